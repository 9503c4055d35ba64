//! Bundle metadata: the `metadata.json` contract inside a test bundle.
//!
//! A bundle is a tar archive containing `metadata.json` at the root, the
//! test files at the paths listed in `files`, and optionally a runtime
//! config file and a `.env.secrets` file at the root. The metadata's
//! `rootHash` is a content-addressed digest over the sorted `path:hash`
//! pairs, so the worker (or any scanner) can re-derive it from extracted
//! content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::{Component, Path},
};

pub const BUNDLE_METADATA_FILE: &str = "metadata.json";
pub const RUNTIME_CONFIG_FILE: &str = "tether.runtime.json";
pub const SECRETS_ENV_FILE: &str = ".env.secrets";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub schema_version: u32,
    /// SHA-256 over sorted `path:hash` pairs joined by newlines.
    pub root_hash: String,
    pub files: BTreeMap<String, BundleFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleFileEntry {
    /// Lowercase-hex SHA-256 of the file bytes.
    pub hash: String,
    #[serde(default)]
    pub exports: Vec<TestExport>,
}

/// One discovered test export. A test is uniquely identified by
/// (file path, export name); `id` is what selection matches against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExport {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Per-test timeout hint in milliseconds; the worker caps it at the
    /// derived per-test budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub only: bool,
    pub export_name: String,
}

impl BundleMetadata {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn validate(&self) -> Result<(), BundleMetadataError> {
        if self.schema_version != Self::SCHEMA_VERSION {
            return Err(BundleMetadataError::new(format!(
                "unsupported schema_version {}",
                self.schema_version
            )));
        }

        validate_hash_hex(&self.root_hash)
            .map_err(|e| e.with_context("invalid rootHash"))?;

        let mut seen_ids = HashSet::<&str>::new();
        for (path, entry) in &self.files {
            validate_relpath(path)
                .map_err(|e| e.with_context(format!("invalid file path '{path}'")))?;
            if path == BUNDLE_METADATA_FILE {
                return Err(BundleMetadataError::new(format!(
                    "file path '{BUNDLE_METADATA_FILE}' is reserved"
                )));
            }
            validate_hash_hex(&entry.hash)
                .map_err(|e| e.with_context(format!("invalid hash for '{path}'")))?;

            for export in &entry.exports {
                if export.id.is_empty() {
                    return Err(BundleMetadataError::new(format!(
                        "empty export id in '{path}'"
                    )));
                }
                if export.export_name.is_empty() {
                    return Err(BundleMetadataError::new(format!(
                        "empty export name in '{path}'"
                    )));
                }
                if !seen_ids.insert(export.id.as_str()) {
                    return Err(BundleMetadataError::new(format!(
                        "duplicate test id '{}'",
                        export.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Re-derive the content-addressed root hash from the file table.
    pub fn computed_root_hash(&self) -> String {
        compute_root_hash(self.files.iter().map(|(path, entry)| (path.as_str(), entry.hash.as_str())))
    }
}

/// SHA-256 over `path:hash` lines, sorted by path, joined by `\n`.
pub fn compute_root_hash<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let mut lines: Vec<String> = pairs.map(|(path, hash)| format!("{path}:{hash}")).collect();
    lines.sort();
    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    hex_lower(&hasher.finalize())
}

pub fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

#[derive(Debug)]
pub struct BundleMetadataError {
    message: String,
}

impl BundleMetadataError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn with_context(self, context: impl Into<String>) -> Self {
        Self::new(format!("{}: {}", context.into(), self.message))
    }
}

impl fmt::Display for BundleMetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BundleMetadataError {}

/// Validate a path that must stay inside an extraction root.
pub fn validate_relpath(path: &str) -> Result<(), BundleMetadataError> {
    if path.is_empty() {
        return Err(BundleMetadataError::new("path must not be empty"));
    }
    if path.contains('\0') {
        return Err(BundleMetadataError::new("path must not contain NUL"));
    }
    if path.contains('\\') {
        return Err(BundleMetadataError::new("path must not contain backslashes"));
    }
    if path.starts_with('/') {
        return Err(BundleMetadataError::new("path must not be absolute"));
    }

    let p = Path::new(path);
    for c in p.components() {
        match c {
            Component::Normal(_) => {}
            Component::CurDir => {
                return Err(BundleMetadataError::new("path must not contain '.' segments"));
            }
            Component::ParentDir => {
                return Err(BundleMetadataError::new(
                    "path must not contain '..' segments",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(BundleMetadataError::new("path must not be absolute"));
            }
        }
    }
    Ok(())
}

fn validate_hash_hex(s: &str) -> Result<(), BundleMetadataError> {
    if s.len() != 64 {
        return Err(BundleMetadataError::new("hash must be 64 hex chars"));
    }
    if !s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(BundleMetadataError::new("hash must be lowercase hex"));
    }
    Ok(())
}
