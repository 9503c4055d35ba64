//! Secret resolution for a task.
//!
//! Priority chain, first non-empty source wins:
//! 1. wire secrets from the context (cloud-managed workers only),
//! 2. the context's `secretsPath`,
//! 3. the `TETHER_SECRETS_FILE` environment override,
//! 4. `.env.secrets` at the bundle root,
//! 5. the worker-config default file.
//!
//! A missing file is not an error; a present-but-unparseable file is.
//! Resolved secrets are owned by the executor fiber and must never appear
//! in logs, traces, or submitted events.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use tether_core::bundle::SECRETS_ENV_FILE;
use tether_core::RuntimeContext;

pub const SECRETS_FILE_ENV: &str = "TETHER_SECRETS_FILE";

pub struct SecretsOptions {
    /// Whether this worker is cloud-managed; self-hosted workers must not
    /// accept secrets on the wire.
    pub cloud_managed: bool,
    /// Worker-config default secrets file.
    pub default_file: Option<PathBuf>,
}

pub async fn resolve_secrets(
    ctx: &RuntimeContext,
    bundle_dir: &Path,
    options: &SecretsOptions,
    env: &(dyn Fn(&str) -> Option<String> + Send + Sync),
) -> anyhow::Result<BTreeMap<String, String>> {
    if let Some(wire) = &ctx.secrets {
        if options.cloud_managed {
            if !wire.is_empty() {
                return Ok(wire.clone());
            }
        } else {
            tracing::warn!(
                event = "tether.secrets.wire_ignored",
                task_id = %ctx.task_id,
                "context carried secrets but worker is self-hosted; ignoring"
            );
        }
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = &ctx.secrets_path {
        candidates.push(PathBuf::from(path));
    }
    if let Some(path) = env(SECRETS_FILE_ENV) {
        candidates.push(PathBuf::from(path));
    }
    candidates.push(bundle_dir.join(SECRETS_ENV_FILE));
    if let Some(path) = &options.default_file {
        candidates.push(path.clone());
    }

    for path in candidates {
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let parsed = parse_env_file(&contents)
                    .with_context(|| format!("parse secrets file {}", path.display()))?;
                if !parsed.is_empty() {
                    tracing::debug!(
                        event = "tether.secrets.loaded",
                        task_id = %ctx.task_id,
                        count = parsed.len(),
                        "loaded secrets"
                    );
                    return Ok(parsed);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("read secrets file {}", path.display()));
            }
        }
    }

    Ok(BTreeMap::new())
}

/// Parse `.env`-style `KEY=VALUE` lines. `#` comments and blank lines are
/// skipped; single or double quotes around a value are stripped.
pub fn parse_env_file(contents: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected KEY=VALUE", lineno + 1))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("line {}: empty key", lineno + 1);
        }
        let mut value = value.trim();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
            {
                value = &value[1..value.len() - 1];
            }
        }
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{BundleDownload, BundleRef, TaskLimits};

    fn context(
        secrets: Option<BTreeMap<String, String>>,
        secrets_path: Option<String>,
    ) -> RuntimeContext {
        RuntimeContext {
            task_id: "t-1".to_string(),
            run_id: "r-1".to_string(),
            project_id: "p-1".to_string(),
            bundle: BundleRef {
                id: "b-1".to_string(),
                download: BundleDownload {
                    url: "https://bundles/b-1.tar".to_string(),
                    checksum: None,
                    expires_at: None,
                },
            },
            selection: None,
            vars: BTreeMap::new(),
            secrets,
            secrets_path,
            limits: TaskLimits {
                timeout_ms: 0,
                memory_mb: 0,
                requested_concurrency: 0,
                max_concurrency: 0,
            },
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn env_file_parser_handles_comments_and_quotes() {
        let parsed = parse_env_file(
            "# comment\n\nAPI_KEY=plain\nQUOTED=\"with spaces\"\nSINGLE='x'\n  PADDED = y \n",
        )
        .unwrap();
        assert_eq!(parsed["API_KEY"], "plain");
        assert_eq!(parsed["QUOTED"], "with spaces");
        assert_eq!(parsed["SINGLE"], "x");
        assert_eq!(parsed["PADDED"], "y");
    }

    #[test]
    fn env_file_parser_rejects_lines_without_equals() {
        assert!(parse_env_file("NOT A PAIR\n").is_err());
    }

    #[tokio::test]
    async fn wire_secrets_win_for_cloud_managed_workers() {
        let mut wire = BTreeMap::new();
        wire.insert("API_KEY".to_string(), "from-wire".to_string());
        let ctx = context(Some(wire), None);
        let options = SecretsOptions {
            cloud_managed: true,
            default_file: None,
        };
        let got = resolve_secrets(&ctx, Path::new("/nonexistent"), &options, &no_env)
            .await
            .unwrap();
        assert_eq!(got["API_KEY"], "from-wire");
    }

    #[tokio::test]
    async fn self_hosted_ignores_wire_secrets() {
        let mut wire = BTreeMap::new();
        wire.insert("API_KEY".to_string(), "from-wire".to_string());
        let ctx = context(Some(wire), None);
        let options = SecretsOptions {
            cloud_managed: false,
            default_file: None,
        };
        let got = resolve_secrets(&ctx, Path::new("/nonexistent"), &options, &no_env)
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn context_path_beats_bundle_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx_file = dir.path().join("ctx.env");
        tokio::fs::write(&ctx_file, "WHO=context\n").await.unwrap();
        let bundle_dir = dir.path().join("bundle");
        tokio::fs::create_dir_all(&bundle_dir).await.unwrap();
        tokio::fs::write(bundle_dir.join(SECRETS_ENV_FILE), "WHO=bundle\n")
            .await
            .unwrap();

        let ctx = context(None, Some(ctx_file.to_string_lossy().into_owned()));
        let options = SecretsOptions {
            cloud_managed: false,
            default_file: None,
        };
        let got = resolve_secrets(&ctx, &bundle_dir, &options, &no_env)
            .await
            .unwrap();
        assert_eq!(got["WHO"], "context");
    }

    #[tokio::test]
    async fn env_override_beats_bundle_file() {
        let dir = tempfile::tempdir().unwrap();
        let override_file = dir.path().join("override.env");
        tokio::fs::write(&override_file, "WHO=override\n")
            .await
            .unwrap();
        let bundle_dir = dir.path().join("bundle");
        tokio::fs::create_dir_all(&bundle_dir).await.unwrap();
        tokio::fs::write(bundle_dir.join(SECRETS_ENV_FILE), "WHO=bundle\n")
            .await
            .unwrap();

        let ctx = context(None, None);
        let options = SecretsOptions {
            cloud_managed: false,
            default_file: None,
        };
        let override_path = override_file.to_string_lossy().into_owned();
        let env = move |key: &str| {
            (key == SECRETS_FILE_ENV).then(|| override_path.clone())
        };
        let got = resolve_secrets(&ctx, &bundle_dir, &options, &env)
            .await
            .unwrap();
        assert_eq!(got["WHO"], "override");
    }

    #[tokio::test]
    async fn missing_files_fall_through_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let default_file = dir.path().join("default.env");
        tokio::fs::write(&default_file, "WHO=default\n").await.unwrap();

        let ctx = context(None, Some("/nonexistent/ctx.env".to_string()));
        let options = SecretsOptions {
            cloud_managed: false,
            default_file: Some(default_file),
        };
        let got = resolve_secrets(&ctx, dir.path(), &options, &no_env)
            .await
            .unwrap();
        assert_eq!(got["WHO"], "default");
    }

    #[tokio::test]
    async fn no_source_yields_empty_map() {
        let ctx = context(None, None);
        let options = SecretsOptions {
            cloud_managed: false,
            default_file: None,
        };
        let got = resolve_secrets(&ctx, Path::new("/nonexistent"), &options, &no_env)
            .await
            .unwrap();
        assert!(got.is_empty());
    }
}
