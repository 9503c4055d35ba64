//! Test selection: which of a bundle's exports a task should run.
//!
//! Selection semantics: when both `ids` and `tags` are non-empty the result
//! is the union of id-matches and tag-matches. When only one list is set,
//! only that list applies. When neither is set, every export is selected.
//! `skip`/`only` markers on exports narrow the universe before the
//! selection is applied.

use serde::{Deserialize, Serialize};

use crate::bundle::BundleMetadata;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSelection {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tag_mode: TagMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    /// The test has at least one of the listed tags.
    #[default]
    Any,
    /// The test has every listed tag.
    All,
}

/// A test chosen for execution, with its owning file resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTest {
    pub id: String,
    pub name: Option<String>,
    pub file_path: String,
    pub export_name: String,
    pub timeout: Option<u64>,
}

pub fn matches_tags(test_tags: &[String], wanted: &[String], mode: TagMode) -> bool {
    match mode {
        TagMode::Any => wanted.iter().any(|t| test_tags.contains(t)),
        TagMode::All => wanted.iter().all(|t| test_tags.contains(t)),
    }
}

/// Apply a selection to a bundle's discovered exports.
///
/// File order follows the sorted metadata table; exports keep their
/// declaration order within a file.
pub fn select_tests(
    metadata: &BundleMetadata,
    selection: Option<&TestSelection>,
) -> Vec<SelectedTest> {
    let has_only = metadata
        .files
        .values()
        .flat_map(|entry| entry.exports.iter())
        .any(|export| export.only);

    let universe = metadata.files.iter().flat_map(|(path, entry)| {
        entry
            .exports
            .iter()
            .filter(|export| !export.skip)
            .filter(|export| !has_only || export.only)
            .map(move |export| SelectedTest {
                id: export.id.clone(),
                name: export.name.clone(),
                file_path: path.clone(),
                export_name: export.export_name.clone(),
                timeout: export.timeout,
            })
    });

    let Some(selection) = selection else {
        return universe.collect();
    };
    if selection.ids.is_empty() && selection.tags.is_empty() {
        return universe.collect();
    }

    let mut selected = Vec::new();
    for (path, entry) in &metadata.files {
        for export in &entry.exports {
            if export.skip || (has_only && !export.only) {
                continue;
            }
            let by_id = !selection.ids.is_empty() && selection.ids.contains(&export.id);
            let by_tag = !selection.tags.is_empty()
                && matches_tags(&export.tags, &selection.tags, selection.tag_mode);
            if by_id || by_tag {
                selected.push(SelectedTest {
                    id: export.id.clone(),
                    name: export.name.clone(),
                    file_path: path.clone(),
                    export_name: export.export_name.clone(),
                    timeout: export.timeout,
                });
            }
        }
    }
    selected
}
