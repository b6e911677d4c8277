// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A release manifest: fragment name to fragment contents. Used both
/// for the remote (repository) and local (`.release.hashes.json`)
/// side of a diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest(pub BTreeMap<String, Fragment>);

impl Manifest {
    pub fn fragment(&self, name: &str) -> Option<&Fragment> {
        self.0.get(name)
    }

    pub fn fragment_mut(&mut self, name: &str) -> &mut Fragment {
        self.0.entry(name.to_owned()).or_default()
    }

    pub fn fragments(&self) -> impl Iterator<Item = (&String, &Fragment)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|fragment| fragment.files.is_empty())
    }

    /// Decode a manifest from raw JSON, folding legacy v4 key casing
    /// to lowerCamelCase first
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(normalize_keys(value))
    }
}

/// One named subset of a release's content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fragment {
    pub files: BTreeMap<String, FileEntry>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub packs: BTreeMap<String, Pack>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub archives: BTreeMap<String, Archive>,
}

/// A single manifested file. `size == 0` with no hash marks a
/// tombstone scheduled for deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileEntry {
    pub hash: Option<String>,
    pub size: u64,
    pub executable: bool,
}

impl FileEntry {
    pub fn is_tombstone(&self) -> bool {
        self.size == 0 && self.hash.is_none()
    }
}

/// A tar bundle of several file bodies addressed by one hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pack {
    pub size: u64,
    pub hashes: Vec<String>,
}

/// A container file whose members are manifested individually and
/// can be patched in place
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Archive {
    pub files: BTreeMap<String, ArchiveFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveFile {
    pub hash: String,
    pub size: u64,
}

/// Per-fragment size summary from the `.meta` sibling of a release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseMeta(pub BTreeMap<String, FragmentMeta>);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FragmentMeta {
    pub total_size: u64,
    pub fragment_size: u64,
    pub total_files: u64,
}

/// Release configuration delivered inside the configuration fragment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub fragments: BTreeMap<String, FragmentRule>,
    pub check: Option<CheckScript>,
    pub licenses_folder: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FragmentRule {
    pub default: bool,
    pub languages: Vec<String>,
}

/// Optional validator executed after the configuration fragment
/// lands. Exit codes map to operator-facing messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckScript {
    pub command: String,
    pub results: BTreeMap<i32, String>,
}

/// Fold legacy v4 PascalCase keys (`Files`, `Hash`, ...) to
/// lowerCamelCase, recursively, before typed decoding
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (fold_key(&key), normalize_keys(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

fn fold_key(key: &str) -> String {
    let mut chars = key.chars();

    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
