// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

/// Current release record schema
pub const SCHEMA_VERSION: u32 = 2;

/// Legacy `gameName` values mapped to repository game uids
const GAME_UID_MIGRATION: &[(&str, &str)] = &[
    ("Dofus", "dofus"),
    ("Wakfu", "wakfu"),
    ("Waven", "waven"),
    ("Krosmaga", "krosmaga"),
];

/// Persisted per-release state, written after every non-transient
/// state change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Record {
    pub game_uid: String,
    pub release_name: String,
    pub location: Option<PathBuf>,
    pub version: Option<String>,
    /// Latest version the repository advertises for this release
    pub repository_version: Option<String>,
    pub installed_fragments: Vec<String>,
    pub is_installing: bool,
    pub is_updating: bool,
    /// Repository version at the time a repair started; older
    /// records stored a plain boolean here
    pub is_repairing: Option<Repairing>,
    pub is_moving: bool,
    pub update_downloaded_size: u64,
    pub update_downloaded_size_date: Option<DateTime<Utc>>,
    pub update_paused_by_user: bool,
    pub is_dirty: bool,
    pub schema_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Repairing {
    Legacy(bool),
    Version(String),
}

impl Repairing {
    pub fn is_active(&self) -> bool {
        match self {
            Repairing::Legacy(active) => *active,
            Repairing::Version(_) => true,
        }
    }
}

impl config::Record for Record {
    fn domain() -> String {
        "release".into()
    }
}

/// Per-release user choices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub requested_languages: Vec<String>,
}

impl config::Record for Settings {
    fn domain() -> String {
        "settings".into()
    }
}

impl Record {
    pub fn new(game_uid: impl ToString, release_name: impl ToString) -> Self {
        Self {
            game_uid: game_uid.to_string(),
            release_name: release_name.to_string(),
            schema_version: SCHEMA_VERSION,
            ..Default::default()
        }
    }

    /// A release without a location has no installed state; scrub
    /// everything that only makes sense with one
    pub fn normalize(&mut self) {
        if self.location.is_none() {
            self.version = None;
            self.installed_fragments.clear();
            self.is_installing = false;
            self.is_updating = false;
            self.is_repairing = None;
        }

        if let Some(Repairing::Legacy(false)) = self.is_repairing {
            self.is_repairing = None;
        }
    }
}

/// Load the record from `dir`, applying legacy migrations, or start
/// a fresh one
pub async fn load(dir: &Path, game_uid: &str, release_name: &str) -> Record {
    let raw = match fs::read(dir.join("release.json")).await {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes).ok(),
        Err(_) => None,
    };

    let Some(raw) = raw else {
        return Record::new(game_uid, release_name);
    };

    let mut record = match serde_json::from_value::<Record>(migrate(raw)) {
        Ok(record) => record,
        Err(error) => {
            warn!("unreadable release record for {game_uid}/{release_name}: {error}");
            return Record::new(game_uid, release_name);
        }
    };

    if record.game_uid.is_empty() {
        record.game_uid = game_uid.to_owned();
    }
    if record.release_name.is_empty() {
        record.release_name = release_name.to_owned();
    }
    record.schema_version = SCHEMA_VERSION;
    record.normalize();

    record
}

pub async fn save(dir: &Path, record: &Record) -> Result<(), config::SaveError> {
    config::save(dir, record).await
}

/// Key-level migrations applied before typed decoding
fn migrate(mut value: Value) -> Value {
    let Some(object) = value.as_object_mut() else {
        return value;
    };

    // gameName -> gameUid
    if !object.contains_key("gameUid") {
        if let Some(name) = object.remove("gameName") {
            let uid = name
                .as_str()
                .map(|name| {
                    GAME_UID_MIGRATION
                        .iter()
                        .find(|(legacy, _)| *legacy == name)
                        .map(|(_, uid)| (*uid).to_owned())
                        .unwrap_or_else(|| name.to_lowercase())
                })
                .unwrap_or_default();

            object.insert("gameUid".into(), Value::String(uid));
        }
    }

    value
}
