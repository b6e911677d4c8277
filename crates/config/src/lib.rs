// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::fs;

const EXTENSION: &str = "json";

/// A typed record persisted as `<root>/<domain>.json`
pub trait Record: DeserializeOwned {
    fn domain() -> String;
}

/// Load the record for `T` under `root`, `None` when
/// absent or unparseable
pub async fn load<T: Record>(root: impl AsRef<Path>) -> Option<T> {
    let bytes = fs::read(file_path::<T>(root.as_ref())).await.ok()?;

    serde_json::from_slice(&bytes).ok()
}

/// Persist the record for `T` under `root`. The write goes through
/// a sibling temp file and a rename so readers never observe a
/// partial record.
pub async fn save<T: Record + Serialize>(
    root: impl AsRef<Path>,
    record: &T,
) -> Result<(), SaveError> {
    let root = root.as_ref();

    fs::create_dir_all(root)
        .await
        .map_err(|io| SaveError::CreateDir(root.into(), io))?;

    let path = file_path::<T>(root);
    let staging = path.with_extension(format!("{EXTENSION}.part"));

    let serialized = serde_json::to_vec_pretty(record)?;

    fs::write(&staging, serialized)
        .await
        .map_err(|io| SaveError::Write(staging.clone(), io))?;
    fs::rename(&staging, &path)
        .await
        .map_err(|io| SaveError::Write(path, io))?;

    Ok(())
}

/// Remove the record for `T` under `root`, ignoring absence
pub async fn remove<T: Record>(root: impl AsRef<Path>) -> Result<(), io::Error> {
    match fs::remove_file(file_path::<T>(root.as_ref())).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

fn file_path<T: Record>(root: &Path) -> PathBuf {
    root.join(format!("{}.{EXTENSION}", T::domain()))
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("create record dir {0:?}")]
    CreateDir(PathBuf, #[source] io::Error),
    #[error("serialize record")]
    Json(#[from] serde_json::Error),
    #[error("write record file {0:?}")]
    Write(PathBuf, #[source] io::Error),
}
