// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use futures::{stream, StreamExt};
use log::debug;
use tokio::fs;
use tokio::task::spawn_blocking;

use crate::diff::Entry;
use crate::environment;
use crate::fetch::{self, Target, Unit};
use crate::installation::Installation;
use crate::manifest::Archive;
use crate::repository;
use crate::task::{Controls, Stop};

use super::Error;

/// How the archive was brought up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Whole archive downloaded
    Full,
    /// Existing archive rewritten with substituted members
    Patched { changed: usize },
}

/// Reconcile one manifested archive. A missing local copy or an
/// inner change bigger than the full-download threshold fetches the
/// archive wholesale; otherwise only changed members are fetched and
/// substituted through the d2p codec.
#[allow(clippy::too_many_arguments)]
pub async fn patch(
    repository: &repository::Client,
    game_uid: &str,
    installation: &Installation,
    path: &str,
    entry: &Entry,
    remote_inner: &Archive,
    local_inner: Option<Archive>,
    parts_dir: &Path,
    controls: &Controls,
) -> Result<Outcome, Stop<Error>> {
    controls.checkpoint().await?;

    let absolute = installation.content_path(path);

    let local_inner = match local_inner {
        Some(inner) if absolute.exists() => inner,
        _ => {
            return full(repository, game_uid, &absolute, entry, parts_dir, controls)
                .await
                .map(|()| Outcome::Full);
        }
    };

    // Inner diff: members whose hash moved, and members gone remotely
    let changed: Vec<(String, String, u64)> = remote_inner
        .files
        .iter()
        .filter(|(name, file)| {
            local_inner
                .files
                .get(*name)
                .map_or(true, |local| local.hash != file.hash)
        })
        .map(|(name, file)| (name.clone(), file.hash.clone(), file.size))
        .collect();

    let removed: Vec<String> = local_inner
        .files
        .keys()
        .filter(|name| !remote_inner.files.contains_key(*name))
        .cloned()
        .collect();

    if changed.is_empty() && removed.is_empty() {
        return Ok(Outcome::Patched { changed: 0 });
    }

    let changed_size: u64 = changed.iter().map(|(_, _, size)| size).sum();

    if entry.size > 0 && changed_size as f64 > environment::ARCHIVE_FULL_RATIO * entry.size as f64 {
        debug!(
            "archive {path}: {changed_size} changed of {} total, downloading whole",
            entry.size
        );
        full(repository, game_uid, &absolute, entry, parts_dir, controls).await?;
        return Ok(Outcome::Full);
    }

    // Fetch changed members at the archive concurrency cap
    let changed_count = changed.len();
    let fetched = stream::iter(changed.into_iter().map(|(name, hash, size)| {
        let member_path = parts_dir.join(format!("inner-{hash}"));
        let unit = Unit {
            hash: hash.clone(),
            size,
            targets: vec![Target {
                path: member_path.clone(),
                executable: false,
            }],
            verify: true,
        };
        Box::pin(async move {
            fetch::fetch(repository, game_uid, &unit, parts_dir, controls)
                .await
                .map(|()| (name, member_path))
        })
    }))
    .buffer_unordered(environment::MAX_ARCHIVE_CONCURRENCY)
    .collect::<Vec<_>>()
    .await;

    let mut substitutions: Vec<(String, PathBuf)> = vec![];
    for result in fetched {
        substitutions.push(result.map_err(|stop| match stop {
            Stop::Cancelled => Stop::Cancelled,
            Stop::Error(error) => Stop::Error(Error::Fetch(error)),
        })?);
    }

    controls.checkpoint().await?;

    let rebuilt = parts_dir.join(format!("rebuild-{}", file_stem(path)));
    let meta_bytes = serde_json::to_vec_pretty(remote_inner)
        .map_err(|error| Stop::Error(Error::Decode(error)))?;

    rewrite(
        absolute.clone(),
        rebuilt.clone(),
        substitutions,
        removed,
        meta_bytes,
    )
    .await
    .map_err(Stop::Error)?;

    fs::rename(&rebuilt, &absolute)
        .await
        .map_err(|error| Stop::Error(Error::Io(error)))?;

    debug!("archive {path}: substituted {changed_count} members");

    Ok(Outcome::Patched {
        changed: changed_count,
    })
}

async fn full(
    repository: &repository::Client,
    game_uid: &str,
    absolute: &Path,
    entry: &Entry,
    parts_dir: &Path,
    controls: &Controls,
) -> Result<(), Stop<Error>> {
    let Some(hash) = &entry.hash else {
        return Ok(());
    };

    let unit = Unit {
        hash: hash.clone(),
        size: entry.size,
        targets: vec![Target {
            path: absolute.to_owned(),
            executable: entry.executable,
        }],
        verify: true,
    };

    fetch::fetch(repository, game_uid, &unit, parts_dir, controls)
        .await
        .map_err(|stop| match stop {
            Stop::Cancelled => Stop::Cancelled,
            Stop::Error(error) => Stop::Error(Error::Fetch(error)),
        })
}

/// Extract, substitute and re-emit the archive off the async runtime
async fn rewrite(
    current: PathBuf,
    rebuilt: PathBuf,
    substitutions: Vec<(String, PathBuf)>,
    removed: Vec<String>,
    meta_bytes: Vec<u8>,
) -> Result<(), Error> {
    spawn_blocking(move || {
        let mut archive = d2p::extract(&current)?;

        for (name, member_path) in substitutions {
            let bytes = std::fs::read(&member_path)?;
            archive.put(&name, bytes);
        }

        for name in removed {
            archive.remove(&name);
        }

        archive.put(environment::ARCHIVE_META_FILE, meta_bytes);

        d2p::build(&rebuilt, &archive)?;

        Ok(())
    })
    .await
    .expect("join archive rewrite task")
}

fn file_stem(path: &str) -> String {
    path.rsplit('/')
        .next()
        .unwrap_or(path)
        .replace(['\\', ':'], "_")
}
