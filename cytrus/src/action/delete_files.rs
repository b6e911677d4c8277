// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeSet;
use std::io;

use futures::{stream, StreamExt};
use log::{debug, warn};
use tokio::fs;

use crate::environment;
use crate::task::{Controls, Stop};

use super::{Context, Error};

enum Unlink {
    Deleted(String, String),
    /// The host still has the file open; advisory, never fatal
    Busy(String, String),
    Missing,
}

/// Unlink every tombstoned file that no other fragment is about to
/// write
pub async fn run(ctx: &mut Context, controls: &Controls) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let Some(diff) = ctx.diff.as_ref() else {
        return Ok(());
    };

    let protected: BTreeSet<&str> = diff.downloading_paths().collect();

    let deletions: Vec<(String, String)> = diff
        .fragments()
        .flat_map(|(fragment, bucket)| {
            bucket
                .files
                .iter()
                .filter(|(path, entry)| entry.is_deletion() && !protected.contains(path.as_str()))
                .map(|(path, _)| (fragment.clone(), path.clone()))
        })
        .collect();

    debug!("deleting {} files", deletions.len());

    let results = stream::iter(deletions.into_iter().map(|(fragment, path)| {
        let absolute = ctx.installation.content_path(&path);
        async move {
            match fs::remove_file(&absolute).await {
                Ok(()) => Ok(Unlink::Deleted(fragment, path)),
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Unlink::Missing),
                Err(error) if is_busy(&error) => {
                    warn!("{path} is held open by another process");
                    Ok(Unlink::Busy(fragment, path))
                }
                Err(error) => Err(Error::Io(error)),
            }
        }
    }))
    .buffer_unordered(environment::MAX_DISK_CONCURRENCY)
    .collect::<Vec<_>>()
    .await;

    for result in results {
        match result.map_err(Stop::Error)? {
            Unlink::Deleted(fragment, path) => ctx.deleted.push((fragment, path)),
            Unlink::Busy(fragment, path) => {
                ctx.opened_by_external_process = true;
                // Still drop it from the local manifest; a repair
                // will reconcile whatever survives on disk
                ctx.deleted.push((fragment, path));
            }
            Unlink::Missing => {}
        }
    }

    Ok(())
}

/// EBUSY on unix, sharing violation on windows
fn is_busy(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(16) | Some(32))
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::action::UpdateKind;
    use crate::diff;
    use crate::installation::Installation;
    use crate::manifest::Manifest;
    use crate::platform::Platform;
    use crate::task;

    use super::*;

    #[tokio::test]
    async fn unlinks_tombstones_and_records_them() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stale.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("kept.bin"), b"y").unwrap();

        let local = Manifest::from_value(json!({
            "main": { "files": {
                "stale.bin": { "hash": "aa", "size": 1, "executable": false },
                "kept.bin": { "hash": "bb", "size": 1, "executable": false }
            }}
        }))
        .unwrap();
        let remote = Manifest::from_value(json!({
            "main": { "files": {
                "kept.bin": { "hash": "bb", "size": 1, "executable": false }
            }}
        }))
        .unwrap();

        let mut ctx = Context::new(
            UpdateKind::Update,
            "dofus",
            "main",
            "5.0_3",
            Platform::Linux,
            Installation::open(dir.path(), "cytrus"),
            dir.path().join("state"),
            vec!["main".into()],
        );
        ctx.diff = Some(diff::compute(
            &["main".into()],
            &local,
            &remote,
            Platform::Linux,
        ));

        let (_controller, controls) = task::control();
        run(&mut ctx, &controls).await.unwrap();

        assert!(!dir.path().join("stale.bin").exists());
        assert!(dir.path().join("kept.bin").exists());
        assert_eq!(ctx.deleted, [("main".to_owned(), "stale.bin".to_owned())]);
    }

    #[tokio::test]
    async fn already_absent_files_are_not_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let local = Manifest::from_value(json!({
            "main": { "files": { "gone.bin": { "hash": "aa", "size": 1, "executable": false } } }
        }))
        .unwrap();

        let mut ctx = Context::new(
            UpdateKind::Update,
            "dofus",
            "main",
            "5.0_3",
            Platform::Linux,
            Installation::open(dir.path(), "cytrus"),
            dir.path().join("state"),
            vec!["main".into()],
        );
        ctx.diff = Some(diff::compute(
            &["main".into()],
            &local,
            &Manifest::default(),
            Platform::Linux,
        ));

        let (_controller, controls) = task::control();
        run(&mut ctx, &controls).await.unwrap();

        assert!(ctx.deleted.is_empty());
    }
}
