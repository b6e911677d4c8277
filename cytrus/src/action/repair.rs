// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use futures::{stream, StreamExt};
use log::debug;
use tokio::fs;

use crate::environment;
use crate::fetch;
use crate::manifest::{FileEntry, Manifest};
use crate::task::{Controls, Progress, Stop};

use super::{Context, Error};

/// Rebuild the local manifest by hashing what is actually on disk.
/// Every file the remote manifest knows about is stat'ed and hashed
/// under a bounded concurrency; the result reflects the tree as it
/// is, so the following diff downloads exactly what is wrong.
pub async fn run(ctx: &mut Context, controls: &Controls) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let remote = ctx.remote.as_ref().ok_or_else(|| {
        Stop::Error(Error::LocalHashes("repair needs the remote manifest".into()))
    })?;

    // Only hash fragments this release cares about
    let candidates: Vec<(String, String, PathBuf)> = remote
        .fragments()
        .filter(|(name, _)| {
            ctx.fragments.contains(name) || ctx.installed_fragments.contains(name)
        })
        .flat_map(|(name, fragment)| {
            fragment.files.keys().map(|path| {
                (
                    name.clone(),
                    path.clone(),
                    ctx.installation.content_path(path),
                )
            })
        })
        .collect();

    let total: u64 = candidates.len() as u64;
    debug!("repair: hashing up to {total} files");

    let jobs = candidates.into_iter().map(|(fragment, path, absolute)| {
        let controls = controls.clone();
        async move {
            controls.checkpoint().await.map_err(|_| Stop::Cancelled)?;

            let Ok(meta) = fs::metadata(&absolute).await else {
                // Not on disk: the diff will schedule a download
                return Ok::<_, Stop<Error>>(None);
            };

            if !meta.is_file() {
                return Ok(None);
            }

            let digest = fetch::digest_file(absolute.clone())
                .await
                .map_err(|error| Stop::Error(Error::Fetch(error)))?;

            let executable = is_executable(&meta);

            Ok(Some((
                fragment,
                path,
                FileEntry {
                    hash: Some(digest),
                    size: meta.len(),
                    executable,
                },
            )))
        }
    });

    let mut local = Manifest::default();
    let mut completed: u64 = 0;

    let mut results = stream::iter(jobs).buffer_unordered(environment::MAX_DISK_CONCURRENCY);

    while let Some(result) = results.next().await {
        completed += 1;

        if let Some((fragment, path, entry)) = result? {
            local.fragment_mut(&fragment).files.insert(path, entry);
        }

        controls.emit(Progress {
            delta: 1,
            completed,
            total,
        });
    }

    ctx.local = Some(local);

    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::action::UpdateKind;
    use crate::installation::Installation;
    use crate::platform::Platform;
    use crate::task;

    use super::*;

    #[tokio::test]
    async fn rebuilds_manifest_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.bin"), b"abc").unwrap();

        let mut ctx = Context::new(
            UpdateKind::Repair,
            "dofus",
            "main",
            "5.0_3",
            Platform::Linux,
            Installation::open(dir.path(), "cytrus"),
            dir.path().join("state"),
            vec!["main".into()],
        );
        ctx.remote = Some(
            Manifest::from_value(json!({
                "main": { "files": {
                    "present.bin": { "hash": "other", "size": 3, "executable": false },
                    "missing.bin": { "hash": "bb", "size": 9, "executable": false }
                }}
            }))
            .unwrap(),
        );

        let (_controller, controls) = task::control();
        run(&mut ctx, &controls).await.unwrap();

        let local = ctx.local.unwrap();
        let files = &local.fragment("main").unwrap().files;

        // The hash reflects the bytes on disk, not the manifest claim
        assert_eq!(
            files["present.bin"].hash.as_deref(),
            Some("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert!(!files.contains_key("missing.bin"));
    }
}
