// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeSet;
use std::path::PathBuf;

use futures::{stream, StreamExt};
use tokio::fs;

use crate::environment;
use crate::task::{Controls, Stop};

use super::{Context, Error};

/// Ensure every directory a fragment's downloads will write into
/// exists before the fetches start
pub async fn run(
    ctx: &mut Context,
    fragment: &str,
    controls: &Controls,
) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let Some(bucket) = ctx.diff.as_ref().and_then(|diff| diff.fragment(fragment)) else {
        return Ok(());
    };

    let mut directories: BTreeSet<PathBuf> = BTreeSet::new();

    for (path, entry) in &bucket.files {
        if entry.download && !entry.is_pack {
            insert_parent(&mut directories, ctx, path);
        }

        for member in entry.pack_files.iter().flat_map(|files| files.keys()) {
            insert_parent(&mut directories, ctx, member);
        }
    }

    let results = stream::iter(directories)
        .map(|directory| async move { fs::create_dir_all(&directory).await })
        .buffer_unordered(environment::MAX_DISK_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    for result in results {
        result.map_err(|error| Stop::Error(Error::Io(error)))?;
    }

    Ok(())
}

fn insert_parent(directories: &mut BTreeSet<PathBuf>, ctx: &Context, path: &str) {
    if let Some(parent) = ctx.installation.content_path(path).parent() {
        directories.insert(parent.to_owned());
    }
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
    async fn creates_target_directories() {
        let dir = tempfile::tempdir().unwrap();

        let remote = Manifest::from_value(json!({
            "main": { "files": {
                "a/b/one.bin": { "hash": "aa", "size": 1, "executable": false },
                "c/two.bin": { "hash": "bb", "size": 1, "executable": false }
            }}
        }))
        .unwrap();

        let mut ctx = Context::new(
            UpdateKind::Install,
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
            &Manifest::default(),
            &remote,
            Platform::Linux,
        ));

        let (_controller, controls) = task::control();
        run(&mut ctx, "main", &controls).await.unwrap();

        assert!(dir.path().join("a/b").is_dir());
        assert!(dir.path().join("c").is_dir());
    }
}
