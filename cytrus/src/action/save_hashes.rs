// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::manifest::Manifest;

use super::{Context, Error};

/// License texts collected from the release's licenses folder,
/// persisted to the state directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Licenses(pub Vec<License>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub title: String,
    pub text: String,
}

impl config::Record for Licenses {
    fn domain() -> String {
        "licenses".into()
    }
}

/// Terminal SaveHashes action
pub async fn run(ctx: &mut Context) -> Result<(), Error> {
    persist(ctx).await
}

/// Fold accumulated downloads and deletions into the local manifest
/// and write it out. Unchanged content writes nothing, so re-running
/// with the same inputs is a no-op on disk. Also refreshes the
/// licenses record when the configuration names a folder.
pub async fn persist(ctx: &mut Context) -> Result<(), Error> {
    let merged = merge(ctx);

    let bytes = serde_json::to_vec_pretty(&merged)?;
    let path = ctx.installation.hashes_path();

    let current = fs::read(&path).await.ok();
    if current.as_deref() != Some(bytes.as_slice()) {
        let staging = path.with_extension("json.part");
        fs::write(&staging, &bytes).await?;
        fs::rename(&staging, &path).await?;
    }

    collect_licenses(ctx).await?;

    ctx.local = Some(merged);
    ctx.downloaded.clear();
    ctx.downloaded_archives.clear();
    ctx.deleted.clear();
    ctx.last_save = Instant::now();

    Ok(())
}

fn merge(ctx: &Context) -> Manifest {
    let mut local = ctx.local.clone().unwrap_or_default();

    for (fragment, files) in &ctx.downloaded {
        let target = local.fragment_mut(fragment);
        for (path, entry) in files {
            target.files.insert(path.clone(), entry.clone());
        }
    }

    for (fragment, archives) in &ctx.downloaded_archives {
        let target = local.fragment_mut(fragment);
        for (path, inner) in archives {
            target.archives.insert(path.clone(), inner.clone());
        }
    }

    for (fragment, path) in &ctx.deleted {
        if let Some(target) = local.0.get_mut(fragment) {
            target.files.remove(path);
            target.archives.remove(path);
        }
    }

    for fragment in local.0.values_mut() {
        fragment.files.retain(|_, entry| !entry.is_tombstone());
        // Packs are a transfer optimization, not local state
        fragment.packs.clear();
    }

    local
        .0
        .retain(|_, fragment| !fragment.files.is_empty() || !fragment.archives.is_empty());

    local
}

async fn collect_licenses(ctx: &Context) -> Result<(), Error> {
    let Some(folder) = ctx
        .configuration
        .as_ref()
        .and_then(|configuration| configuration.licenses_folder.as_deref())
    else {
        return Ok(());
    };

    let dir = ctx.installation.content_path(folder);

    let mut read_dir = match fs::read_dir(&dir).await {
        Ok(read_dir) => read_dir,
        Err(_) => return Ok(()),
    };

    let mut licenses = vec![];

    while let Some(entry) = read_dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let Ok(text) = fs::read_to_string(entry.path()).await else {
            continue;
        };

        let title = entry
            .path()
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        licenses.push(License { title, text });
    }

    licenses.sort_by(|a, b| a.title.cmp(&b.title));

    config::save(&ctx.state_dir, &Licenses(licenses))
        .await
        .map_err(|error| Error::Io(std::io::Error::other(error)))?;

    Ok(())
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::action::UpdateKind;
    use crate::installation::Installation;
    use crate::manifest::FileEntry;
    use crate::platform::Platform;

    use super::*;

    fn context(dir: &std::path::Path) -> Context {
        Context::new(
            UpdateKind::Update,
            "dofus",
            "main",
            "5.0_3",
            Platform::Linux,
            Installation::open(dir, "cytrus"),
            dir.join("state"),
            vec!["main".into()],
        )
    }

    #[tokio::test]
    async fn merges_downloads_and_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        ctx.local = Some(
            Manifest::from_value(json!({
                "main": { "files": {
                    "old.bin": { "hash": "aa", "size": 1, "executable": false },
                    "kept.bin": { "hash": "bb", "size": 1, "executable": false }
                }}
            }))
            .unwrap(),
        );
        ctx.record_download(
            "main",
            "new.bin",
            FileEntry {
                hash: Some("cc".into()),
                size: 2,
                executable: false,
            },
        );
        ctx.deleted.push(("main".into(), "old.bin".into()));

        persist(&mut ctx).await.unwrap();

        let written: Manifest = serde_json::from_slice(
            &std::fs::read(ctx.installation.hashes_path()).unwrap(),
        )
        .unwrap();

        let files = &written.fragment("main").unwrap().files;
        assert!(files.contains_key("kept.bin"));
        assert!(files.contains_key("new.bin"));
        assert!(!files.contains_key("old.bin"));

        // Accumulators drained into the merged local manifest
        assert!(ctx.downloaded.is_empty());
        assert!(ctx.deleted.is_empty());
        assert_eq!(ctx.local, Some(written));
    }

    #[tokio::test]
    async fn rerun_with_same_inputs_is_a_noop_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        ctx.record_download(
            "main",
            "a.bin",
            FileEntry {
                hash: Some("aa".into()),
                size: 4,
                executable: false,
            },
        );

        persist(&mut ctx).await.unwrap();
        let first = std::fs::read(ctx.installation.hashes_path()).unwrap();
        let first_mtime = std::fs::metadata(ctx.installation.hashes_path())
            .unwrap()
            .modified()
            .unwrap();

        persist(&mut ctx).await.unwrap();
        let second = std::fs::read(ctx.installation.hashes_path()).unwrap();
        let second_mtime = std::fs::metadata(ctx.installation.hashes_path())
            .unwrap()
            .modified()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first_mtime, second_mtime);
    }

    #[tokio::test]
    async fn licenses_are_collected_into_the_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        std::fs::create_dir_all(dir.path().join("licenses")).unwrap();
        std::fs::write(dir.path().join("licenses/EULA.txt"), "terms").unwrap();

        ctx.configuration = Some(
            serde_json::from_value(json!({ "licensesFolder": "licenses", "fragments": {} }))
                .unwrap(),
        );

        persist(&mut ctx).await.unwrap();

        let record: Licenses = config::load(&ctx.state_dir).await.unwrap();
        assert_eq!(record.0.len(), 1);
        assert_eq!(record.0[0].title, "EULA");
        assert_eq!(record.0[0].text, "terms");
    }
}
