// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::{stream, StreamExt};
use itertools::Itertools;
use log::{debug, warn};
use tokio::fs;
use tokio::task::spawn_blocking;

use crate::diff::FragmentDiff;
use crate::environment;
use crate::fetch::{self, Target, Unit};
use crate::manifest::FileEntry;
use crate::repository;
use crate::task::{Controls, Stop};

use super::{archive, Context, Error};

/// Bring one fragment's files in line with the diff: fetch changed
/// blobs (fanned out over shared hashes), extract packs, patch
/// archives in place, and fix permission-only drift. The ephemeral
/// parts directory is owned by this action and removed on every
/// completed exit, success or not.
pub async fn run(
    repository: &repository::Client,
    ctx: &mut Context,
    fragment: &str,
    controls: &Controls,
) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let Some(bucket) = ctx
        .diff
        .as_ref()
        .and_then(|diff| diff.fragment(fragment))
        .cloned()
    else {
        return Ok(());
    };

    let parts_dir = ctx.installation.download_parts_dir();
    fs::create_dir_all(&parts_dir)
        .await
        .map_err(|error| Stop::Error(Error::Io(error)))?;

    let result = execute(repository, ctx, fragment, &bucket, &parts_dir, controls).await;

    let _ = fs::remove_dir_all(&parts_dir).await;

    result
}

struct Job {
    unit: Unit,
    /// (manifest path, entry) pairs to record once the unit landed
    records: Vec<(String, FileEntry)>,
}

async fn execute(
    repository: &repository::Client,
    ctx: &mut Context,
    fragment: &str,
    bucket: &FragmentDiff,
    parts_dir: &Path,
    controls: &Controls,
) -> Result<(), Stop<Error>> {
    // Permission-only drift first; no network involved
    for (path, entry) in &bucket.files {
        if entry.update_permissions && !entry.download {
            let absolute = ctx.installation.content_path(path);
            match fetch::set_mode(&absolute, entry.executable).await {
                Ok(()) => {
                    ctx.record_download(
                        fragment,
                        path,
                        FileEntry {
                            hash: entry.hash.clone(),
                            size: entry.size,
                            executable: entry.executable,
                        },
                    );
                }
                Err(fetch::Error::Io(error))
                    if error.kind() == std::io::ErrorKind::NotFound =>
                {
                    warn!("chmod target {path} vanished, skipping");
                }
                Err(error) => return Err(Stop::Error(Error::Fetch(error))),
            }
        }
    }

    let jobs = plain_jobs(ctx, bucket);
    run_jobs(repository, ctx, fragment, jobs, controls, parts_dir).await?;

    for (path, entry) in &bucket.files {
        if entry.is_pack && entry.download {
            extract_pack(repository, ctx, fragment, path, entry, parts_dir, controls).await?;
        }
    }

    for (path, entry) in &bucket.files {
        let Some(remote_inner) = &entry.archive else {
            continue;
        };
        if !entry.download {
            continue;
        }

        let local_inner = ctx
            .local
            .as_ref()
            .and_then(|local| local.fragment(fragment))
            .and_then(|fragment| fragment.archives.get(path))
            .cloned();

        archive::patch(
            repository,
            &ctx.game_uid,
            &ctx.installation,
            path,
            entry,
            remote_inner,
            local_inner,
            parts_dir,
            controls,
        )
        .await?;

        ctx.record_download(
            fragment,
            path,
            FileEntry {
                hash: entry.hash.clone(),
                size: entry.size,
                executable: entry.executable,
            },
        );
        ctx.downloaded_archives
            .entry(fragment.to_owned())
            .or_default()
            .insert(path.to_owned(), remote_inner.clone());

        ctx.maybe_save().await.map_err(Stop::Error)?;
    }

    Ok(())
}

/// Individual blob downloads: every entry marked for download that
/// is neither a pack nor an archive, grouped by content hash so
/// shared blobs are fetched once and fanned out
fn plain_jobs(ctx: &Context, bucket: &FragmentDiff) -> Vec<Job> {
    bucket
        .files
        .iter()
        .filter(|(_, entry)| entry.download && !entry.is_pack && entry.archive.is_none())
        .filter_map(|(path, entry)| {
            entry
                .hash
                .clone()
                .map(|hash| (hash, (path.clone(), entry.size, entry.executable)))
        })
        .into_group_map()
        .into_iter()
        .map(|(hash, group)| {
            let size = group.first().map(|(_, size, _)| *size).unwrap_or_default();

            Job {
                unit: Unit {
                    hash: hash.clone(),
                    size,
                    targets: group
                        .iter()
                        .map(|(path, _, executable)| Target {
                            path: ctx.installation.content_path(path),
                            executable: *executable,
                        })
                        .collect(),
                    verify: true,
                },
                records: group
                    .into_iter()
                    .map(|(path, size, executable)| {
                        (
                            path,
                            FileEntry {
                                hash: Some(hash.clone()),
                                size,
                                executable,
                            },
                        )
                    })
                    .collect(),
            }
        })
        .collect()
}

/// Drive jobs at the download concurrency cap, recording each unit
/// as it completes and checkpointing hashes on the periodic interval
async fn run_jobs(
    repository: &repository::Client,
    ctx: &mut Context,
    fragment: &str,
    jobs: Vec<Job>,
    controls: &Controls,
    parts_dir: &Path,
) -> Result<(), Stop<Error>> {
    if jobs.is_empty() {
        return Ok(());
    }

    debug!("downloading {} units for fragment {fragment}", jobs.len());

    let game_uid = ctx.game_uid.clone();

    let mut completions = stream::iter(jobs.into_iter().map(|job| {
        let game_uid = game_uid.clone();
        async move {
            fetch::fetch(repository, &game_uid, &job.unit, parts_dir, controls)
                .await
                .map(|()| job.records)
        }
    }))
    .buffer_unordered(environment::MAX_DOWNLOAD_CONCURRENCY);

    while let Some(completion) = completions.next().await {
        let records = completion.map_err(|stop| match stop {
            Stop::Cancelled => Stop::Cancelled,
            Stop::Error(error) => Stop::Error(Error::Fetch(error)),
        })?;

        for (path, entry) in records {
            ctx.record_download(fragment, &path, entry);
        }

        ctx.maybe_save().await.map_err(Stop::Error)?;
    }

    Ok(())
}

/// Download a pack blob and fan its members out to their paths. A
/// member missing from the tar falls back to individual fetches of
/// the absent hashes.
async fn extract_pack(
    repository: &repository::Client,
    ctx: &mut Context,
    fragment: &str,
    pack_hash: &str,
    entry: &crate::diff::Entry,
    parts_dir: &Path,
    controls: &Controls,
) -> Result<(), Stop<Error>> {
    let Some(pack_files) = &entry.pack_files else {
        return Ok(());
    };

    let tar_path = parts_dir.join(format!("pack-{pack_hash}.tar"));

    let unit = Unit {
        hash: pack_hash.to_owned(),
        size: entry.size,
        targets: vec![Target {
            path: tar_path.clone(),
            executable: false,
        }],
        verify: true,
    };

    fetch::fetch(repository, &ctx.game_uid, &unit, parts_dir, controls)
        .await
        .map_err(|stop| match stop {
            Stop::Cancelled => Stop::Cancelled,
            Stop::Error(error) => Stop::Error(Error::Fetch(error)),
        })?;

    let members = untar_members(tar_path.clone(), parts_dir.to_owned())
        .await
        .map_err(Stop::Error)?;

    let mut missing: Vec<(String, FileEntry)> = vec![];

    for (path, file) in pack_files {
        let Some(hash) = &file.hash else {
            continue;
        };

        let member = parts_dir.join(format!("member-{hash}"));
        if !member.exists() {
            missing.push((path.clone(), file.clone()));
            continue;
        }

        let absolute = ctx.installation.content_path(path);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| Stop::Error(Error::Io(error)))?;
        }
        fs::copy(&member, &absolute)
            .await
            .map_err(|error| Stop::Error(Error::Io(error)))?;
        fetch::set_mode(&absolute, file.executable)
            .await
            .map_err(|error| Stop::Error(Error::Fetch(error)))?;

        ctx.record_download(fragment, path, file.clone());
    }

    let _ = fs::remove_file(&tar_path).await;

    if !missing.is_empty() {
        warn!(
            "pack {pack_hash}: {} members absent ({} extracted), fetching individually",
            missing.len(),
            members.len()
        );

        let mut by_hash: BTreeMap<String, Job> = BTreeMap::new();
        for (path, file) in missing {
            let Some(hash) = file.hash.clone() else {
                continue;
            };
            let job = by_hash.entry(hash.clone()).or_insert_with(|| Job {
                unit: Unit {
                    hash,
                    size: file.size,
                    targets: vec![],
                    verify: true,
                },
                records: vec![],
            });
            job.unit.targets.push(Target {
                path: ctx.installation.content_path(&path),
                executable: file.executable,
            });
            job.records.push((path, file));
        }

        run_jobs(
            repository,
            ctx,
            fragment,
            by_hash.into_values().collect(),
            controls,
            parts_dir,
        )
        .await?;
    }

    ctx.maybe_save().await.map_err(Stop::Error)?;

    Ok(())
}

/// Unpack pack members (named by content hash) next to the tar;
/// returns the member names seen
async fn untar_members(tar_path: PathBuf, parts_dir: PathBuf) -> Result<Vec<String>, Error> {
    spawn_blocking(move || {
        let file = std::fs::File::open(&tar_path)?;
        let mut archive = tar::Archive::new(file);

        let mut members = vec![];

        for entry in archive.entries()? {
            let mut entry = entry?;

            if !entry.header().entry_type().is_file() {
                continue;
            }

            let name = entry.path()?.to_string_lossy().into_owned();
            let out = parts_dir.join(format!("member-{name}"));

            let mut out_file = std::fs::File::create(&out)?;
            std::io::copy(&mut entry, &mut out_file)?;

            members.push(name);
        }

        Ok(members)
    })
    .await
    .expect("join untar task")
}
