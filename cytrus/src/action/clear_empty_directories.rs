// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use log::trace;
use tokio::task::spawn_blocking;
use walkdir::WalkDir;

use crate::task::{Controls, Stop};

use super::{Context, Error};

/// Remove directories left empty by deletions, deepest first. The
/// location itself always survives.
pub async fn run(ctx: &mut Context, controls: &Controls) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let location = ctx.installation.location.clone();

    let removed = sweep(location).await.map_err(Stop::Error)?;

    trace!("cleared {removed} empty directories");

    Ok(())
}

async fn sweep(location: PathBuf) -> Result<usize, Error> {
    spawn_blocking(move || {
        let mut removed = 0;

        // contents_first yields children before their parent, so a
        // directory only holding empty directories unwinds in one pass
        for entry in WalkDir::new(&location)
            .contents_first(true)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_dir() || entry.path() == location {
                continue;
            }

            if is_empty(entry.path()) && std::fs::remove_dir(entry.path()).is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    })
    .await
    .expect("join sweep task")
}

fn is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
