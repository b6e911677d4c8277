// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use log::warn;

use crate::repository;
use crate::task::{Controls, Stop};

use super::{Context, Error, UpdateKind};

/// Fetch the remote manifest for the targeted version. Pre-installs
/// only need the configuration fragment, served by the `.config`
/// sibling.
pub async fn run(
    repository: &repository::Client,
    ctx: &mut Context,
    controls: &Controls,
) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let remote = match ctx.kind {
        UpdateKind::PreInstall => {
            repository
                .release_config(&ctx.game_uid, &ctx.release_name, ctx.platform, &ctx.version)
                .await
        }
        _ => {
            repository
                .release(&ctx.game_uid, &ctx.release_name, ctx.platform, &ctx.version)
                .await
        }
    }
    .map_err(|error| Stop::Error(Error::Repository(error)))?;

    controls.checkpoint().await?;

    // The size summary drives progress totals; a release without one
    // still updates fine
    match repository
        .release_meta(&ctx.game_uid, &ctx.release_name, ctx.platform, &ctx.version)
        .await
    {
        Ok(meta) => ctx.meta = Some(meta),
        Err(error) => {
            warn!("no usable release meta for {}: {error}", ctx.game_uid);
            ctx.meta = None;
        }
    }

    ctx.remote = Some(remote);

    Ok(())
}
