// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use log::debug;

use crate::diff;
use crate::manifest::Manifest;
use crate::task::{Controls, Stop};

use super::{Context, Error};

/// Run the diff engine over the requested fragments. The diff is
/// pure over its inputs, so a fragment change simply schedules this
/// again with the new selection.
pub async fn run(
    ctx: &mut Context,
    fragments: &[String],
    controls: &Controls,
) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let remote = ctx
        .remote
        .as_ref()
        .ok_or_else(|| Stop::Error(Error::LocalHashes("diff needs the remote manifest".into())))?;

    let local = ctx.local.clone().unwrap_or_else(Manifest::default);

    let plan = diff::compute(fragments, &local, remote, ctx.platform);

    debug!(
        "diff over {fragments:?}: {} fragments touched",
        plan.0.len()
    );

    ctx.diff = Some(plan);

    Ok(())
}
