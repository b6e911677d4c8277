// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::task::{Controls, Stop};

use super::{Context, Error};

/// Identity marker written next to the content tree so a directory
/// can be recognized as a managed install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfos {
    pub game_uid: String,
    pub release: String,
}

pub async fn run(ctx: &mut Context, controls: &Controls) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let infos = ReleaseInfos {
        game_uid: ctx.game_uid.clone(),
        release: ctx.release_name.clone(),
    };

    let bytes = serde_json::to_vec_pretty(&infos).map_err(|error| Stop::Error(Error::Decode(error)))?;

    fs::create_dir_all(&ctx.installation.location)
        .await
        .map_err(|error| Stop::Error(Error::Io(error)))?;
    fs::write(ctx.installation.infos_path(), bytes)
        .await
        .map_err(|error| Stop::Error(Error::Io(error)))?;

    Ok(())
}

/// Read a marker back, used to recognize foreign game directories
/// before installing into them
pub async fn read(installation: &crate::installation::Installation) -> Option<ReleaseInfos> {
    let bytes = fs::read(installation.infos_path()).await.ok()?;

    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod test {
    use crate::action::UpdateKind;
    use crate::installation::Installation;
    use crate::platform::Platform;
    use crate::task;

    use super::*;

    #[tokio::test]
    async fn writes_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(
            UpdateKind::Install,
            "dofus",
            "beta",
            "5.0_3",
            Platform::Linux,
            Installation::open(dir.path(), "cytrus"),
            dir.path().join("state"),
            vec![],
        );
        let (_controller, controls) = task::control();

        run(&mut ctx, &controls).await.unwrap();

        let infos = read(&ctx.installation).await.unwrap();
        assert_eq!(infos.game_uid, "dofus");
        assert_eq!(infos.release, "beta");
    }
}
