// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde_json::Value;
use tokio::fs;

use crate::environment;
use crate::manifest::Manifest;
use crate::task::{Controls, Stop};

use super::{Context, Error};

/// Read the local manifest from `.release.hashes.json`. A missing or
/// legacy-format file surfaces as [`Error::LocalHashes`], promoting
/// the run to a repair.
pub async fn run(ctx: &mut Context, controls: &Controls) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let path = ctx.installation.hashes_path();

    let bytes = fs::read(&path)
        .await
        .map_err(|error| Stop::Error(Error::LocalHashes(format!("{}: {error}", path.display()))))?;

    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|error| Stop::Error(Error::LocalHashes(error.to_string())))?;

    // A v4-era file keeps PascalCase keys; its hashes cannot be
    // trusted against a v5 manifest
    if value
        .get(environment::CONFIGURATION_FRAGMENT)
        .and_then(|fragment| fragment.get("Files"))
        .is_some()
    {
        return Err(Stop::Error(Error::LocalHashes(
            "legacy hash file format".into(),
        )));
    }

    let manifest = Manifest::from_value(value)
        .map_err(|error| Stop::Error(Error::LocalHashes(error.to_string())))?;

    ctx.local = Some(manifest);

    Ok(())
}

#[cfg(test)]
mod test {
    use crate::action::UpdateKind;
    use crate::installation::Installation;
    use crate::platform::Platform;
    use crate::task;

    use super::*;

    fn context(location: &std::path::Path) -> Context {
        Context::new(
            UpdateKind::Update,
            "dofus",
            "main",
            "5.0_3",
            Platform::Linux,
            Installation::open(location, "cytrus"),
            location.join("state"),
            vec!["main".into()],
        )
    }

    #[tokio::test]
    async fn missing_file_is_a_local_hashes_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let (_controller, controls) = task::control();

        let result = run(&mut ctx, &controls).await;
        assert!(matches!(result, Err(Stop::Error(Error::LocalHashes(_)))));
    }

    #[tokio::test]
    async fn legacy_casing_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(environment::LOCAL_HASHES_FILE),
            serde_json::json!({
                "configuration": { "Files": {} }
            })
            .to_string(),
        )
        .unwrap();

        let mut ctx = context(dir.path());
        let (_controller, controls) = task::control();

        let result = run(&mut ctx, &controls).await;
        assert!(matches!(result, Err(Stop::Error(Error::LocalHashes(_)))));
    }

    #[tokio::test]
    async fn wellformed_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(environment::LOCAL_HASHES_FILE),
            serde_json::json!({
                "main": {
                    "files": { "a.bin": { "hash": "aa", "size": 4, "executable": false } }
                }
            })
            .to_string(),
        )
        .unwrap();

        let mut ctx = context(dir.path());
        let (_controller, controls) = task::control();

        run(&mut ctx, &controls).await.unwrap();

        let local = ctx.local.unwrap();
        assert_eq!(local.fragment("main").unwrap().files.len(), 1);
    }
}
