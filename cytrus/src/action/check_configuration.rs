// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use log::{debug, warn};
use tokio::process::Command;

use crate::task::{Controls, Stop};

use super::{Context, Error};

/// Execute the configuration's validator script, if any, and map its
/// exit code through the configured results table
pub async fn run(ctx: &mut Context, controls: &Controls) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let Some(check) = ctx
        .configuration
        .as_ref()
        .and_then(|configuration| configuration.check.clone())
    else {
        return Ok(());
    };

    let command = ctx.installation.content_path(&check.command);

    if !command.exists() {
        warn!("configured validator {} is absent, skipping", check.command);
        return Ok(());
    }

    let status = Command::new(&command)
        .current_dir(&ctx.installation.location)
        .status()
        .await
        .map_err(|error| {
            Stop::Error(Error::BadConfiguration(format!(
                "validator failed to start: {error}"
            )))
        })?;

    let code = status.code().unwrap_or(-1);
    debug!("validator {} exited with {code}", check.command);

    if code == 0 {
        return Ok(());
    }

    let message = check
        .results
        .get(&code)
        .cloned()
        .unwrap_or_else(|| format!("validator exited with {code}"));

    Err(Stop::Error(Error::BadConfiguration(message)))
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::action::UpdateKind;
    use crate::installation::Installation;
    use crate::platform::Platform;
    use crate::task;

    use super::*;

    fn context(dir: &std::path::Path, check: serde_json::Value) -> Context {
        let mut ctx = Context::new(
            UpdateKind::Install,
            "dofus",
            "main",
            "5.0_3",
            Platform::Linux,
            Installation::open(dir, "cytrus"),
            dir.join("state"),
            vec![],
        );
        ctx.configuration =
            Some(serde_json::from_value(json!({ "check": check, "fragments": {} })).unwrap());
        ctx
    }

    #[tokio::test]
    async fn no_validator_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), serde_json::Value::Null);
        let (_controller, controls) = task::control();

        run(&mut ctx, &controls).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_maps_through_results() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("check.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut ctx = context(
            dir.path(),
            json!({ "command": "check.sh", "results": { "3": "graphics driver too old" } }),
        );
        let (_controller, controls) = task::control();

        let result = run(&mut ctx, &controls).await;
        match result {
            Err(Stop::Error(Error::BadConfiguration(message))) => {
                assert_eq!(message, "graphics driver too old");
            }
            other => panic!("expected BadConfiguration, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_passes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("check.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut ctx = context(dir.path(), json!({ "command": "check.sh", "results": {} }));
        let (_controller, controls) = task::control();

        run(&mut ctx, &controls).await.unwrap();
    }
}
