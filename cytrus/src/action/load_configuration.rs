// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use tokio::fs;

use crate::environment;
use crate::manifest::Configuration;
use crate::task::{Controls, Stop};

use super::{Context, Error};

/// Parse the downloaded configuration fragment and recompute the
/// fragment selection. The sequencer compares the selection before
/// and after to detect a mid-flight change.
pub async fn run(ctx: &mut Context, controls: &Controls) -> Result<(), Stop<Error>> {
    controls.checkpoint().await?;

    let path = ctx
        .installation
        .content_path(environment::CONFIGURATION_FILE);

    let bytes = fs::read(&path).await.map_err(|error| {
        Stop::Error(Error::BadConfiguration(format!(
            "missing {}: {error}",
            environment::CONFIGURATION_FILE
        )))
    })?;

    let configuration: Configuration = serde_json::from_slice(&bytes)
        .map_err(|error| Stop::Error(Error::BadConfiguration(error.to_string())))?;

    ctx.fragments = select_fragments(
        &configuration,
        &ctx.installed_fragments,
        &ctx.requested_languages,
    );
    ctx.configuration = Some(configuration);

    Ok(())
}

/// Selection rule: the configuration fragment always, previously
/// installed fragments, defaults, and fragments matching a requested
/// language
pub fn select_fragments(
    configuration: &Configuration,
    installed: &[String],
    languages: &[String],
) -> Vec<String> {
    let mut selected = vec![environment::CONFIGURATION_FRAGMENT.to_owned()];

    for (name, rule) in &configuration.fragments {
        if name == environment::CONFIGURATION_FRAGMENT {
            continue;
        }

        let wanted = rule.default
            || installed.contains(name)
            || rule
                .languages
                .iter()
                .any(|language| languages.contains(language));

        if wanted {
            selected.push(name.clone());
        }
    }

    selected
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn configuration() -> Configuration {
        serde_json::from_value(json!({
            "fragments": {
                "main": { "default": true },
                "fr": { "languages": ["fr"] },
                "en": { "languages": ["en"] },
                "hd": {}
            }
        }))
        .unwrap()
    }

    #[test]
    fn defaults_and_languages_are_selected() {
        let selected = select_fragments(&configuration(), &[], &["en".into()]);

        assert_eq!(selected, ["configuration", "en", "main"]);
    }

    #[test]
    fn installed_fragments_stay_selected() {
        let selected = select_fragments(&configuration(), &["hd".into()], &[]);

        assert!(selected.contains(&"hd".to_owned()));
        assert!(selected.contains(&"main".to_owned()));
        assert!(!selected.contains(&"fr".to_owned()));
    }
}
