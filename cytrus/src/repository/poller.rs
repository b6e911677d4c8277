// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use std::time::Duration;

use log::trace;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;

use super::{Client, Error, GamesList};

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub interval: Duration,
    /// Fold `preReleasedGames` into `games` before comparing and
    /// emitting
    pub pre_release: bool,
}

#[derive(Debug)]
pub enum Event {
    /// The games list changed since the previous poll
    Update(GamesList),
    CheckFailed(Error),
}

/// Poll `cytrus.json` on an interval, emitting [`Event::Update`]
/// whenever the list deep-compares unequal to the previous one.
/// Dropping the receiver stops the poller.
pub fn watch(
    client: Arc<Client>,
    initial: Option<Value>,
    settings: PollerSettings,
) -> mpsc::Receiver<Event> {
    let (sender, receiver) = mpsc::channel(16);

    tokio::spawn(async move {
        let mut previous = initial.map(|value| effective(value, settings.pre_release));
        let mut ticker = time::interval(settings.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let event = match client.games_list_value().await {
                Ok(value) => {
                    let value = effective(value, settings.pre_release);

                    if previous.as_ref() == Some(&value) {
                        trace!("games list unchanged");
                        continue;
                    }

                    let decoded = serde_json::from_value::<GamesList>(value.clone());
                    previous = Some(value);

                    match decoded {
                        Ok(list) => Event::Update(list),
                        Err(error) => Event::CheckFailed(Error::Decode(error)),
                    }
                }
                Err(error) => Event::CheckFailed(error),
            };

            if sender.send(event).await.is_err() {
                break;
            }
        }
    });

    receiver
}

/// The list as consumers should see it: pre-released entries merged
/// over the stable ones when enabled
fn effective(mut value: Value, pre_release: bool) -> Value {
    if !pre_release {
        return value;
    }

    let Some(pre) = value
        .as_object_mut()
        .and_then(|root| root.remove("preReleasedGames"))
    else {
        return value;
    };

    if let Some(games) = value.get_mut("games") {
        deep_merge(games, pre);
    }

    value
}

fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn pre_release_merges_over_stable() {
        let value = json!({
            "version": 5,
            "games": {
                "dofus": { "name": "Dofus", "platforms": { "linux": { "main": "1.0" } } }
            },
            "preReleasedGames": {
                "dofus": { "platforms": { "linux": { "beta": "2.0-beta" } } },
                "wakfu": { "name": "Wakfu" }
            }
        });

        let merged = effective(value, true);
        let games = &merged["games"];

        assert_eq!(games["dofus"]["platforms"]["linux"]["main"], "1.0");
        assert_eq!(games["dofus"]["platforms"]["linux"]["beta"], "2.0-beta");
        assert_eq!(games["wakfu"]["name"], "Wakfu");
        assert!(merged.get("preReleasedGames").is_none());
    }

    #[test]
    fn disabled_pre_release_is_untouched() {
        let value = json!({
            "games": {},
            "preReleasedGames": { "wakfu": {} }
        });

        let kept = effective(value.clone(), false);
        assert_eq!(kept, value);
    }
}
