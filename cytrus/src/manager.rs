// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use crate::installation::StateLayout;
use crate::platform::Platform;
use crate::queue::{self, Gate, Key, QueueEvent};
use crate::release::Release;
use crate::repository::{self, GamesList};

/// Host-provided engine configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub repository: url::Url,
    pub repository_name: String,
    pub platform: Platform,
    pub data_root: PathBuf,
    pub app_name: String,
    pub pre_release: bool,
}

impl Settings {
    /// Conventional data root under the platform's data directory
    pub fn default_data_root(app_name: &str) -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(app_name)
    }
}

/// Owns the update queue and the known releases; the single
/// orchestrator the host talks to
pub struct Manager {
    settings: Settings,
    repository: Arc<repository::Client>,
    layout: StateLayout,
    queue: queue::Handle,
    events: mpsc::Receiver<QueueEvent>,
    releases: HashMap<Key, Release>,
}

impl Manager {
    pub fn new(settings: Settings) -> Self {
        let repository = Arc::new(repository::Client::new(settings.repository.clone()));
        let layout = StateLayout::new(&settings.data_root, &settings.repository_name);

        let (queue_actor, queue_handle, events) = queue::new();
        tokio::spawn(queue_actor.run());

        Self {
            settings,
            repository,
            layout,
            queue: queue_handle,
            events,
            releases: HashMap::new(),
        }
    }

    pub fn repository(&self) -> &Arc<repository::Client> {
        &self.repository
    }

    pub fn queue(&self) -> &queue::Handle {
        &self.queue
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Fetch or open the release for a game uid and channel
    pub async fn release(&mut self, game_uid: &str, release_name: &str) -> &mut Release {
        let key = Key {
            game_uid: game_uid.to_owned(),
            release_name: release_name.to_owned(),
        };

        if !self.releases.contains_key(&key) {
            let release = Release::open(
                self.repository.clone(),
                self.queue.clone(),
                &self.layout,
                self.settings.platform,
                &self.settings.app_name,
                game_uid,
                release_name,
            )
            .await;

            self.releases.insert(key.clone(), release);
        }

        self.releases.get_mut(&key).expect("release just inserted")
    }

    pub fn releases(&mut self) -> impl Iterator<Item = &mut Release> {
        self.releases.values_mut()
    }

    /// Poll the repository's games list on an interval, honouring
    /// the pre-release setting
    pub fn watch_games_list(
        &self,
        interval: std::time::Duration,
    ) -> mpsc::Receiver<repository::Event> {
        repository::watch(
            self.repository.clone(),
            None,
            repository::PollerSettings {
                interval,
                pre_release: self.settings.pre_release,
            },
        )
    }

    /// Fold a fresh games list into the known releases: track the
    /// advertised latest versions, creating releases on first
    /// observation
    pub async fn observe_games_list(&mut self, list: &GamesList) {
        let platform = self.settings.platform.to_string();

        let observed: Vec<(String, String, String)> = list
            .games
            .iter()
            .filter_map(|(game_uid, game)| {
                game.platforms
                    .get(&platform)
                    .map(|releases| (game_uid, releases))
            })
            .flat_map(|(game_uid, releases)| {
                releases.iter().map(|(release_name, version)| {
                    (game_uid.clone(), release_name.clone(), version.clone())
                })
            })
            .collect();

        for (game_uid, release_name, version) in observed {
            let release = self.release(&game_uid, &release_name).await;
            release.observe_repository_version(&version);
        }
    }

    /// Connectivity changes gate the queue and every release
    pub async fn set_online(&mut self, online: bool) {
        debug!("connectivity: online={online}");

        self.queue.set_gate(Gate::Offline, !online).await;

        for release in self.releases.values_mut() {
            release.set_online(online);
        }
    }

    /// The host application started or finished downloading its own
    /// update
    pub async fn set_self_updating(&mut self, active: bool) {
        self.queue.set_gate(Gate::SelfUpdate, active).await;
    }

    /// Drain pending queue events into the releases they belong to.
    /// Returns the drained events for the host UI.
    pub async fn pump_events(&mut self) -> Vec<QueueEvent> {
        let mut drained = vec![];

        while let Ok(event) = self.events.try_recv() {
            if let Some(release) = self.releases.get_mut(&event.key) {
                release.on_event(&event.event).await;
            }
            drained.push(event);
        }

        drained
    }

    /// Run crash recovery for every known release
    pub async fn setup(&mut self) {
        for release in self.releases.values_mut() {
            if let Err(error) = release.setup().await {
                debug!("setup skipped a release: {error}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn settings(dir: &std::path::Path) -> Settings {
        Settings {
            repository: "https://repo.invalid/cytrus".parse().unwrap(),
            repository_name: "production".into(),
            platform: Platform::Linux,
            data_root: dir.to_owned(),
            app_name: "cytrus".into(),
            pre_release: false,
        }
    }

    #[tokio::test]
    async fn games_list_observation_creates_releases() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = Manager::new(settings(dir.path()));

        let list: GamesList = serde_json::from_value(serde_json::json!({
            "version": 5,
            "games": {
                "dofus": {
                    "gameId": 1,
                    "name": "Dofus",
                    "platforms": {
                        "linux": { "main": "5.0_3", "beta": "5.1_0" },
                        "windows": { "main": "5.0_3" }
                    }
                }
            }
        }))
        .unwrap();

        manager.observe_games_list(&list).await;

        let release = manager.release("dofus", "beta").await;
        assert_eq!(
            release.record.repository_version.as_deref(),
            Some("5.1_0")
        );
        assert!(release.is_update_available());

        // Only this platform's channels appear
        assert_eq!(manager.releases.len(), 2);
    }

    #[tokio::test]
    async fn releases_are_opened_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = Manager::new(settings(dir.path()));

        manager.release("dofus", "main").await.record.is_dirty = true;
        assert!(manager.release("dofus", "main").await.record.is_dirty);
    }
}
