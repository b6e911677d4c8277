// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::fs;

use crate::action::{self, Context, UpdateKind};
use crate::environment;
use crate::error::Code;
use crate::installation::{Installation, StateLayout};
use crate::platform::Platform;
use crate::queue;
use crate::repository;
use crate::sequencer::{self, Sequencer};

pub use self::store::{Record, Repairing, Settings};

pub mod store;

/// One game release (game uid + channel) as the engine manages it:
/// the persisted record, its install location, and the ability to
/// enqueue update runs
pub struct Release {
    repository: Arc<repository::Client>,
    queue: queue::Handle,
    platform: Platform,
    app_name: String,
    state_dir: PathBuf,
    pub record: Record,
    pub settings: Settings,
    /// An update run for this release is queued or running
    running: bool,
    online: bool,
    /// What the in-flight run will commit on completion
    pending_version: Option<String>,
}

impl Release {
    pub async fn open(
        repository: Arc<repository::Client>,
        queue: queue::Handle,
        layout: &StateLayout,
        platform: Platform,
        app_name: impl ToString,
        game_uid: &str,
        release_name: &str,
    ) -> Self {
        let state_dir = layout.release_dir(game_uid, release_name);
        let record = store::load(&state_dir, game_uid, release_name).await;
        let settings = config::load(&state_dir).await.unwrap_or_default();

        Self {
            repository,
            queue,
            platform,
            app_name: app_name.to_string(),
            state_dir,
            record,
            settings,
            running: false,
            online: true,
            pending_version: None,
        }
    }

    pub fn key(&self) -> queue::Key {
        queue::Key {
            game_uid: self.record.game_uid.clone(),
            release_name: self.record.release_name.clone(),
        }
    }

    pub fn installation(&self) -> Option<Installation> {
        self.record
            .location
            .as_ref()
            .map(|location| Installation::open(location, &self.app_name))
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advisory location probe; nothing is scheduled against an
    /// unavailable release
    pub fn is_location_available(&self) -> bool {
        self.installation()
            .map(|installation| installation.is_available())
            .unwrap_or(false)
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Record the latest version the repository advertises
    pub fn observe_repository_version(&mut self, version: impl ToString) {
        self.record.repository_version = Some(version.to_string());
    }

    pub fn is_update_available(&self) -> bool {
        match (&self.record.version, &self.record.repository_version) {
            (Some(installed), Some(latest)) => installed != latest,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    pub async fn save(&self) -> Result<(), Error> {
        store::save(&self.state_dir, &self.record).await?;
        Ok(())
    }

    /// Crash recovery at startup: flags left set by an interrupted
    /// run decide what to resume. Returns the scheduled kind.
    pub async fn setup(&mut self) -> Result<Option<UpdateKind>, Error> {
        let interrupted_install =
            self.record.is_installing && self.record.location.is_some();
        let repairing = self
            .record
            .is_repairing
            .as_ref()
            .is_some_and(Repairing::is_active);

        if self.record.is_dirty || repairing || interrupted_install {
            self.repair().await?;
            return Ok(Some(UpdateKind::Repair));
        }

        if self.record.is_updating {
            self.update().await?;
            return Ok(Some(UpdateKind::Update));
        }

        if self.record.is_moving {
            // The record does not persist the move target, so an
            // interrupted move degrades to repairing in place
            warn!(
                "{}/{}: interrupted move, repairing in place",
                self.record.game_uid, self.record.release_name
            );
            self.record.is_moving = false;
            self.repair().await?;
            return Ok(Some(UpdateKind::Repair));
        }

        Ok(None)
    }

    /// First-time install into `location`
    pub async fn install(
        &mut self,
        location: PathBuf,
        languages: Vec<String>,
    ) -> Result<(), Error> {
        self.ensure_idle()?;
        self.ensure_online()?;
        self.check_install_location(&location).await?;

        self.settings.requested_languages = languages;
        let _ = config::save(&self.state_dir, &self.settings).await;

        self.record.location = Some(location);
        self.record.is_installing = true;

        self.enqueue(UpdateKind::Install).await
    }

    /// Fetch only the configuration fragment, enough to present
    /// install choices before committing to a full install
    pub async fn pre_install(&mut self, location: PathBuf) -> Result<(), Error> {
        self.ensure_idle()?;
        self.ensure_online()?;
        self.check_install_location(&location).await?;

        self.record.location = Some(location);

        self.enqueue(UpdateKind::PreInstall).await
    }

    pub async fn update(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;
        self.ensure_online()?;
        self.ensure_located()?;

        self.record.is_updating = true;

        self.enqueue(UpdateKind::Update).await
    }

    pub async fn repair(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;
        self.ensure_online()?;
        self.ensure_located()?;

        let version = self.target_version()?;
        self.record.is_repairing = Some(Repairing::Version(version));

        self.enqueue(UpdateKind::Repair).await
    }

    /// Remove the managed tree and forget the release
    pub async fn uninstall(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;

        let Some(installation) = self.installation() else {
            return Err(Error::Precondition(Code::LocationNotSet));
        };

        // Only ever delete a tree we own
        match crate::action::write_release_infos::read(&installation).await {
            Some(infos) if infos.game_uid == self.record.game_uid => {}
            _ => return Err(Error::Precondition(Code::LocationIsAGameDirectory)),
        }

        match fs::remove_dir_all(&installation.location).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(Error::Io(error)),
        }

        let _ = config::remove::<Record>(&self.state_dir).await;

        self.record.location = None;
        self.record.is_dirty = false;
        self.record.normalize();

        info!(
            "{}/{} uninstalled",
            self.record.game_uid, self.record.release_name
        );

        Ok(())
    }

    /// Apply a terminal or progress event from the queue to the
    /// persisted record
    pub async fn on_event(&mut self, event: &sequencer::Event) {
        match event {
            sequencer::Event::Progress(snapshot) => {
                self.record.update_downloaded_size = snapshot.overall.downloaded;
                self.record.update_downloaded_size_date = Some(Utc::now());
            }
            sequencer::Event::Completed { fragments } => {
                self.running = false;
                self.record.version = self.pending_version.take();
                self.record.installed_fragments = fragments.clone();
                self.record.is_installing = false;
                self.record.is_updating = false;
                self.record.is_repairing = None;
                self.record.is_dirty = false;
                self.record.update_downloaded_size = 0;
                let _ = self.save().await;
            }
            sequencer::Event::Cancelled => {
                self.running = false;
                self.pending_version = None;
                self.record.is_installing = false;
                self.record.is_updating = false;
                self.record.is_repairing = None;
                let _ = self.save().await;
            }
            sequencer::Event::Error(error) => {
                self.running = false;
                self.pending_version = None;

                let was_installing = self.record.is_installing;

                self.record.is_dirty = true;
                self.record.is_installing = false;
                self.record.is_updating = false;
                self.record.is_repairing = None;

                if was_installing {
                    // A failed install forgets its location entirely
                    self.record.location = None;
                    self.record.normalize();
                }

                let _ = self.save().await;

                if matches!(error, action::Error::LocalHashes(_)) && !was_installing {
                    debug!(
                        "{}/{}: local hashes unusable, scheduling repair",
                        self.record.game_uid, self.record.release_name
                    );
                    if let Err(error) = self.repair().await {
                        warn!("auto-repair failed to schedule: {error}");
                    }
                }
            }
        }
    }

    /// Download an information payload (a tar of presentation
    /// assets) and unpack it into the state directory's data folder
    pub async fn sync_information(&self, hash: &str) -> Result<(), Error> {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let mut stream = self
            .repository
            .information(&self.record.game_uid, hash)
            .await?;

        let data_dir = self.state_dir.join("data");
        fs::create_dir_all(&data_dir).await?;

        let tar_path = self.state_dir.join(format!("information-{hash}.tar"));
        let mut out = fs::File::create(&tar_path).await?;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| {
                Error::Io(io::Error::other(error))
            })?;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        let unpack_tar = tar_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), io::Error> {
            let file = std::fs::File::open(&unpack_tar)?;
            tar::Archive::new(file).unpack(&data_dir)?;
            Ok(())
        })
        .await
        .expect("join unpack task")?;

        let _ = fs::remove_file(&tar_path).await;

        Ok(())
    }

    async fn enqueue(&mut self, kind: UpdateKind) -> Result<(), Error> {
        let version = self.target_version()?;
        let installation = self
            .installation()
            .ok_or(Error::Precondition(Code::LocationNotSet))?;

        let mut fragments = vec![environment::CONFIGURATION_FRAGMENT.to_owned()];
        for fragment in &self.record.installed_fragments {
            if !fragments.contains(fragment) {
                fragments.push(fragment.clone());
            }
        }

        let mut ctx = Context::new(
            kind,
            &self.record.game_uid,
            &self.record.release_name,
            &version,
            self.platform,
            installation,
            self.state_dir.clone(),
            fragments,
        );
        ctx.requested_languages = self.settings.requested_languages.clone();

        let (sequencer, handle, events) = Sequencer::new(
            self.repository.clone(),
            ctx,
            self.record.update_downloaded_size,
        );

        let launch: queue::Launcher = Box::new(move || queue::Running {
            handle,
            events,
            task: tokio::spawn(sequencer.run()),
        });

        self.pending_version = Some(version);
        self.running = true;
        self.save().await?;

        self.queue
            .add(queue::Request {
                key: self.key(),
                launch,
            })
            .await;

        Ok(())
    }

    fn target_version(&self) -> Result<String, Error> {
        self.record
            .repository_version
            .clone()
            .or_else(|| self.record.version.clone())
            .ok_or(Error::NoKnownVersion)
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        if self.running {
            return Err(Error::Precondition(Code::UpdateRunning));
        }
        Ok(())
    }

    fn ensure_online(&self) -> Result<(), Error> {
        if !self.online {
            return Err(Error::Precondition(Code::CannotUpdateWhileOffline));
        }
        Ok(())
    }

    fn ensure_located(&self) -> Result<(), Error> {
        match &self.record.location {
            None => Err(Error::Precondition(Code::LocationNotSet)),
            Some(location) if !location.is_dir() => {
                Err(Error::Precondition(Code::LocationNotFound))
            }
            Some(_) => Ok(()),
        }
    }

    /// An install target must be empty, or already marked as ours
    async fn check_install_location(&self, location: &PathBuf) -> Result<(), Error> {
        if !location.exists() {
            return Ok(());
        }

        let installation = Installation::open(location, &self.app_name);

        if let Some(infos) = crate::action::write_release_infos::read(&installation).await {
            if infos.game_uid == self.record.game_uid {
                return Ok(());
            }
            return Err(Error::Precondition(Code::LocationIsAGameDirectory));
        }

        let mut entries = fs::read_dir(location).await.map_err(Error::Io)?;
        if entries.next_entry().await.map_err(Error::Io)?.is_some() {
            return Err(Error::Precondition(Code::LocationNotEmpty));
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Precondition(Code),
    #[error("no known repository version for this release")]
    NoKnownVersion,
    #[error("repository: {0}")]
    Repository(#[from] repository::Error),
    #[error("store: {0}")]
    Store(#[from] config::SaveError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn code(&self) -> Option<Code> {
        match self {
            Error::Precondition(code) => Some(*code),
            Error::Io(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                Some(Code::UserPermissions)
            }
            _ => None,
        }
    }
}
