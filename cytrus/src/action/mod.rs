// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use thiserror::Error;

use crate::diff::Diff;
use crate::environment;
use crate::installation::Installation;
use crate::manifest::{Archive, Configuration, FileEntry, Manifest, ReleaseMeta};
use crate::platform::Platform;
use crate::repository;
use crate::task::{Controls, Stop};
use crate::{fetch, request};

pub mod archive;
pub mod check_configuration;
pub mod clear_empty_directories;
pub mod create_diff;
pub mod create_directories;
pub mod delete_files;
pub mod download_fragment;
pub mod get_local_hashes;
pub mod get_remote_hashes;
pub mod load_configuration;
pub mod repair;
pub mod save_hashes;
pub mod write_release_infos;

/// What a sequencer run is trying to achieve; decides queue
/// composition and which manifest resource backs the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    PreInstall,
    Install,
    Update,
    Repair,
}

/// Shared state threaded through an update run. Each action borrows
/// it exclusively and records its outputs in named fields.
pub struct Context {
    pub kind: UpdateKind,
    pub game_uid: String,
    /// Release channel name (`main`, `beta`, ...)
    pub release_name: String,
    pub version: String,
    pub platform: Platform,
    pub installation: Installation,
    /// Per-release state directory (release.json, licenses.json)
    pub state_dir: PathBuf,
    /// Fragments the run is installing; rewritten by
    /// [`load_configuration`] when the configuration says otherwise
    pub fragments: Vec<String>,
    /// Fragments already present from an earlier run
    pub installed_fragments: Vec<String>,
    /// Languages the release wants, driving fragment selection
    pub requested_languages: Vec<String>,

    pub remote: Option<Manifest>,
    pub meta: Option<ReleaseMeta>,
    pub local: Option<Manifest>,
    pub diff: Option<Diff>,
    pub configuration: Option<Configuration>,

    /// fragment -> path -> entry, accumulated by downloads and
    /// folded into the local manifest by [`save_hashes`]
    pub downloaded: BTreeMap<String, BTreeMap<String, FileEntry>>,
    /// fragment -> archive path -> inner manifest
    pub downloaded_archives: BTreeMap<String, BTreeMap<String, Archive>>,
    /// (fragment, path) pairs unlinked by [`delete_files`]
    pub deleted: Vec<(String, String)>,

    /// Advisory: an unlink hit an in-use error on the host platform
    pub opened_by_external_process: bool,

    pub last_save: Instant,
}

impl Context {
    pub fn new(
        kind: UpdateKind,
        game_uid: impl ToString,
        release_name: impl ToString,
        version: impl ToString,
        platform: Platform,
        installation: Installation,
        state_dir: PathBuf,
        fragments: Vec<String>,
    ) -> Self {
        Self {
            kind,
            game_uid: game_uid.to_string(),
            release_name: release_name.to_string(),
            version: version.to_string(),
            platform,
            installation,
            state_dir,
            installed_fragments: fragments.clone(),
            fragments,
            requested_languages: vec![],
            remote: None,
            meta: None,
            local: None,
            diff: None,
            configuration: None,
            downloaded: BTreeMap::new(),
            downloaded_archives: BTreeMap::new(),
            deleted: vec![],
            opened_by_external_process: false,
            last_save: Instant::now(),
        }
    }

    /// Record one placed file for the local manifest merge
    pub fn record_download(&mut self, fragment: &str, path: &str, entry: FileEntry) {
        self.downloaded
            .entry(fragment.to_owned())
            .or_default()
            .insert(path.to_owned(), entry);
    }

    /// Checkpoint the local manifest if the periodic interval lapsed
    pub async fn maybe_save(&mut self) -> Result<(), Error> {
        if self.last_save.elapsed() >= environment::SAVE_HASHES_INTERVAL {
            save_hashes::persist(self).await?;
        }

        Ok(())
    }
}

/// The explicit registry of update steps. The sequencer composes
/// runs out of these; there is no dynamic discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    GetRemoteHashes,
    GetLocalHashes,
    Repair,
    CreateDiff { fragments: Vec<String> },
    LoadConfiguration,
    CheckConfiguration,
    WriteReleaseInfos,
    CreateDirectories { fragment: String },
    DownloadFragment { fragment: String },
    DeleteFiles,
    ClearEmptyDirectories,
    SaveHashes,
}

impl Action {
    pub async fn run(
        &self,
        repository: &repository::Client,
        ctx: &mut Context,
        controls: &Controls,
    ) -> Result<(), Stop<Error>> {
        match self {
            Action::GetRemoteHashes => get_remote_hashes::run(repository, ctx, controls).await,
            Action::GetLocalHashes => get_local_hashes::run(ctx, controls).await,
            Action::Repair => repair::run(ctx, controls).await,
            Action::CreateDiff { fragments } => create_diff::run(ctx, fragments, controls).await,
            Action::LoadConfiguration => load_configuration::run(ctx, controls).await,
            Action::CheckConfiguration => check_configuration::run(ctx, controls).await,
            Action::WriteReleaseInfos => write_release_infos::run(ctx, controls).await,
            Action::CreateDirectories { fragment } => {
                create_directories::run(ctx, fragment, controls).await
            }
            Action::DownloadFragment { fragment } => {
                download_fragment::run(repository, ctx, fragment, controls).await
            }
            Action::DeleteFiles => delete_files::run(ctx, controls).await,
            Action::ClearEmptyDirectories => clear_empty_directories::run(ctx, controls).await,
            Action::SaveHashes => {
                controls.checkpoint().await?;
                save_hashes::run(ctx).await.map_err(Stop::Error)
            }
        }
    }

    /// Actions that survive a mid-flight fragment change; everything
    /// else is cleared from the queue and rebuilt
    pub fn survives_fragment_change(&self) -> bool {
        matches!(
            self,
            Action::GetRemoteHashes
                | Action::GetLocalHashes
                | Action::LoadConfiguration
                | Action::CheckConfiguration
                | Action::WriteReleaseInfos
        )
    }

    /// Whether a fragment change may cancel this action while it is
    /// executing. Configuration work always runs to completion.
    pub fn cancellable_on_fragment_change(&self) -> bool {
        match self {
            Action::DownloadFragment { fragment } => {
                fragment != environment::CONFIGURATION_FRAGMENT
            }
            Action::CreateDiff { fragments } => fragments
                .iter()
                .any(|fragment| fragment != environment::CONFIGURATION_FRAGMENT),
            _ => false,
        }
    }

    /// Fragment this action operates on, when it has one
    pub fn fragment(&self) -> Option<&str> {
        match self {
            Action::CreateDirectories { fragment } | Action::DownloadFragment { fragment } => {
                Some(fragment)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("repository: {0}")]
    Repository(#[from] repository::Error),
    #[error("request: {0}")]
    Request(#[from] request::Error),
    #[error("fetch: {0}")]
    Fetch(#[from] fetch::Error),
    #[error("local hashes unusable: {0}")]
    LocalHashes(String),
    #[error("configuration check failed: {0}")]
    BadConfiguration(String),
    #[error("archive read: {0}")]
    ArchiveRead(#[from] d2p::ReadError),
    #[error("archive write: {0}")]
    ArchiveWrite(#[from] d2p::WriteError),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fragment_change_classification() {
        let config_download = Action::DownloadFragment {
            fragment: "configuration".into(),
        };
        let content_download = Action::DownloadFragment {
            fragment: "fr".into(),
        };

        assert!(!config_download.cancellable_on_fragment_change());
        assert!(content_download.cancellable_on_fragment_change());

        let config_diff = Action::CreateDiff {
            fragments: vec!["configuration".into()],
        };
        let full_diff = Action::CreateDiff {
            fragments: vec!["configuration".into(), "en".into()],
        };

        assert!(!config_diff.cancellable_on_fragment_change());
        assert!(full_diff.cancellable_on_fragment_change());
    }

    #[test]
    fn queue_clearing_spares_configuration_steps() {
        assert!(Action::GetRemoteHashes.survives_fragment_change());
        assert!(Action::WriteReleaseInfos.survives_fragment_change());
        assert!(!Action::DeleteFiles.survives_fragment_change());
        assert!(!Action::SaveHashes.survives_fragment_change());
        assert!(
            !Action::DownloadFragment {
                fragment: "en".into()
            }
            .survives_fragment_change()
        );
    }
}
