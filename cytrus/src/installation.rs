// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use crate::environment;

/// On-disk layout of one release's install location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pub location: PathBuf,
    pub app_name: String,
}

impl Installation {
    pub fn open(location: impl Into<PathBuf>, app_name: impl ToString) -> Self {
        Self {
            location: location.into(),
            app_name: app_name.to_string(),
        }
    }

    /// Local manifest of installed files and their hashes
    pub fn hashes_path(&self) -> PathBuf {
        self.location.join(environment::LOCAL_HASHES_FILE)
    }

    /// Release identity marker
    pub fn infos_path(&self) -> PathBuf {
        self.location.join(environment::RELEASE_INFOS_FILE)
    }

    /// Ephemeral directory for in-flight download parts, owned by
    /// the active download and removed on any exit path
    pub fn download_parts_dir(&self) -> PathBuf {
        self.location
            .join(environment::download_parts_dir(&self.app_name))
    }

    /// Resolve a forward-slash manifest path inside the content tree
    pub fn content_path(&self, relative: &str) -> PathBuf {
        self.location.join(relative)
    }

    /// Advisory probe: a missing location means no action may be
    /// scheduled against this release
    pub fn is_available(&self) -> bool {
        self.location.is_dir()
    }
}

/// Layout of the per-release state directory, kept apart from the
/// content tree:
/// `<dataRoot>/repositories/<repoName>/<gameUid>/<releaseName>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    pub data_root: PathBuf,
    pub repository_name: String,
}

impl StateLayout {
    pub fn new(data_root: impl Into<PathBuf>, repository_name: impl ToString) -> Self {
        Self {
            data_root: data_root.into(),
            repository_name: repository_name.to_string(),
        }
    }

    pub fn release_dir(&self, game_uid: &str, release_name: &str) -> PathBuf {
        self.data_root
            .join("repositories")
            .join(&self.repository_name)
            .join(game_uid)
            .join(release_name)
    }

    /// Presentation assets, tar-extracted from information payloads
    pub fn data_dir(&self, game_uid: &str, release_name: &str) -> PathBuf {
        self.release_dir(game_uid, release_name).join("data")
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;

    #[test]
    fn layout_paths() {
        let installation = Installation::open("/games/dofus", "cytrus");

        assert_eq!(
            installation.hashes_path(),
            Path::new("/games/dofus/.release.hashes.json")
        );
        assert_eq!(
            installation.download_parts_dir(),
            Path::new("/games/dofus/.tmp-cytrus-download-parts")
        );
        assert_eq!(
            installation.content_path("data/maps/m.d2p"),
            Path::new("/games/dofus/data/maps/m.d2p")
        );
    }

    #[test]
    fn state_dirs() {
        let layout = StateLayout::new("/home/u/.local/share/app", "production");

        assert_eq!(
            layout.release_dir("dofus", "main"),
            Path::new("/home/u/.local/share/app/repositories/production/dofus/main")
        );
        assert_eq!(
            layout.data_dir("dofus", "beta"),
            Path::new("/home/u/.local/share/app/repositories/production/dofus/beta/data")
        );
    }
}
