// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde::Serialize;

/// Error codes surfaced to the embedding host at the engine
/// boundary. Rendered as SCREAMING_SNAKE strings on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    CannotUpdateWhileOffline,
    UpdateRunning,
    LocationNotSet,
    LocationNotFound,
    LocationIsAGameDirectory,
    LocationNotEmpty,
    NotEnoughSpace,
    UserPermissions,
    CytrusVersionNotHandled,
    BadConfiguration,
    LocalHashesError,
    FetchHashMismatch,
    D2pWrongVersion,
    D2pNotFound,
}

impl Code {
    /// Boundary classification of an update run failure, for hosts
    /// that surface coded errors. `None` means a plain transport or
    /// io failure with no dedicated code.
    pub fn classify(error: &crate::action::Error) -> Option<Code> {
        use crate::{action, fetch, repository};

        match error {
            action::Error::Repository(repository::Error::VersionNotHandled { .. }) => {
                Some(Code::CytrusVersionNotHandled)
            }
            action::Error::BadConfiguration(_) => Some(Code::BadConfiguration),
            action::Error::LocalHashes(_) => Some(Code::LocalHashesError),
            action::Error::Fetch(fetch::Error::HashMismatch { .. }) => {
                Some(Code::FetchHashMismatch)
            }
            action::Error::ArchiveRead(d2p::ReadError::WrongVersion { .. }) => {
                Some(Code::D2pWrongVersion)
            }
            action::Error::ArchiveRead(d2p::ReadError::NotFound(_)) => Some(Code::D2pNotFound),
            action::Error::Io(error) => match error.kind() {
                std::io::ErrorKind::PermissionDenied => Some(Code::UserPermissions),
                _ if error.raw_os_error() == Some(28) => Some(Code::NotEnoughSpace),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_render_screaming_snake() {
        assert_eq!(
            Code::CannotUpdateWhileOffline.to_string(),
            "CANNOT_UPDATE_WHILE_OFFLINE"
        );
        assert_eq!(Code::D2pWrongVersion.to_string(), "D2P_WRONG_VERSION");
        assert_eq!(
            Code::LocationIsAGameDirectory.to_string(),
            "LOCATION_IS_A_GAME_DIRECTORY"
        );
    }
}
