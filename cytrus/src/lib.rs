// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Game-content update engine speaking the cytrus v5 repository
//! protocol: manifest reconciliation, resumable hash-verified
//! downloads, pausable update runs and a single-runner update queue.

pub use self::error::Code;
pub use self::installation::{Installation, StateLayout};
pub use self::manager::{Manager, Settings};
pub use self::manifest::Manifest;
pub use self::platform::Platform;
pub use self::release::Release;
pub use self::sequencer::Sequencer;

pub mod action;
pub mod diff;
pub mod environment;
pub mod error;
pub mod fetch;
pub mod installation;
pub mod manager;
pub mod manifest;
pub mod platform;
pub mod queue;
pub mod release;
pub mod repository;
mod request;
pub mod sequencer;
pub mod task;
