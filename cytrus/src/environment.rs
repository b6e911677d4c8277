// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

/// Remote manifest protocol version we speak
pub const CYTRUS_VERSION: u64 = 5;

/// The fragment that carries release configuration, always diffed
/// and downloaded first
pub const CONFIGURATION_FRAGMENT: &str = "configuration";

/// Configuration file delivered inside the configuration fragment
pub const CONFIGURATION_FILE: &str = "cytrus.config.json";

/// Archive member carrying the archive's own manifest
pub const ARCHIVE_META_FILE: &str = ".zaap.meta.json";

/// Local manifest of installed files, per release location
pub const LOCAL_HASHES_FILE: &str = ".release.hashes.json";

/// Release identity marker written next to the content tree
pub const RELEASE_INFOS_FILE: &str = ".release.infos.json";

/// Max concurrent file downloads within one fragment
pub const MAX_DOWNLOAD_CONCURRENCY: usize = 6;
/// Max concurrent disk tasks (mkdir, unlink, repair hashing)
pub const MAX_DISK_CONCURRENCY: usize = 10;
/// Max concurrent inner-file downloads while patching an archive
pub const MAX_ARCHIVE_CONCURRENCY: usize = 2;

/// Fetch retry budget for one blob
pub const FETCH_MAX_RETRIES: u32 = 5;
/// Base used for per-attempt fetch timeouts: base × (attempts + 1)
pub const FETCH_TIMEOUT_BASE: Duration = Duration::from_millis(2000);

/// Manifest request retry budget
pub const REQUEST_MAX_RETRIES: u32 = 2;
/// Backoff bounds between manifest request retries
pub const REQUEST_RETRY_MIN: Duration = Duration::from_millis(1000);
pub const REQUEST_RETRY_MAX: Duration = Duration::from_millis(2000);

/// DNS answer lifetime clamp
pub const DNS_TTL_MIN: Duration = Duration::from_secs(30);
pub const DNS_TTL_MAX: Duration = Duration::from_secs(300);

/// A pack replaces its members' individual downloads above this
/// fraction of wanted members
pub const PACK_RATIO: f64 = 0.5;
/// An archive is re-downloaded wholesale above this fraction of
/// changed inner bytes
pub const ARCHIVE_FULL_RATIO: f64 = 0.7;

/// Interval between hash checkpoints while a sequencer is active
pub const SAVE_HASHES_INTERVAL: Duration = Duration::from_secs(10);

/// Download speed measurement: bucket width, retention window and
/// the floor applied to the elapsed divisor
pub const SPEED_BUCKET: Duration = Duration::from_millis(100);
pub const SPEED_WINDOW: Duration = Duration::from_millis(1500);
pub const SPEED_FLOOR: Duration = Duration::from_millis(50);

/// Unix file modes applied after download
pub const MODE_EXECUTABLE: u32 = 0o744;
pub const MODE_PLAIN: u32 = 0o644;

/// Ephemeral download directory under the release location
pub fn download_parts_dir(app_name: &str) -> String {
    format!(".tmp-{app_name}-download-parts")
}
