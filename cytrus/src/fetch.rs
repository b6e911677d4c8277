// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use reqwest::header::{ACCEPT_RANGES, RANGE};
use reqwest::StatusCode;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::environment;
use crate::repository;
use crate::task::{Controls, Progress, Stop};

/// One download unit: a content blob fanned out to every target
/// path sharing its hash
#[derive(Debug, Clone)]
pub struct Unit {
    pub hash: String,
    pub size: u64,
    pub targets: Vec<Target>,
    /// Check the blob's SHA-1 against `hash` before placement
    pub verify: bool,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub path: PathBuf,
    pub executable: bool,
}

/// Download `unit` into `parts_dir`, then place it at each target.
///
/// Partial parts are resumed with a `Range` request when the server
/// advertises byte ranges. Transient failures retry within the
/// budget; pause requests close the response stream so a later
/// resume reopens at the current byte. Once the part has been
/// renamed into place the unit is past the point of cancellation.
pub async fn fetch(
    repository: &repository::Client,
    game_uid: &str,
    unit: &Unit,
    parts_dir: &Path,
    controls: &Controls,
) -> Result<(), Stop<Error>> {
    // Zero-sized files never touch the network
    if unit.size == 0 {
        place_empty(unit).await.map_err(stop)?;
        return Ok(());
    }

    let url = repository
        .hash_url(game_uid, &unit.hash)
        .map_err(|error| stop(Error::Repository(Box::new(error))))?;
    let part = parts_dir.join(format!("{}.part", unit.hash));

    let mut attempts: u32 = 0;
    let mut last_error = String::new();

    loop {
        controls.checkpoint().await.inspect_err(|_| {
            cleanup_blocking(&part);
        })?;

        if attempts > environment::FETCH_MAX_RETRIES {
            cleanup_blocking(&part);
            return Err(stop(Error::RetriesExhausted {
                hash: unit.hash.clone(),
                attempts,
                last: last_error,
            }));
        }

        match attempt(repository, &url, unit, &part, attempts, controls).await {
            Ok(Attempt::Complete) => {
                if unit.verify {
                    let digest = digest_file(part.clone()).await.map_err(stop)?;
                    if digest != unit.hash {
                        let mismatch = Error::HashMismatch {
                            expected: unit.hash.clone(),
                            computed: digest,
                        };
                        debug!("fetch {}: {mismatch}, cleaning and retrying", unit.hash);
                        last_error = mismatch.to_string();
                        let _ = fs::remove_file(&part).await;
                        attempts += 1;
                        continue;
                    }
                }
                break;
            }
            // Pause closed the stream; reopen without spending budget
            Ok(Attempt::Interrupted) => continue,
            Err(error) => match error {
                Error::RangeNotSatisfiable | Error::HashMismatch { .. } => {
                    debug!("fetch {}: {error}, cleaning and retrying", unit.hash);
                    last_error = error.to_string();
                    let _ = fs::remove_file(&part).await;
                    attempts += 1;
                }
                ref transient if transient.is_transient() => {
                    debug!("fetch {}: {error}, retrying", unit.hash);
                    last_error = error.to_string();
                    attempts += 1;
                }
                terminal => {
                    cleanup_blocking(&part);
                    return Err(stop(terminal));
                }
            },
        }
    }

    // Past this point cancellation is rejected: the blob is being
    // renamed to its final paths
    place(unit, &part).await.map_err(stop)
}

enum Attempt {
    Complete,
    /// A pause request closed the response stream mid-body
    Interrupted,
}

async fn attempt(
    repository: &repository::Client,
    url: &url::Url,
    unit: &Unit,
    part: &Path,
    attempts: u32,
    controls: &Controls,
) -> Result<Attempt, Error> {
    let per_attempt = environment::FETCH_TIMEOUT_BASE * (attempts + 1);

    let mut offset = match fs::metadata(part).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    if offset > unit.size {
        let _ = fs::remove_file(part).await;
        offset = 0;
    }

    let endpoint = repository.endpoint().await;
    let mut request = endpoint.raw.get(url.clone());

    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }

    let response = timeout(per_attempt, request.send())
        .await
        .map_err(|_| Error::Timeout)??;

    let mut response = match response.status() {
        StatusCode::RANGE_NOT_SATISFIABLE => return Err(Error::RangeNotSatisfiable),
        status if !status.is_success() => return Err(Error::Status(status)),
        _ => response,
    };

    let resumable = offset > 0
        && response.status() == StatusCode::PARTIAL_CONTENT
        && response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));

    let mut file = if resumable {
        OpenOptions::new().append(true).open(part).await?
    } else {
        // Server ignored or refused the range: start over
        offset = 0;
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent).await?;
        }
        File::create(part).await?
    };

    loop {
        if controls.is_paused() || controls.is_cancelled() {
            // Drop the stream before parking; resume reopens with a
            // fresh Range request
            drop(response);
            file.flush().await?;
            controls
                .checkpoint()
                .await
                .map_err(|_| Error::Cancelled)?;
            return Ok(Attempt::Interrupted);
        }

        let chunk = timeout(per_attempt, response.chunk())
            .await
            .map_err(|_| Error::Timeout)??;

        let Some(chunk) = chunk else {
            break;
        };

        file.write_all(&chunk).await?;
        offset += chunk.len() as u64;

        controls.emit(Progress {
            delta: chunk.len() as u64,
            completed: offset,
            total: unit.size,
        });
    }

    file.flush().await?;

    if offset != unit.size {
        warn!(
            "fetch {}: got {offset} bytes, expected {}",
            unit.hash, unit.size
        );
        return Err(Error::ShortBody {
            got: offset,
            expected: unit.size,
        });
    }

    Ok(Attempt::Complete)
}

/// Rename the finished part to the first target and fan the content
/// out to the rest
async fn place(unit: &Unit, part: &Path) -> Result<(), Error> {
    let Some((first, rest)) = unit.targets.split_first() else {
        let _ = fs::remove_file(part).await;
        return Ok(());
    };

    if let Some(parent) = first.path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(part, &first.path).await?;
    set_mode(&first.path, first.executable).await?;

    for target in rest {
        if let Some(parent) = target.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&first.path, &target.path).await?;
        set_mode(&target.path, target.executable).await?;
    }

    Ok(())
}

async fn place_empty(unit: &Unit) -> Result<(), Error> {
    for target in &unit.targets {
        if let Some(parent) = target.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        File::create(&target.path).await?;
        set_mode(&target.path, target.executable).await?;
    }

    Ok(())
}

/// 0o744 for executables, 0o644 otherwise; windows has no modes
pub async fn set_mode(path: &Path, executable: bool) -> Result<(), Error> {
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;

        let mode = if executable {
            environment::MODE_EXECUTABLE
        } else {
            environment::MODE_PLAIN
        };

        fs::set_permissions(path, Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, executable);
    }

    Ok(())
}

/// SHA-1 of a file's content, hex encoded
pub async fn digest_file(path: PathBuf) -> Result<String, Error> {
    spawn_blocking(move || {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha1::new();

        io::copy(&mut file, &mut hasher)?;

        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .expect("join digest task")
}

fn cleanup_blocking(part: &Path) {
    let _ = std::fs::remove_file(part);
}

fn stop(error: Error) -> Stop<Error> {
    match error {
        Error::Cancelled => Stop::Cancelled,
        other => Stop::Error(other),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("attempt timed out")]
    Timeout,
    #[error("server cannot satisfy requested range")]
    RangeNotSatisfiable,
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("short body: got {got} bytes, expected {expected}")]
    ShortBody { got: u64, expected: u64 },
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("retries exhausted for {hash} after {attempts} attempts: {last}")]
    RetriesExhausted {
        hash: String,
        attempts: u32,
        last: String,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("repository: {0}")]
    Repository(Box<repository::Error>),
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errors worth another attempt: timeouts, reset or aborted
    /// connections, broken pipes and resolution hiccups
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout | Error::ShortBody { .. } => true,
            Error::Status(status) => status.is_server_error(),
            Error::Request(error) => {
                error.is_timeout() || error.is_connect() || io_transient(error)
            }
            Error::Io(error) => io_kind_transient(error.kind()),
            _ => false,
        }
    }
}

fn io_transient(error: &reqwest::Error) -> bool {
    use std::error::Error as _;

    let mut source = error.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<io::Error>() {
            return io_kind_transient(io.kind());
        }
        source = inner.source();
    }

    false
}

fn io_kind_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::ShortBody { got: 1, expected: 2 }.is_transient());
        assert!(Error::Status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_transient());

        assert!(!Error::Status(StatusCode::NOT_FOUND).is_transient());
        assert!(!Error::RangeNotSatisfiable.is_transient());
        assert!(!Error::HashMismatch {
            expected: "aa".into(),
            computed: "bb".into()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn empty_unit_creates_empty_targets() {
        let dir = tempfile::tempdir().unwrap();

        let unit = Unit {
            hash: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
            size: 0,
            targets: vec![
                Target {
                    path: dir.path().join("a/empty1"),
                    executable: false,
                },
                Target {
                    path: dir.path().join("empty2"),
                    executable: false,
                },
            ],
            verify: false,
        };

        place_empty(&unit).await.unwrap();

        assert_eq!(std::fs::metadata(dir.path().join("a/empty1")).unwrap().len(), 0);
        assert_eq!(std::fs::metadata(dir.path().join("empty2")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn place_fans_out_and_sets_modes() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("blob.part");
        std::fs::write(&part, b"payload").unwrap();

        let unit = Unit {
            hash: "unused".into(),
            size: 7,
            targets: vec![
                Target {
                    path: dir.path().join("bin/tool"),
                    executable: true,
                },
                Target {
                    path: dir.path().join("copy/tool"),
                    executable: false,
                },
            ],
            verify: false,
        };

        place(&unit, &part).await.unwrap();

        assert!(!part.exists());
        assert_eq!(std::fs::read(dir.path().join("bin/tool")).unwrap(), b"payload");
        assert_eq!(std::fs::read(dir.path().join("copy/tool")).unwrap(), b"payload");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode(&dir.path().join("bin/tool")), 0o744);
            assert_eq!(mode(&dir.path().join("copy/tool")), 0o644);
        }
    }

    #[tokio::test]
    async fn digest_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            digest_file(path).await.unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
