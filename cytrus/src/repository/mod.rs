// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::environment;
use crate::manifest::{self, Manifest, ReleaseMeta};
use crate::platform::Platform;
use crate::request;

pub use self::endpoint::Rotation;
pub use self::poller::{watch, Event, PollerSettings};

pub mod endpoint;
pub mod poller;

/// Root of the remote repository: `cytrus.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GamesList {
    pub version: u64,
    pub games: BTreeMap<String, Game>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pre_released_games: BTreeMap<String, Game>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Game {
    pub game_id: u64,
    pub order: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub assets: Value,
    /// platform string -> release channel -> latest version
    pub platforms: BTreeMap<String, BTreeMap<String, String>>,
}

/// Client for one cytrus v5 repository
pub struct Client {
    base: Url,
    rotation: Rotation,
}

impl Client {
    /// `base` must be the repository root; a missing trailing slash
    /// is corrected so joins stay inside the repository.
    pub fn new(mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let host = base.host_str().unwrap_or_default().to_owned();
        let port = base.port_or_known_default().unwrap_or(443);

        Self {
            rotation: Rotation::new(host, port, None),
            base,
        }
    }

    /// Raw `cytrus.json` with legacy key casing folded, gated on the
    /// protocol version we speak
    pub async fn games_list_value(&self) -> Result<Value, Error> {
        let endpoint = self.rotation.endpoint().await;
        let url = self.resource("cytrus.json")?;

        let mut value = request::json_with(&endpoint.retrying, url).await?;

        // A missing version field means legacy key casing; fold
        // before reading anything else
        if value.get("version").is_none() {
            value = manifest::normalize_keys(value);
        }

        match value.get("version").and_then(Value::as_u64) {
            Some(environment::CYTRUS_VERSION) => Ok(value),
            found => Err(Error::VersionNotHandled { found }),
        }
    }

    pub async fn games_list(&self) -> Result<GamesList, Error> {
        let value = self.games_list_value().await?;

        Ok(serde_json::from_value(value)?)
    }

    /// Per-release file manifest:
    /// `/{gameUid}/releases/{channel}/{platform}/{version}.json`
    pub async fn release(
        &self,
        game_uid: &str,
        channel: &str,
        platform: Platform,
        version: &str,
    ) -> Result<Manifest, Error> {
        let value = self
            .release_resource(game_uid, channel, platform, version, "json")
            .await?;

        Ok(Manifest::from_value(value)?)
    }

    /// Fragment size summary, the `.meta` sibling
    pub async fn release_meta(
        &self,
        game_uid: &str,
        channel: &str,
        platform: Platform,
        version: &str,
    ) -> Result<ReleaseMeta, Error> {
        let value = self
            .release_resource(game_uid, channel, platform, version, "meta")
            .await?;

        Ok(serde_json::from_value(manifest::normalize_keys(value))?)
    }

    /// Configuration fragment only, the `.config` sibling used for
    /// pre-installs
    pub async fn release_config(
        &self,
        game_uid: &str,
        channel: &str,
        platform: Platform,
        version: &str,
    ) -> Result<Manifest, Error> {
        let value = self
            .release_resource(game_uid, channel, platform, version, "config")
            .await?;

        Ok(Manifest::from_value(value)?)
    }

    /// Stream a content blob: `/{gameUid}/hashes/{hh}/{hash}`
    pub async fn hash(
        &self,
        game_uid: &str,
        hash: &str,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, Error> {
        let endpoint = self.rotation.endpoint().await;
        let url = self.hash_url(game_uid, hash)?;

        Ok(request::stream_with(&endpoint.retrying, url).await?)
    }

    /// Stream an information payload (tar), same path shape as
    /// content blobs
    pub async fn information(
        &self,
        game_uid: &str,
        hash: &str,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, Error> {
        self.hash(game_uid, hash).await
    }

    /// Blob URL for callers that drive their own request cycle (the
    /// fetcher and its resume/retry handling)
    pub fn hash_url(&self, game_uid: &str, hash: &str) -> Result<Url, Error> {
        if hash.len() < 2 {
            return Err(Error::MalformedHash(hash.to_owned()));
        }

        self.resource(&format!("{game_uid}/hashes/{}/{hash}", &hash[..2]))
    }

    /// A raw client pinned to a rotated endpoint, for request cycles
    /// managed outside the shared retry policy
    pub async fn endpoint(&self) -> endpoint::Endpoint {
        self.rotation.endpoint().await
    }

    async fn release_resource(
        &self,
        game_uid: &str,
        channel: &str,
        platform: Platform,
        version: &str,
        extension: &str,
    ) -> Result<Value, Error> {
        let endpoint = self.rotation.endpoint().await;
        let url = self.resource(&format!(
            "{game_uid}/releases/{channel}/{platform}/{version}.{extension}"
        ))?;

        Ok(request::json_with(&endpoint.retrying, url).await?)
    }

    fn resource(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base.join(path)?)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("repository speaks cytrus {found:?}, expected {}", environment::CYTRUS_VERSION)]
    VersionNotHandled { found: Option<u64> },
    #[error("malformed content hash: {0}")]
    MalformedHash(String),
    #[error("invalid repository url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("request: {0}")]
    Request(#[from] request::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn client() -> Client {
        Client::new("https://repo.example/cytrus".parse().unwrap())
    }

    #[test]
    fn hash_url_shards_on_first_byte() {
        let url = client().hash_url("dofus", "ab34ef").unwrap();
        assert_eq!(
            url.as_str(),
            "https://repo.example/cytrus/dofus/hashes/ab/ab34ef"
        );
    }

    #[test]
    fn short_hash_is_rejected() {
        assert!(matches!(
            client().hash_url("dofus", "a"),
            Err(Error::MalformedHash(_))
        ));
    }

    #[test]
    fn games_list_decodes() {
        let list: GamesList = serde_json::from_value(serde_json::json!({
            "version": 5,
            "games": {
                "dofus": {
                    "gameId": 1,
                    "order": 0,
                    "name": "Dofus",
                    "platforms": { "linux": { "main": "5.0_3" } }
                }
            }
        }))
        .unwrap();

        assert_eq!(list.games["dofus"].platforms["linux"]["main"], "5.0_3");
    }
}
