// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use bytes::Bytes;
use futures::Stream;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use thiserror::Error;
use url::Url;

use crate::environment;

/// Build a reqwest client, optionally pinning the hostname to a
/// pre-resolved socket address (endpoint rotation)
pub fn build_client(resolve: Option<(&str, std::net::SocketAddr)>) -> reqwest::Client {
    let mut builder = reqwest::ClientBuilder::new().user_agent(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
    ));

    if let Some((host, addr)) = resolve {
        builder = builder.resolve(host, addr);
    }

    builder.build().expect("build reqwest client")
}

/// Wrap a client with the manifest retry policy: exponential
/// backoff, bounded interval, two retries
pub fn with_retries(client: reqwest::Client) -> ClientWithMiddleware {
    let policy = ExponentialBackoff::builder()
        .retry_bounds(environment::REQUEST_RETRY_MIN, environment::REQUEST_RETRY_MAX)
        .build_with_max_retries(environment::REQUEST_MAX_RETRIES);

    reqwest_middleware::ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(policy))
        .build()
}

/// Fetch a resource at the provided [`Url`] against a specific
/// (rotated) client and stream its response bytes
pub async fn stream_with(
    client: &ClientWithMiddleware,
    url: Url,
) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, Error> {
    let response = client.get(url).send().await?;

    Ok(response.error_for_status()?.bytes_stream())
}

/// Fetch and decode a JSON resource against a specific client
pub async fn json_with(
    client: &ClientWithMiddleware,
    url: Url,
) -> Result<serde_json::Value, Error> {
    let response = client.get(url).send().await?;

    Ok(response.error_for_status()?.json().await?)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed after retries: {0}")]
    Middleware(#[from] reqwest_middleware::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}
