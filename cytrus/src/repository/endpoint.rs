// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use log::warn;
use rand::Rng;
use reqwest_middleware::ClientWithMiddleware;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::environment;
use crate::request;

/// One usable repository endpoint: a client pinned to a resolved
/// address, with and without the manifest retry policy. The pinned
/// hostname keeps TLS negotiating against the original host.
#[derive(Clone)]
pub struct Endpoint {
    pub raw: reqwest::Client,
    pub retrying: ClientWithMiddleware,
}

/// DNS-cached endpoint rotation for one repository host. Addresses
/// are resolved up front, cached for a clamped lifetime, and picked
/// uniformly at random per request. A failed refresh retains the
/// last-known set.
pub struct Rotation {
    host: String,
    port: u16,
    ttl: Duration,
    cached: Mutex<Cached>,
}

#[derive(Default)]
struct Cached {
    addrs: Vec<SocketAddr>,
    refreshed: Option<Instant>,
    endpoints: HashMap<SocketAddr, Endpoint>,
}

impl Rotation {
    /// `ttl_hint` is clamped into the 30-300s window; system
    /// resolvers expose no record lifetime, so absent a hint the
    /// cache refreshes on the clamp floor.
    pub fn new(host: impl ToString, port: u16, ttl_hint: Option<Duration>) -> Self {
        let ttl = ttl_hint
            .unwrap_or(environment::DNS_TTL_MIN)
            .clamp(environment::DNS_TTL_MIN, environment::DNS_TTL_MAX);

        Self {
            host: host.to_string(),
            port,
            ttl,
            cached: Mutex::new(Cached::default()),
        }
    }

    /// Pick an endpoint for the next request, refreshing the cached
    /// addresses when their lifetime lapsed
    pub async fn endpoint(&self) -> Endpoint {
        let mut cached = self.cached.lock().await;

        let expired = cached
            .refreshed
            .map_or(true, |refreshed| refreshed.elapsed() >= self.ttl);

        if expired {
            match lookup_host((self.host.as_str(), self.port)).await {
                Ok(addrs) => {
                    let addrs = addrs.collect::<Vec<_>>();
                    // No answers: keep what we have
                    if !addrs.is_empty() {
                        cached.endpoints.retain(|addr, _| addrs.contains(addr));
                        cached.addrs = addrs;
                    }
                    cached.refreshed = Some(Instant::now());
                }
                Err(error) => {
                    warn!("dns refresh for {} failed, retaining {} cached addresses: {error}",
                        self.host,
                        cached.addrs.len());
                    cached.refreshed = Some(Instant::now());
                }
            }
        }

        if cached.addrs.is_empty() {
            // Never resolved: let reqwest do its own resolution
            let raw = request::build_client(None);
            return Endpoint {
                retrying: request::with_retries(raw.clone()),
                raw,
            };
        }

        let pick = rand::thread_rng().gen_range(0..cached.addrs.len());
        let addr = cached.addrs[pick];
        let host = &self.host;

        cached
            .endpoints
            .entry(addr)
            .or_insert_with(|| {
                let raw = request::build_client(Some((host.as_str(), addr)));
                Endpoint {
                    retrying: request::with_retries(raw.clone()),
                    raw,
                }
            })
            .clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ttl_is_clamped() {
        let low = Rotation::new("repo.example", 443, Some(Duration::from_secs(1)));
        assert_eq!(low.ttl, environment::DNS_TTL_MIN);

        let high = Rotation::new("repo.example", 443, Some(Duration::from_secs(3600)));
        assert_eq!(high.ttl, environment::DNS_TTL_MAX);

        let unset = Rotation::new("repo.example", 443, None);
        assert_eq!(unset.ttl, environment::DNS_TTL_MIN);
    }

    #[tokio::test]
    async fn unresolvable_host_still_yields_endpoint() {
        let rotation = Rotation::new("host.invalid.cytrus.test", 443, None);
        // Must not error: falls back to reqwest's own resolution
        let _ = rotation.endpoint().await;
    }
}
