use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use leaky_bucket::RateLimiter;
use serde::Deserialize;
use thiserror::Error;
use tracing::{Instrument, instrument};

use crate::overlap::{ChannelId, ChannelRecord, IdentitySet};
use crate::util::env::Config;
use crate::util::helix::DiscoveredChannel;

/// A channel's raw chatter list as reported by the chat server.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatterList {
    /// Authoritative chatter count; may exceed the number of names listed.
    pub chatter_count: u32,
    /// `role -> logins`, e.g. `broadcaster`, `vips`, `moderators`, `viewers`.
    #[serde(default)]
    pub chatters: HashMap<String, Vec<Option<String>>>,
}

impl ChatterList {
    pub fn into_identities(self, min_population: u32) -> Option<IdentitySet> {
        let raw = self.chatters.into_values().flatten();
        IdentitySet::build(raw, self.chatter_count, min_population)
    }
}

/// Per-channel chatter retrieval.
#[async_trait]
pub trait ChatterSource: Send + Sync {
    async fn fetch_chatters(&self, channel: &ChannelId) -> ChatterResult<ChatterList>;
}

#[derive(Debug, Clone)]
pub struct TmiClient {
    client: reqwest::Client,
    base_url: String,
}

impl TmiClient {
    pub fn new(config: &Config) -> Self {
        Self::with_base_url(&config.tmi_url)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatterSource for TmiClient {
    #[instrument(skip(self))]
    async fn fetch_chatters(&self, channel: &ChannelId) -> ChatterResult<ChatterList> {
        let uri = format!("{}/group/user/{}/chatters", self.base_url, channel);
        let res = self.client.get(uri).send().await?;

        if !res.status().is_success() {
            return Err(ChatterErr::FetchErr(res.status().to_string()));
        }

        Ok(res.json::<ChatterList>().await?)
    }
}

/// Fetch pacing for [`collect_records`].
#[derive(Debug, Clone)]
pub struct FetchLimits {
    pub concurrency: usize,
    pub per_second: usize,
    pub min_population: u32,
}

impl FetchLimits {
    pub fn new(config: &Config) -> Self {
        Self {
            concurrency: config.fetch_concurrency,
            per_second: config.fetch_per_second,
            min_population: config.min_chatters,
        }
    }

    fn limiter(&self) -> RateLimiter {
        let per_second = self.per_second.max(1);
        RateLimiter::builder()
            .initial(per_second)
            .max(per_second)
            .refill(per_second)
            .interval(Duration::from_secs(1))
            .build()
    }
}

/// Retrieves chatters for every discovered channel and keeps those that pass the population
/// threshold.
///
/// Channels whose fetch fails, or whose reported chatter count is too low, are logged and
/// dropped; they never fail the batch.
#[instrument(skip(source, discovered, limits), fields(channel_count = discovered.len()))]
pub async fn collect_records<S>(
    source: &S,
    discovered: Vec<DiscoveredChannel>,
    limits: &FetchLimits,
) -> Vec<ChannelRecord>
where
    S: ChatterSource + ?Sized,
{
    let limiter = Arc::new(limits.limiter());
    let min_population = limits.min_population;

    let requests = discovered.into_iter().map(|channel| {
        let limiter = limiter.clone();
        async move {
            limiter.acquire_one().await;
            match source.fetch_chatters(&channel.id).await {
                Ok(list) => {
                    let reported = list.chatter_count;
                    match list.into_identities(min_population) {
                        Some(identities) => {
                            let mut meta = channel.meta;
                            meta.chatters = reported;
                            Some(ChannelRecord::new(channel.id, meta, identities))
                        }
                        None => {
                            tracing::debug!(channel = %channel.id, reported, "below chatter threshold");
                            None
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = %channel.id, error = %e, "chatter fetch failed, excluding channel");
                    None
                }
            }
        }
    });

    let records: Vec<ChannelRecord> = stream::iter(requests)
        .buffer_unordered(limits.concurrency.max(1))
        .filter_map(|record| async move { record })
        .collect()
        .instrument(tracing::debug_span!("resolve_chatter_futures"))
        .await;

    tracing::debug!(record_count = records.len(), "chatter collection complete");
    records
}

pub type ChatterResult<T> = core::result::Result<T, ChatterErr>;

#[derive(Debug, Error)]
pub enum ChatterErr {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("error during chatter fetch: {0}")]
    FetchErr(String),
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::overlap::ChannelMeta;

    fn discovered(login: &str) -> DiscoveredChannel {
        DiscoveredChannel {
            id: ChannelId::from(login),
            meta: ChannelMeta {
                display_name: login.to_string(),
                viewers: 2000,
                ..Default::default()
            },
        }
    }

    fn limits(min_population: u32) -> FetchLimits {
        FetchLimits {
            concurrency: 4,
            per_second: 100,
            min_population,
        }
    }

    #[test]
    fn test_chatter_list_parsing() {
        let list: ChatterList = serde_json::from_value(json!({
            "chatter_count": 150,
            "chatters": {
                "broadcaster": ["Streamer"],
                "vips": [],
                "moderators": ["Nightbot", "ModPerson"],
                "viewers": ["viewer1", null, "VIEWER1"]
            }
        }))
        .unwrap();

        let identities = list.into_identities(100).unwrap();
        let mut names: Vec<_> = identities.iter().cloned().collect();
        names.sort();

        assert_eq!(names, vec!["modperson", "streamer", "viewer1"]);
    }

    #[tokio::test]
    async fn test_collect_filters_and_excludes() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/group/user/big/chatters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "chatter_count": 120,
                "chatters": { "viewers": ["a", "b", "SomeBot"] }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/group/user/small/chatters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "chatter_count": 50,
                "chatters": { "viewers": ["a"] }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/group/user/broken/chatters"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = TmiClient::with_base_url(&server.uri());
        let batch = vec![discovered("big"), discovered("small"), discovered("broken")];
        let records = collect_records(&client, batch, &limits(100)).await;

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, ChannelId::from("big"));
        assert_eq!(record.meta.chatters, 120);
        assert_eq!(record.meta.viewers, 2000);
        assert_eq!(record.identities.len(), 2);
        assert!(!record.identities.contains("somebot"));
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = TmiClient::with_base_url(&server.uri());
        let err = client.fetch_chatters(&ChannelId::from("gone")).await.unwrap_err();
        assert!(matches!(err, ChatterErr::FetchErr(_)));
    }
}
