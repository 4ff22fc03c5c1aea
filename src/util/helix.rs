use core::fmt;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use http::header::{AUTHORIZATION, InvalidHeaderValue};
use http::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::overlap::{ChannelId, ChannelMeta};
use crate::util::env::Config;

pub const HELIX_URN_USERS: &str = "users";
pub const HELIX_URN_STREAMS: &str = "streams";
pub const HELIX_PARAM_LOGIN: &str = "login";
/// Helix caps both page size and the number of `login=` params per request at 100.
pub const HELIX_PAGE_SIZE: usize = 100;

/// A channel found during discovery, not yet populated with chatters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredChannel {
    pub id: ChannelId,
    pub meta: ChannelMeta,
}

/// Source of candidate channels and their display metadata.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Live channels with at least `min_viewers` viewers, most-watched first, without duplicates.
    async fn fetch_top_streams(&self, min_viewers: u32) -> HelixResult<Vec<DiscoveredChannel>>;

    /// `login -> avatar reference` for whichever of `logins` resolve.
    async fn fetch_avatars(&self, logins: &[ChannelId]) -> HelixResult<HashMap<ChannelId, String>>;
}

#[derive(Debug, Clone)]
pub struct HelixClient {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl HelixClient {
    pub fn new(config: &Config) -> HelixResult<Self> {
        Self::with_base_url(&config.helix_url, &config.client_id, &config.app_token)
    }

    pub fn with_base_url(base_url: &str, client_id: &str, app_token: &str) -> HelixResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {app_token}"))?,
        );
        headers.insert("Client-Id", HeaderValue::from_str(client_id)?);

        tracing::debug!("built AUTHORIZATION headers for helix bearer token");

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    fn uri(&self, urn: &str, query: &str) -> String {
        format!("{}/{urn}{query}", self.base_url)
    }

    #[instrument(skip(self))]
    /// Performs a GET request to a given URI and parses the response according to the specified
    /// `T` output type
    async fn fetch<T>(&self, uri: String) -> HelixResult<T>
    where
        T: DeserializeOwned + fmt::Debug,
    {
        let res = self
            .client
            .get(uri)
            .headers(self.headers.clone())
            .send()
            .await?;

        if !res.status().is_success() {
            let status_code = res.status();
            tracing::error!(code = %status_code, "non-2xx helix response");

            // surface the error body if helix sent one
            return Err(match res.json::<Value>().await {
                Ok(body) => HelixErr::FetchErrWithBody {
                    status: status_code.as_u16(),
                    body,
                },
                Err(_) => HelixErr::FetchErr(status_code.to_string()),
            });
        }

        if let Some(remaining) = res.headers().get("ratelimit-remaining")
            && let Some(total) = res.headers().get("ratelimit-limit")
        {
            tracing::trace!(ratelimit_available = ?remaining, ratelimit_total = ?total, "rate-limit bucket");
        }

        Ok(res.json::<T>().await?)
    }
}

#[async_trait]
impl ChannelDirectory for HelixClient {
    #[instrument(skip(self))]
    async fn fetch_top_streams(&self, min_viewers: u32) -> HelixResult<Vec<DiscoveredChannel>> {
        let mut seen = HashSet::new();
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let query = match &cursor {
                Some(after) => format!("?first={HELIX_PAGE_SIZE}&after={after}"),
                None => format!("?first={HELIX_PAGE_SIZE}"),
            };

            let page: HelixPage<HelixStream> = self.fetch(self.uri(HELIX_URN_STREAMS, &query)).await?;
            pages += 1;

            let mut below_threshold = false;
            for stream in page.data {
                // listings arrive sorted by viewers, so the first quiet stream ends discovery
                if stream.viewer_count < min_viewers {
                    below_threshold = true;
                    break;
                }

                let channel = DiscoveredChannel::from(stream);
                if seen.insert(channel.id.clone()) {
                    channels.push(channel);
                }
            }

            cursor = page.pagination.cursor.filter(|c| !c.is_empty());
            if below_threshold || cursor.is_none() {
                break;
            }
        }

        tracing::debug!(pages, channel_count = channels.len(), "stream discovery complete");
        Ok(channels)
    }

    #[instrument(skip(self, logins), fields(login_count = logins.len()))]
    async fn fetch_avatars(&self, logins: &[ChannelId]) -> HelixResult<HashMap<ChannelId, String>> {
        let mut avatars = HashMap::new();

        for query in build_query_params(HELIX_PARAM_LOGIN, logins) {
            let page: HelixPage<HelixUser> = self.fetch(self.uri(HELIX_URN_USERS, &query)).await?;
            for user in page.data {
                if let Some(avatar) = avatar_reference(&user.image) {
                    avatars.insert(ChannelId::new(&user.login), avatar);
                }
            }
        }

        tracing::debug!(avatar_count = avatars.len(), "fetched channel avatars");
        Ok(avatars)
    }
}

/// Splits `items` into `?{param}=a&{param}=b...` query strings of at most [`HELIX_PAGE_SIZE`] params.
pub fn build_query_params<T: fmt::Display>(param: &str, items: &[T]) -> Vec<String> {
    items
        .chunks(HELIX_PAGE_SIZE)
        .map(|chunk| {
            let joined = chunk
                .iter()
                .map(|item| format!("{param}={}", item.to_string().to_lowercase()))
                .collect::<Vec<_>>()
                .join("&");

            format!("?{joined}")
        })
        .collect()
}

/// Reduces a profile image URL to the file name of its 70x70 variant, which is all the frontend
/// needs to rebuild the URL.
pub fn avatar_reference(profile_image_url: &str) -> Option<String> {
    profile_image_url
        .replace("-300x300", "-70x70")
        .split('/')
        .nth(4)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixPage<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: HelixPagination,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelixPagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixStream {
    #[serde(rename = "user_login")]
    pub login: String,
    #[serde(rename = "user_name")]
    pub name: String,
    #[serde(rename = "game_name", default)]
    pub game: String,
    pub viewer_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
    pub login: String,
    #[serde(rename = "profile_image_url", default)]
    pub image: String,
}

impl From<HelixStream> for DiscoveredChannel {
    fn from(value: HelixStream) -> Self {
        Self {
            id: ChannelId::new(&value.login),
            meta: ChannelMeta {
                display_name: value.name,
                avatar: None,
                game: value.game,
                viewers: value.viewer_count,
                chatters: 0,
            },
        }
    }
}

pub type HelixResult<T> = core::result::Result<T, HelixErr>;

#[derive(Debug, Error)]
pub enum HelixErr {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("while creating a HeaderValue ({0})")]
    HeaderError(#[from] InvalidHeaderValue),

    #[error("error during helix fetch: {0}")]
    FetchErr(String),

    #[error("error (with detail) during helix fetch ({status}): {body}")]
    FetchErrWithBody { status: u16, body: Value },
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn stream(login: &str, viewers: u32) -> Value {
        json!({
            "user_login": login,
            "user_name": login.to_uppercase(),
            "game_name": "Just Chatting",
            "viewer_count": viewers,
        })
    }

    async fn client(server: &MockServer) -> HelixClient {
        HelixClient::with_base_url(&server.uri(), "client-id", "app-token").unwrap()
    }

    #[test]
    fn test_query_params_chunked() {
        let logins: Vec<ChannelId> = (0..250).map(|i| ChannelId::from(format!("user{i}"))).collect();
        let params = build_query_params(HELIX_PARAM_LOGIN, &logins);

        assert_eq!(params.len(), 3);
        assert!(params[0].starts_with("?login=user0&login=user1&"));
        assert_eq!(params[2].matches("login=").count(), 50);
    }

    #[test]
    fn test_avatar_reference() {
        let url = "https://static-cdn.jtvnw.net/jtv_user_pictures/abc-profile_image-300x300.png";
        assert_eq!(
            avatar_reference(url).as_deref(),
            Some("abc-profile_image-70x70.png")
        );
        assert_eq!(avatar_reference("not a url"), None);
    }

    #[tokio::test]
    async fn test_discovery_pages_until_threshold() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/streams"))
            .and(query_param("after", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [stream("third", 2000), stream("first", 1800), stream("quiet", 900), stream("never", 5000)],
                "pagination": { "cursor": "page3" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/streams"))
            .and(header("Authorization", "Bearer app-token"))
            .and(header("Client-Id", "client-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [stream("First", 9000), stream("second", 4000)],
                "pagination": { "cursor": "page2" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channels = client(&server).await.fetch_top_streams(1500).await.unwrap();
        let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();

        // duplicate `first` from page two is dropped, `never` comes after the cutoff
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert_eq!(channels[0].meta.viewers, 9000);
        assert_eq!(channels[0].meta.display_name, "FIRST");
    }

    #[tokio::test]
    async fn test_discovery_stops_without_cursor() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/streams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [stream("only", 3000)],
                "pagination": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channels = client(&server).await.fetch_top_streams(1500).await.unwrap();
        assert_eq!(channels.len(), 1);
    }

    #[tokio::test]
    async fn test_discovery_error_surfaces() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/streams"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({ "message": "Invalid OAuth token" })),
            )
            .mount(&server)
            .await;

        let err = client(&server).await.fetch_top_streams(1500).await.unwrap_err();
        assert!(matches!(err, HelixErr::FetchErrWithBody { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_fetch_avatars() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users"))
            .and(query_param("login", "alpha"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "login": "Alpha", "profile_image_url": "https://cdn.example/pics/alpha-300x300.png" },
                    { "login": "beta", "profile_image_url": "" }
                ]
            })))
            .mount(&server)
            .await;

        let logins = vec![ChannelId::from("alpha"), ChannelId::from("beta")];
        let avatars = client(&server).await.fetch_avatars(&logins).await.unwrap();

        assert_eq!(avatars.len(), 1);
        assert_eq!(avatars[&ChannelId::from("alpha")], "alpha-70x70.png");
    }
}
