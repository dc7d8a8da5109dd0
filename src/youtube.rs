use std::sync::Arc;

use serde::Deserialize;
use serde_aux::prelude::*;

use crate::{auth, util};

pub const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

// Shapes follow the liveStreams and liveBroadcasts resources of the
// YouTube Data API v3; only the fields the monitor reads are kept.

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStream {
    pub id: String,
    pub snippet: Option<StreamSnippet>,
    pub status: Option<StreamStatusInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnippet {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusInfo {
    pub stream_status: Option<StreamStatus>,
    pub health_status: Option<HealthStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamStatus {
    Active,
    Created,
    Error,
    Inactive,
    Ready,
    #[serde(other)]
    Other,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Active => "active",
            StreamStatus::Created => "created",
            StreamStatus::Error => "error",
            StreamStatus::Inactive => "inactive",
            StreamStatus::Ready => "ready",
            StreamStatus::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: Option<StreamHealth>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub last_update_time_seconds: Option<i64>,
    #[serde(default = "Vec::new")]
    pub configuration_issues: Vec<ConfigurationIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamHealth {
    Good,
    Ok,
    Bad,
    NoData,
    #[serde(other)]
    Other,
}

impl StreamHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamHealth::Good => "good",
            StreamHealth::Ok => "ok",
            StreamHealth::Bad => "bad",
            StreamHealth::NoData => "noData",
            StreamHealth::Other => "other",
        }
    }

    /// YouTube is receiving usable data from the encoder.
    pub fn is_receiving_data(&self) -> bool {
        matches!(self, StreamHealth::Good | StreamHealth::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationIssue {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: IssueSeverity,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
    #[serde(other)]
    Other,
}

impl LiveStream {
    pub fn title(&self) -> &str {
        self.snippet.as_ref().map(|s| s.title.as_str()).unwrap_or("")
    }

    pub fn health(&self) -> Option<StreamHealth> {
        self.status.as_ref()?.health_status.as_ref()?.status
    }

    pub fn stream_status(&self) -> Option<StreamStatus> {
        self.status.as_ref()?.stream_status
    }

    pub fn issues(&self) -> &[ConfigurationIssue] {
        self.status
            .as_ref()
            .and_then(|s| s.health_status.as_ref())
            .map(|h| h.configuration_issues.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveBroadcast {
    pub id: String,
    pub snippet: Option<BroadcastSnippet>,
    pub content_details: Option<BroadcastContentDetails>,
    pub status: Option<BroadcastStatus>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSnippet {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastContentDetails {
    pub bound_stream_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStatus {
    pub life_cycle_status: Option<String>,
}

impl LiveBroadcast {
    pub fn title(&self) -> &str {
        self.snippet.as_ref().map(|s| s.title.as_str()).unwrap_or("")
    }

    pub fn life_cycle_status(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.life_cycle_status.as_deref())
            .unwrap_or("")
    }

    pub fn bound_stream_id(&self) -> Option<&str> {
        self.content_details.as_ref()?.bound_stream_id.as_deref()
    }

    pub fn watch_url(&self) -> String {
        format!("https://youtube.com/live/{}", self.id)
    }
}

/// Picks the broadcast an operator would care about: a live one bound to the
/// stream, else one that is ready or testing.
pub fn find_bound_broadcast<'a>(
    broadcasts: &'a [LiveBroadcast],
    stream_id: &str,
) -> Option<&'a LiveBroadcast> {
    let bound = |b: &&LiveBroadcast| b.bound_stream_id() == Some(stream_id);

    broadcasts
        .iter()
        .filter(bound)
        .find(|b| b.life_cycle_status() == "live")
        .or_else(|| {
            broadcasts
                .iter()
                .filter(bound)
                .find(|b| matches!(b.life_cycle_status(), "ready" | "testing"))
        })
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("could not get access token: {0}")]
    Auth(#[from] auth::AuthError),
    #[error("YouTube API request failed: {0}")]
    Http(#[from] util::HttpError),
    #[error("{0} '{1}' not found")]
    NotFound(&'static str, String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ApiError::NotFound(..) => true,
            ApiError::Http(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            _ => false,
        }
    }
}

pub struct YouTubeClient {
    http: util::HttpClient,
    tokens: Arc<dyn auth::TokenProvider>,
    base_url: String,
}

impl YouTubeClient {
    pub fn new(http: util::HttpClient, tokens: Arc<dyn auth::TokenProvider>) -> Self {
        Self::with_base_url(http, tokens, API_BASE)
    }

    pub fn with_base_url(
        http: util::HttpClient,
        tokens: Arc<dyn auth::TokenProvider>,
        base_url: &str,
    ) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn list<T>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
    ) -> Result<ListResponse<T>, ApiError>
    where
        T: serde::de::DeserializeOwned,
    {
        let token = self.tokens.access_token().await?;
        let resp = self
            .http
            .client
            .get(format!("{}/{}", self.base_url, resource))
            .query(query)
            .bearer_auth(token)
            .send()
            .await
            .map_err(util::HttpError::from)?;

        Ok(util::read_json(resp).await?)
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<LiveStream, ApiError> {
        let resp: ListResponse<LiveStream> = self
            .list(
                "liveStreams",
                &[("part", "snippet,status"), ("id", stream_id)],
            )
            .await?;

        resp.items
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound("Stream", stream_id.to_string()))
    }

    pub async fn list_active_broadcasts(&self) -> Result<Vec<LiveBroadcast>, ApiError> {
        let resp: ListResponse<LiveBroadcast> = self
            .list(
                "liveBroadcasts",
                &[
                    ("part", "snippet,contentDetails,status"),
                    ("broadcastStatus", "active"),
                    ("maxResults", "50"),
                ],
            )
            .await?;

        Ok(resp.items)
    }
}
