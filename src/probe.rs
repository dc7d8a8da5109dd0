//! Status prober: one platform query per tick, folded into a [`HealthSample`].
//!
//! Probing never fails. A request that cannot be completed is reported as a
//! sample that is not receiving data, with the error as its detail.

use std::{fmt, sync::LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{
    config::ConfigError,
    youtube::{self, IssueSeverity, LiveStream},
};

static STREAM_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("stream id pattern compiles"));

/// Raw status recorded when the platform could not be queried.
pub const PROBE_ERROR_STATUS: &str = "error";

/// YouTube `liveStream` id the monitor watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity(String);

impl StreamIdentity {
    pub fn parse(id: &str) -> Result<Self, ConfigError> {
        let id = id.trim();
        if !STREAM_ID_REGEX.is_match(id) {
            return Err(ConfigError::InvalidStreamId(id.to_string()));
        }

        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub is_receiving_data: bool,
    /// Platform health as reported (`good`, `ok`, `bad`, `noData`), or
    /// [`PROBE_ERROR_STATUS`].
    pub status: String,
    pub stream_status: Option<String>,
    pub detail: Option<String>,
}

impl HealthSample {
    pub fn from_stream(stream: &LiveStream, timestamp: DateTime<Utc>) -> Self {
        let health = stream.health();

        let errors = stream
            .issues()
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .map(|i| format!("{}: {}", i.kind, i.reason))
            .collect::<Vec<_>>();

        Self {
            timestamp,
            is_receiving_data: health.map(|h| h.is_receiving_data()).unwrap_or(false),
            status: health
                .map(|h| h.as_str())
                .unwrap_or(youtube::StreamHealth::NoData.as_str())
                .to_string(),
            stream_status: stream.stream_status().map(|s| s.as_str().to_string()),
            detail: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    pub fn from_error<E: fmt::Display>(err: E, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            is_receiving_data: false,
            status: PROBE_ERROR_STATUS.to_string(),
            stream_status: None,
            detail: Some(err.to_string()),
        }
    }

    /// Receiving data at full quality.
    pub fn is_good(&self) -> bool {
        self.is_receiving_data && self.status == youtube::StreamHealth::Good.as_str()
    }

    pub fn describe(&self) -> String {
        match &self.detail {
            Some(detail) => format!("health {} ({})", self.status, detail),
            None => format!("health {}", self.status),
        }
    }
}

#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self, stream: &StreamIdentity) -> HealthSample;
}

pub struct YouTubeProbe {
    client: youtube::YouTubeClient,
}

impl YouTubeProbe {
    pub fn new(client: youtube::YouTubeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusProbe for YouTubeProbe {
    async fn probe(&self, stream: &StreamIdentity) -> HealthSample {
        match self.client.get_stream(stream.as_str()).await {
            Ok(s) => HealthSample::from_stream(&s, Utc::now()),
            Err(e) => {
                warn!("Could not check stream {}: {}", stream, e);
                HealthSample::from_error(e, Utc::now())
            }
        }
    }
}
