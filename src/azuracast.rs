//! AzuraCast station control.
//!
//! The restart controller only waits for the API to accept the command;
//! whether the stream comes back is decided by later probes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::{
    config::{ConfigError, MonitorConfig},
    health::{RestartAttempt, RestartOutcome},
    probe::StreamIdentity,
    util,
};

pub const URL_ENV: &str = "AZURACAST_URL";
pub const API_KEY_ENV: &str = "AZURACAST_API_KEY";
pub const STATION_ID_ENV: &str = "AZURACAST_STATION_ID";

#[derive(Debug, Clone, PartialEq)]
pub struct AzuraCastConfig {
    /// Base URL of the instance, without trailing slash.
    pub url: String,
    pub api_key: String,
    /// Numeric id or short name of the station.
    pub station_id: String,
}

impl AzuraCastConfig {
    /// `None` unless all three variables are set.
    pub fn from_vars<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let (url, api_key, station_id) =
            match (var(URL_ENV), var(API_KEY_ENV), var(STATION_ID_ENV)) {
                (Some(url), Some(api_key), Some(station_id)) => (url, api_key, station_id),
                _ => return Ok(None),
            };

        reqwest::Url::parse(&url).map_err(|_| ConfigError::InvalidRelayUrl(url.clone()))?;

        Ok(Some(Self {
            url: url.trim_end_matches('/').to_string(),
            api_key,
            station_id,
        }))
    }

    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("AzuraCast request failed: {0}")]
    Http(#[from] util::HttpError),
}

impl ControlError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ControlError::Http(e) => e.is_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StationInfo {
    pub id: Option<i64>,
    #[serde(default)]
    pub name: String,
    pub shortcode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NowPlaying {
    pub now_playing: Option<CurrentTrack>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CurrentTrack {
    pub song: Option<Song>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Song {
    pub artist: Option<String>,
    pub title: Option<String>,
}

impl NowPlaying {
    /// "Artist - Title", when something is playing.
    pub fn track(&self) -> Option<String> {
        let song = self.now_playing.as_ref()?.song.as_ref()?;
        Some(format!(
            "{} - {}",
            song.artist.as_deref().unwrap_or("?"),
            song.title.as_deref().unwrap_or("?")
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RestartMode {
    /// One `backend/restart` call.
    #[default]
    Restart,
    /// `backend/stop` followed by `backend/start`.
    StopStart,
}

pub struct AzuraCastClient {
    /// Commands are sent once.
    control: util::HttpClient,
    /// Read-only queries retry transient failures.
    query: util::HttpClient,
    config: AzuraCastConfig,
}

impl AzuraCastClient {
    pub fn new(config: AzuraCastConfig, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            control: util::HttpClient::without_retries(timeout)?,
            query: util::HttpClient::new(timeout)?,
            config,
        })
    }

    fn station_url(&self, path: &str) -> String {
        format!(
            "{}/api/station/{}/{}",
            self.config.url, self.config.station_id, path
        )
    }

    async fn post(&self, path: &str) -> Result<(), ControlError> {
        let url = self.station_url(path);
        debug!("POST {}", url);

        let resp = self
            .control
            .client
            .post(&url)
            .header("X-API-Key", &self.config.api_key)
            .send()
            .await
            .map_err(util::HttpError::from)?;
        util::check_status(resp).await?;

        Ok(())
    }

    async fn get<T>(&self, url: &str) -> Result<T, ControlError>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self
            .query
            .client
            .get(url)
            .header("X-API-Key", &self.config.api_key)
            .send()
            .await
            .map_err(util::HttpError::from)?;

        Ok(util::read_json(resp).await?)
    }

    /// Restarts the Liquidsoap backend.
    pub async fn restart_backend(&self) -> Result<(), ControlError> {
        self.post("backend/restart").await
    }

    pub async fn stop_backend(&self) -> Result<(), ControlError> {
        self.post("backend/stop").await
    }

    pub async fn start_backend(&self) -> Result<(), ControlError> {
        self.post("backend/start").await
    }

    pub async fn station(&self) -> Result<StationInfo, ControlError> {
        self.get(&format!(
            "{}/api/station/{}",
            self.config.url, self.config.station_id
        ))
        .await
    }

    pub async fn now_playing(&self) -> Result<NowPlaying, ControlError> {
        self.get(&format!(
            "{}/api/nowplaying/{}",
            self.config.url, self.config.station_id
        ))
        .await
    }
}

#[async_trait]
pub trait RestartControl: Send + Sync {
    async fn restart(&self, stream: &StreamIdentity) -> RestartAttempt;
}

pub struct AzuraCastRestarter {
    client: AzuraCastClient,
    mode: RestartMode,
    monitor: MonitorConfig,
}

impl AzuraCastRestarter {
    /// `monitor` supplies the cooldown applied to every attempt.
    pub fn new(client: AzuraCastClient, mode: RestartMode, monitor: MonitorConfig) -> Self {
        Self {
            client,
            mode,
            monitor,
        }
    }

    async fn send(&self) -> Result<(), ControlError> {
        match self.mode {
            RestartMode::Restart => self.client.restart_backend().await,
            RestartMode::StopStart => {
                self.client.stop_backend().await?;
                self.client.start_backend().await
            }
        }
    }
}

#[async_trait]
impl RestartControl for AzuraCastRestarter {
    async fn restart(&self, stream: &StreamIdentity) -> RestartAttempt {
        let initiated_at = Utc::now();
        info!(
            "Restarting AzuraCast station {} for stream {} ({:?})",
            self.client.config.station_id, stream, self.mode
        );

        let outcome = match self.send().await {
            Ok(()) => RestartOutcome::Acknowledged,
            Err(e) if e.is_timeout() => {
                warn!("AzuraCast restart timed out: {}", e);
                RestartOutcome::TimedOut
            }
            Err(e) => {
                warn!("AzuraCast restart failed: {}", e);
                RestartOutcome::Failed(e.to_string())
            }
        };

        RestartAttempt {
            initiated_at,
            outcome,
            cooldown_until: self.monitor.cooldown_deadline(initiated_at),
        }
    }
}
