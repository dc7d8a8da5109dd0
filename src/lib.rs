//! # stream-tools
//!
//! This crate watches a YouTube live stream's ingestion health and restarts
//! the AzuraCast station feeding it when the stream stops receiving data.
//!
//! ## Usage
//!
//! The `monitor` module ties a probe, a restart controller and a notifier
//! together. Each piece is a trait, so any of them can be swapped out.
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use stream_tools::{auth, config, monitor, notify, probe, util, youtube};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     // reqwest client with retries for transient errors
//!     let http = util::HttpClient::new(Duration::from_secs(30)).unwrap();
//!
//!     // Credentials from the environment or the cached token file
//!     let tokens = auth::OAuthTokenSource::discover(
//!         http.clone(),
//!         auth::default_token_path().as_deref(),
//!     )
//!     .unwrap();
//!     let client = youtube::YouTubeClient::new(http, Arc::new(tokens));
//!
//!     // Watch without restarting anything
//!     let config = config::MonitorConfig {
//!         auto_restart: false,
//!         ..Default::default()
//!     };
//!     let mut monitor = monitor::Monitor::new(
//!         probe::StreamIdentity::parse("my-stream-id").unwrap(),
//!         config,
//!         Box::new(probe::YouTubeProbe::new(client)),
//!         None,
//!         Box::new(notify::NullNotifier),
//!     );
//!
//!     monitor.run(CancellationToken::new()).await;
//! }
//! ```

#![forbid(unsafe_code)]

#[macro_use]
extern crate log;

pub mod auth;
pub mod azuracast;
pub mod config;
pub mod health;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod stats;
pub mod util;
pub mod youtube;
