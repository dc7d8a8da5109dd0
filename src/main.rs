use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use stream_tools::{
    auth,
    azuracast::{AzuraCastClient, AzuraCastConfig, AzuraCastRestarter, RestartControl, RestartMode},
    config::{self, ConfigError, MonitorConfig},
    monitor::{Monitor, StartupInfo},
    notify::{DiscordNotifier, Notifier, NullNotifier},
    probe::{StreamIdentity, YouTubeProbe},
    util, youtube,
};
use tokio_util::sync::CancellationToken;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "stream-tools", version, about)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch a live stream and restart its source when it stops receiving data
    Watch(WatchArgs),
}

#[derive(Args)]
struct WatchArgs {
    /// YouTube live stream id (not the broadcast/video id)
    stream_id: String,

    /// Seconds between checks while healthy
    #[arg(short, long, default_value_t = config::DEFAULT_INTERVAL.as_secs())]
    interval: u64,

    /// Seconds between checks while unhealthy
    #[arg(short, long, default_value_t = config::DEFAULT_FAIL_INTERVAL.as_secs())]
    fail_interval: u64,

    /// Consecutive unhealthy checks before acting
    #[arg(short = 'c', long, default_value_t = config::DEFAULT_FAILURE_THRESHOLD)]
    fail_count: u32,

    /// Seconds to wait after a restart before another one [default: 2 × interval]
    #[arg(short = 'w', long, visible_alias = "restart-wait")]
    cooldown: Option<u64>,

    /// Only notify, never restart
    #[arg(long)]
    no_restart: bool,

    /// Stop restarting after this many attempts (0 = unlimited)
    #[arg(short, long, default_value_t = config::DEFAULT_MAX_RESTARTS)]
    max_restarts: u32,

    #[arg(long, value_enum, default_value_t = RestartMode::Restart)]
    restart_mode: RestartMode,

    /// Discord webhook URL
    #[arg(short, long, env = "DISCORD_WEBHOOK_URL")]
    discord: Option<String>,

    /// Seconds to wait for a notification to be delivered
    #[arg(long, default_value_t = config::DEFAULT_NOTIFY_TIMEOUT.as_secs())]
    notify_timeout: u64,

    /// Cached OAuth token file [default: ~/.config/stream-tools/token.json]
    #[arg(long, env = "YT_TOKEN_FILE")]
    token_file: Option<PathBuf>,
}

impl WatchArgs {
    fn monitor_config(&self) -> Result<MonitorConfig, ConfigError> {
        let interval = Duration::from_secs(self.interval);

        MonitorConfig {
            interval,
            fail_interval: Duration::from_secs(self.fail_interval).min(interval),
            failure_threshold: self.fail_count,
            restart_cooldown: match self.cooldown {
                Some(secs) => Duration::from_secs(secs),
                None => interval
                    .checked_mul(2)
                    .ok_or(ConfigError::CooldownOutOfRange(interval))?,
            },
            auto_restart: !self.no_restart,
            max_restarts: Some(self.max_restarts).filter(|&n| n > 0),
            notify_timeout: Duration::from_secs(self.notify_timeout),
            notification_target: self.discord.clone(),
        }
        .validate()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,stream_tools=debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let result = match cli.command {
        Command::Watch(args) => watch(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn watch(args: WatchArgs) -> Result<(), ConfigError> {
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, stopping after the current check");
                    token.cancel();
                }
                Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
            }
        });
    }

    run_until_cancelled(token, prepare(args)).await
}

/// Startup is abandoned as soon as `token` is cancelled; a started monitor
/// stops after its in-flight check.
async fn run_until_cancelled<F>(token: CancellationToken, startup: F) -> Result<(), ConfigError>
where
    F: std::future::Future<Output = Result<Monitor, ConfigError>>,
{
    let mut monitor = tokio::select! {
        biased;
        _ = token.cancelled() => {
            info!("Interrupted during startup");
            return Ok(());
        }
        monitor = startup => monitor?,
    };
    monitor.run(token).await;

    Ok(())
}

/// Resolves credentials and collaborators, then announces the run.
async fn prepare(args: WatchArgs) -> Result<Monitor, ConfigError> {
    let stream = StreamIdentity::parse(&args.stream_id)?;
    let mut config = args.monitor_config()?;

    let http = util::HttpClient::new(HTTP_TIMEOUT)?;
    let token_path = args.token_file.clone().or_else(auth::default_token_path);
    let tokens = auth::OAuthTokenSource::discover(http.clone(), token_path.as_deref())?;
    let client = youtube::YouTubeClient::new(http, Arc::new(tokens));

    let mut startup = StartupInfo::default();
    match client.get_stream(stream.as_str()).await {
        Ok(s) => {
            startup.stream_title = s.title().to_string();
            startup.initial_health = s
                .health()
                .map(|h| h.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
        }
        Err(e) if e.is_not_found() => {
            return Err(ConfigError::StreamNotFound(stream.to_string()));
        }
        Err(e) => {
            warn!("Could not fetch stream {}: {}", stream, e);
            startup.initial_health = "unknown".to_string();
        }
    }

    match client.list_active_broadcasts().await {
        Ok(broadcasts) => {
            if let Some(b) = youtube::find_bound_broadcast(&broadcasts, stream.as_str()) {
                startup.broadcast_title = Some(b.title().to_string());
                startup.broadcast_status = Some(b.life_cycle_status().to_string());
                startup.broadcast_url = Some(b.watch_url());
            }
        }
        Err(e) => warn!("Could not look up broadcasts: {}", e),
    }

    let restarter: Option<Box<dyn RestartControl>> = match AzuraCastConfig::from_env()? {
        Some(azuracast) => {
            let station = AzuraCastClient::new(azuracast, HTTP_TIMEOUT)?;
            match station.station().await {
                Ok(info) => startup.station_name = Some(info.name),
                Err(e) => warn!("Could not get station info: {}", e),
            }
            match station.now_playing().await {
                Ok(np) => startup.now_playing = np.track(),
                Err(e) => warn!("Could not get now playing: {}", e),
            }

            Some(Box::new(AzuraCastRestarter::new(
                station,
                args.restart_mode,
                config.clone(),
            )) as Box<dyn RestartControl>)
        }
        None => {
            if config.auto_restart {
                warn!("AzuraCast is not configured, restarts are disabled");
                config.auto_restart = false;
            }
            None
        }
    };

    let notifier: Box<dyn Notifier> = match &config.notification_target {
        Some(url) => Box::new(DiscordNotifier::new(url, config.notify_timeout)?),
        None => {
            info!("No notification target configured");
            Box::new(NullNotifier)
        }
    };

    let probe = YouTubeProbe::new(client);
    let mut monitor = Monitor::new(stream, config, Box::new(probe), restarter, notifier);
    monitor.announce(&startup).await;

    Ok(monitor)
}
