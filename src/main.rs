use std::{net::Ipv4Addr, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rngcounter::{
    client::GeckoClient,
    config::{Config, DEFAULT_CONFIG_PATH},
    shutdown,
    tracker::{Sample, Tracker, TrackerConfig},
    udp_log::UdpLogListener,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Watch a game's RNG advance in real time.
///
/// Polls the Wichmann-Hill generator state over TCPGecko and reports how many
/// steps it took between reads, a rolling steps-per-second rate and the
/// running total.
#[derive(Parser, Debug)]
#[command(name = "rngcounter", version, about)]
struct Cli {
    /// Path to the JSON settings file. Created on exit if missing.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, env = "RNGCOUNTER_CONFIG")]
    config: PathBuf,

    /// Console IP address. Defaults to the last address used.
    #[arg(long, env = "RNGCOUNTER_IP")]
    ip: Option<Ipv4Addr>,

    /// Directory for CSV sample logs and UDP console logs.
    #[arg(long, env = "RNGCOUNTER_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Number of reads averaged into the rolling rate.
    #[arg(long)]
    window: Option<usize>,

    /// Do not write a CSV sample log.
    #[arg(long)]
    no_log: bool,

    /// Also capture the console's UDP log broadcasts.
    #[arg(long)]
    udp_log: bool,
}

impl Cli {
    fn apply_to(&self, config: &mut Config) {
        if let Some(dir) = &self.log_dir {
            config.log_file_path = dir.clone();
        }
        if let Some(depth) = self.window {
            config.average_count = depth;
        }
        if self.udp_log {
            config.udp_logging = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config)?;
    cli.apply_to(&mut config);

    let ip = match cli.ip {
        Some(ip) => ip,
        None => config.saved_ip.parse().with_context(|| {
            format!(
                "saved IP '{}' is not a valid IPv4 address, pass --ip",
                config.saved_ip
            )
        })?,
    };
    config.saved_ip = ip.to_string();

    let mut udp_listener = match config.udp_logging {
        true => {
            let mut listener = UdpLogListener::new(&config.log_file_path);
            listener
                .start()
                .await
                .context("failed to start UDP log listener")?;
            Some(listener)
        }
        false => None,
    };

    let mut client = GeckoClient::new(config.client_config());
    client
        .connect(&config.saved_ip)
        .await
        .with_context(|| format!("unable to connect to console at {ip}"))?;
    match client.get_server_version_hash().await {
        Ok(Some(hash)) => tracing::info!(hash = %format!("{hash:#010x}"), "server version"),
        Ok(None) => tracing::warn!("server did not report a version hash"),
        Err(e) => tracing::warn!(error = %e, "version hash query failed"),
    }

    let mut tracker_config = TrackerConfig::from(&config);
    if cli.no_log {
        tracker_config.log_dir = None;
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let mut tracker = Tracker::new(client, tx, tracker_config);
    tracker.start()?;
    tracing::info!("tracking started, finding the current RNG state may take a moment");

    let outcome = report_samples(rx).await;

    let mut client = tracker.shutdown().await?;
    client.disconnect().await;
    if let Some(listener) = udp_listener.as_mut() {
        listener.stop().await;
    }
    config.save(&cli.config)?;
    outcome
}

/// Log samples until a shutdown signal arrives.
async fn report_samples(mut rx: mpsc::UnboundedReceiver<Sample>) -> Result<()> {
    let shutdown = shutdown::wait_for_shutdown();
    tokio::pin!(shutdown);
    let mut failing = false;

    loop {
        let sample = tokio::select! {
            result = &mut shutdown => {
                result?;
                return Ok(());
            }
            sample = rx.recv() => match sample {
                Some(sample) => sample,
                None => return Ok(()),
            },
        };

        match sample {
            Sample::Reading {
                steps,
                rate,
                total_steps,
            } => {
                if failing {
                    tracing::info!("reads recovered");
                    failing = false;
                }
                tracing::info!(steps, rate = %format!("{rate:.2}"), total_steps, "rng");
            }
            Sample::ReadFailed => {
                if !failing {
                    tracing::warn!("timed out reading from TCPGecko, the console or homebrew may need a restart");
                    failing = true;
                }
            }
            Sample::Resynced {
                searched,
                total_steps,
            } => {
                tracing::warn!(searched, total_steps, "lost track of the RNG, resynchronized");
            }
            Sample::Halted => bail!("tracker halted, see the error above"),
        }
    }
}
