//! Votifier receiver daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use votifier_core::{PeerTarget, TokenKey, Vote};

use votifier_peer::app::{AppError, public_key_line, run_receiver, send_once};
use votifier_peer::config::{ReceiverConfig, write_example_config};

/// Votifier receiver CLI.
#[derive(Debug, Parser)]
#[command(name = "votifier-peer")]
#[command(about = "Votifier v1/v2 vote receiver and forwarder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the receiver until interrupted. Creates the config if missing.
    Run {
        /// TOML config file path.
        #[arg(long, default_value = "votifier-peer.toml")]
        config: PathBuf,
    },
    /// Write the example config.
    InitConfig {
        /// TOML config file path.
        #[arg(long, default_value = "votifier-peer.toml")]
        config: PathBuf,
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the receiver public key as a single line.
    PublicKey {
        /// TOML config file path.
        #[arg(long, default_value = "votifier-peer.toml")]
        config: PathBuf,
    },
    /// Send one test vote to a receiver.
    Send {
        /// Receiver host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Receiver port.
        #[arg(long, default_value_t = 8192)]
        port: u16,
        /// Shared secret; selects the v2 codec.
        #[arg(long, conflicts_with = "key", required_unless_present = "key")]
        token: Option<String>,
        /// Receiver public key (PEM or single line); selects the v1 codec.
        #[arg(long)]
        key: Option<String>,
        /// Voting site name.
        #[arg(long, default_value = "votifier-peer")]
        service: String,
        /// Player name.
        #[arg(long)]
        username: String,
        /// Voter address.
        #[arg(long, default_value = "127.0.0.1")]
        address: String,
        /// Timestamp; defaults to the current unix time.
        #[arg(long)]
        timestamp: Option<String>,
        /// Connect plus I/O timeout in milliseconds.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { config } => run(&config).await,
        Command::InitConfig { config, force } => {
            write_example_config(&config, force).map_err(AppError::Io)
        }
        Command::PublicKey { config } => match ReceiverConfig::from_toml_file(&config) {
            Ok(cfg) => public_key_line(&cfg).await.map(|line| println!("{line}")),
            Err(err) => Err(err.into()),
        },
        Command::Send {
            host,
            port,
            token,
            key,
            service,
            username,
            address,
            timestamp,
            timeout_ms,
        } => {
            init_tracing(false);
            let timestamp = timestamp.unwrap_or_else(|| {
                time::OffsetDateTime::now_utc().unix_timestamp().to_string()
            });
            let target = PeerTarget {
                enabled: true,
                host,
                port,
                public_key_material: key.unwrap_or_default(),
                use_token: token.is_some(),
                token: token.as_deref().map(TokenKey::from_secret),
            };
            match Vote::new(service, username, address, timestamp) {
                Ok(vote) => send_once(&target, &vote, Duration::from_millis(timeout_ms))
                    .await
                    .map(|()| println!("vote sent to {}", target.address())),
                Err(err) => Err(err.into()),
            }
        }
    };

    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run(path: &Path) -> Result<(), AppError> {
    let created = !path.exists();
    if created {
        write_example_config(path, false)?;
    }
    let config = ReceiverConfig::from_toml_file(path)?;
    init_tracing(config.debug);
    if created {
        tracing::info!(path = %path.display(), "wrote default configuration");
    }
    run_receiver(config, path).await
}

fn init_tracing(debug: bool) {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let fallback = if debug { "debug" } else { "info" };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| fallback.into()),
            )
            .try_init();
    });
}
