//! tandem - two-peer host-authoritative session synchronization
//!
//! Command-line front end: room codes, config files and an in-process demo.

mod config;
mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use tandem_core::RoomCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Two-peer session synchronization toolkit", long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print fresh room codes
    Code {
        /// How many codes to print
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Run a scripted host/guest campaign in-process
    Demo {
        /// Rounds in the campaign (default from config)
        #[arg(long)]
        rounds: Option<u32>,

        /// Session seed (default from config)
        #[arg(long)]
        seed: Option<u64>,

        /// Write session events as JSON lines to this path
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the config path instead of stdout
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with WARN level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    info!("Starting tandem v{}", env!("CARGO_PKG_VERSION"));
    let config = AppConfig::load_from_path(&cli.config);

    match cli.command {
        Command::Code { count } => {
            let mut rng = rand::thread_rng();
            for _ in 0..count.max(1) {
                let code = RoomCode::generate(&mut rng);
                println!("{code}  ({})", code.peer_id());
            }
        }
        Command::Demo {
            rounds,
            seed,
            events,
        } => {
            let options = demo::DemoOptions {
                rounds: rounds.unwrap_or(config.demo.rounds),
                seed: seed.unwrap_or(config.demo.seed),
                ticks_per_round: config.demo.ticks_per_round,
                events,
            };
            let report = demo::run(&options, &config.session).await?;
            println!("room {} via {:?}", report.room_code, report.path);
            println!(
                "rounds {} (retries {}), final score {}:{}",
                report.rounds_played,
                report.retries,
                report.final_score.host,
                report.final_score.guest
            );
            println!("max render error {:.3}", report.max_render_error);
            println!(
                "host sent {} frames ({} dropped), guest sent {} frames ({} dropped)",
                report.host_stats.frames_sent,
                report.host_stats.dropped_backpressure + report.host_stats.dropped_send_failure,
                report.guest_stats.frames_sent,
                report.guest_stats.dropped_backpressure + report.guest_stats.dropped_send_failure,
            );
            if let Some(path) = &options.events {
                println!("{} events written to {}", report.events_logged, path.display());
            }
        }
        Command::Config { write } => {
            if write {
                config
                    .save_to_path(&cli.config)
                    .context("saving configuration")?;
                println!("wrote {}", cli.config.display());
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }
    Ok(())
}
