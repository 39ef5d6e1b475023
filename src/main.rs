//! CLI Entry Point for multibeam-daq
//!
//! # Usage
//!
//! Scan a 3 x 4 field mega-field:
//! ```bash
//! multibeam-daq --config config/multibeam.toml acquire --fields 3x4 --content thumbnail
//! ```
//!
//! Try the commands without hardware:
//! ```bash
//! multibeam-daq --simulate single --content full
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use multibeam_daq::commands;
use multibeam_daq::config::AppConfig;
use multibeam_daq::logging;
use multibeam_daq::mb_driver_asm::simulator::SIMULATED_HOST;
use multibeam_daq::mb_driver_asm::DataContent;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "multibeam-daq")]
#[command(about = "Multibeam acquisition control through the ASM", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-process simulated ASM instead of the configured host
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a mega-field, field by field
    Acquire {
        /// Field grid as <columns>x<rows>
        #[arg(long, default_value = "1x1")]
        fields: String,

        /// empty, thumbnail or full
        #[arg(long, default_value = "thumbnail")]
        content: DataContent,
    },

    /// Acquire a single field
    Single {
        #[arg(long, default_value = "thumbnail")]
        content: DataContent,
    },

    /// Run the calibration loop for a while
    Calibrate {
        #[arg(long, default_value = "10")]
        seconds: u64,
    },

    /// Check whether a mega-field was stored
    Check {
        mega_field_id: String,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None if cli.simulate => AppConfig::new(SIMULATED_HOST),
        None => bail!("--config is required unless --simulate is given"),
    };
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let server = commands::open_server(&config, cli.simulate).await?;
    let result = run(&cli.command, &config, &server).await;
    server.terminate().await;
    result
}

async fn run(
    command: &Commands,
    config: &AppConfig,
    server: &multibeam_daq::mb_driver_asm::AcquisitionServer,
) -> Result<()> {
    match command {
        Commands::Acquire { fields, content } => {
            let grid = commands::parse_field_grid(fields)?;
            let timeout = config.acquisition.single_field_timeout();
            let summaries = commands::acquire_megafield(server, grid, *content, timeout).await?;
            for summary in &summaries {
                println!("{}", serde_json::to_string(summary)?);
            }
            println!(
                "Acquired {} fields into mega-field '{}'",
                summaries.len(),
                server.mppc().filename().get()
            );
        }
        Commands::Single { content } => {
            let summary = commands::acquire_single(server, *content).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Calibrate { seconds } => {
            commands::run_calibration(server, Duration::from_secs(*seconds)).await?;
            println!("Calibration loop ran for {} s", seconds);
        }
        Commands::Check { mega_field_id } => {
            let stored = commands::check_stored(server, mega_field_id).await?;
            println!(
                "Mega-field '{}' {}",
                mega_field_id,
                if stored { "exists" } else { "was not found" }
            );
        }
        Commands::Config => {}
    }
    Ok(())
}
