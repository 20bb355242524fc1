//! `labctl` command-line tool
//!
//! Opens one instrument per invocation, either by its id in `labctl.toml` or
//! by driver type and device path:
//!
//! ```bash
//! labctl get --id stage position
//! labctl set --driver laser --device /dev/ttyUSB1 current 35
//! labctl watch --id thermo temperature --interval-ms 500
//! ```

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use labctl::config::{InstrumentDefinition, LabConfig};
use labctl::logging::{self, LoggingConfig};
use labctl::registry::DriverRegistry;
use labctl_core::driver::{DriverOptions, Instrument};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "labctl")]
#[command(about = "Control serial laboratory instruments", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./labctl.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level and echo serial traffic
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("target").required(true).args(["id", "driver"])))]
struct Target {
    /// Instrument id from the configuration file
    #[arg(long, conflicts_with_all = ["driver", "device"])]
    id: Option<String>,

    /// Driver type (see `labctl drivers`)
    #[arg(long, requires = "device")]
    driver: Option<String>,

    /// Character device path
    #[arg(long, requires = "driver")]
    device: Option<String>,

    /// Read timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available driver types
    Drivers,

    /// List configured instruments
    List,

    /// Describe an instrument's properties
    Props {
        #[command(flatten)]
        target: Target,
    },

    /// Read a property (or every readable property with `all`)
    Get {
        #[command(flatten)]
        target: Target,
        /// Property name
        property: String,
    },

    /// Write a property
    Set {
        #[command(flatten)]
        target: Target,
        /// Property name
        property: String,
        /// New value, parsed according to the property's kind
        value: String,
    },

    /// Send a raw command and print the reply
    Send {
        #[command(flatten)]
        target: Target,
        /// Command text
        raw: String,
    },

    /// Read a property repeatedly until interrupted
    Watch {
        #[command(flatten)]
        target: Target,
        /// Property name
        property: String,
        /// Interval between reads
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
        /// Stop after this many reads
        #[arg(long)]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    config.validate().context("Invalid configuration")?;

    let mut logging_config = LoggingConfig::from_config(&config)?;
    if cli.verbose {
        logging_config = logging_config.verbose();
    }
    logging::init(logging_config)?;

    let registry = DriverRegistry::with_builtin();

    match cli.command {
        Commands::Drivers => {
            for (driver_type, name) in registry.describe() {
                println!("{driver_type:<12} {name}");
            }
            Ok(())
        }
        Commands::List => {
            list_instruments(&config);
            Ok(())
        }
        Commands::Props { target } => {
            let instrument = open_target(&registry, &config, &target, cli.verbose).await?;
            for info in instrument.describe() {
                let access = match (info.readable, info.writable) {
                    (true, true) => "rw",
                    (true, false) => "ro",
                    (false, true) => "wo",
                    (false, false) => "--",
                };
                println!(
                    "{:<20} {:<7} {:<3} {:<6} {}",
                    info.name,
                    info.kind.to_string(),
                    access,
                    info.unit.unwrap_or(""),
                    info.description
                );
            }
            Ok(())
        }
        Commands::Get { target, property } => {
            let instrument = open_target(&registry, &config, &target, cli.verbose).await?;
            if property == "all" {
                for (name, value) in instrument.snapshot().await {
                    match value {
                        Ok(value) => println!("{name} = {value}"),
                        Err(e) => println!("{name} ! {e}"),
                    }
                }
            } else {
                let value = instrument
                    .get_property(&property)
                    .await
                    .with_context(|| format!("Reading '{property}'"))?;
                println!("{value}");
            }
            Ok(())
        }
        Commands::Set {
            target,
            property,
            value,
        } => {
            let instrument = open_target(&registry, &config, &target, cli.verbose).await?;
            instrument
                .set_property_str(&property, &value)
                .await
                .with_context(|| format!("Writing '{property}'"))?;
            Ok(())
        }
        Commands::Send { target, raw } => {
            let instrument = open_target(&registry, &config, &target, cli.verbose).await?;
            let reply = instrument
                .command(&raw)
                .await
                .with_context(|| format!("Sending '{raw}'"))?;
            println!("{reply}");
            Ok(())
        }
        Commands::Watch {
            target,
            property,
            interval_ms,
            count,
        } => {
            let instrument = open_target(&registry, &config, &target, cli.verbose).await?;
            watch(instrument.as_ref(), &property, interval_ms, count).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<LabConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                bail!("Configuration file '{}' does not exist", path.display());
            }
            LabConfig::load_from(path)
                .with_context(|| format!("Loading configuration from '{}'", path.display()))
        }
        None => LabConfig::load().context("Loading configuration"),
    }
}

fn list_instruments(config: &LabConfig) {
    if config.instruments.is_empty() {
        println!("No instruments configured");
        return;
    }
    for def in &config.instruments {
        let state = if def.enabled { "" } else { " (disabled)" };
        println!("{:<16} {:<12} {}{state}", def.id, def.driver, def.device);
    }
}

async fn open_target(
    registry: &DriverRegistry,
    config: &LabConfig,
    target: &Target,
    verbose: bool,
) -> Result<Box<dyn Instrument>> {
    let (driver, device, mut options) = match (&target.id, &target.driver, &target.device) {
        (Some(id), _, _) => {
            let def: &InstrumentDefinition = config
                .instrument(id)
                .with_context(|| format!("No instrument '{id}' in configuration"))?;
            if !def.enabled {
                bail!("Instrument '{id}' is disabled in configuration");
            }
            (def.driver.as_str(), def.device.as_str(), def.options())
        }
        (None, Some(driver), Some(device)) => {
            (driver.as_str(), device.as_str(), DriverOptions::default())
        }
        _ => bail!("Name an instrument with --id, or with --driver and --device"),
    };

    if let Some(ms) = target.timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    if verbose {
        options = options.debug(true);
    }

    let instrument = registry
        .open(driver, device, options)
        .await
        .with_context(|| format!("Opening {driver} at '{device}'"))?;
    info!(driver, device, "Instrument ready");
    Ok(instrument)
}

async fn watch(
    instrument: &dyn Instrument,
    property: &str,
    interval_ms: u64,
    count: Option<u64>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut reads = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            _ = ticker.tick() => {
                let value = instrument
                    .get_property(property)
                    .await
                    .with_context(|| format!("Reading '{property}'"))?;
                println!("{value}");
                reads += 1;
                if count.is_some_and(|n| reads >= n) {
                    return Ok(());
                }
            }
        }
    }
}
