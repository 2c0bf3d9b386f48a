//! CLI entry point for rotation-stage
//!
//! Stands in for an attribute server: every invocation loads the
//! configuration, initializes the device, runs one attribute access or
//! command through the by-name interface and shuts the device down again.
//! `shell` keeps the device initialized across many lines of input.
//!
//! # Usage
//!
//! ```bash
//! rotation-stage --config config/rotation-stage.toml status
//! rotation-stage write position 45
//! rotation-stage shift-offset -- -2.5
//! rotation-stage shell
//! ```

// Global allocator
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rotation_stage::config::{StageConfig, DEFAULT_CONFIG_PATH};
use rotation_stage::{logging, DeviceInterface, StageController};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

#[derive(Parser)]
#[command(name = "rotation-stage")]
#[command(about = "Control a serial rotation stage", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show state, status and operation count
    Status,

    /// Read an attribute
    Read {
        /// Attribute name (position, velocity, home_offset, num_operations, state, status)
        attribute: String,
    },

    /// Write an attribute
    Write {
        /// Attribute name (position, velocity, home_offset)
        attribute: String,
        /// New value
        #[arg(allow_hyphen_values = true)]
        value: f64,
    },

    /// Run the home sequence
    Homing,

    /// Sweep the full range and reset the operation count
    Swipe,

    /// Add degrees to the home offset
    ShiftOffset {
        /// Degrees to add
        #[arg(allow_hyphen_values = true)]
        delta: f64,
    },

    /// Move by a signed number of degrees
    MoveRelative {
        /// Degrees to move
        #[arg(allow_hyphen_values = true)]
        delta: f64,
    },

    /// Send a raw protocol command (diagnostics only)
    Raw {
        /// Command text, sent verbatim
        text: String,
    },

    /// List attributes and commands
    Describe,

    /// Interactive session reading one request per line from stdin
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = StageConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    if let Commands::Describe = cli.command {
        describe();
        return Ok(());
    }

    let controller = Arc::new(StageController::with_options(
        config.identity(),
        config.link_factory()?,
        config.property_store(),
        config.controller_options(),
    ));

    controller
        .initialize(&config.device.port, config.device.address)
        .await?;

    let outcome = match cli.command {
        Commands::Shell => run_shell(&controller).await,
        command => run_command(&controller, command).await,
    };

    let shutdown = controller.shutdown().await;
    outcome?;
    shutdown?;
    Ok(())
}

async fn run_command(controller: &StageController, command: Commands) -> Result<()> {
    let value = match command {
        Commands::Status => {
            let report = controller.refresh_status().await?;
            println!("state:          {}", report.state);
            println!("num_operations: {}", report.num_operations);
            println!("status:");
            for line in report.status.lines() {
                println!("  {}", line);
            }
            return Ok(());
        }
        Commands::Read { attribute } => controller.read_attribute(&attribute).await?,
        Commands::Write { attribute, value } => {
            controller.write_attribute(&attribute, Value::from(value)).await?;
            Value::Null
        }
        Commands::Homing => controller.execute_command("homing", Value::Null).await?,
        Commands::Swipe => controller.execute_command("swipe", Value::Null).await?,
        Commands::ShiftOffset { delta } => {
            controller
                .execute_command("shift_offset", Value::from(delta))
                .await?
        }
        Commands::MoveRelative { delta } => {
            controller
                .execute_command("move_relative", Value::from(delta))
                .await?
        }
        Commands::Raw { text } => {
            controller
                .execute_command("raw_command", Value::from(text))
                .await?
        }
        Commands::Describe | Commands::Shell => Value::Null,
    };

    print_value(&value);
    Ok(())
}

fn print_value(value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => println!("{}", s),
        other => println!("{}", other),
    }
}

fn describe() {
    println!("Attributes:");
    for attr in rotation_stage::ATTRIBUTES {
        let access = match attr.access {
            rotation_stage::interface::Access::Read => "r ",
            rotation_stage::interface::Access::ReadWrite => "rw",
        };
        println!("  {:<15} {} {}", attr.name, access, attr.description);
    }
    println!("Commands:");
    for cmd in rotation_stage::COMMANDS {
        println!("  {:<15}    {}", cmd.name, cmd.description);
    }
}

/// Parse a shell argument as JSON, falling back to a bare string.
fn parse_argument(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

async fn run_shell(controller: &StageController) -> Result<()> {
    println!("rotation-stage shell. Type 'help' for commands, 'quit' to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = signal::ctrl_c() => {
                tracing::info!("Interrupted");
                None
            }
        };
        let Some(line) = line else { break };

        let mut parts = line.trim().splitn(3, char::is_whitespace);
        let verb = parts.next().unwrap_or_default();
        let name = parts.next();
        let arg = parts.next().map(str::trim);

        let result = match (verb, name, arg) {
            ("", _, _) => continue,
            ("quit" | "exit", _, _) => break,
            ("help", _, _) => {
                println!("  read <attribute>");
                println!("  write <attribute> <value>");
                println!("  <command> [argument]");
                println!("  status | describe | quit");
                continue;
            }
            ("describe", _, _) => {
                describe();
                continue;
            }
            ("status", None, _) => controller
                .refresh_status()
                .await
                .map(|report| Value::String(report.status)),
            ("read", Some(attribute), _) => controller.read_attribute(attribute).await,
            ("write", Some(attribute), Some(value)) => controller
                .write_attribute(attribute, parse_argument(value))
                .await
                .map(|()| Value::Null),
            (command, argument, rest) => {
                // Raw commands keep spaces; everything else takes one argument
                let joined = match (argument, rest) {
                    (Some(a), Some(r)) => Some(format!("{} {}", a, r)),
                    (Some(a), None) => Some(a.to_string()),
                    _ => None,
                };
                let args = match (command, joined) {
                    ("raw_command", Some(text)) => Value::String(text),
                    (_, Some(text)) => parse_argument(&text),
                    (_, None) => Value::Null,
                };
                controller.execute_command(command, args).await
            }
        };

        match result {
            Ok(value) => print_value(&value),
            Err(e) => println!("error: {}", e),
        }
    }

    Ok(())
}
