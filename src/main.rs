#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # simcomd
//!
//! Command-line front end for a SIMCOM SIM7600-class modem on a serial port.
//!
//! ## Subcommands
//!
//! - `simcomd status`: identity, SIM, signal, registration, operator
//! - `simcomd settings`: active settings profile
//! - `simcomd gps fix|start|stop|state`: GNSS session control and fixes
//! - `simcomd sms list [--filter]`: list stored messages
//! - `simcomd sms send <to> <text>`: send a text message
//! - `simcomd sms delete <index>`: delete a stored message
//! - `simcomd watch`: poll signal quality in the background until Ctrl-C
//!
//! Results are printed to stdout as JSON; logs go to stderr.
//!
//! ## Architecture
//!
//! ```text
//! main.rs         : entry point, clap subcommands, graceful shutdown
//! config.rs       : TOML + env-var configuration
//! transport.rs    : SerialLink (termios), device auto-detection
//! correlator.rs   : exchange/poll loop, link lock, background poll queue
//! device.rs       : SIM/SMS setup, status snapshot
//! gps.rs          : CGPS session state machine, CGPSINFO decoding
//! sms/
//!   mod.rs        : list, send (prompt handshake), delete
//!   message.rs    : SmsMessage, MessageType, SmsFilter
//!   parser.rs     : +CMGL listing decoder
//! ```

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use simcomd::transport::detect_device;
use simcomd::util::truncate_for_log;
use simcomd::{Config, Correlator, Device, Error, Gps, SerialLink, Sms, SmsFilter};

/// Exit code for a command the modem refused or could not complete.
const EXIT_COMMAND_FAILED: u8 = 2;

#[derive(Parser)]
#[command(name = "simcomd", version)]
struct Cli {
    /// Config file (default `simcomd.toml` in the current directory).
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a modem status snapshot.
    Status,
    /// Print the active settings profile (`AT&V`).
    Settings,
    /// GNSS session control.
    Gps {
        #[command(subcommand)]
        action: GpsAction,
    },
    /// Text messages.
    Sms {
        #[command(subcommand)]
        action: SmsAction,
    },
    /// Poll signal quality in the background until interrupted.
    Watch,
}

#[derive(Subcommand)]
enum GpsAction {
    /// Acquire one position fix, starting the session if needed.
    Fix,
    Start,
    Stop,
    /// Query whether the session is running.
    State,
}

#[derive(Subcommand)]
enum SmsAction {
    List {
        /// all, rec-unread, rec-read, sto-unsent, sto-sent
        #[arg(long, default_value = "all")]
        filter: SmsFilter,
    },
    Send {
        to: String,
        text: String,
    },
    Delete {
        index: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("simcomd: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("simcomd v{} starting", env!("CARGO_PKG_VERSION"));

    let modem = match connect(&config).await {
        Ok(modem) => modem,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, &config, modem).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_COMMAND_FAILED),
        Err(e @ Error::Transport(_)) => {
            error!("{e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(EXIT_COMMAND_FAILED)
        }
    }
}

/// Open the serial port and bring the modem into a known state.
async fn connect(config: &Config) -> Result<Correlator, Error> {
    let path = config
        .serial
        .device
        .clone()
        .or_else(detect_device)
        .ok_or_else(|| Error::Transport("no modem found (set SIM7600_PORT)".into()))?;

    let link = SerialLink::open(&path, config.serial.baud_rate)?;
    info!("Modem: {path} @ {} baud", config.serial.baud_rate);

    let modem = Correlator::new(link, config.poll_interval());
    modem.init().await?;
    Ok(modem)
}

async fn run(command: Commands, config: &Config, modem: Correlator) -> Result<bool, Error> {
    match command {
        Commands::Status => {
            let device = Device::new(modem, config.status_timeout());
            print_json(&device.status().await?);
        }
        Commands::Settings => {
            let device = Device::new(modem, config.status_timeout());
            print_json(&serde_json::json!({ "profile": device.config_dump().await? }));
        }
        Commands::Gps { action } => {
            let gps = Gps::new(modem, config.gps_timeouts());
            match action {
                GpsAction::Fix => {
                    let outcome = gps
                        .get_fix(config.gps_timeouts().command, config.gps.retries)
                        .await?;
                    print_json(&outcome);
                }
                GpsAction::Start => {
                    gps.start().await?;
                    print_json(&serde_json::json!({ "state": gps.last_seen() }));
                }
                GpsAction::Stop => {
                    gps.stop().await?;
                    print_json(&serde_json::json!({ "state": gps.last_seen() }));
                }
                GpsAction::State => {
                    let state = gps.state().await?;
                    print_json(&serde_json::json!({ "state": state }));
                }
            }
        }
        Commands::Sms { action } => {
            let device = Device::new(modem.clone(), config.status_timeout());
            device.initial_checks().await?;
            device
                .prepare_sms(&config.sms.storage, config.sms.text_mode)
                .await?;

            let sms = Sms::new(modem, config.sms_timeouts());
            match action {
                SmsAction::List { filter } => print_json(&sms.list(filter).await?),
                SmsAction::Send { to, text } => {
                    let record = sms.send_message(&to, &text).await;
                    print_json(&record);
                    return Ok(record.is_sent == Some(true));
                }
                SmsAction::Delete { index } => {
                    let deleted = sms.delete(index).await;
                    print_json(&serde_json::json!({ "index": index, "deleted": deleted }));
                    return Ok(deleted);
                }
            }
        }
        Commands::Watch => watch(config, modem).await?,
    }
    Ok(true)
}

/// Run the background queue with a repeating `AT+CSQ` until Ctrl-C/SIGTERM
/// or until the link is lost.
async fn watch(config: &Config, modem: Correlator) -> Result<(), Error> {
    let poller = modem.spawn_poller()?;
    let mut outcomes = modem.subscribe();
    let handle = modem.schedule("AT+CSQ", "OK", config.status_timeout(), true);
    info!("Watching `{}` every {:?}", handle.command(), modem.poll_interval());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            () = &mut shutdown => break Ok(()),
            outcome = outcomes.recv() => match outcome {
                Ok(outcome) => match outcome.result {
                    Ok(resp) => print_json(&serde_json::json!({
                        "command": outcome.command,
                        "response": truncate_for_log(resp.trim(), 200),
                    })),
                    Err(e @ Error::Transport(_)) => break Err(e),
                    Err(e) => warn!("{}: {e}", outcome.command),
                },
                Err(RecvError::Lagged(n)) => warn!("Watch: skipped {n} outcome(s)"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    handle.cancel();
    poller.abort();
    info!("Watch stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to serialize output: {e}"),
    }
}
