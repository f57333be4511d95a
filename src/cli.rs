//! Command line front end. Only drives the device session and prints what it reports.

use std::time::Duration;
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::device::command::{Command, SpeedPreset};
use crate::device::session::DeviceSession;
use crate::device::transport::Transport;
use crate::device::types::{DeviceDescriptor, DeviceEvent};
use crate::error::AppRunError;

#[derive(Parser, Debug)]
#[command(version, about = "Control a WindTrax fan over Bluetooth LE")]
pub struct Cli {
    /// Connect to this device id instead of scanning for one by name.
    /// Ids the adapter has not seen yet are looked up with a short scan
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// How long to scan, for example "10s" or "2500ms"
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub window: Option<Duration>,

    /// Also log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// List the fans in range
    Scan,
    /// Switch the fan on or off
    Power {
        #[arg(value_enum)]
        state: PowerState,
    },
    /// Set the fan speed: low, medium, high or a percentage
    Speed {
        #[arg(value_parser = parse_speed)]
        speed: Command,
    },
    /// Stay connected and print state changes until interrupted
    Monitor,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

// range checking is left to the command encoder
fn parse_speed(value: &str) -> Result<Command, String> {
    let preset = match value.to_ascii_lowercase().as_str() {
        "low" => Some(SpeedPreset::Low),
        "medium" => Some(SpeedPreset::Medium),
        "high" => Some(SpeedPreset::High),
        _ => None,
    };

    match preset {
        Some(preset) => Ok(preset.into()),
        None => value
            .trim_end_matches('%')
            .parse::<u8>()
            .map(Command::SetSpeed)
            .map_err(|_| format!("expected low, medium, high or a percentage, got '{}'", value)),
    }
}

pub async fn execute<T: Transport>(session: &DeviceSession<T>, cli: &Cli) -> Result<(), AppRunError> {
    let window = cli.window.unwrap_or(session.config().scan_window);

    match &cli.command {
        CliCommand::Scan => {
            let found = session.begin_scan(window).await?;
            if found.is_empty() {
                println!("No {} found", session.config().target_name);
            }
            for descriptor in found {
                println!("{}", descriptor);
            }
            Ok(())
        },
        CliCommand::Power { state } => {
            send_once(session, cli, window, Command::Power(*state == PowerState::On)).await
        },
        CliCommand::Speed { speed } => send_once(session, cli, window, *speed).await,
        CliCommand::Monitor => {
            let descriptor = connect_target(session, cli, window).await?;
            println!("Connected to {}", descriptor);
            monitor(session).await;
            session.disconnect().await;
            Ok(())
        },
    }
}

async fn connect_target<T: Transport>(
    session: &DeviceSession<T>,
    cli: &Cli,
    window: Duration,
) -> Result<DeviceDescriptor, AppRunError> {
    let descriptor = match &cli.device {
        Some(id) => DeviceDescriptor::new(id.as_str(), None),
        None => {
            let found = session.begin_scan(window).await?;
            found.first().cloned().ok_or_else(|| AppRunError::NotFound {
                name: session.config().target_name.clone(),
            })?
        },
    };

    Ok(session.connect(descriptor).await?)
}

async fn send_once<T: Transport>(
    session: &DeviceSession<T>,
    cli: &Cli,
    window: Duration,
    command: Command,
) -> Result<(), AppRunError> {
    connect_target(session, cli, window).await?;
    let result = session.send_command(command).await;
    session.disconnect().await;

    result?;
    println!("Sent {:?}", command);
    Ok(())
}

async fn monitor<T: Transport>(session: &DeviceSession<T>) {
    let mut events = session.subscribe_events();

    'mainloop: loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!("Failed to listen for ctrl-c: {}", err);
                }
                info!("Interrupted");
                break 'mainloop;
            },
            event = events.recv() => match event {
                Ok(DeviceEvent::StateChange(state)) => println!("State: {}", state.connection),
                Ok(DeviceEvent::LinkLost(descriptor)) => {
                    println!("Connection lost to {}", descriptor);
                    break 'mainloop;
                },
                Err(RecvError::Lagged(missed)) => warn!("Missed {} device events", missed),
                Err(RecvError::Closed) => break 'mainloop,
            },
        }
    }
}
