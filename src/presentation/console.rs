//! Operator Console
//!
//! Line-oriented front end: scan, pick a vehicle, then send commands until
//! the operator types `exit`.

use crate::domain::models::{format_mac, AppEvent, MessageSeverity, VehicleRecord};
use crate::infrastructure::bluetooth::connection::CancelToken;
use crate::infrastructure::bluetooth::protocol::VehicleCommand;
use crate::infrastructure::bluetooth::service::VehicleService;
use anyhow::Result;
use std::io::Write;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A line typed at the command prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Ping,
    GetVersion,
    GetBattery,
    Exit,
}

impl FromStr for OperatorCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ping" => Ok(Self::Ping),
            "get-version" => Ok(Self::GetVersion),
            "get-battery" => Ok(Self::GetBattery),
            "exit" => Ok(Self::Exit),
            other => Err(format!(
                "Unknown command '{}'. Try ping, get-version, get-battery or exit.",
                other
            )),
        }
    }
}

impl OperatorCommand {
    pub fn to_vehicle_command(self) -> Option<VehicleCommand> {
        match self {
            Self::Ping => Some(VehicleCommand::Ping),
            Self::GetVersion => Some(VehicleCommand::VersionRequest),
            Self::GetBattery => Some(VehicleCommand::BatteryRequest),
            Self::Exit => None,
        }
    }
}

/// Answer to the vehicle selection prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Vehicle(usize),
    Exit,
    Invalid,
}

pub fn parse_selection(input: &str, count: usize) -> Selection {
    let input = input.trim();
    if input == "exit" {
        return Selection::Exit;
    }
    match input.parse::<usize>() {
        Ok(index) if index < count => Selection::Vehicle(index),
        _ => Selection::Invalid,
    }
}

/// `0: Groundshock (AA:BB:CC:DD:EE:FF)`
pub fn format_vehicle_line(index: usize, vehicle: &VehicleRecord) -> String {
    format!(
        "{}: {} ({})",
        index,
        vehicle.display_model(),
        format_mac(vehicle.mac_address)
    )
}

fn prompt(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

/// Render application events while the console waits for input
fn spawn_event_printer(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    tokio::spawn(async move {
        let mut found = 0;
        while let Some(event) = events.recv().await {
            match event {
                AppEvent::VehicleFound(_) => {
                    found += 1;
                    prompt(&format!(
                        "\rSearching for cars, press enter to stop...  ({} found)",
                        found
                    ));
                }
                AppEvent::Response(response) => println!("[read] {}", response),
                AppEvent::LogMessage(status) => match status.severity {
                    MessageSeverity::Error | MessageSeverity::Warning => {
                        println!("\n{}", status.message)
                    }
                    MessageSeverity::Info | MessageSeverity::Success => {
                        println!("{}", status.message)
                    }
                },
                AppEvent::ConnectionState { mac_address, state } => {
                    info!("{} is now {:?}", format_mac(mac_address), state)
                }
            }
        }
    });
}

pub async fn run(
    mut service: VehicleService,
    events: mpsc::UnboundedReceiver<AppEvent>,
) -> Result<()> {
    spawn_event_printer(events);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    prompt("Searching for cars, press enter to stop... ");
    service.start_scan()?;
    lines.next_line().await?;
    let found = service.stop_scan().await?;
    println!();
    info!("Scan finished, {} vehicle(s) found", found);

    let vehicles = service.vehicles();
    if vehicles.is_empty() {
        println!("No cars found.  Exiting...");
        return Ok(());
    }

    let vehicle = loop {
        println!("Cars available for connection: ");
        for (i, vehicle) in vehicles.iter().enumerate() {
            println!("{}", format_vehicle_line(i, vehicle));
        }
        println!();
        println!("Please choose a car or type 'exit': ");

        let Some(input) = lines.next_line().await? else {
            return Ok(());
        };
        match parse_selection(&input, vehicles.len()) {
            Selection::Vehicle(i) => break vehicles[i].clone(),
            Selection::Exit => return Ok(()),
            Selection::Invalid => continue,
        }
    };
    println!();

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted by operator");
            interrupt.cancel();
        }
    });

    let commander = service.commander(vehicle.mac_address);
    let session_cancel = cancel.clone();
    let (outcome, stats) = service
        .run_session(vehicle.mac_address, &cancel, move || async move {
            loop {
                prompt("Please enter your command: ");
                let line = tokio::select! {
                    line = lines.next_line() => line?,
                    _ = session_cancel.cancelled() => None,
                };
                let Some(line) = line else {
                    return Ok(());
                };

                let command = match line.parse::<OperatorCommand>() {
                    Ok(OperatorCommand::Exit) => return Ok(()),
                    Ok(command) => command,
                    Err(hint) => {
                        println!("{}", hint);
                        continue;
                    }
                };
                if let Some(vehicle_command) = command.to_vehicle_command() {
                    if let Err(e) = commander.send(vehicle_command).await {
                        error!("Write failed: {}", e);
                        println!("{}", e);
                    }
                }
            }
        })
        .await;

    info!(
        "Session finished: {:?} ({} frames, {} malformed)",
        outcome, stats.frames, stats.malformed
    );
    println!("Exiting...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::VehicleModel;

    #[test]
    fn test_parse_commands() {
        assert_eq!("ping".parse(), Ok(OperatorCommand::Ping));
        assert_eq!(" get-version\n".parse(), Ok(OperatorCommand::GetVersion));
        assert_eq!("get-battery".parse(), Ok(OperatorCommand::GetBattery));
        assert_eq!("exit".parse(), Ok(OperatorCommand::Exit));
        assert!("drive".parse::<OperatorCommand>().is_err());
    }

    #[test]
    fn test_command_mapping() {
        assert_eq!(
            OperatorCommand::GetBattery.to_vehicle_command(),
            Some(VehicleCommand::BatteryRequest)
        );
        assert_eq!(OperatorCommand::Exit.to_vehicle_command(), None);
    }

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("0", 2), Selection::Vehicle(0));
        assert_eq!(parse_selection("1\n", 2), Selection::Vehicle(1));
        assert_eq!(parse_selection("2", 2), Selection::Invalid);
        assert_eq!(parse_selection("-1", 2), Selection::Invalid);
        assert_eq!(parse_selection("car", 2), Selection::Invalid);
        assert_eq!(parse_selection("exit", 2), Selection::Exit);
    }

    #[test]
    fn test_format_vehicle_line() {
        let vehicle = VehicleRecord {
            model: Some(VehicleModel::Thermo),
            ..VehicleRecord::new(0x0A0B0C0D0E0F)
        };
        assert_eq!(
            format_vehicle_line(3, &vehicle),
            "3: Thermo (0A:0B:0C:0D:0E:0F)"
        );
        assert_eq!(
            format_vehicle_line(0, &VehicleRecord::new(1)),
            "0: Unknown (00:00:00:00:00:01)"
        );
    }
}
