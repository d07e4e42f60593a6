use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use log::{error, info};

use watchface_bridge_lib::commands;
use watchface_bridge_lib::config::AppConfig;
use watchface_bridge_lib::logging::SessionLogger;
use watchface_bridge_lib::state::{AppState, resolve_config_dir};
use watchface_bridge_lib::utils::format_battery;

/// Manage the watch face of an AW12 smartwatch over BLE
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Use the in-process simulated watch instead of the radio
    #[arg(long)]
    simulate: bool,

    /// Directory holding session_config.json
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Which watch a command talks to; the last paired one when omitted
#[derive(clap::Args)]
struct Target {
    /// Hardware address of the watch
    #[arg(short, long)]
    address: Option<String>,

    /// Display name recorded with the pairing
    #[arg(short, long, default_value = "")]
    name: String,
}

#[derive(Subcommand)]
enum Command {
    /// List nearby devices
    Scan {
        /// Seconds to scan
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect to a watch and show its battery and firmware
    Connect {
        #[command(flatten)]
        target: Target,
    },
    /// Connect to the last paired watch
    Reconnect,
    /// Forget the last paired watch
    Forget,
    /// Replace the watch background with an image
    UploadImage {
        path: PathBuf,
        #[command(flatten)]
        target: Target,
    },
    /// Flash a .bin watch face package
    UploadBin {
        path: PathBuf,
        /// Face slot, the configured default when omitted
        #[arg(short, long)]
        index: Option<i32>,
        #[command(flatten)]
        target: Target,
    },
    /// Read or select the built-in watch face
    Face {
        #[command(subcommand)]
        action: FaceAction,
    },
}

#[derive(Subcommand)]
enum FaceAction {
    Get {
        #[command(flatten)]
        target: Target,
    },
    Set {
        index: i32,
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = if args.verbose { log::Level::Debug } else { log::Level::Info };
    SessionLogger::init_or_fallback(level);

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config_dir = resolve_config_dir(args.config_dir)?;
    let config = AppConfig::load(&config_dir).await?;
    let app_state = AppState::new(config, &config_dir, args.simulate).await?;

    let outcome = execute(&app_state, args.command).await;
    commands::shutdown(&app_state).await;
    outcome.map_err(|e| anyhow!(e))
}

async fn execute(app_state: &AppState, command: Command) -> Result<(), String> {
    match command {
        Command::Scan { seconds } => {
            let devices = commands::scan_devices(app_state, Duration::from_secs(seconds)).await?;
            if devices.is_empty() {
                println!("No devices found");
            }
            for device in devices {
                println!("{}  {:>4} dBm  {}", device.address, device.rssi, device.name);
            }
        }
        Command::Connect { target } => {
            let session = connect(app_state, &target).await?;
            println!(
                "Connected to {} ({}), battery {}, firmware {}",
                session.name.unwrap_or_default(),
                session.address.unwrap_or_default(),
                format_battery(session.battery),
                if session.firmware_version.is_empty() { "unknown" } else { session.firmware_version.as_str() },
            );
        }
        Command::Reconnect => match commands::reconnect(app_state).await? {
            Some(session) => println!("Reconnected to {}", session.address.unwrap_or_default()),
            None => println!("No paired watch recorded"),
        },
        Command::Forget => {
            commands::forget(app_state).await?;
            println!("Paired watch forgotten");
        }
        Command::UploadImage { path, target } => {
            connect(app_state, &target).await?;
            commands::upload_image(app_state, &path).await?;
            println!("Background uploaded");
        }
        Command::UploadBin { path, index, target } => {
            connect(app_state, &target).await?;
            commands::upload_bin(app_state, &path, index).await?;
            println!("Watch face package uploaded");
        }
        Command::Face { action } => match action {
            FaceAction::Get { target } => {
                connect(app_state, &target).await?;
                println!("Current watch face: {}", commands::get_watch_face(app_state).await?);
            }
            FaceAction::Set { index, target } => {
                connect(app_state, &target).await?;
                commands::set_watch_face(app_state, index).await?;
                println!("Watch face set to {}", index);
            }
        },
    }
    Ok(())
}

async fn connect(
    app_state: &AppState,
    target: &Target,
) -> Result<watchface_bridge_lib::core::session::ConnectionSession, String> {
    match &target.address {
        Some(address) => commands::connect_to_device(app_state, address, &target.name).await,
        None => {
            info!("No address given, using the last paired watch");
            commands::reconnect(app_state)
                .await?
                .ok_or_else(|| "no paired watch recorded, pass --address".to_string())
        }
    }
}
