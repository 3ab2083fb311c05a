use crate::domain::models::MacAddress;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command line of the `wed-fleet` tool.
#[derive(Debug, Parser)]
#[command(name = "wed-fleet", about = "Manage a fleet of WED wearable sensors", version)]
pub struct Cli {
    /// Talk to in-memory simulated devices instead of the radio
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Debug-level console logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan for nearby devices
    List {
        /// Scan window in seconds
        #[arg(long, default_value_t = 5)]
        duration: u64,
    },
    /// Flash a device's LED
    Blink {
        #[arg(long)]
        device: MacAddress,
    },
    /// Download the stored logs of one or more devices
    Download {
        #[arg(long = "device", required = true, num_args = 1..)]
        devices: Vec<MacAddress>,
        /// Request uncompressed records
        #[arg(long)]
        raw: bool,
        /// Output file prefix
        #[arg(long = "file", default_value = "./WED_data")]
        file_prefix: PathBuf,
        /// Also write logs to this directory
        #[arg(long = "log")]
        log_dir: Option<PathBuf>,
        /// Skip devices holding fewer logs than this
        #[arg(long, default_value_t = 1)]
        min_logs: u32,
    },
    /// Print battery, log count and mode of devices
    Status {
        #[arg(long = "device", required = true, num_args = 1..)]
        devices: Vec<MacAddress>,
    },
    /// Keep downloading from every device in a fleet config
    Start {
        #[arg(long)]
        config: PathBuf,
    },
    /// Summarize a downloaded log file
    Inspect {
        #[arg(long)]
        file: PathBuf,
    },
}

impl Commands {
    /// Devices named on the command line
    pub fn devices(&self) -> Vec<MacAddress> {
        match self {
            Commands::Blink { device } => vec![*device],
            Commands::Download { devices, .. } | Commands::Status { devices } => devices.clone(),
            Commands::List { .. } | Commands::Start { .. } | Commands::Inspect { .. } => {
                Vec::new()
            }
        }
    }
}
