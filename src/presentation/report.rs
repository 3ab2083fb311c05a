//! Console reporting of fleet events.

use crate::domain::models::{DownloadEnd, FleetEvent, ScannedDevice, SessionOutcome};
use std::io::Write;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One-line summary of a finished session
pub fn outcome_line(outcome: &SessionOutcome) -> String {
    let mut line = format!("{}: ", outcome.mac);
    match (&outcome.error, outcome.download) {
        (Some(error), _) => line.push_str(&format!("failed ({})", error)),
        (None, Some(DownloadEnd::Completed)) => line.push_str(&format!(
            "downloaded {} of {} logs",
            outcome.records_received, outcome.records_expected
        )),
        (None, Some(DownloadEnd::Cancelled)) => line.push_str(&format!(
            "interrupted at {} of {} logs",
            outcome.records_received, outcome.records_expected
        )),
        (None, Some(DownloadEnd::Failed)) => line.push_str(&format!(
            "aborted at {} of {} logs",
            outcome.records_received, outcome.records_expected
        )),
        (None, None) => match &outcome.status {
            Some(status) => line.push_str(&format!(
                "battery {}%, {} logs, {} reboots",
                status.battery_percent, status.total_logs, status.reboot_count
            )),
            None => line.push_str("done"),
        },
    }
    if outcome.watchdog_restarts > 0 {
        line.push_str(&format!(", {} watchdog restarts", outcome.watchdog_restarts));
    }
    line
}

pub fn device_table(devices: &[ScannedDevice]) -> String {
    let mut out = format!("{:<20} {:<18} {:>5}\n", "NAME", "ADDRESS", "RSSI");
    for device in devices {
        out.push_str(&format!(
            "{:<20} {:<18} {:>5}\n",
            device.name,
            device.address.to_string(),
            device.signal_strength
        ));
    }
    out
}

/// Print events until every sender is gone
pub fn spawn_reporter(mut events: mpsc::UnboundedReceiver<FleetEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut in_progress = false;
        while let Some(event) = events.recv().await {
            match event {
                FleetEvent::Progress {
                    mac,
                    received,
                    expected,
                } => {
                    print!("\r{}: downloaded {} logs out of {} ", mac, received, expected);
                    let _ = std::io::stdout().flush();
                    in_progress = true;
                }
                FleetEvent::StatusRead(mac, status, period) => {
                    info!(
                        mac = %mac,
                        "{} logs, battery {}%, sample period {} ms",
                        status.total_logs, status.battery_percent, period
                    );
                }
                FleetEvent::BatteryLow(mac, level) => {
                    warn!(mac = %mac, "Battery at {}%, charge soon", level);
                }
                FleetEvent::SessionStarted { mac, live } => {
                    debug!(mac = %mac, "session started ({} live)", live);
                }
                FleetEvent::SessionFinished { outcome, live } => {
                    if in_progress {
                        println!();
                        in_progress = false;
                    }
                    println!("{}", outcome_line(&outcome));
                    debug!(mac = %outcome.mac, "session finished ({} live)", live);
                }
                FleetEvent::Rescheduled(entry) => {
                    debug!(
                        mac = %entry.mac,
                        "requeued with key {} after {} retries",
                        entry.priority, entry.retry_count
                    );
                }
                FleetEvent::StateChanged(..) => {}
            }
        }
        if in_progress {
            println!();
        }
    })
}
