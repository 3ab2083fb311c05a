use crate::domain::checkpoint::CheckpointStore;
use crate::domain::codec::LogCodec;
use crate::domain::download::{self, DownloadFile};
use crate::domain::models::{FleetEvent, MacAddress, SessionOutcome};
use crate::domain::scheduler::{FleetScheduler, FleetSummary};
use crate::domain::session::{DeviceSession, SessionContext, SessionOptions};
use crate::domain::settings::FleetConfig;
use crate::infrastructure::bluetooth::backend::RadioBackend;
use crate::infrastructure::bluetooth::channel::BackendChannel;
use crate::infrastructure::bluetooth::protocol::DeviceSettings;
use crate::infrastructure::bluetooth::simulator::{SimulatedBackend, SimulatedDevice};
use crate::infrastructure::codec::WedCodec;
use crate::presentation::report;
use anyhow::Context;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Logs held by every simulated device
const SIMULATED_LOGS: u32 = 1500;

/// Simulated devices answering `list` when none were named
const SIMULATED_DEFAULT_FLEET: [[u8; 6]; 3] = [
    [0xC4, 0xBE, 0x84, 0x70, 0x2B, 0x01],
    [0xC4, 0xBE, 0x84, 0x70, 0x2B, 0x02],
    [0xC4, 0xBE, 0x84, 0x70, 0x2B, 0x03],
];

/// In-memory backend populated with `devices`, or a small default fleet
pub fn simulated_fleet(devices: &[MacAddress]) -> SimulatedBackend {
    let backend = SimulatedBackend::new();
    let defaults: Vec<MacAddress> = SIMULATED_DEFAULT_FLEET
        .iter()
        .map(|o| MacAddress::new(*o))
        .collect();
    let devices = if devices.is_empty() { &defaults[..] } else { devices };
    for (i, mac) in devices.iter().enumerate() {
        let mut device = SimulatedDevice::with_logs(SIMULATED_LOGS);
        device.name = format!("WED-{}", i + 1);
        device.records_per_notification = 20;
        backend.add_device(*mac, device);
    }
    backend
}

/// Print the header and record counts of a download file
pub fn inspect(path: &Path) -> anyhow::Result<()> {
    let file = DownloadFile::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let samples = file
        .samples(&WedCodec::new())
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    let summary = download::summarize(&file, &samples);

    println!("format:        {}", if file.raw { "raw" } else { "compressed" });
    println!("start_time:    {}", file.start_time);
    println!("sample_period: {} ms", file.sample_period_ms);
    println!("first sample:  {}", summary.first_sample);
    for (name, count) in &summary.counts {
        println!("{:<14} {}", format!("{}:", name), count);
    }
    Ok(())
}

/// Command runner over one radio backend
pub struct App<B: RadioBackend> {
    channel: BackendChannel<B>,
    codec: Arc<dyn LogCodec>,
}

impl<B: RadioBackend> App<B> {
    pub fn new(backend: B, radio_timeout: Duration) -> Self {
        Self {
            channel: BackendChannel::new(backend, radio_timeout),
            codec: Arc::new(WedCodec::new()),
        }
    }

    fn context(
        &self,
        settings: DeviceSettings,
        options: SessionOptions,
        events: mpsc::UnboundedSender<FleetEvent>,
    ) -> SessionContext<B> {
        SessionContext {
            channel: self.channel.clone(),
            settings: Arc::new(settings),
            codec: Arc::clone(&self.codec),
            options: Arc::new(options),
            events: Some(events),
        }
    }

    pub async fn list(&self, duration: Duration) -> anyhow::Result<()> {
        info!("Scanning for {:?}", duration);
        let devices = self
            .channel
            .discover(duration)
            .await
            .context("Device discovery failed")?;
        if devices.is_empty() {
            println!("No devices found");
        } else {
            print!("{}", report::device_table(&devices));
        }
        Ok(())
    }

    /// Run one session per device, all at once, and wait for them
    pub async fn run_sessions(
        &self,
        devices: &[MacAddress],
        options: SessionOptions,
        cancel: CancellationToken,
    ) -> Vec<SessionOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = report::spawn_reporter(rx);
        let ctx = self.context(DeviceSettings::wed(), options, tx.clone());

        let mut seen = HashSet::new();
        let mut sessions = JoinSet::new();
        for mac in devices {
            if !seen.insert(*mac) {
                warn!(mac = %mac, "Device listed twice, scheduling it once");
                continue;
            }
            let session = DeviceSession::new(*mac, ctx.clone(), cancel.clone());
            sessions.spawn(session.run());
        }
        drop(ctx);

        let mut outcomes = Vec::with_capacity(seen.len());
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok(outcome) => {
                    let _ = tx.send(FleetEvent::SessionFinished {
                        outcome: outcome.clone(),
                        live: sessions.len(),
                    });
                    outcomes.push(outcome);
                }
                Err(e) => warn!("Session task failed: {}", e),
            }
        }
        drop(tx);
        let _ = reporter.await;
        outcomes
    }

    pub async fn start(
        &self,
        config: &FleetConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<FleetSummary> {
        let checkpoint_path = config.checkpoint_path();
        let store = CheckpointStore::open(&checkpoint_path)
            .with_context(|| format!("Failed to open {}", checkpoint_path.display()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = report::spawn_reporter(rx);
        let ctx = self.context(
            DeviceSettings::for_type(config.device_type),
            config.session_options(),
            tx,
        );

        let scheduler =
            FleetScheduler::new(&config.devices, ctx, store.clone(), config.scheduler_config());
        let summary = scheduler.run(cancel).await;
        let _ = reporter.await;

        store
            .persist()
            .with_context(|| format!("Failed to save {}", checkpoint_path.display()))?;
        Ok(summary)
    }
}
