//! Device Session
//!
//! Per-device protocol state machine:
//!
//! ```text
//! Idle → Connected → StatusKnown → Broadcasting ⇄ Watchdog → Draining → Closed
//! ```
//!
//! Every exit path, including radio failures and cancellation, ends in
//! `Closed` with the link released. Errors never leave [`DeviceSession::run`];
//! they are folded into the returned [`SessionOutcome`].

use crate::domain::accumulator::{self, DownloadProgress, NotificationAccumulator};
use crate::domain::checkpoint::epoch_now;
use crate::domain::codec::LogCodec;
use crate::domain::download::{download_path, open_download_file};
use crate::domain::models::{
    CheckpointDecision, Command, DeviceConfig, DeviceStatus, DownloadEnd, FleetEvent, MacAddress,
    SessionOutcome, SessionState,
};
use crate::infrastructure::bluetooth::backend::{RadioBackend, RadioError};
use crate::infrastructure::bluetooth::channel::BackendChannel;
use crate::infrastructure::bluetooth::protocol::{DeviceCommand, DeviceSettings};
use chrono::Local;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time without any wake before a download is considered stalled
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(30);

/// Default wait for trailing notifications after a completed download
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error("failed to write download file {}: {source}", path.display())]
    Output { path: PathBuf, source: io::Error },

    #[error("session step out of order: {0}")]
    State(&'static str),

    #[error("notification pump failed: {0}")]
    Pump(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub watchdog: Duration,
    pub drain_grace: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            watchdog: DEFAULT_WATCHDOG,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Per-run options shared by every session of a command
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub command: Command,
    /// Request uncompressed records
    pub raw: bool,
    /// Downloads only start when the device holds at least this many logs
    pub min_logs: u32,
    /// Path prefix of download files
    pub file_prefix: PathBuf,
    pub battery_warning: Option<u8>,
    pub timings: SessionTimings,
}

impl SessionOptions {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            raw: false,
            min_logs: 1,
            file_prefix: PathBuf::from("./WED_data"),
            battery_warning: None,
            timings: SessionTimings::default(),
        }
    }
}

/// Collaborators injected into every session
pub struct SessionContext<B: RadioBackend> {
    pub channel: BackendChannel<B>,
    pub settings: Arc<DeviceSettings>,
    pub codec: Arc<dyn LogCodec>,
    pub options: Arc<SessionOptions>,
    pub events: Option<mpsc::UnboundedSender<FleetEvent>>,
}

impl<B: RadioBackend> Clone for SessionContext<B> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            settings: Arc::clone(&self.settings),
            codec: Arc::clone(&self.codec),
            options: Arc::clone(&self.options),
            events: self.events.clone(),
        }
    }
}

pub struct DeviceSession<B: RadioBackend> {
    mac: MacAddress,
    ctx: SessionContext<B>,
    cancel: CancellationToken,
    state: SessionState,
    link: Option<B::Link>,
    notifications: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    status: Option<DeviceStatus>,
    config: Option<DeviceConfig>,
}

enum Wake {
    Signal,
    Stalled,
    Cancelled,
}

impl<B: RadioBackend> DeviceSession<B> {
    pub fn new(mac: MacAddress, ctx: SessionContext<B>, cancel: CancellationToken) -> Self {
        Self {
            mac,
            ctx,
            cancel,
            state: SessionState::Idle,
            link: None,
            notifications: None,
            status: None,
            config: None,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(mac = %self.mac, "{:?} -> {:?}", self.state, state);
            self.state = state;
            self.publish(FleetEvent::StateChanged(self.mac, state));
        }
    }

    fn publish(&self, event: FleetEvent) {
        if let Some(events) = &self.ctx.events {
            let _ = events.send(event);
        }
    }

    /// Run the configured command to completion
    pub async fn run(mut self) -> SessionOutcome {
        let mut outcome = SessionOutcome::new(self.mac);
        if let Err(e) = self.drive(&mut outcome).await {
            if matches!(&e, SessionError::Radio(r) if r.is_protocol()) {
                error!(mac = %self.mac, "Protocol error: {}", e);
            } else {
                error!(mac = %self.mac, "Session failed: {}", e);
            }
            outcome.error = Some(e.to_string());
        }
        self.close().await;
        outcome.status = self.status.clone();
        outcome.final_state = self.state;
        outcome
    }

    async fn drive(&mut self, outcome: &mut SessionOutcome) -> Result<(), SessionError> {
        self.connect().await?;
        self.read_status().await?;

        match self.ctx.options.command {
            Command::Status => Ok(()),
            Command::Blink => self.blink().await,
            Command::Download => {
                let total = self.status.as_ref().map_or(0, |s| s.total_logs);
                let min_logs = self.ctx.options.min_logs;
                if total < min_logs {
                    info!(
                        mac = %self.mac,
                        "No logs to download ({} available, {} required)", total, min_logs
                    );
                    outcome.checkpoint = CheckpointDecision::Set(epoch_now());
                    return Ok(());
                }
                if self.cancel.is_cancelled() {
                    info!(mac = %self.mac, "Cancelled before download");
                    outcome.download = Some(DownloadEnd::Cancelled);
                    return Ok(());
                }
                self.download(outcome).await
            }
        }
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
        info!(mac = %self.mac, "Connecting to MAC address {} .......", self.mac);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = self.ctx.channel.connect(self.mac, tx).await?;
        self.link = Some(link);
        self.notifications = Some(rx);
        info!(mac = %self.mac, "Connected to {}!", self.mac);
        self.set_state(SessionState::Connected);
        Ok(())
    }

    async fn read_register(&mut self, handle: u16) -> Result<Vec<u8>, SessionError> {
        let link = self
            .link
            .as_mut()
            .ok_or(SessionError::State("register read before connect"))?;
        Ok(self.ctx.channel.read(link, handle).await?)
    }

    async fn write_command(&mut self, command: DeviceCommand) -> Result<(), SessionError> {
        let link = self
            .link
            .as_mut()
            .ok_or(SessionError::State("command before connect"))?;
        let handle = self.ctx.settings.config_handle;
        Ok(self
            .ctx
            .channel
            .write(link, handle, &command.encode())
            .await?)
    }

    /// Read and decode the status and config registers
    pub async fn read_status(&mut self) -> Result<(), SessionError> {
        let settings = Arc::clone(&self.ctx.settings);
        let raw_status = self.read_register(settings.status_handle).await?;
        let raw_config = self.read_register(settings.config_handle).await?;
        let status = settings.decode_status(&raw_status)?;
        let config = settings.decode_config(&raw_config)?;

        let mode = status.mode();
        let period = settings.sample_period_ms(&config, mode);
        info!(
            mac = %self.mac,
            "Battery {}%, {} logs, {} ({} ms), {} reboots",
            status.battery_percent,
            status.total_logs,
            settings.mode_name(mode),
            period,
            status.reboot_count
        );
        if let Some(threshold) = self.ctx.options.battery_warning {
            if status.battery_percent < threshold {
                warn!(mac = %self.mac, "Battery low: {}%", status.battery_percent);
                self.publish(FleetEvent::BatteryLow(self.mac, status.battery_percent));
            }
        }

        self.publish(FleetEvent::StatusRead(self.mac, status.clone(), period));
        self.status = Some(status);
        self.config = Some(config);
        self.set_state(SessionState::StatusKnown);
        Ok(())
    }

    pub async fn blink(&mut self) -> Result<(), SessionError> {
        info!(mac = %self.mac, "Blinking");
        self.write_command(DeviceCommand::Blink).await
    }

    fn sample_period_ms(&self) -> u32 {
        match (&self.status, &self.config) {
            (Some(status), Some(config)) => {
                self.ctx.settings.sample_period_ms(config, status.mode())
            }
            _ => 0,
        }
    }

    async fn download(&mut self, outcome: &mut SessionOutcome) -> Result<(), SessionError> {
        let options = Arc::clone(&self.ctx.options);
        let total = self.status.as_ref().map_or(0, |s| s.total_logs) as u64;
        let period = self.sample_period_ms();
        let start = Local::now();

        let path = download_path(&options.file_prefix, start, self.mac);
        info!(mac = %self.mac, "Writing data to file: {}", path.display());
        let file = open_download_file(&path, options.raw, start, period).map_err(|source| {
            SessionError::Output {
                path: path.clone(),
                source,
            }
        })?;

        let rx = self
            .notifications
            .take()
            .ok_or(SessionError::State("download without notification stream"))?;
        let acc = NotificationAccumulator::new(
            Arc::clone(&self.ctx.codec),
            self.ctx.settings.notification_header_len,
            total,
            file,
        );
        let progress = acc.progress();
        let pump_stop = CancellationToken::new();
        let pump = accumulator::spawn_pump(acc, rx, pump_stop.clone());

        let end = match self
            .write_command(DeviceCommand::StartBroadcast { raw: options.raw })
            .await
        {
            Ok(()) => {
                self.set_state(SessionState::Broadcasting);
                self.watch(&progress, total, outcome).await
            }
            Err(e) => {
                error!(mac = %self.mac, "Failed to start broadcast: {}", e);
                DownloadEnd::Failed
            }
        };

        match end {
            DownloadEnd::Completed => info!(mac = %self.mac, "Download Complete"),
            DownloadEnd::Cancelled => info!(mac = %self.mac, "Download Interrupted"),
            DownloadEnd::Failed => warn!(mac = %self.mac, "Download Aborted"),
        }

        self.set_state(SessionState::Draining);
        info!(mac = %self.mac, "Stopping device from broadcasting ....");
        if let Err(e) = self.write_command(DeviceCommand::StopBroadcast).await {
            warn!(mac = %self.mac, "Failed to stop broadcast: {}", e);
        }
        if end == DownloadEnd::Completed {
            debug!(mac = %self.mac, "Waiting for all notifications to get handled ....");
            tokio::time::sleep(options.timings.drain_grace).await;
        }

        pump_stop.cancel();
        let acc = pump
            .await
            .map_err(|e| SessionError::Pump(e.to_string()))?;
        let received = acc.received();
        outcome.records_received = received;
        outcome.records_expected = total;
        outcome.download = Some(end);

        debug!(mac = %self.mac, "Closing File ....");
        if let Err(source) = acc.finish() {
            // Nothing is safely captured if the file is incomplete
            return Err(SessionError::Output { path, source });
        }

        outcome.checkpoint =
            download_checkpoint(end, received, total, start.timestamp(), period);
        Ok(())
    }

    /// Wait on the wake signal until completion, cancellation or failure,
    /// restarting the broadcast whenever a wait times out
    async fn watch(
        &mut self,
        progress: &DownloadProgress,
        total: u64,
        outcome: &mut SessionOutcome,
    ) -> DownloadEnd {
        let watchdog = self.ctx.options.timings.watchdog;
        let cancel = self.cancel.clone();

        loop {
            if progress.is_done() {
                return DownloadEnd::Completed;
            }

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                res = tokio::time::timeout(watchdog, progress.notified()) => match res {
                    Ok(()) => Wake::Signal,
                    Err(_) => Wake::Stalled,
                },
            };

            match wake {
                Wake::Cancelled => return DownloadEnd::Cancelled,
                Wake::Signal => {
                    let received = progress.received();
                    debug!(mac = %self.mac, "Downloaded {} logs out of {}", received, total);
                    self.publish(FleetEvent::Progress {
                        mac: self.mac,
                        received,
                        expected: total,
                    });
                }
                Wake::Stalled => {
                    self.set_state(SessionState::Watchdog);
                    outcome.watchdog_restarts += 1;
                    warn!(
                        mac = %self.mac,
                        "No notification for {:?} at {} of {} logs, restarting broadcast",
                        watchdog,
                        progress.received(),
                        total
                    );
                    if let Err(e) = self.restart_broadcast().await {
                        error!(mac = %self.mac, "Watchdog restart failed: {}", e);
                        return DownloadEnd::Failed;
                    }
                    self.set_state(SessionState::Broadcasting);
                }
            }
        }
    }

    async fn restart_broadcast(&mut self) -> Result<(), SessionError> {
        self.write_command(DeviceCommand::StopBroadcast).await?;
        let config_handle = self.ctx.settings.config_handle;
        let _ = self.read_register(config_handle).await?;
        let raw = self.ctx.options.raw;
        self.write_command(DeviceCommand::StartBroadcast { raw })
            .await
    }

    /// Release the link; always ends in `Closed`
    async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            debug!(mac = %self.mac, "Disconnecting ....");
            match self.ctx.channel.disconnect(&mut link).await {
                Ok(()) => info!(mac = %self.mac, "Disconnected from {}!", self.mac),
                Err(e) => warn!(mac = %self.mac, "Disconnect failed: {}", e),
            }
        }
        self.notifications = None;
        self.set_state(SessionState::Closed);
    }
}

/// Checkpoint after a download attempt.
///
/// A completed download confirms everything up to the attempt start. An
/// interrupted one rolls the start back by the time the missing records
/// would span, so the next attempt re-covers only the missed tail.
pub fn download_checkpoint(
    end: DownloadEnd,
    received: u64,
    expected: u64,
    start_epoch: i64,
    sample_period_ms: u32,
) -> CheckpointDecision {
    if received == 0 {
        return CheckpointDecision::Unchanged;
    }
    match end {
        DownloadEnd::Completed => CheckpointDecision::Set(start_epoch),
        DownloadEnd::Cancelled | DownloadEnd::Failed => {
            let missing = expected.saturating_sub(received);
            let rollback = missing.saturating_mul(sample_period_ms as u64) / 1000;
            CheckpointDecision::Set(start_epoch.saturating_sub(rollback as i64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::channel::DEFAULT_RADIO_TIMEOUT;
    use crate::infrastructure::bluetooth::simulator::{RadioOp, SimulatedBackend, SimulatedDevice};
    use crate::infrastructure::codec::WedCodec;
    use std::fs::{self, File};
    use std::io::Read;
    use std::path::Path;

    fn mac() -> MacAddress {
        MacAddress::new([0xC4, 0xBE, 0x84, 0x70, 0x2B, 0x01])
    }

    fn context(
        backend: &SimulatedBackend,
        options: SessionOptions,
    ) -> SessionContext<SimulatedBackend> {
        SessionContext {
            channel: BackendChannel::new(backend.clone(), DEFAULT_RADIO_TIMEOUT),
            settings: Arc::new(DeviceSettings::wed()),
            codec: Arc::new(WedCodec::new()),
            options: Arc::new(options),
            events: None,
        }
    }

    fn download_options(dir: &Path, min_logs: u32) -> SessionOptions {
        SessionOptions {
            min_logs,
            file_prefix: dir.join("WED_data"),
            timings: SessionTimings {
                watchdog: Duration::from_secs(30),
                drain_grace: Duration::from_millis(10),
            },
            ..SessionOptions::new(Command::Download)
        }
    }

    fn read_file(dir: &Path) -> Vec<u8> {
        let entry = fs::read_dir(dir).unwrap().next().unwrap().unwrap();
        let mut bytes = Vec::new();
        File::open(entry.path())
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_download_completes_with_checkpoint_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(1500);
        device.records_per_notification = 20;
        backend.add_device(mac(), device);

        let before = epoch_now();
        let session = DeviceSession::new(
            mac(),
            context(&backend, download_options(dir.path(), 1000)),
            CancellationToken::new(),
        );
        let outcome = session.run().await;
        let after = epoch_now();

        assert_eq!(outcome.final_state, SessionState::Closed);
        assert_eq!(outcome.download, Some(DownloadEnd::Completed));
        assert!(outcome.records_received > 1500);
        match outcome.checkpoint {
            CheckpointDecision::Set(t) => assert!(before <= t && t <= after),
            other => panic!("unexpected checkpoint {other:?}"),
        }

        let bytes = read_file(dir.path());
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.splitn(4, '\n').collect();
        assert_eq!(lines[0], "compressed");
        assert!(lines[1].starts_with("start_time: "));
        assert_eq!(lines[2], "sample_period: 50");

        assert_eq!(backend.last_verbosity(mac()), Some(3));
        let writes = backend.writes_to(mac());
        assert_eq!(writes.first(), Some(&vec![6, 3]));
        assert_eq!(writes.last(), Some(&vec![6, 0]));
        assert!(matches!(backend.ops().last(), Some(RadioOp::Disconnect(_))));
    }

    #[tokio::test]
    async fn test_insufficient_logs_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        backend.add_device(mac(), SimulatedDevice::with_logs(500));

        let before = epoch_now();
        let outcome = DeviceSession::new(
            mac(),
            context(&backend, download_options(dir.path(), 1000)),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(outcome.final_state, SessionState::Closed);
        assert_eq!(outcome.download, None);
        assert!(matches!(outcome.checkpoint, CheckpointDecision::Set(t) if t >= before));
        assert_eq!(backend.broadcast_count(mac()), 0);
        assert!(backend.writes_to(mac()).is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_checkpoint_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(1500);
        device.refuse_connection = true;
        backend.add_device(mac(), device);

        let outcome = DeviceSession::new(
            mac(),
            context(&backend, download_options(dir.path(), 1)),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(outcome.final_state, SessionState::Closed);
        assert_eq!(outcome.checkpoint, CheckpointDecision::Unchanged);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_malformed_status_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(1500);
        device.short_status = true;
        backend.add_device(mac(), device);

        let outcome = DeviceSession::new(
            mac(),
            context(&backend, download_options(dir.path(), 1)),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(outcome.checkpoint, CheckpointDecision::Unchanged);
        assert!(outcome.error.unwrap().contains("status register"));
        // the link is still released
        assert!(matches!(backend.ops().last(), Some(RadioOp::Disconnect(_))));
        assert_eq!(backend.broadcast_count(mac()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_restarts_once_per_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(1500);
        device.mute = true;
        backend.add_device(mac(), device);

        let cancel = CancellationToken::new();
        let session = DeviceSession::new(
            mac(),
            context(&backend, download_options(dir.path(), 1)),
            cancel.clone(),
        );
        let handle = tokio::spawn(session.run());
        // two full watchdog periods, then stop halfway through the third
        tokio::time::sleep(Duration::from_secs(75)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.watchdog_restarts, 2);
        assert_eq!(outcome.download, Some(DownloadEnd::Cancelled));
        assert_eq!(outcome.checkpoint, CheckpointDecision::Unchanged);

        let writes = backend.writes_to(mac());
        assert_eq!(
            writes,
            vec![
                vec![6, 3],
                vec![6, 0],
                vec![6, 3],
                vec![6, 0],
                vec![6, 3],
                vec![6, 0],
            ]
        );
        // each cycle re-reads the config register between stop and start
        let config_reads = backend
            .ops()
            .iter()
            .filter(|op| matches!(op, RadioOp::Read(_, 0x0027)))
            .count();
        assert_eq!(config_reads, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_download_recovers_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(200);
        device.stall_after = Some(40);
        backend.add_device(mac(), device);

        let outcome = DeviceSession::new(
            mac(),
            context(&backend, download_options(dir.path(), 1)),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(outcome.watchdog_restarts, 1);
        assert_eq!(outcome.download, Some(DownloadEnd::Completed));
        assert!(outcome.records_received > 200);
        assert_eq!(backend.broadcast_count(mac()), 2);
    }

    #[tokio::test]
    async fn test_blink_writes_fixed_pattern() {
        let backend = SimulatedBackend::new();
        backend.add_device(mac(), SimulatedDevice::with_logs(0));
        let outcome = DeviceSession::new(
            mac(),
            context(&backend, SessionOptions::new(Command::Blink)),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert!(outcome.succeeded());
        assert_eq!(backend.writes_to(mac()), vec![vec![5, 4, 6, 1, 5]]);
        assert_eq!(backend.blink_count(mac()), 1);
        assert_eq!(outcome.checkpoint, CheckpointDecision::Unchanged);
    }

    #[tokio::test]
    async fn test_status_only_reads() {
        let backend = SimulatedBackend::new();
        backend.add_device(mac(), SimulatedDevice::with_logs(42));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctx = context(
            &backend,
            SessionOptions {
                battery_warning: Some(90),
                ..SessionOptions::new(Command::Status)
            },
        );
        ctx.events = Some(tx);

        let outcome = DeviceSession::new(mac(), ctx, CancellationToken::new())
            .run()
            .await;
        assert_eq!(outcome.status.unwrap().total_logs, 42);
        assert!(backend.writes_to(mac()).is_empty());

        let mut battery_low = false;
        while let Ok(event) = rx.try_recv() {
            if let FleetEvent::BatteryLow(_, 80) = event {
                battery_low = true;
            }
        }
        assert!(battery_low);
    }

    #[test]
    fn test_partial_checkpoint_rolls_back_missing_tail() {
        // 1000 missing records at 50 ms span 50 s
        let decision = download_checkpoint(DownloadEnd::Cancelled, 500, 1500, 10_000, 50);
        match decision {
            CheckpointDecision::Set(t) => assert!((t - 9_950).abs() <= 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            download_checkpoint(DownloadEnd::Completed, 1501, 1500, 10_000, 50),
            CheckpointDecision::Set(10_000)
        );
        assert_eq!(
            download_checkpoint(DownloadEnd::Cancelled, 0, 1500, 10_000, 50),
            CheckpointDecision::Unchanged
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_download_leaves_device_alone() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        backend.add_device(mac(), SimulatedDevice::with_logs(1500));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = DeviceSession::new(
            mac(),
            context(&backend, download_options(dir.path(), 1)),
            cancel,
        )
        .run()
        .await;

        assert_eq!(outcome.final_state, SessionState::Closed);
        assert_eq!(outcome.download, Some(DownloadEnd::Cancelled));
        assert_eq!(outcome.checkpoint, CheckpointDecision::Unchanged);
        assert!(backend.writes_to(mac()).is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(matches!(backend.ops().last(), Some(RadioOp::Disconnect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_download_rolls_checkpoint_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(1500);
        device.records_per_notification = 20;
        device.stall_after = Some(500);
        backend.add_device(mac(), device);

        let cancel = CancellationToken::new();
        let before = epoch_now();
        let handle = tokio::spawn(
            DeviceSession::new(
                mac(),
                context(&backend, download_options(dir.path(), 1)),
                cancel.clone(),
            )
            .run(),
        );
        // stop while the stream is stalled, before the watchdog fires
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();
        let after = epoch_now();

        assert_eq!(outcome.download, Some(DownloadEnd::Cancelled));
        assert_eq!(outcome.watchdog_restarts, 0);
        assert_eq!(outcome.records_received, 500);
        assert_eq!(outcome.records_expected, 1500);
        // 1000 missing records at 50 ms roll the start back 50 s
        match outcome.checkpoint {
            CheckpointDecision::Set(t) => {
                assert!(before - 50 <= t && t <= after - 50, "{t} not in {before}..{after}")
            }
            other => panic!("unexpected checkpoint {other:?}"),
        }
        assert_eq!(backend.writes_to(mac()).last(), Some(&vec![6, 0]));
    }
}
