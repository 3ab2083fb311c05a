//! Fleet Scheduler
//!
//! Keeps every configured device in exactly one place: queued in the
//! [`RetryQueue`] or in flight as a live session. The queue orders entries by
//! checkpoint age (oldest first, FIFO on ties); the scheduler launches up to
//! `max_concurrency` sessions and reinserts each device when its session
//! exits, escalating devices whose checkpoint keeps failing to advance.

use crate::domain::checkpoint::{epoch_now, CheckpointStore};
use crate::domain::models::{FleetEvent, MacAddress, ScheduleEntry, SessionOutcome};
use crate::domain::session::{DeviceSession, SessionContext};
use crate::infrastructure::bluetooth::backend::RadioBackend;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Key of an entry forced to the front of the queue
pub const MOST_OVERDUE: i64 = i64::MIN;

/// Unchanged exits tolerated before an entry is forced to the front
pub const MAX_STALLED_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    /// First retry delay; doubles with every further unchanged exit.
    /// Zero keeps failing devices eligible straight away.
    pub backoff_base: Duration,
    /// Delay before revisiting a device whose checkpoint just advanced
    pub revisit: Duration,
    /// Shutdown wait per live session before force-termination
    pub shutdown_grace: Duration,
    /// Stop after this many sessions have been launched
    pub max_rounds: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            backoff_base: Duration::ZERO,
            revisit: Duration::ZERO,
            shutdown_grace: Duration::from_secs(5),
            max_rounds: None,
        }
    }
}

#[derive(Debug)]
struct Queued {
    seq: u64,
    entry: ScheduleEntry,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap is a max-heap: smallest key, then earliest insertion, wins
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .priority
            .cmp(&self.entry.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-priority queue of schedule entries with FIFO tie-breaking
#[derive(Debug, Default)]
pub struct RetryQueue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ScheduleEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued { seq, entry });
    }

    /// Best entry that is eligible at `now`
    pub fn pop_ready(&mut self, now: i64) -> Option<ScheduleEntry> {
        let mut deferred = Vec::new();
        let mut found = None;
        while let Some(queued) = self.heap.pop() {
            if queued.entry.not_before <= now {
                found = Some(queued.entry);
                break;
            }
            deferred.push(queued);
        }
        // original sequence numbers keep the FIFO order intact
        self.heap.extend(deferred);
        found
    }

    /// Earliest `not_before` among queued entries
    pub fn next_ready_at(&self) -> Option<i64> {
        self.heap.iter().map(|q| q.entry.not_before).min()
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.heap.iter().any(|q| q.entry.mac == *mac)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Update an entry after its session exits.
///
/// `before` and `after` are the stored checkpoints around the session.
pub fn reschedule(
    entry: &mut ScheduleEntry,
    before: i64,
    after: i64,
    now: i64,
    config: &SchedulerConfig,
) {
    if after != before {
        entry.retry_count = 0;
        entry.priority = after;
        entry.not_before = now.saturating_add(config.revisit.as_secs() as i64);
        return;
    }

    entry.retry_count += 1;
    if entry.retry_count > MAX_STALLED_RETRIES {
        entry.priority = MOST_OVERDUE;
        entry.retry_count = 0;
        entry.not_before = now;
    } else {
        let factor = 1u64 << (entry.retry_count - 1);
        let delay = config.backoff_base.as_secs().saturating_mul(factor);
        entry.not_before = now.saturating_add(delay as i64);
    }
}

/// Totals of a scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetSummary {
    pub sessions: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

type SessionExit = (ScheduleEntry, i64, Result<SessionOutcome, JoinError>);

pub struct FleetScheduler<B: RadioBackend> {
    ctx: SessionContext<B>,
    store: CheckpointStore,
    config: SchedulerConfig,
    queue: RetryQueue,
    in_flight: HashMap<MacAddress, ScheduleEntry>,
    summary: FleetSummary,
}

impl<B: RadioBackend> FleetScheduler<B> {
    /// One entry per distinct device, keyed by its stored checkpoint
    pub fn new(
        devices: &[MacAddress],
        ctx: SessionContext<B>,
        store: CheckpointStore,
        config: SchedulerConfig,
    ) -> Self {
        let mut queue = RetryQueue::new();
        for mac in devices {
            if queue.contains(mac) {
                warn!(mac = %mac, "Device listed twice, scheduling it once");
                continue;
            }
            queue.push(ScheduleEntry::new(*mac, store.get_or_default(mac)));
        }
        Self {
            ctx,
            store,
            config,
            queue,
            in_flight: HashMap::new(),
            summary: FleetSummary::default(),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn publish(&self, event: FleetEvent) {
        if let Some(events) = &self.ctx.events {
            let _ = events.send(event);
        }
    }

    fn rounds_left(&self) -> bool {
        self.config
            .max_rounds
            .map_or(true, |max| self.summary.sessions < max)
    }

    /// Run sessions until `cancel` fires or `max_rounds` is reached
    pub async fn run(mut self, cancel: CancellationToken) -> FleetSummary {
        let session_cancel = cancel.child_token();
        let mut live: JoinSet<SessionExit> = JoinSet::new();
        let max_live = self.config.max_concurrency.max(1);
        info!(
            "Scheduling {} devices, {} at a time",
            self.queue.len(),
            max_live
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            while live.len() < max_live && self.rounds_left() {
                match self.queue.pop_ready(epoch_now()) {
                    Some(entry) => self.launch(entry, &mut live, &session_cancel),
                    None => break,
                }
            }

            if live.is_empty() && (!self.rounds_left() || self.queue.is_empty()) {
                break;
            }

            // Sleep until the next deferred entry only while a slot is free
            let idle_wait = match self.queue.next_ready_at() {
                Some(at) if live.len() < max_live && self.rounds_left() => {
                    let secs = at.saturating_sub(epoch_now()).max(1) as u64;
                    Some(Duration::from_secs(secs))
                }
                _ => None,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(exit) = live.join_next(), if !live.is_empty() => {
                    self.handle_exit(exit, live.len(), true);
                }
                _ = tokio::time::sleep(idle_wait.unwrap_or_default()), if idle_wait.is_some() => {}
            }
        }

        self.shutdown(&mut live, &session_cancel).await;
        info!(
            "Fleet run finished: {} sessions, {} succeeded, {} failed",
            self.summary.sessions, self.summary.succeeded, self.summary.failed
        );
        self.summary
    }

    fn launch(
        &mut self,
        entry: ScheduleEntry,
        live: &mut JoinSet<SessionExit>,
        cancel: &CancellationToken,
    ) {
        let mac = entry.mac;
        if self.in_flight.contains_key(&mac) {
            // a device never has two live sessions
            error!(mac = %mac, "Device already in flight, dropping duplicate entry");
            return;
        }

        let before = self.store.get_or_default(&mac);
        let session = DeviceSession::new(mac, self.ctx.clone(), cancel.clone());
        self.in_flight.insert(mac, entry.clone());
        self.summary.sessions += 1;

        live.spawn(async move {
            let mut task = AbortOnDrop(tokio::spawn(session.run()));
            let result = (&mut task.0).await;
            (entry, before, result)
        });
        debug!(mac = %mac, "Session launched, {} live", live.len());
        self.publish(FleetEvent::SessionStarted {
            mac,
            live: live.len(),
        });
    }

    fn handle_exit(
        &mut self,
        exit: Result<SessionExit, JoinError>,
        live: usize,
        requeue: bool,
    ) {
        let (mut entry, before, result) = match exit {
            Ok(exit) => exit,
            Err(e) => {
                // only happens when the wrapper itself was aborted
                debug!("Session wrapper ended: {}", e);
                return;
            }
        };
        let mac = entry.mac;
        self.in_flight.remove(&mac);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(mac = %mac, "Session task died: {}", e);
                let mut outcome = SessionOutcome::new(mac);
                outcome.error = Some(e.to_string());
                outcome
            }
        };

        if outcome.succeeded() {
            self.summary.succeeded += 1;
        } else {
            self.summary.failed += 1;
        }

        if self.store.record(mac, outcome.checkpoint) {
            if let Err(e) = self.store.persist() {
                warn!("Failed to persist checkpoints: {}", e);
            }
        }
        let after = self.store.get_or_default(&mac);

        self.publish(FleetEvent::SessionFinished { outcome, live });
        if !requeue {
            return;
        }

        if after == before && entry.retry_count == MAX_STALLED_RETRIES {
            warn!(
                mac = %mac,
                "No progress after {} attempts, forcing to front",
                MAX_STALLED_RETRIES + 1
            );
        }
        reschedule(&mut entry, before, after, epoch_now(), &self.config);
        self.publish(FleetEvent::Rescheduled(entry.clone()));
        self.queue.push(entry);
    }

    async fn shutdown(&mut self, live: &mut JoinSet<SessionExit>, cancel: &CancellationToken) {
        cancel.cancel();
        if live.is_empty() {
            return;
        }

        let grace = self.config.shutdown_grace * live.len() as u32;
        info!(
            "Waiting up to {:?} for {} live sessions to stop",
            grace,
            live.len()
        );
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                exit = live.join_next() => match exit {
                    Some(exit) => {
                        let remaining = live.len();
                        self.handle_exit(exit, remaining, false);
                    }
                    None => break,
                },
            }
        }

        if !live.is_empty() {
            warn!("Force terminating {} sessions", live.len());
            live.shutdown().await;
            for (mac, _) in self.in_flight.drain() {
                warn!(mac = %mac, "Session terminated without a checkpoint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Command;
    use crate::domain::session::{SessionOptions, SessionTimings};
    use crate::infrastructure::bluetooth::channel::{BackendChannel, DEFAULT_RADIO_TIMEOUT};
    use crate::infrastructure::bluetooth::protocol::DeviceSettings;
    use crate::infrastructure::bluetooth::simulator::{SimulatedBackend, SimulatedDevice};
    use crate::infrastructure::codec::WedCodec;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0xC4, 0xBE, 0x84, 0x70, 0x2B, last])
    }

    fn entry(last: u8, priority: i64) -> ScheduleEntry {
        ScheduleEntry::new(mac(last), priority)
    }

    fn context(
        backend: &SimulatedBackend,
        dir: &Path,
    ) -> (SessionContext<SimulatedBackend>, mpsc::UnboundedReceiver<FleetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = SessionOptions {
            file_prefix: dir.join("WED_data"),
            timings: SessionTimings {
                watchdog: Duration::from_secs(30),
                drain_grace: Duration::from_millis(5),
            },
            ..SessionOptions::new(Command::Download)
        };
        let ctx = SessionContext {
            channel: BackendChannel::new(backend.clone(), DEFAULT_RADIO_TIMEOUT),
            settings: Arc::new(DeviceSettings::wed()),
            codec: Arc::new(WedCodec::new()),
            options: Arc::new(options),
            events: Some(tx),
        };
        (ctx, rx)
    }

    fn fast_config(max_concurrency: usize, max_rounds: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency,
            max_rounds: Some(max_rounds),
            ..SchedulerConfig::default()
        }
    }

    fn started_live_counts(rx: &mut mpsc::UnboundedReceiver<FleetEvent>) -> Vec<usize> {
        let mut started = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FleetEvent::SessionStarted { live, .. } = event {
                started.push(live);
            }
        }
        started
    }

    #[test]
    fn test_queue_orders_by_key_then_fifo() {
        let mut queue = RetryQueue::new();
        queue.push(entry(1, 300));
        queue.push(entry(2, 100));
        queue.push(entry(3, 100));
        queue.push(entry(4, MOST_OVERDUE));

        let order: Vec<u8> = std::iter::from_fn(|| queue.pop_ready(0))
            .map(|e| e.mac.octets()[5])
            .collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_pop_ready_skips_deferred_entries() {
        let mut queue = RetryQueue::new();
        let mut deferred = entry(1, 10);
        deferred.not_before = 1_000;
        queue.push(deferred);
        queue.push(entry(2, 20));
        queue.push(entry(3, 20));

        assert_eq!(queue.pop_ready(500).unwrap().mac, mac(2));
        assert_eq!(queue.next_ready_at(), Some(i64::MIN));
        assert_eq!(queue.pop_ready(500).unwrap().mac, mac(3));
        assert!(queue.pop_ready(500).is_none());
        assert_eq!(queue.next_ready_at(), Some(1_000));
        assert_eq!(queue.pop_ready(1_000).unwrap().mac, mac(1));
    }

    #[test]
    fn test_unchanged_checkpoint_escalates() {
        let config = SchedulerConfig {
            backoff_base: Duration::from_secs(60),
            ..SchedulerConfig::default()
        };
        let mut e = entry(1, 500);
        let now = 10_000;

        for expected in 1..=3 {
            reschedule(&mut e, 500, 500, now, &config);
            assert_eq!(e.retry_count, expected);
            assert_eq!(e.priority, 500);
        }
        // 60 s, 120 s, 240 s
        assert_eq!(e.not_before, now + 240);

        reschedule(&mut e, 500, 500, now, &config);
        assert_eq!(e.priority, MOST_OVERDUE);
        assert_eq!(e.retry_count, 0);
        assert_eq!(e.not_before, now);
    }

    #[test]
    fn test_changed_checkpoint_resets_retries() {
        let config = SchedulerConfig {
            revisit: Duration::from_secs(600),
            ..SchedulerConfig::default()
        };
        let mut e = entry(1, 500);
        e.retry_count = 2;
        reschedule(&mut e, 500, 9_000, 10_000, &config);
        assert_eq!(e.retry_count, 0);
        assert_eq!(e.priority, 9_000);
        assert_eq!(e.not_before, 10_600);
    }

    #[tokio::test]
    async fn test_concurrency_limit_holds_while_entries_remain() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let devices: Vec<MacAddress> = (1..=5).map(mac).collect();
        for m in &devices {
            backend.add_device(*m, SimulatedDevice::with_logs(40));
        }
        let (ctx, mut rx) = context(&backend, dir.path());
        let scheduler = FleetScheduler::new(
            &devices,
            ctx,
            CheckpointStore::in_memory(),
            fast_config(2, 10),
        );

        let summary = scheduler.run(CancellationToken::new()).await;
        assert_eq!(summary.sessions, 10);

        let started = started_live_counts(&mut rx);
        assert_eq!(started.len(), 10);
        assert_eq!(started[0], 1);
        // every later launch refills the free slot straight away
        assert!(started[1..].iter().all(|live| *live == 2), "{started:?}");
        assert_eq!(backend.max_links_per_device(), 1);
    }

    #[tokio::test]
    async fn test_failing_devices_keep_slots_busy_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let devices: Vec<MacAddress> = (1..=5).map(mac).collect();
        for m in &devices {
            let mut device = SimulatedDevice::with_logs(40);
            device.refuse_connection = true;
            backend.add_device(*m, device);
        }
        let (ctx, mut rx) = context(&backend, dir.path());
        let config = SchedulerConfig {
            max_concurrency: 2,
            max_rounds: Some(15),
            ..SchedulerConfig::default()
        };
        let scheduler = FleetScheduler::new(&devices, ctx, CheckpointStore::in_memory(), config);

        let run = scheduler.run(CancellationToken::new());
        let summary = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap();
        // three passes over the fleet, none of them waiting out a backoff
        assert_eq!(summary.sessions, 15);
        assert_eq!(summary.failed, 15);

        let started = started_live_counts(&mut rx);
        assert_eq!(started.len(), 15);
        assert!(started[1..].iter().all(|live| *live == 2), "{started:?}");
    }

    #[tokio::test]
    async fn test_device_is_queued_xor_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let devices = vec![mac(1), mac(2), mac(1)];
        for m in [mac(1), mac(2)] {
            backend.add_device(m, SimulatedDevice::with_logs(10));
        }
        let (ctx, mut rx) = context(&backend, dir.path());
        let scheduler = FleetScheduler::new(
            &devices,
            ctx,
            CheckpointStore::in_memory(),
            fast_config(2, 6),
        );
        assert_eq!(scheduler.queued(), 2);
        assert_eq!(scheduler.in_flight(), 0);
        scheduler.run(CancellationToken::new()).await;

        // replay the event stream: a device is started only while queued
        let mut in_flight = std::collections::HashSet::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                FleetEvent::SessionStarted { mac, .. } => {
                    assert!(in_flight.insert(mac), "{mac} started twice");
                }
                FleetEvent::SessionFinished { outcome, .. } => {
                    assert!(in_flight.remove(&outcome.mac));
                }
                _ => {}
            }
        }
        assert!(in_flight.is_empty());
        assert_eq!(backend.max_links_per_device(), 1);
    }

    #[tokio::test]
    async fn test_failing_device_is_forced_after_four_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(10);
        device.refuse_connection = true;
        backend.add_device(mac(1), device);

        let (ctx, mut rx) = context(&backend, dir.path());
        let scheduler = FleetScheduler::new(
            &[mac(1)],
            ctx,
            CheckpointStore::in_memory(),
            fast_config(1, 4),
        );
        let summary = scheduler.run(CancellationToken::new()).await;
        assert_eq!(summary.failed, 4);

        let mut retries = Vec::new();
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let FleetEvent::Rescheduled(entry) = event {
                retries.push(entry.retry_count);
                last = Some(entry);
            }
        }
        assert_eq!(retries, vec![1, 2, 3, 0]);
        assert_eq!(last.unwrap().priority, MOST_OVERDUE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_grace_then_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(100);
        device.mute = true;
        backend.add_device(mac(1), device);

        let (ctx, _rx) = context(&backend, dir.path());
        let store = CheckpointStore::in_memory();
        let scheduler = FleetScheduler::new(&[mac(1)], ctx, store.clone(), fast_config(1, 1));

        let cancel = CancellationToken::new();
        let run = tokio::spawn(scheduler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let summary = run.await.unwrap();

        // the session saw the cancellation and stopped on its own
        assert_eq!(summary.sessions, 1);
        assert_eq!(summary.succeeded + summary.failed, 1);
        assert_eq!(store.get(&mac(1)), None);
        assert_eq!(backend.writes_to(mac(1)).last(), Some(&vec![6, 0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_session_is_terminated_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new();
        let mut device = SimulatedDevice::with_logs(100);
        device.read_delay = Some(Duration::from_secs(60));
        backend.add_device(mac(1), device);

        let (mut ctx, _rx) = context(&backend, dir.path());
        ctx.channel = BackendChannel::new(backend.clone(), Duration::from_secs(120));
        let store = CheckpointStore::in_memory();
        let config = SchedulerConfig {
            shutdown_grace: Duration::from_secs(1),
            ..fast_config(1, 1)
        };
        let scheduler = FleetScheduler::new(&[mac(1)], ctx, store.clone(), config);

        let started = tokio::time::Instant::now();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(scheduler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.open_links(mac(1)), 1);
        cancel.cancel();
        let summary = run.await.unwrap();

        // returned at the grace deadline, long before the read would finish
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
        assert_eq!(summary.sessions, 1);
        assert_eq!(summary.succeeded + summary.failed, 0);
        assert_eq!(store.get(&mac(1)), None);

        // the aborted session released its link
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.open_links(mac(1)), 0);
    }
}
