//! Notification Accumulator
//!
//! Per-attempt download state. Every inbound notification is stripped of its
//! header, counted through the log codec and appended verbatim to the output.
//! The accumulator raises a single logical wake signal when the download
//! completes and each time another progress step is crossed.

use crate::domain::codec::LogCodec;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Progress shared between the accumulator and the waiting session
#[derive(Debug, Default)]
pub struct DownloadProgress {
    received: AtomicU64,
    done: AtomicBool,
    wake: Notify,
}

impl DownloadProgress {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait for the next wake. Raises that happened since the last wait
    /// collapse into one.
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    fn raise(&self) {
        // notify_one keeps at most one pending permit
        self.wake.notify_one();
    }
}

pub struct NotificationAccumulator<W: Write> {
    codec: Arc<dyn LogCodec>,
    header_len: usize,
    max_records: u64,
    step: u64,
    next_threshold: u64,
    output: W,
    write_error: Option<io::Error>,
    progress: Arc<DownloadProgress>,
}

impl<W: Write> NotificationAccumulator<W> {
    pub fn new(codec: Arc<dyn LogCodec>, header_len: usize, max_records: u64, output: W) -> Self {
        let step = (max_records / 100).max(1);
        Self {
            codec,
            header_len,
            max_records,
            step,
            next_threshold: step,
            output,
            write_error: None,
            progress: Arc::new(DownloadProgress::default()),
        }
    }

    pub fn progress(&self) -> Arc<DownloadProgress> {
        Arc::clone(&self.progress)
    }

    pub fn received(&self) -> u64 {
        self.progress.received()
    }

    pub fn is_done(&self) -> bool {
        self.progress.is_done()
    }

    /// Handle one notification, in arrival order
    pub fn ingest(&mut self, payload: &[u8]) {
        let Some(body) = payload.get(self.header_len..) else {
            debug!("dropping {}-byte notification shorter than its header", payload.len());
            return;
        };

        let count = self.codec.count_records(body) as u64;
        let received = self.progress.received.fetch_add(count, Ordering::AcqRel) + count;

        if self.write_error.is_none() {
            if let Err(e) = self.output.write_all(body) {
                warn!("Failed to write download data: {}", e);
                self.write_error = Some(e);
            }
        }

        if received > self.max_records && !self.progress.done.swap(true, Ordering::AcqRel) {
            self.progress.raise();
        }
        if received >= self.next_threshold {
            self.next_threshold = (received / self.step + 1) * self.step;
            self.progress.raise();
        }
    }

    /// Flush and release the output, reporting any write failure seen
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(e) = self.write_error.take() {
            return Err(e);
        }
        self.output.flush()?;
        Ok(self.output)
    }
}

/// Feed notifications from `rx` into `acc` until `stop` fires or the link
/// goes away. Anything already queued when `stop` fires is still ingested.
pub fn spawn_pump<W>(
    mut acc: NotificationAccumulator<W>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: CancellationToken,
) -> JoinHandle<NotificationAccumulator<W>>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(payload) => acc.ingest(&payload),
                    None => break,
                },
            }
        }
        while let Ok(payload) = rx.try_recv() {
            acc.ingest(&payload);
        }
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::codec::WedCodec;
    use std::time::Duration;

    fn accel_payload(records: usize) -> Vec<u8> {
        let mut p = vec![0x1B, 0x27, 0x00];
        for _ in 0..records {
            p.extend_from_slice(&[0x01, 1, 2, 3]);
        }
        p
    }

    fn accumulator(max: u64) -> NotificationAccumulator<Vec<u8>> {
        NotificationAccumulator::new(Arc::new(WedCodec::new()), 3, max, Vec::new())
    }

    #[test]
    fn test_strips_header_and_appends_verbatim() {
        let mut acc = accumulator(100);
        acc.ingest(&accel_payload(2));
        acc.ingest(&accel_payload(1));
        assert_eq!(acc.received(), 3);
        let out = acc.finish().unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..4], &[0x01, 1, 2, 3]);
    }

    #[test]
    fn test_done_only_after_exceeding_max() {
        let mut acc = accumulator(8);
        acc.ingest(&accel_payload(4));
        acc.ingest(&accel_payload(4));
        // exactly max is not enough
        assert!(!acc.is_done());
        acc.ingest(&accel_payload(1));
        assert!(acc.is_done());
        acc.ingest(&accel_payload(4));
        assert!(acc.is_done());
        assert_eq!(acc.received(), 13);
    }

    #[test]
    fn test_short_payload_ignored() {
        let mut acc = accumulator(1);
        acc.ingest(&[0x1B, 0x27]);
        assert_eq!(acc.received(), 0);
        assert!(acc.finish().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wake_raises_collapse() {
        let mut acc = accumulator(1000);
        let progress = acc.progress();
        // crosses several 1% steps with no waiter in between
        for _ in 0..10 {
            acc.ingest(&accel_payload(10));
        }

        progress.notified().await;
        let second = tokio::time::timeout(Duration::from_millis(20), progress.notified()).await;
        assert!(second.is_err(), "multiple raises must collapse to one wake");
    }

    #[tokio::test]
    async fn test_pump_drains_queue_on_stop() {
        let acc = accumulator(100);
        let progress = acc.progress();
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        for _ in 0..5 {
            tx.send(accel_payload(2)).unwrap();
        }
        stop.cancel();
        let acc = spawn_pump(acc, rx, stop).await.unwrap();
        assert_eq!(acc.received(), 10);
        assert_eq!(progress.received(), 10);
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_surfaces_at_finish() {
        let mut acc =
            NotificationAccumulator::new(Arc::new(WedCodec::new()), 3, 1, FailingWriter);
        acc.ingest(&accel_payload(2));
        // counting continues so completion is still seen
        assert!(acc.is_done());
        assert!(acc.finish().is_err());
    }
}
