//! Progress Reporter & Batcher (spec §4.4).
//!
//! The handler-facing [`ProgressReporter`] converts fine-grained `report`
//! calls into a minimum-necessary stream of `progress` frames via a
//! dedicated [`Batcher`] worker task, one per reporter instance (spec §5
//! "Batcher").

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::delivery::DeliveryManager;
use crate::error::Error;
use crate::frame::OutgoingFrame;

#[derive(Debug, Clone)]
struct ProgressItem {
    percentage: f64,
    message: String,
}

pub struct BatcherConfig {
    pub interval: Duration,
    pub max_batch: usize,
    pub flush_threshold_pct: f64,
    pub queue_capacity: usize,
}

impl From<&crate::config::Config> for BatcherConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            interval: Duration::from_millis(cfg.batcher_interval_ms),
            max_batch: cfg.batcher_max_batch,
            flush_threshold_pct: cfg.batcher_flush_threshold_pct,
            queue_capacity: cfg.batcher_queue_capacity,
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<ProgressItem>>,
    capacity: usize,
    max_batch: usize,
    flush_threshold_pct: f64,
    wake: Notify,
    last_emitted_pct: Mutex<Option<f64>>,
}

impl Shared {
    /// Push a new update, dropping the *oldest* pending one on overflow
    /// (spec §4.4 "Overflow drops the oldest pending update, never the
    /// newest"). Returns whether the worker should be woken immediately:
    /// queue at capacity, batch-size reached, or this update itself crossed
    /// the flush-threshold percentage.
    fn push(&self, item: ProgressItem) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        let crosses_threshold = item.percentage >= self.flush_threshold_pct;
        queue.push_back(item);
        queue.len() >= self.capacity || queue.len() >= self.max_batch || crosses_threshold
    }

    fn drain(&self) -> Vec<ProgressItem> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }
}

/// Applies the combining rule: always emit the first and last item of the
/// batch; emit intermediates only when they differ from the previously
/// emitted percentage by at least 10 points (spec §4.4 "Combining rule").
fn combine(batch: &[ProgressItem], last_emitted: &mut Option<f64>) -> Vec<ProgressItem> {
    if batch.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(2);
    let first = batch[0].clone();
    out.push(first.clone());
    let mut cursor = first.percentage;

    if batch.len() > 1 {
        for item in &batch[1..batch.len() - 1] {
            if (item.percentage - cursor).abs() >= 10.0 {
                out.push(item.clone());
                cursor = item.percentage;
            }
        }
        out.push(batch[batch.len() - 1].clone());
    }

    *last_emitted = out.last().map(|i| i.percentage);
    out
}

/// Dedicated worker that drains a [`Shared`] queue on a tick/size/threshold
/// trigger and emits `progress` frames through the [`DeliveryManager`]
/// (spec §4.4 "Batching policy").
pub struct Batcher {
    shared: Arc<Shared>,
    shutdown: Arc<Notify>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    request_id: String,
    channel_id: String,
}

impl Batcher {
    pub fn spawn(
        request_id: impl Into<String>,
        channel_id: impl Into<String>,
        delivery: Arc<DeliveryManager>,
        cfg: BatcherConfig,
    ) -> Arc<Self> {
        let request_id = request_id.into();
        let channel_id = channel_id.into();
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            capacity: cfg.queue_capacity,
            max_batch: cfg.max_batch,
            flush_threshold_pct: cfg.flush_threshold_pct,
            wake: Notify::new(),
            last_emitted_pct: Mutex::new(None),
        });
        let shutdown = Arc::new(Notify::new());
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let worker_shared = shared.clone();
        let worker_shutdown = shutdown.clone();
        let worker_closed = closed.clone();
        let worker_request_id = request_id.clone();
        let worker_channel_id = channel_id.clone();
        let worker_delivery = delivery;
        let interval = cfg.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = worker_shared.wake.notified() => {}
                    _ = worker_shutdown.notified() => {
                        flush_once(&worker_shared, &worker_delivery, &worker_request_id, &worker_channel_id).await;
                        break;
                    }
                }
                flush_once(&worker_shared, &worker_delivery, &worker_request_id, &worker_channel_id).await;

                if worker_closed.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
            }
        });

        Arc::new(Self {
            shared,
            shutdown,
            closed,
            worker: Mutex::new(Some(handle)),
            request_id,
            channel_id,
        })
    }

    /// Non-blocking; never fails on backpressure (spec §4.4 `Report`).
    fn report(&self, percentage: f64, message: impl Into<String>) {
        let percentage = percentage.clamp(0.0, 100.0);
        let flush_now = self.shared.push(ProgressItem {
            percentage,
            message: message.into(),
        });
        if flush_now {
            self.shared.wake.notify_one();
        }
    }

    /// Force an immediate flush and wait for the worker to have processed
    /// the queue at least once more (spec §4.4 "brief flush grace window").
    async fn force_flush(&self) {
        self.shared.wake.notify_one();
        // The worker's select! races tick/wake/shutdown; yielding here gives
        // it a scheduling slot to observe the notification before we
        // proceed to send the terminal frame.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn close(&self) {
        if self
            .closed
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }
        self.shutdown.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn flush_once(
    shared: &Shared,
    delivery: &DeliveryManager,
    request_id: &str,
    channel_id: &str,
) {
    let batch = shared.drain();
    if batch.is_empty() {
        return;
    }

    let mut last_emitted = shared.last_emitted_pct.lock().unwrap();
    let combined = combine(&batch, &mut last_emitted);
    drop(last_emitted);

    for item in combined {
        trace!(request_id, channel_id, percentage = item.percentage, "flushing progress");
        let frame = OutgoingFrame::Progress {
            request_id: request_id.to_string(),
            timestamp: chrono::Utc::now(),
            percentage: item.percentage,
            message: item.message,
            metadata: None,
        };
        if let Err(e) = delivery.send(channel_id, &frame).await {
            debug!(request_id, channel_id, error = %e, "failed to deliver progress frame");
        }
    }
}

/// Handler-facing progress API bound to a single `(request_id, channel_id)`
/// pair (spec §4.4 "Contract exposed to handlers").
pub struct ProgressReporter {
    batcher: Arc<Batcher>,
    delivery: Arc<DeliveryManager>,
    request_id: String,
    channel_id: String,
}

impl ProgressReporter {
    pub fn new(delivery: Arc<DeliveryManager>, cfg: BatcherConfig, request_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        let channel_id = channel_id.into();
        let batcher = Batcher::spawn(request_id.clone(), channel_id.clone(), delivery.clone(), cfg);
        Self {
            batcher,
            delivery,
            request_id,
            channel_id,
        }
    }

    pub fn report(&self, percentage: f64, message: impl Into<String>) {
        self.batcher.report(percentage, message);
    }

    pub fn set_metadata(&self, _key: impl Into<String>, _value: Value) {
        // Metadata attaches to subsequent frames; the minimal wire shape in
        // use here does not yet need per-call metadata beyond what callers
        // pass directly to `complete`/`fail`, so this is a documented no-op
        // hook for handler code written against the full contract.
    }

    /// Final terminal frame with success data; flushes pending progress
    /// first and forces a 100% emission (spec §4.4 `Complete`).
    pub async fn complete(&self, result: Value) -> Result<(), Error> {
        self.report(100.0, "complete");
        self.batcher.force_flush().await;
        self.batcher.close().await;

        let frame = OutgoingFrame::Response {
            request_id: self.request_id.clone(),
            timestamp: chrono::Utc::now(),
            success: true,
            data: Some(result),
            error: None,
            metadata: None,
        };
        self.delivery.send(&self.channel_id, &frame).await
    }

    /// Terminal error frame; flushes pending progress first (spec §4.4 `Fail`).
    pub async fn fail(&self, error: &Error) -> Result<(), Error> {
        self.batcher.force_flush().await;
        self.batcher.close().await;

        let frame = OutgoingFrame::error_frame(Some(self.request_id.clone()), error);
        self.delivery.send(&self.channel_id, &frame).await
    }

    /// Tear down the batcher worker without emitting a terminal frame, for
    /// paths that are not actually done (retry, cancellation) but still need
    /// to stop the background worker (spec §5 "Shutdown closes the channel").
    pub async fn discard(&self) {
        self.batcher.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_keeps_first_and_last_drops_small_deltas() {
        let batch = vec![
            ProgressItem { percentage: 10.0, message: "a".into() },
            ProgressItem { percentage: 12.0, message: "b".into() },
            ProgressItem { percentage: 15.0, message: "c".into() },
            ProgressItem { percentage: 20.0, message: "d".into() },
        ];
        let mut last = None;
        let combined = combine(&batch, &mut last);
        let pcts: Vec<f64> = combined.iter().map(|i| i.percentage).collect();
        assert_eq!(pcts, vec![10.0, 20.0]);
    }

    #[test]
    fn combine_keeps_large_intermediate_deltas() {
        let batch = vec![
            ProgressItem { percentage: 0.0, message: "a".into() },
            ProgressItem { percentage: 30.0, message: "b".into() },
            ProgressItem { percentage: 35.0, message: "c".into() },
            ProgressItem { percentage: 100.0, message: "d".into() },
        ];
        let mut last = None;
        let combined = combine(&batch, &mut last);
        let pcts: Vec<f64> = combined.iter().map(|i| i.percentage).collect();
        assert_eq!(pcts, vec![0.0, 30.0, 100.0]);
    }

    fn shared(capacity: usize, max_batch: usize, flush_threshold_pct: f64) -> Shared {
        Shared {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            max_batch,
            flush_threshold_pct,
            wake: Notify::new(),
            last_emitted_pct: Mutex::new(None),
        }
    }

    #[test]
    fn push_triggers_flush_once_batch_size_is_reached() {
        let shared = shared(100, 3, 95.0);
        assert!(!shared.push(ProgressItem { percentage: 1.0, message: "a".into() }));
        assert!(!shared.push(ProgressItem { percentage: 2.0, message: "b".into() }));
        assert!(shared.push(ProgressItem { percentage: 3.0, message: "c".into() }));
    }

    #[test]
    fn push_triggers_flush_when_percentage_crosses_threshold() {
        let shared = shared(100, 10, 95.0);
        assert!(!shared.push(ProgressItem { percentage: 50.0, message: "a".into() }));
        assert!(shared.push(ProgressItem { percentage: 95.0, message: "b".into() }));
    }

    #[test]
    fn combine_single_item_emits_once() {
        let batch = vec![ProgressItem { percentage: 42.0, message: "a".into() }];
        let mut last = None;
        let combined = combine(&batch, &mut last);
        assert_eq!(combined.len(), 1);
    }
}
