//! Connection Registry & Delivery Manager (spec §4.1).
//!
//! Delivers an outgoing [`OutgoingFrame`] to a specific channel with
//! bounded-latency, at-most-once semantics; broadcasts to a set of channels
//! with partial-failure reporting; maintains a per-channel circuit breaker;
//! evicts stale channels. Emits send counts, per-kind failure counts,
//! latency histograms, and circuit-state gauges through the `metrics`
//! crate's global recorder (spec §4.1/§10.1 "Observed metrics").

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::circuit::{Admission, CircuitBreakerRegistry, CircuitState};
use crate::error::{Error, ErrorKind};
use crate::frame::OutgoingFrame;
use crate::store::ConnectionStore;
use crate::transport::{Transport, TransportErrorKind};

fn circuit_state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

/// RAII tracker for in-flight `send` calls so [`DeliveryManager::shutdown`]
/// can wait for them to drain instead of sleeping blindly.
struct InFlightGuard<'a> {
    count: &'a AtomicUsize,
    drained: &'a Notify,
}

impl<'a> InFlightGuard<'a> {
    fn enter(count: &'a AtomicUsize, drained: &'a Notify) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self { count, drained }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

#[derive(Clone)]
struct CachedEndpoint {
    endpoint: String,
    cached_at: Instant,
}

/// Per-channel endpoint lookup cache (spec §4.1 "bounded in-memory cache
/// keyed by channel id, TTL ≤ 60s").
struct EndpointCache {
    entries: DashMap<String, CachedEndpoint>,
    ttl: Duration,
}

impl EndpointCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, channel_id: &str) -> Option<String> {
        let entry = self.entries.get(channel_id)?;
        if entry.cached_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(channel_id);
            return None;
        }
        Some(entry.endpoint.clone())
    }

    fn put(&self, channel_id: &str, endpoint: String) {
        self.entries.insert(
            channel_id.to_string(),
            CachedEndpoint {
                endpoint,
                cached_at: Instant::now(),
            },
        );
    }

    fn invalidate(&self, channel_id: &str) {
        self.entries.remove(channel_id);
    }
}

/// Outcome of a single channel within a [`Broadcast`](DeliveryManager::broadcast)
/// (spec §8 "every element of S appears exactly once in the aggregated
/// outcome").
#[derive(Debug)]
pub enum DeliveryOutcome {
    Sent,
    Failed(Error),
}

/// Partial-failure result of a broadcast: every input channel id appears
/// exactly once (spec §4.1 "Broadcast does not fail-fast").
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub outcomes: HashMap<String, DeliveryOutcome>,
}

impl BroadcastReport {
    pub fn success_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, DeliveryOutcome::Sent))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

pub struct DeliveryManagerConfig {
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub broadcast_workers: usize,
    pub circuit_threshold: u32,
    pub circuit_window: Duration,
    pub circuit_cooldown: Duration,
    pub endpoint_cache_ttl: Duration,
}

impl From<&crate::config::Config> for DeliveryManagerConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            retry_attempts: cfg.send_retry_attempts,
            retry_base: Duration::from_millis(cfg.send_retry_base_ms),
            retry_cap: Duration::from_millis(cfg.send_retry_cap_ms),
            broadcast_workers: cfg.broadcast_workers,
            circuit_threshold: cfg.circuit_threshold,
            circuit_window: Duration::from_millis(cfg.circuit_window_ms),
            circuit_cooldown: Duration::from_millis(cfg.circuit_cooldown_ms),
            endpoint_cache_ttl: Duration::from_secs(cfg.endpoint_cache_ttl_secs),
        }
    }
}

pub struct DeliveryManager {
    connections: Arc<dyn ConnectionStore>,
    transport: Arc<dyn Transport>,
    cache: EndpointCache,
    circuit: CircuitBreakerRegistry,
    cfg: DeliveryManagerConfig,
    shutting_down: std::sync::atomic::AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl DeliveryManager {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        transport: Arc<dyn Transport>,
        cfg: DeliveryManagerConfig,
    ) -> Self {
        let circuit = CircuitBreakerRegistry::new(cfg.circuit_threshold, cfg.circuit_window, cfg.circuit_cooldown);
        let cache = EndpointCache::new(cfg.endpoint_cache_ttl);
        Self {
            connections,
            transport,
            cache,
            circuit,
            cfg,
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    async fn resolve_endpoint(&self, channel_id: &str) -> Result<String, Error> {
        if let Some(endpoint) = self.cache.get(channel_id) {
            return Ok(endpoint);
        }

        let connection = self
            .connections
            .get(channel_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("no connection for channel {channel_id}")))?;

        self.cache.put(channel_id, connection.endpoint.clone());
        Ok(connection.endpoint)
    }

    /// Deliver `frame` to `channel_id` with bounded-latency, at-most-once
    /// semantics (spec §4.1 `Send`).
    pub async fn send(&self, channel_id: &str, frame: &OutgoingFrame) -> Result<(), Error> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::internal("delivery manager is shutting down"));
        }

        let _guard = InFlightGuard::enter(&self.in_flight, &self.drained);
        gauge!("streamer_delivery_active_sends").increment(1.0);
        let started = Instant::now();

        let result = self.send_inner(channel_id, frame).await;

        gauge!("streamer_delivery_active_sends").decrement(1.0);
        histogram!("streamer_delivery_send_duration_seconds", "op" => "send")
            .record(started.elapsed().as_secs_f64());
        counter!("streamer_delivery_send_total").increment(1);
        match &result {
            Ok(()) => {
                counter!("streamer_delivery_send_succeeded_total").increment(1);
            }
            Err(e) => {
                counter!("streamer_delivery_send_failed_total", "kind" => e.kind.wire_code())
                    .increment(1);
            }
        }
        gauge!("streamer_delivery_circuit_state", "channel_id" => channel_id.to_string())
            .set(circuit_state_value(self.circuit.state(channel_id)));

        result
    }

    async fn send_inner(&self, channel_id: &str, frame: &OutgoingFrame) -> Result<(), Error> {
        match self.circuit.admit(channel_id) {
            Admission::Rejected => {
                return Err(Error::circuit_open(format!(
                    "circuit open for channel {channel_id}"
                )))
            }
            Admission::Allowed | Admission::Probe => {}
        }

        let endpoint = match self.resolve_endpoint(channel_id).await {
            Ok(endpoint) => endpoint,
            Err(e) => return Err(e),
        };

        let bytes = frame.to_bytes()?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.post(&endpoint, bytes.clone()).await {
                Ok(()) => {
                    self.connections.touch(channel_id, chrono::Utc::now()).await?;
                    self.circuit.record(channel_id, true, false);
                    return Ok(());
                }
                Err(TransportErrorKind::Gone) => {
                    self.connections.delete(channel_id).await?;
                    self.cache.invalidate(channel_id);
                    self.circuit.record(channel_id, false, true);
                    self.circuit.remove(channel_id);
                    info!(channel_id, "channel reported stale, connection deleted");
                    return Err(Error::stale(format!("channel {channel_id} is gone")));
                }
                Err(TransportErrorKind::Permanent) => {
                    self.circuit.record(channel_id, false, false);
                    return Err(Error::new(
                        ErrorKind::Internal,
                        format!("permanent transport error sending to {channel_id}"),
                    ));
                }
                Err(TransportErrorKind::Transient) => {
                    if attempt >= self.cfg.retry_attempts {
                        self.circuit.record(channel_id, false, false);
                        return Err(Error::transient(format!(
                            "exhausted {} retries sending to {channel_id}",
                            self.cfg.retry_attempts
                        )));
                    }
                    let delay = backoff_with_jitter(attempt, self.cfg.retry_base, self.cfg.retry_cap);
                    warn!(channel_id, attempt, ?delay, "transient send failure, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Dispatch `frame` to every id in `channel_ids` via a fixed-size worker
    /// pool, aggregating partial failures (spec §4.1 `Broadcast`).
    pub async fn broadcast(&self, channel_ids: &[String], frame: OutgoingFrame) -> BroadcastReport {
        use futures::stream::{self, StreamExt};

        let started = Instant::now();
        let frame = Arc::new(frame);
        let outcomes = stream::iter(channel_ids.iter().cloned())
            .map(|channel_id| {
                let frame = Arc::clone(&frame);
                async move {
                    let outcome = match self.send(&channel_id, &frame).await {
                        Ok(()) => DeliveryOutcome::Sent,
                        Err(e) => DeliveryOutcome::Failed(e),
                    };
                    (channel_id, outcome)
                }
            })
            .buffer_unordered(self.cfg.broadcast_workers.max(1))
            .collect::<Vec<_>>()
            .await;

        histogram!("streamer_delivery_send_duration_seconds", "op" => "broadcast")
            .record(started.elapsed().as_secs_f64());
        counter!("streamer_delivery_broadcast_total").increment(1);

        BroadcastReport {
            outcomes: outcomes.into_iter().collect(),
        }
    }

    /// Cheap liveness check: never mutates state beyond the endpoint cache
    /// (spec §4.1 `IsActive`).
    pub async fn is_active(&self, channel_id: &str) -> bool {
        if self.circuit.state(channel_id) == crate::circuit::CircuitState::Open {
            return false;
        }
        match self.resolve_endpoint(channel_id).await {
            Ok(endpoint) => self.transport.probe(&endpoint).await,
            Err(_) => false,
        }
    }

    /// Stop accepting new work and wait for in-flight `send` calls to finish,
    /// up to `deadline`; sends still outstanding once it elapses are
    /// abandoned rather than canceled (spec §4.1 `Shutdown`).
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        debug!(?deadline, in_flight = self.in_flight.load(Ordering::Acquire), "delivery manager shutting down");

        let drain = async {
            loop {
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                tokio::select! {
                    _ = self.drained.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!(
                remaining = self.in_flight.load(Ordering::Acquire),
                "shutdown deadline elapsed with sends still in flight"
            );
        } else {
            debug!("all in-flight sends drained before shutdown deadline");
        }
    }
}

/// Exponential backoff with full jitter: `random(0, min(cap, base * 2^attempt))`
/// (spec §4.1 "base 100 ms, cap 5 s").
fn backoff_with_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(20));
    let capped = exp.min(cap.as_millis()).max(1);
    let jittered = rand::thread_rng().gen_range(0..=capped);
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConnectionStore;
    use crate::transport::fake::FakeTransport;
    use std::collections::HashSet;

    fn manager(transport: Arc<FakeTransport>, connections: Arc<MemoryConnectionStore>) -> DeliveryManager {
        DeliveryManager::new(
            connections,
            transport,
            DeliveryManagerConfig {
                retry_attempts: 3,
                retry_base: Duration::from_millis(1),
                retry_cap: Duration::from_millis(10),
                broadcast_workers: 4,
                circuit_threshold: 5,
                circuit_window: Duration::from_secs(30),
                circuit_cooldown: Duration::from_millis(10),
                endpoint_cache_ttl: Duration::from_secs(60),
            },
        )
    }

    async fn seed(connections: &MemoryConnectionStore, channel_id: &str, endpoint: &str) {
        connections
            .put(crate::model::Connection::new(
                channel_id,
                "user-1",
                "tenant-1",
                endpoint,
                HashSet::new(),
                24,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_succeeds_and_touches_last_activity() {
        let connections = Arc::new(MemoryConnectionStore::new());
        seed(&connections, "c1", "http://example/c1").await;
        let transport = Arc::new(FakeTransport::new());
        let mgr = manager(transport.clone(), connections.clone());

        let frame = OutgoingFrame::Progress {
            request_id: "r1".into(),
            timestamp: chrono::Utc::now(),
            percentage: 50.0,
            message: "halfway".into(),
            metadata: None,
        };

        mgr.send("c1", &frame).await.unwrap();
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn stale_send_deletes_connection_and_disables_is_active() {
        let connections = Arc::new(MemoryConnectionStore::new());
        seed(&connections, "c1", "http://example/c1").await;
        let transport = Arc::new(FakeTransport::new());
        transport.push("http://example/c1", Err(TransportErrorKind::Gone));
        let mgr = manager(transport, connections.clone());

        let frame = OutgoingFrame::Progress {
            request_id: "r1".into(),
            timestamp: chrono::Utc::now(),
            percentage: 1.0,
            message: "x".into(),
            metadata: None,
        };

        let err = mgr.send("c1", &frame).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Stale);
        assert!(connections.get("c1").await.unwrap().is_none());
        assert!(!mgr.is_active("c1").await);
    }

    #[tokio::test]
    async fn not_found_for_unknown_channel() {
        let connections = Arc::new(MemoryConnectionStore::new());
        let transport = Arc::new(FakeTransport::new());
        let mgr = manager(transport, connections);

        let frame = OutgoingFrame::Progress {
            request_id: "r1".into(),
            timestamp: chrono::Utc::now(),
            percentage: 1.0,
            message: "x".into(),
            metadata: None,
        };
        let err = mgr.send("ghost", &frame).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn circuit_opens_after_five_transient_failures() {
        let connections = Arc::new(MemoryConnectionStore::new());
        seed(&connections, "c1", "http://example/c1").await;
        let transport = Arc::new(FakeTransport::new());
        // Each send exhausts 3 attempts, all transient, so 5 sends => 5 breaker failures.
        for _ in 0..(5 * 3) {
            transport.push("http://example/c1", Err(TransportErrorKind::Transient));
        }
        let mgr = manager(transport.clone(), connections);

        let frame = OutgoingFrame::Progress {
            request_id: "r1".into(),
            timestamp: chrono::Utc::now(),
            percentage: 1.0,
            message: "x".into(),
            metadata: None,
        };

        for _ in 0..5 {
            let err = mgr.send("c1", &frame).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Transient);
        }

        let calls_before = transport.call_count();
        let err = mgr.send("c1", &frame).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(transport.call_count(), calls_before, "no outbound call once open");
    }

    #[tokio::test]
    async fn shutdown_waits_for_an_in_flight_send_to_drain() {
        let connections = Arc::new(MemoryConnectionStore::new());
        seed(&connections, "c1", "http://example/c1").await;
        let transport = Arc::new(FakeTransport::new());
        let mgr = Arc::new(manager(transport, connections));

        let frame = OutgoingFrame::Progress {
            request_id: "r1".into(),
            timestamp: chrono::Utc::now(),
            percentage: 1.0,
            message: "x".into(),
            metadata: None,
        };

        assert_eq!(mgr.in_flight.load(std::sync::atomic::Ordering::Acquire), 0);
        mgr.send("c1", &frame).await.unwrap();
        assert_eq!(mgr.in_flight.load(std::sync::atomic::Ordering::Acquire), 0);

        mgr.shutdown(Duration::from_millis(200)).await;
        assert!(mgr.shutting_down.load(std::sync::atomic::Ordering::Acquire));
    }

    #[tokio::test]
    async fn broadcast_accounts_for_every_channel_exactly_once() {
        let connections = Arc::new(MemoryConnectionStore::new());
        seed(&connections, "c1", "http://example/c1").await;
        seed(&connections, "c2", "http://example/c2").await;
        let transport = Arc::new(FakeTransport::new());
        transport.push("http://example/c2", Err(TransportErrorKind::Permanent));
        let mgr = manager(transport, connections);

        let frame = OutgoingFrame::Progress {
            request_id: "r1".into(),
            timestamp: chrono::Utc::now(),
            percentage: 1.0,
            message: "x".into(),
            metadata: None,
        };

        let report = mgr
            .broadcast(&["c1".to_string(), "c2".to_string(), "ghost".to_string()], frame)
            .await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.success_count() + report.failure_count(), 3);
        assert_eq!(report.success_count(), 1);
    }
}
