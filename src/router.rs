//! Router & Dispatch Engine (spec §4.2).
//!
//! Decodes an incoming frame, authenticates by channel lookup, validates the
//! action, either executes synchronously or enqueues durably, and emits the
//! correct acknowledgment/response/error frame.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::delivery::DeliveryManager;
use crate::error::Error;
use crate::frame::{IncomingFrame, OutgoingFrame};
use crate::handler::HandlerRegistry;
use crate::model::Request;
use crate::store::RequestStore;

/// Default retry budget stamped on freshly-minted requests. Not one of the
/// spec's named configuration options; handlers that need a different budget
/// set it per-action by wrapping [`Router::route`] at the embedding layer.
const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct Router {
    connections: Arc<dyn crate::store::ConnectionStore>,
    requests: Arc<dyn RequestStore>,
    handlers: Arc<HandlerRegistry>,
    delivery: Arc<DeliveryManager>,
    async_threshold: Duration,
    request_ttl_days: u64,
}

impl Router {
    pub fn new(
        connections: Arc<dyn crate::store::ConnectionStore>,
        requests: Arc<dyn RequestStore>,
        handlers: Arc<HandlerRegistry>,
        delivery: Arc<DeliveryManager>,
        cfg: &Config,
    ) -> Self {
        Self {
            connections,
            requests,
            handlers,
            delivery,
            async_threshold: cfg.async_threshold(),
            request_ttl_days: cfg.request_ttl_days,
        }
    }

    /// Handle one incoming invocation for `channel_id`, returning the frame
    /// produced for it. The frame is also pushed through the Delivery
    /// Manager (spec §2: "Router depends on the Delivery Manager for
    /// acknowledgments and sync responses").
    pub async fn route(&self, channel_id: &str, raw: &[u8]) -> OutgoingFrame {
        let frame = match IncomingFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => return self.reject(channel_id, None, e).await,
        };

        let connection = match self.connections.get(channel_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                return self
                    .reject(
                        channel_id,
                        frame.id.clone(),
                        Error::unauthorized(format!("no connection for channel {channel_id}")),
                    )
                    .await
            }
            Err(e) => return self.reject(channel_id, frame.id.clone(), e).await,
        };

        let handler = match self.handlers.get(&frame.action) {
            Some(h) => h,
            None => {
                return self
                    .reject(
                        channel_id,
                        frame.id.clone(),
                        Error::invalid_action(format!(
                            "no handler registered for action '{}'",
                            frame.action
                        )),
                    )
                    .await
            }
        };

        // Permission check precedes `Validate` so a caller without access
        // never learns whether their payload would otherwise be valid.
        let required = handler.required_permissions();
        if !required.is_subset(&connection.permissions) {
            return self
                .reject(
                    channel_id,
                    frame.id.clone(),
                    Error::unauthorized("connection lacks required permissions for this action"),
                )
                .await;
        }

        let request_id = frame.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let request = Request::new_pending(
            request_id.clone(),
            channel_id.to_string(),
            connection.user_id.clone(),
            connection.tenant_id.clone(),
            frame.action.clone(),
            frame.payload.clone().unwrap_or(serde_json::Value::Null),
            DEFAULT_MAX_RETRIES,
            self.request_ttl_days,
        );

        if let Err(e) = handler.validate(&request) {
            return self.reject(channel_id, Some(request_id), e).await;
        }

        let estimated = handler.estimated_duration();
        if estimated <= self.async_threshold {
            self.run_sync(channel_id, request_id, &*handler, &request).await
        } else {
            self.enqueue_async(channel_id, request_id, estimated, request).await
        }
    }

    async fn run_sync(
        &self,
        channel_id: &str,
        request_id: String,
        handler: &dyn crate::handler::Handler,
        request: &Request,
    ) -> OutgoingFrame {
        // Reached only when the handler's own estimate is already within
        // the async threshold, so the dispatch deadline is the threshold
        // itself rather than that (already-satisfied) estimate.
        let deadline = self.async_threshold;
        let out = match tokio::time::timeout(deadline, handler.process(request)).await {
            Ok(Ok(data)) => OutgoingFrame::Response {
                request_id: request_id.clone(),
                timestamp: chrono::Utc::now(),
                success: true,
                data: Some(data),
                error: None,
                metadata: None,
            },
            Ok(Err(e)) => OutgoingFrame::error_frame(Some(request_id.clone()), &e),
            Err(_elapsed) => OutgoingFrame::error_frame(
                Some(request_id.clone()),
                &Error::transient("handler exceeded the sync dispatch deadline"),
            ),
        };
        self.emit(channel_id, &out).await;
        out
    }

    async fn enqueue_async(
        &self,
        channel_id: &str,
        request_id: String,
        estimated: Duration,
        request: Request,
    ) -> OutgoingFrame {
        if let Err(e) = self.requests.insert(request).await {
            return self.reject(channel_id, Some(request_id), e).await;
        }

        info!(channel_id, request_id, "request enqueued for async processing");
        let out = OutgoingFrame::Acknowledgment {
            request_id: request_id.clone(),
            timestamp: chrono::Utc::now(),
            status: "queued",
            message: "request accepted".to_string(),
            estimated_duration: Some(estimated.as_secs_f64()),
        };
        // A failed acknowledgment send does not roll back the insert: the
        // row is left PENDING for the Processor to pick up (spec §4.2
        // "Failure semantics").
        self.emit(channel_id, &out).await;
        out
    }

    async fn reject(&self, channel_id: &str, request_id: Option<String>, error: Error) -> OutgoingFrame {
        let out = OutgoingFrame::error_frame(request_id, &error);
        self.emit(channel_id, &out).await;
        out
    }

    async fn emit(&self, channel_id: &str, frame: &OutgoingFrame) {
        if let Err(e) = self.delivery.send(channel_id, frame).await {
            warn!(channel_id, error = %e, "failed to deliver frame produced by route()");
        }
    }
}
