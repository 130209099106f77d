//! Streamer: a request-dispatch and progress-streaming fabric layered over a
//! bidirectional, WebSocket-style message channel.
//!
//! A connected client issues named actions; the fabric decides whether each
//! can be answered inline or must be deferred to the [`processor::AsyncProcessor`]
//! worker pool, which streams incremental progress and a final result back
//! on the same logical channel. See [`StreamerFabric`] for the public entry
//! point wiring the four subsystems together.

pub mod circuit;
pub mod config;
pub mod delivery;
pub mod error;
pub mod frame;
pub mod handler;
pub mod model;
pub mod processor;
pub mod progress;
pub mod router;
pub mod store;
pub mod transport;

use std::sync::Arc;

use config::Config;
use delivery::{DeliveryManager, DeliveryManagerConfig};
use handler::HandlerRegistry;
use processor::AsyncProcessor;
use router::Router;
use store::{ConnectionStore, RequestStore};
use transport::Transport;

/// Runtime handle for a Streamer instance (SPEC_FULL.md §10.7): a running
/// Router backed by a Delivery Manager, plus an Async Processor task the
/// embedding binary drives. Built via [`StreamerFabricBuilder`].
pub struct StreamerFabric {
    router: Router,
    processor: Arc<AsyncProcessor>,
}

/// Collects the external collaborators a [`StreamerFabric`] needs: the two
/// durable stores, the outbound transport, and the handler registry. Handler
/// authors implement [`handler::Handler`] and register it by action name;
/// they never touch the stores or Delivery Manager directly except through
/// the `ProgressReporter` handed to `process_with_progress`.
pub struct StreamerFabricBuilder {
    connections: Arc<dyn ConnectionStore>,
    requests: Arc<dyn RequestStore>,
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
    config: Config,
}

impl StreamerFabricBuilder {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        requests: Arc<dyn RequestStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            connections,
            requests,
            transport,
            handlers: HandlerRegistry::new(),
            config: Config::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn register_handler(mut self, action: impl Into<String>, handler: Arc<dyn handler::Handler>) -> Self {
        self.handlers.register(action, handler);
        self
    }

    pub fn build(self) -> StreamerFabric {
        let delivery = Arc::new(DeliveryManager::new(
            self.connections.clone(),
            self.transport,
            DeliveryManagerConfig::from(&self.config),
        ));
        let handlers = Arc::new(self.handlers);
        let cfg = Arc::new(self.config);

        let router = Router::new(
            self.connections,
            self.requests.clone(),
            handlers.clone(),
            delivery.clone(),
            &cfg,
        );
        let processor = AsyncProcessor::new(self.requests, handlers, delivery, cfg);

        StreamerFabric { router, processor }
    }
}

impl StreamerFabric {
    /// Handle one incoming invocation for `channel_id` (spec §4.2). Mirrors a
    /// transport-runtime's per-event entry point: decode, authenticate,
    /// dispatch, and return the frame produced for the caller.
    pub async fn route(&self, channel_id: &str, raw: &[u8]) -> frame::OutgoingFrame {
        self.router.route(channel_id, raw).await
    }

    /// Drive the Async Processor's change-feed loop for the life of the
    /// process. The embedding binary spawns this as a long-lived task.
    pub async fn run_processor(&self) {
        self.processor.clone().run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Connection;
    use crate::store::{MemoryConnectionStore, MemoryRequestStore};
    use crate::transport::fake::FakeTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl handler::Handler for Echo {
        fn validate(&self, _request: &model::Request) -> Result<(), error::Error> {
            Ok(())
        }
        fn estimated_duration(&self) -> Duration {
            Duration::from_millis(1)
        }
        async fn process(&self, request: &model::Request) -> Result<serde_json::Value, error::Error> {
            Ok(json!({ "echo": request.payload.clone() }))
        }
    }

    #[tokio::test]
    async fn fabric_builder_wires_a_working_sync_round_trip() {
        let connections = Arc::new(MemoryConnectionStore::new());
        let requests = Arc::new(MemoryRequestStore::new());
        let transport = Arc::new(FakeTransport::new());

        connections
            .put(Connection::new(
                "c1",
                "user-1",
                "tenant-1",
                "http://example/endpoint",
                HashSet::new(),
                24,
            ))
            .await
            .unwrap();

        let fabric = StreamerFabricBuilder::new(connections, requests, transport)
            .register_handler("echo", Arc::new(Echo))
            .build();

        let out = fabric.route("c1", br#"{"id":"r1","action":"echo","payload":"hi"}"#).await;
        match out {
            frame::OutgoingFrame::Response { success, data, .. } => {
                assert!(success);
                assert_eq!(data.unwrap()["echo"], "hi");
            }
            other => panic!("expected response frame, got {other:?}"),
        }
    }
}
