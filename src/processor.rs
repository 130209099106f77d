//! Async Processor (spec §4.3).
//!
//! Consumes the Requests change feed, claims PENDING rows via compare-and-set,
//! executes the matching handler's async path, and drives progress/terminal
//! frames back through the [`DeliveryManager`] via a [`ProgressReporter`].

use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, warn};

use crate::config::Config;
use crate::delivery::DeliveryManager;
use crate::handler::HandlerRegistry;
use crate::model::{ChangeEvent, Request, RequestStatus};
use crate::progress::{BatcherConfig, ProgressReporter};
use crate::store::RequestStore;

pub struct AsyncProcessor {
    requests: Arc<dyn RequestStore>,
    handlers: Arc<HandlerRegistry>,
    delivery: Arc<DeliveryManager>,
    cfg: Arc<Config>,
}

impl AsyncProcessor {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        handlers: Arc<HandlerRegistry>,
        delivery: Arc<DeliveryManager>,
        cfg: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests,
            handlers,
            delivery,
            cfg,
        })
    }

    /// Drive the change feed for the life of the process (spec §9
    /// "not restartable from an arbitrary position"). Each change-feed batch
    /// is handled by up to `processor_parallelism` concurrent workers.
    pub async fn run(self: Arc<Self>) {
        let feed = self.requests.change_feed();
        feed.for_each_concurrent(self.cfg.processor_parallelism.max(1), |event| {
            let this = Arc::clone(&self);
            async move { this.handle_event(event).await }
        })
        .await;
    }

    fn reporter_for(&self, request_id: &str, channel_id: &str) -> ProgressReporter {
        ProgressReporter::new(
            self.delivery.clone(),
            BatcherConfig::from(self.cfg.as_ref()),
            request_id.to_string(),
            channel_id.to_string(),
        )
    }

    async fn handle_event(&self, event: ChangeEvent) {
        let candidate = event.new_image();
        if candidate.status != RequestStatus::Pending {
            return;
        }

        if candidate.retries >= candidate.max_retries {
            self.exhaust(candidate).await;
            return;
        }

        let claimed = self
            .requests
            .compare_and_set_status(
                &candidate.request_id,
                RequestStatus::Pending,
                RequestStatus::Processing,
                Box::new(|r| {
                    r.started_at = Some(chrono::Utc::now());
                    r.retries += 1;
                }),
            )
            .await;

        let request = match claimed {
            Ok(Some(r)) => r,
            Ok(None) => return, // lost the CAS to another worker
            Err(e) => {
                warn!(request_id = candidate.request_id, error = %e, "failed to claim request");
                return;
            }
        };

        info!(request_id = request.request_id, channel_id = request.channel_id, "claimed request");
        self.execute(request).await;
    }

    async fn exhaust(&self, candidate: &Request) {
        let result = self
            .requests
            .compare_and_set_status(
                &candidate.request_id,
                RequestStatus::Pending,
                RequestStatus::Failed,
                Box::new(|r| {
                    r.last_error = Some("exhausted".to_string());
                    r.completed_at = Some(chrono::Utc::now());
                }),
            )
            .await;

        if let Ok(Some(request)) = result {
            warn!(request_id = request.request_id, "retries exhausted");
            let reporter = self.reporter_for(&request.request_id, &request.channel_id);
            let error = crate::error::Error::internal("request exhausted its retry budget");
            let _ = reporter.fail(&error).await;
        }
    }

    async fn execute(&self, request: Request) {
        let Some(handler) = self.handlers.get(&request.action) else {
            let _ = self
                .requests
                .compare_and_set_status(
                    &request.request_id,
                    RequestStatus::Processing,
                    RequestStatus::Failed,
                    Box::new(|r| r.last_error = Some(format!("no handler registered for action '{}'", r.action))),
                )
                .await;
            return;
        };

        let reporter = self.reporter_for(&request.request_id, &request.channel_id);

        // Cancel rather than complete-and-stash once the originating
        // channel is gone (decided open question, SPEC_FULL.md §9).
        if !self.delivery.is_active(&request.channel_id).await {
            let _ = self
                .requests
                .compare_and_set_status(
                    &request.request_id,
                    RequestStatus::Processing,
                    RequestStatus::Canceled,
                    Box::new(|r| r.completed_at = Some(chrono::Utc::now())),
                )
                .await;
            reporter.discard().await;
            return;
        }

        let outcome = tokio::time::timeout(
            self.cfg.processor_max_duration(),
            handler.process_with_progress(&request, &reporter),
        )
        .await;

        match outcome {
            Ok(Ok(data)) => {
                let _ = self
                    .requests
                    .compare_and_set_status(
                        &request.request_id,
                        RequestStatus::Processing,
                        RequestStatus::Completed,
                        Box::new(|r| r.completed_at = Some(chrono::Utc::now())),
                    )
                    .await;
                if let Err(e) = reporter.complete(data).await {
                    warn!(request_id = request.request_id, error = %e, "failed to deliver completion frame");
                }
            }
            Ok(Err(e)) => {
                if e.kind.is_retryable() {
                    let _ = self
                        .requests
                        .compare_and_set_status(
                            &request.request_id,
                            RequestStatus::Processing,
                            RequestStatus::Pending,
                            Box::new({
                                let msg = e.to_string();
                                move |r| r.last_error = Some(msg)
                            }),
                        )
                        .await;
                    reporter.discard().await;
                } else {
                    let _ = self
                        .requests
                        .compare_and_set_status(
                            &request.request_id,
                            RequestStatus::Processing,
                            RequestStatus::Failed,
                            Box::new({
                                let msg = e.to_string();
                                move |r| {
                                    r.last_error = Some(msg);
                                    r.completed_at = Some(chrono::Utc::now());
                                }
                            }),
                        )
                        .await;
                    if let Err(e) = reporter.fail(&e).await {
                        warn!(request_id = request.request_id, error = %e, "failed to deliver failure frame");
                    }
                }
            }
            Err(_elapsed) => {
                let _ = self
                    .requests
                    .compare_and_set_status(
                        &request.request_id,
                        RequestStatus::Processing,
                        RequestStatus::Pending,
                        Box::new(|r| r.last_error = Some("processor deadline exceeded".to_string())),
                    )
                    .await;
                reporter.discard().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryManagerConfig;
    use crate::error::Error;
    use crate::handler::Handler;
    use crate::model::Connection;
    use crate::store::{MemoryConnectionStore, MemoryRequestStore};
    use crate::transport::fake::FakeTransport;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::time::Duration;

    struct Completes;

    #[async_trait]
    impl Handler for Completes {
        fn validate(&self, _request: &Request) -> Result<(), Error> {
            Ok(())
        }
        fn estimated_duration(&self) -> Duration {
            Duration::from_secs(60)
        }
        async fn process(&self, _request: &Request) -> Result<Value, Error> {
            unreachable!()
        }
        async fn process_with_progress(
            &self,
            _request: &Request,
            reporter: &ProgressReporter,
        ) -> Result<Value, Error> {
            reporter.report(50.0, "halfway");
            Ok(json!({ "ok": true }))
        }
    }

    fn harness() -> (
        Arc<AsyncProcessor>,
        Arc<MemoryConnectionStore>,
        Arc<MemoryRequestStore>,
        Arc<HandlerRegistry>,
    ) {
        let connections = Arc::new(MemoryConnectionStore::new());
        let requests = Arc::new(MemoryRequestStore::new());
        let transport = Arc::new(FakeTransport::new());
        let delivery = Arc::new(DeliveryManager::new(
            connections.clone(),
            transport,
            DeliveryManagerConfig::from(&Config::default()),
        ));
        let mut registry = HandlerRegistry::new();
        registry.register("do_thing", Arc::new(Completes));
        let handlers = Arc::new(registry);

        let cfg = Arc::new(Config::default());
        let processor = AsyncProcessor::new(requests.clone(), handlers.clone(), delivery, cfg);
        (processor, connections, requests, handlers)
    }

    async fn seed_connection(connections: &MemoryConnectionStore, channel_id: &str) {
        connections
            .put(Connection::new(
                channel_id,
                "user-1",
                "tenant-1",
                "http://example/endpoint",
                HashSet::new(),
                24,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claims_and_completes_a_pending_request() {
        let (processor, connections, requests, _handlers) = harness();
        seed_connection(&connections, "c1").await;

        // Spawn the feed consumer before inserting: the in-memory store's
        // change feed is a broadcast channel, so a row inserted before a
        // subscriber exists is never observed by that subscriber.
        let feed_task = tokio::spawn(processor.clone().run());
        tokio::task::yield_now().await;

        let request = Request::new_pending("r1", "c1", "user-1", "tenant-1", "do_thing", json!({}), 3, 7);
        requests.insert(request).await.unwrap();

        for _ in 0..200 {
            if let Some(row) = requests.get("r1").await.unwrap() {
                if row.status == RequestStatus::Completed {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        feed_task.abort();

        let row = requests.get("r1").await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Completed);
        assert_eq!(row.retries, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_without_claiming() {
        let (processor, connections, requests, _handlers) = harness();
        seed_connection(&connections, "c1").await;

        let mut request = Request::new_pending("r2", "c1", "user-1", "tenant-1", "do_thing", json!({}), 1, 7);
        request.retries = 1;
        requests.insert(request).await.unwrap();

        processor.handle_event(ChangeEvent::Inserted(requests.get("r2").await.unwrap().unwrap())).await;

        let row = requests.get("r2").await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("exhausted"));
    }

    #[tokio::test]
    async fn missing_channel_cancels_without_invoking_handler() {
        let (processor, _connections, requests, _handlers) = harness();
        // No connection seeded for "ghost": IsActive resolves false.
        let request = Request::new_pending("r3", "ghost", "user-1", "tenant-1", "do_thing", json!({}), 3, 7);
        requests.insert(request.clone()).await.unwrap();

        processor.handle_event(ChangeEvent::Inserted(request)).await;

        let row = requests.get("r3").await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Canceled);
    }

    #[tokio::test]
    async fn missing_handler_fails_the_request() {
        let (processor, connections, requests, _handlers) = harness();
        seed_connection(&connections, "c1").await;
        let request = Request::new_pending("r4", "c1", "user-1", "tenant-1", "no_such_action", json!({}), 3, 7);
        requests.insert(request.clone()).await.unwrap();

        processor.handle_event(ChangeEvent::Inserted(request)).await;

        let row = requests.get("r4").await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Failed);
    }
}
