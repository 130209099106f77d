//! The outbound send primitive the Delivery Manager drives (spec §3.6).
//!
//! `Transport` abstracts "POST these bytes to this endpoint" so the Delivery
//! Manager's retry/circuit-breaking logic is exercised against a scriptable
//! fake rather than a live management API in tests.

use async_trait::async_trait;
use bytes::Bytes;

/// The three failure shapes the Delivery Manager needs to discriminate
/// (spec §4.1 "Failure modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The endpoint reports the channel itself is gone (e.g. an HTTP
    /// 410-equivalent from an API Gateway management API).
    Gone,
    /// 5xx, timeout, or 429: worth retrying.
    Transient,
    /// 4xx other than 429: retrying will not help.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("endpoint reported the channel is gone")]
    Gone,
    #[error("transient transport failure")]
    Transient,
    #[error("permanent transport failure")]
    Permanent,
}

impl From<TransportFailure> for TransportErrorKind {
    fn from(value: TransportFailure) -> Self {
        match value {
            TransportFailure::Gone => TransportErrorKind::Gone,
            TransportFailure::Transient => TransportErrorKind::Transient,
            TransportFailure::Permanent => TransportErrorKind::Permanent,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, endpoint: &str, bytes: Bytes) -> Result<(), TransportErrorKind>;

    /// Cheap reachability probe used by `IsActive` (spec §4.1). The default
    /// implementation treats the transport as active unconditionally; a real
    /// transport may implement a lighter-weight check than a full `post`.
    async fn probe(&self, _endpoint: &str) -> bool {
        true
    }
}

/// Production [`Transport`] backed by `reqwest`, classifying HTTP status
/// codes into the three failure shapes [`TransportFailure`] distinguishes.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Classify an HTTP status code into the three failure shapes [`TransportFailure`]
    /// distinguishes. Anything in `2xx` is not represented here; callers only
    /// reach this for non-success responses.
    fn classify_status(status: reqwest::StatusCode) -> TransportFailure {
        if status.as_u16() == 410 {
            TransportFailure::Gone
        } else if status.is_server_error() || status.as_u16() == 429 {
            TransportFailure::Transient
        } else {
            TransportFailure::Permanent
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, endpoint: &str, bytes: Bytes) -> Result<(), TransportErrorKind> {
        let response = self
            .client
            .post(endpoint)
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                TransportErrorKind::from(if e.is_timeout() {
                    TransportFailure::Transient
                } else {
                    TransportFailure::Permanent
                })
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::classify_status(status).into())
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A scriptable [`Transport`] fake: each endpoint has a queue of
    /// pre-programmed outcomes, consumed one per `post` call. Grounds the
    /// Delivery Manager's retry/circuit-breaker tests without a live network.
    #[derive(Default)]
    pub struct FakeTransport {
        scripts: dashmap::DashMap<String, Mutex<VecDeque<Result<(), TransportErrorKind>>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, endpoint: &str, outcome: Result<(), TransportErrorKind>) {
            self.scripts
                .entry(endpoint.to_string())
                .or_default()
                .lock()
                .unwrap()
                .push_back(outcome);
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn post(&self, endpoint: &str, _bytes: Bytes) -> Result<(), TransportErrorKind> {
            self.calls.lock().unwrap().push(endpoint.to_string());

            let Some(queue) = self.scripts.get(endpoint) else {
                return Ok(());
            };
            let mut queue = queue.lock().unwrap();
            queue.pop_front().unwrap_or(Ok(()))
        }
    }
}
