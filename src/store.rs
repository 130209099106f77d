//! Store abstractions over the two external durable tables (spec §3.5):
//! `Connections` and `Requests`. The core never talks to a concrete database;
//! it only ever holds a `dyn ConnectionStore` / `dyn RequestStore`. In-memory
//! implementations back the test suite and are gated behind `test-util` so a
//! production embedder never links them in by accident.

use async_trait::async_trait;

use crate::error::Error;
use crate::model::{ChangeEvent, ChannelId, Connection, Request, RequestId, RequestStatus};

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, channel_id: &str) -> Result<Option<Connection>, Error>;
    async fn put(&self, connection: Connection) -> Result<(), Error>;
    async fn delete(&self, channel_id: &str) -> Result<(), Error>;
    async fn by_user(&self, user_id: &str) -> Result<Vec<Connection>, Error>;
    async fn by_tenant(&self, tenant_id: &str) -> Result<Vec<Connection>, Error>;
    async fn touch(&self, channel_id: &str, now: chrono::DateTime<chrono::Utc>) -> Result<(), Error>;
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new PENDING row. Fails with [`crate::error::ErrorKind::Internal`] if the id
    /// already exists.
    async fn insert(&self, request: Request) -> Result<(), Error>;

    async fn get(&self, request_id: &str) -> Result<Option<Request>, Error>;

    /// Atomically transition `request_id` from `expected` to `next`, applying
    /// `mutate` to the row first. Returns `Ok(None)` if another worker already
    /// moved the row off `expected` (a lost compare-and-set, spec §4.3).
    async fn compare_and_set_status(
        &self,
        request_id: &str,
        expected: RequestStatus,
        next: RequestStatus,
        mutate: Box<dyn FnOnce(&mut Request) + Send>,
    ) -> Result<Option<Request>, Error>;

    /// A `Stream` of change-feed events, consumed once by the Async Processor
    /// for the life of the process (spec §9 "not restartable from an
    /// arbitrary position").
    fn change_feed(&self) -> futures::stream::BoxStream<'static, ChangeEvent>;
}

#[cfg(any(test, feature = "test-util"))]
mod memory {
use super::*;

/// In-memory [`ConnectionStore`], keyed by channel id with secondary indices by
/// user and tenant (spec §3 "Invariants: secondary indices consistent with
/// primary row"). Backs the test suite; not a production store.
#[derive(Default)]
pub struct MemoryConnectionStore {
    by_channel: dashmap::DashMap<ChannelId, Connection>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn get(&self, channel_id: &str) -> Result<Option<Connection>, Error> {
        Ok(self.by_channel.get(channel_id).map(|e| e.value().clone()))
    }

    async fn put(&self, connection: Connection) -> Result<(), Error> {
        self.by_channel.insert(connection.channel_id.clone(), connection);
        Ok(())
    }

    async fn delete(&self, channel_id: &str) -> Result<(), Error> {
        self.by_channel.remove(channel_id);
        Ok(())
    }

    async fn by_user(&self, user_id: &str) -> Result<Vec<Connection>, Error> {
        Ok(self
            .by_channel
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn by_tenant(&self, tenant_id: &str) -> Result<Vec<Connection>, Error> {
        Ok(self
            .by_channel
            .iter()
            .filter(|e| e.value().tenant_id == tenant_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn touch(&self, channel_id: &str, now: chrono::DateTime<chrono::Utc>) -> Result<(), Error> {
        if let Some(mut entry) = self.by_channel.get_mut(channel_id) {
            entry.value_mut().touch(now);
        }
        Ok(())
    }
}

/// In-memory [`RequestStore`] with a broadcast-backed change feed. Backs the
/// test suite; not a production store.
pub struct MemoryRequestStore {
    rows: dashmap::DashMap<RequestId, Request>,
    changes: tokio::sync::broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryRequestStore {
    fn default() -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(1024);
        Self {
            rows: dashmap::DashMap::new(),
            changes: tx,
        }
    }
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn insert(&self, request: Request) -> Result<(), Error> {
        if self.rows.contains_key(&request.request_id) {
            return Err(Error::internal(format!(
                "request {} already exists",
                request.request_id
            )));
        }
        let id = request.request_id.clone();
        self.rows.insert(id, request.clone());
        let _ = self.changes.send(ChangeEvent::Inserted(request));
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<Request>, Error> {
        Ok(self.rows.get(request_id).map(|e| e.value().clone()))
    }

    async fn compare_and_set_status(
        &self,
        request_id: &str,
        expected: RequestStatus,
        next: RequestStatus,
        mutate: Box<dyn FnOnce(&mut Request) + Send>,
    ) -> Result<Option<Request>, Error> {
        let Some(mut entry) = self.rows.get_mut(request_id) else {
            return Ok(None);
        };
        if entry.value().status != expected {
            return Ok(None);
        }

        let old = entry.value().clone();
        let new = {
            let row = entry.value_mut();
            row.status = next;
            mutate(row);
            row.clone()
        };
        drop(entry);

        let _ = self.changes.send(ChangeEvent::StatusChanged { old, new: new.clone() });
        Ok(Some(new))
    }

    fn change_feed(&self) -> futures::stream::BoxStream<'static, ChangeEvent> {
        use futures::StreamExt;
        let rx = self.changes.subscribe();
        tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}

} // mod memory

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnectionStore, MemoryRequestStore};
