//! Handler registration contract and registry (spec §3 "Handler
//! registration", §9 "Dynamic handler registry").
//!
//! A handler is a polymorphic object keyed by action name, exposing
//! `validate`/`estimated_duration`/`process` for the sync path and an
//! optional `process_with_progress` for the async path. The registry is a
//! read-mostly mapping populated once at startup.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::model::{Permission, Request};
use crate::progress::ProgressReporter;

/// The unit that validates, estimates, and executes an action.
///
/// Implementors only need `validate`/`estimated_duration`/`process` to serve
/// the sync path. Handlers whose `estimated_duration` exceeds the router's
/// threshold must also implement [`process_with_progress`](Handler::process_with_progress);
/// the default implementation returns an internal error so a misconfigured
/// "async" handler fails loudly rather than silently completing instantly.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Structural validation of the request payload, run before dispatch
    /// decides sync vs. async (spec §4.2 Dispatch).
    fn validate(&self, request: &Request) -> Result<(), Error>;

    /// Declared estimate of how long this action takes; the Router compares
    /// this against `async_threshold` to decide sync vs. async (spec §4.2,
    /// §9 "Sync/async polymorphism").
    fn estimated_duration(&self) -> Duration;

    /// Permissions the caller's connection must hold (spec §9 "Open
    /// questions... make the handler's required-permissions set explicit").
    fn required_permissions(&self) -> HashSet<Permission> {
        HashSet::new()
    }

    /// Synchronous execution path (spec §4.2 "Sync path").
    async fn process(&self, request: &Request) -> Result<Value, Error>;

    /// Asynchronous execution path, invoked by the Async Processor with a
    /// bound [`ProgressReporter`] (spec §4.3 "Execution").
    async fn process_with_progress(
        &self,
        request: &Request,
        _reporter: &ProgressReporter,
    ) -> Result<Value, Error> {
        let _ = request;
        Err(Error::internal(
            "handler declares an async-threshold duration but does not implement process_with_progress",
        ))
    }
}

/// Read-mostly mapping from action name to [`Handler`], populated once at
/// startup (spec §9 "Dynamic handler registry").
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, std::sync::Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Into<String>, handler: std::sync::Arc<dyn Handler>) {
        self.handlers.insert(action.into(), handler);
    }

    pub fn get(&self, action: &str) -> Option<std::sync::Arc<dyn Handler>> {
        self.handlers.get(action).cloned()
    }
}
