//! Core data model: [`Connection`], [`Request`]/[`RequestStatus`], and [`Claims`]
//! (spec §3).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ChannelId = String;
pub type UserId = String;
pub type TenantId = String;
pub type RequestId = String;
pub type Permission = String;

/// A live client channel (spec §3 "Connection").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub endpoint: String,
    pub permissions: HashSet<Permission>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ttl_hours: u64,
}

impl Connection {
    pub fn new(
        channel_id: impl Into<ChannelId>,
        user_id: impl Into<UserId>,
        tenant_id: impl Into<TenantId>,
        endpoint: impl Into<String>,
        permissions: HashSet<Permission>,
        ttl_hours: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            endpoint: endpoint.into(),
            permissions,
            connected_at: now,
            last_activity: now,
            ttl_hours,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }
}

/// Claims produced by the external credential verifier (spec §3 "Claims").
/// Consumed read-only by the Router to populate [`Connection`]/[`Request`]
/// and check handler-declared permissions. The verifier itself is out of
/// scope; this is purely the data shape the core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub permissions: HashSet<Permission>,
    pub issuer: String,
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lifecycle status of a [`Request`] (spec §3). Monotonic along
/// `Pending -> Processing -> {Completed, Failed, Canceled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Canceled
        )
    }
}

/// A durably-queued request (spec §3 "Request").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub action: String,
    pub payload: Value,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub ttl_days: u64,
}

impl Request {
    pub fn new_pending(
        request_id: impl Into<RequestId>,
        channel_id: impl Into<ChannelId>,
        user_id: impl Into<UserId>,
        tenant_id: impl Into<TenantId>,
        action: impl Into<String>,
        payload: Value,
        max_retries: u32,
        ttl_days: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            action: action.into(),
            payload,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retries: 0,
            max_retries,
            last_error: None,
            ttl_days,
        }
    }
}

/// A change-feed event delivered by [`crate::store::RequestStore::change_feed`]
/// (spec §6 "change feed delivers new-and-old images").
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Inserted(Request),
    StatusChanged { old: Request, new: Request },
}

impl ChangeEvent {
    pub fn new_image(&self) -> &Request {
        match self {
            ChangeEvent::Inserted(r) => r,
            ChangeEvent::StatusChanged { new, .. } => new,
        }
    }
}
