//! Lifecycle events handed to an external webhook delivery worker.
//!
//! The pipeline never waits on delivery: events go into a bounded
//! `tokio::sync::mpsc` queue with `try_send`, and a full queue drops the event.

use crate::model::ProductRecord;
use crate::progress::{JobId, JobSnapshot, JobState};
use crate::store::UpsertKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "product.imported")]
    ProductImported,
    #[serde(rename = "product.created")]
    ProductCreated,
    #[serde(rename = "product.updated")]
    ProductUpdated,
    #[serde(rename = "product.deleted")]
    ProductDeleted,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        Self::ProductImported,
        Self::ProductCreated,
        Self::ProductUpdated,
        Self::ProductDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductImported => "product.imported",
            Self::ProductCreated => "product.created",
            Self::ProductUpdated => "product.updated",
            Self::ProductDeleted => "product.deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: EventType,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

struct TriggerInner {
    tx: Option<mpsc::Sender<WebhookEvent>>,
    subscriptions: RwLock<HashSet<EventType>>,
    dropped: AtomicU64,
}

/// Cheap to clone; all clones share one queue and one subscription set.
#[derive(Clone)]
pub struct EventTrigger {
    inner: Arc<TriggerInner>,
}

impl EventTrigger {
    /// A trigger with no subscriptions yet, and the receiving end for the delivery worker.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WebhookEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::with_sender(Some(tx)), rx)
    }

    /// A trigger that never emits.
    pub fn disabled() -> Self {
        Self::with_sender(None)
    }

    fn with_sender(tx: Option<mpsc::Sender<WebhookEvent>>) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                tx,
                subscriptions: RwLock::new(HashSet::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, event_type: EventType) {
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event_type);
    }

    pub fn unsubscribe(&self, event_type: EventType) {
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&event_type);
    }

    pub fn is_subscribed(&self, event_type: EventType) -> bool {
        self.inner.tx.is_some()
            && self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&event_type)
    }

    /// Events lost because the delivery queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Emit `event_type` if anyone subscribed; `payload` is only built in that case.
    /// Returns whether the event was queued.
    pub fn emit_with(&self, event_type: EventType, payload: impl FnOnce() -> Value) -> bool {
        if !self.is_subscribed(event_type) {
            return false;
        }
        let Some(tx) = &self.inner.tx else {
            return false;
        };
        let event = WebhookEvent {
            event_type,
            payload: payload(),
            emitted_at: Utc::now(),
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = %event.event_type, "event queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(event = %event_type, "event queue closed");
                false
            }
        }
    }

    /// `product.imported`, once per job that finished with at least a partial import.
    pub fn job_finished(&self, job: &JobSnapshot) -> bool {
        if !matches!(
            job.state,
            JobState::Completed | JobState::CompletedWithErrors
        ) {
            return false;
        }
        self.emit_with(EventType::ProductImported, || {
            json!({
                "job_id": job.job_id,
                "state": job.state,
                "count": job.rows_succeeded,
                "created": job.rows_created,
                "updated": job.rows_updated,
                "errors": job.rows_failed,
            })
        })
    }

    /// `product.created` / `product.updated` for one committed record.
    pub fn record_upserted(&self, job_id: JobId, record: &ProductRecord, kind: UpsertKind) -> bool {
        let event_type = match kind {
            UpsertKind::Created => EventType::ProductCreated,
            UpsertKind::Updated => EventType::ProductUpdated,
        };
        self.emit_with(event_type, || {
            json!({
                "job_id": job_id,
                "sku": record.sku,
                "key": record.key,
                "name": record.name,
                "active": record.active,
            })
        })
    }

    /// `product.deleted` after a bulk delete.
    pub fn products_deleted(&self, count: u64) -> bool {
        self.emit_with(EventType::ProductDeleted, || json!({ "count": count }))
    }
}
