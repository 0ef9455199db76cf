// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use cinarr_domain::{DomainEvent, Item};
use cinarr_infrastructure::state_files::CollectedNotification;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

/// Event publisher abstraction
pub trait EventPublisher: Send + Sync {
    fn publish_json(&self, event: serde_json::Value);
}

/// Serialize a typed event and hand it to `publisher`.
pub fn publish_event<T>(publisher: &dyn EventPublisher, event: &DomainEvent<T>)
where
    T: Serialize,
{
    publisher.publish_json(json!({
        "id": event.id,
        "name": event.name,
        "occurred_at": event.occurred_at,
        "payload": event.payload,
    }));
}

/// A minimal in-memory event bus that stores serialized events.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<serde_json::Value>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(target: "events", "event bus lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve and clear all captured events
    pub fn drain(&self) -> Vec<serde_json::Value> {
        std::mem::take(&mut *self.guard())
    }
}

impl EventPublisher for InMemoryEventBus {
    fn publish_json(&self, event: serde_json::Value) {
        self.guard().push(event);
    }
}

/// Delivers batches of collected-item notifications to the operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_collected(&self, batch: &[CollectedNotification]) -> Result<()>;
}

/// Default notifier: writes one log line per collected item.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_collected(&self, batch: &[CollectedNotification]) -> Result<()> {
        for note in batch {
            info!(
                target: "events",
                item_id = %note.payload.item_id,
                title = %note.payload.title,
                upgrade = note.payload.is_upgrade,
                "collected"
            );
        }
        Ok(())
    }
}

/// Runs after an item reaches Collected, on a clone of the item.
#[async_trait]
pub trait PostProcessingHook: Send + Sync {
    async fn on_collected(&self, item: Item) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopPostProcessing;

#[async_trait]
impl PostProcessingHook for NoopPostProcessing {
    async fn on_collected(&self, _item: Item) -> Result<()> {
        Ok(())
    }
}
