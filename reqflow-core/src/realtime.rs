//! Realtime subscription interface.
//!
//! A [`ChannelHandle`] represents one subscription on the remote service.
//! Any number of local consumers can listen on the same handle through
//! [`ChannelHandle::events`], which is what lets the connection pool share a
//! single remote channel between many subscribers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{ReqflowError, Result};

/// Capacity of the per-channel event buffer
const EVENT_BUFFER: usize = 256;

/// What a channel listens to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Event kind: `INSERT`, `UPDATE`, `DELETE` or `*`
    pub event: String,
    pub schema: String,
    pub table: Option<String>,
    /// Row filter in `column=eq.value` form
    pub filter: Option<String>,
}

impl ChannelConfig {
    /// Listen to every change of a table
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            event: "*".to_string(),
            schema: "public".to_string(),
            table: Some(table.into()),
            filter: None,
        }
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// A change notification delivered on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

/// Handle to one remote subscription
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: u64,
    name: String,
    sender: broadcast::Sender<RealtimeEvent>,
}

impl ChannelHandle {
    /// Create a handle with a fresh event buffer
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            id,
            name: name.into(),
            sender,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start receiving events delivered on this channel
    pub fn events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every receiver. Returns how many received it.
    pub fn publish(&self, event: RealtimeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelHandle {}

/// Subscription surface of the remote service
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(&self, name: &str, config: &ChannelConfig) -> Result<ChannelHandle>;

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<()>;
}

/// In-process transport that records subscriptions
#[derive(Default)]
pub struct MemoryTransport {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, ChannelHandle>>,
    subscribe_calls: AtomicU64,
    unsubscribe_calls: AtomicU64,
    reject_subscribe: Mutex<bool>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of channels currently subscribed
    pub fn open_channels(&self) -> usize {
        self.open.lock().len()
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::Relaxed)
    }

    pub fn unsubscribe_calls(&self) -> u64 {
        self.unsubscribe_calls.load(Ordering::Relaxed)
    }

    /// Make subsequent subscriptions fail
    pub fn set_reject_subscribe(&self, reject: bool) {
        *self.reject_subscribe.lock() = reject;
    }

    /// Push an event to every open channel with the given name
    pub fn emit(&self, name: &str, event: &str, payload: Value) -> usize {
        let open = self.open.lock();
        open.values()
            .filter(|h| h.name() == name)
            .map(|h| {
                h.publish(RealtimeEvent {
                    channel: name.to_string(),
                    event: event.to_string(),
                    payload: payload.clone(),
                })
            })
            .sum()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn subscribe(&self, name: &str, _config: &ChannelConfig) -> Result<ChannelHandle> {
        self.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        if *self.reject_subscribe.lock() {
            return Err(ReqflowError::backend(format!(
                "subscription to '{}' rejected",
                name
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ChannelHandle::new(id, name);
        self.open.lock().insert(id, handle.clone());
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<()> {
        self.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);
        self.open.lock().remove(&handle.id());
        Ok(())
    }
}
