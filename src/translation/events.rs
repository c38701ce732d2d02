/*!
 * Per-session event fan-out.
 *
 * Observers subscribe to one session and receive its events synchronously,
 * in subscription order, on the task that publishes them. A session channel
 * exists while it has subscribers or an attached run; the last
 * `Subscription` or `RunLease` to go away tears it down.
 */

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::database::models::{ChunkRecord, SessionStatus};
use crate::translation::progress::Progress;

/// Event published while a session is translated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TranslationEvent {
    /// A chunk was claimed and is about to be sent to the provider
    #[serde(rename_all = "camelCase")]
    ChunkStart {
        session_id: String,
        chunk_id: i64,
        order: i64,
    },

    /// A chunk call finished, successfully or not
    #[serde(rename_all = "camelCase")]
    ChunkProgress {
        session_id: String,
        chunk: ChunkRecord,
        progress: Progress,
    },

    /// The session changed status
    #[serde(rename_all = "camelCase")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
        progress: Progress,
    },

    /// Every chunk is translated and the document assembled
    #[serde(rename_all = "camelCase")]
    SessionComplete {
        session_id: String,
        translated_text: String,
        progress: Progress,
    },
}

impl TranslationEvent {
    pub fn session_id(&self) -> &str {
        match self {
            TranslationEvent::ChunkStart { session_id, .. }
            | TranslationEvent::ChunkProgress { session_id, .. }
            | TranslationEvent::SessionStatus { session_id, .. }
            | TranslationEvent::SessionComplete { session_id, .. } => session_id,
        }
    }

    /// Chunk id and order, for chunk events
    pub fn chunk_position(&self) -> Option<(i64, i64)> {
        match self {
            TranslationEvent::ChunkStart { chunk_id, order, .. } => Some((*chunk_id, *order)),
            TranslationEvent::ChunkProgress { chunk, .. } => Some((chunk.id, chunk.order)),
            _ => None,
        }
    }
}

/// Event handler callback
pub type EventHandler = Arc<dyn Fn(&TranslationEvent) + Send + Sync>;

#[derive(Default)]
struct SessionChannel {
    subscribers: Vec<(u64, EventHandler)>,
    active_runs: usize,
}

impl SessionChannel {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.active_runs == 0
    }
}

#[derive(Default)]
struct BusInner {
    channels: Mutex<HashMap<String, SessionChannel>>,
    next_id: Mutex<u64>,
}

impl BusInner {
    fn next_subscriber_id(&self) -> u64 {
        let mut next = self.next_id.lock();
        *next += 1;
        *next
    }

    fn remove_subscriber(&self, session_id: &str, subscriber_id: u64) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(session_id) {
            channel.subscribers.retain(|(id, _)| *id != subscriber_id);
            if channel.is_idle() {
                channels.remove(session_id);
                debug!("Event channel closed for session {}", session_id);
            }
        }
    }

    fn release_run(&self, session_id: &str) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(session_id) {
            channel.active_runs = channel.active_runs.saturating_sub(1);
            if channel.is_idle() {
                channels.remove(session_id);
                debug!("Event channel closed for session {}", session_id);
            }
        }
    }
}

/// In-process event bus keyed by session id
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `session_id`
    pub fn subscribe<F>(&self, session_id: &str, handler: F) -> Subscription
    where
        F: Fn(&TranslationEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber_id();
        self.inner
            .channels
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .subscribers
            .push((id, Arc::new(handler)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            session_id: session_id.to_string(),
            id,
            active: true,
        }
    }

    /// Subscribe through an unbounded channel, for async observers
    pub fn subscribe_channel(&self, session_id: &str) -> (Subscription, mpsc::UnboundedReceiver<TranslationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(session_id, move |event| {
            // A dropped receiver just stops listening
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Deliver `event` to the subscribers of `session_id`
    pub fn publish(&self, session_id: &str, event: &TranslationEvent) {
        // Handlers run outside the lock so they may subscribe or unsubscribe
        let handlers: Vec<EventHandler> = match self.inner.channels.lock().get(session_id) {
            Some(channel) => channel.subscribers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        for handler in handlers {
            handler(event);
        }
    }

    /// Keep the session channel alive for the duration of a run
    pub fn attach_run(&self, session_id: &str) -> RunLease {
        self.inner
            .channels
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .active_runs += 1;

        RunLease {
            bus: Arc::downgrade(&self.inner),
            session_id: session_id.to_string(),
        }
    }

    /// Number of live session channels
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Number of subscribers of one session
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(session_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }
}

/// Handle to a registered handler; unsubscribes when dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    session_id: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.bus.upgrade() {
            inner.remove_subscriber(&self.session_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.session_id)
            .field("id", &self.id)
            .finish()
    }
}

/// Keeps a session channel open while a run is active
#[derive(Debug)]
pub struct RunLease {
    bus: Weak<BusInner>,
    session_id: String,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.release_run(&self.session_id);
        }
    }
}
