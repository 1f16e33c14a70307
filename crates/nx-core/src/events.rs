//! Pipeline event system for the UI layer.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late-joining subscribers can catch up.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Severity;
use crate::ids::RequestId;
use crate::media::{FileDescriptor, PipelineState};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Request lifecycle ---------------------------------------------------
    RequestSubmitted {
        filename: String,
    },
    StateChanged {
        state: PipelineState,
    },

    // -- Preparation ---------------------------------------------------------
    NeedsTranscoding {
        video_ok: bool,
        audio_ok: bool,
    },
    ProgressUpdated {
        percent: u8,
    },
    Notice {
        category: Severity,
        message: String,
    },
    FileReady {
        descriptor: Box<FileDescriptor>,
    },

    // -- Streaming -----------------------------------------------------------
    ChunkSent {
        index: u64,
        bytes_sent: u64,
    },
    StreamCompleted {
        chunks: u64,
        bytes: u64,
    },

    // -- Terminal ------------------------------------------------------------
    Failed {
        category: Severity,
        reason: String,
    },
    Cancelled,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event tied to the request that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Request the event belongs to.
    pub request_id: RequestId,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(request_id: RequestId, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request_id,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size (not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    /// Subscribe to the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn broadcast(&self, request_id: RequestId, payload: EventPayload) {
        let event = Event::new(request_id, payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // Ignore send errors (no subscribers).
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
