//! The relay core: the single choke point through which every inbound
//! message passes before reaching subscribers.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::history::HistoryCache;
use crate::store::{StoreWriter, StoredMessage};
use crate::types::{ChatMessage, RelayOptions};

/// Broadcast channel capacity.
const BROADCAST_CAPACITY: usize = 1024;

/// Validation failures surfaced to the submitting client. These are
/// the only errors a sender ever sees; persistence failures never
/// surface.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Message text is empty")]
    EmptyText,

    #[error("Message text exceeds {max} characters (got {len})")]
    TextTooLong { len: usize, max: usize },

    #[error("Username is empty")]
    EmptyUsername,
}

struct SubmitState {
    next_seq: u64,
    last_timestamp: i64,
}

/// Owns the history cache, the subscriber fan-out channel, and the
/// optional durable store writer. All mutation funnels through
/// [`submit`](Self::submit), serialized by a single lock, which makes
/// the broadcast order identical to the cache-append order: a strict
/// global total order as observed by every subscriber.
pub struct Relay {
    history: HistoryCache,
    tx: broadcast::Sender<ChatMessage>,
    writer: Option<StoreWriter>,
    state: Mutex<SubmitState>,
    max_text_len: usize,
}

impl Relay {
    /// Create a memory-only relay.
    pub fn new(options: &RelayOptions) -> Arc<Self> {
        Self::with_writer(options, None)
    }

    /// Create a relay that hands accepted messages to a durable store
    /// writer. `None` runs memory-only.
    pub fn with_writer(options: &RelayOptions, writer: Option<StoreWriter>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            history: HistoryCache::new(options.history_capacity),
            tx,
            writer,
            state: Mutex::new(SubmitState {
                next_seq: 1,
                last_timestamp: 0,
            }),
            max_text_len: options.max_text_len,
        })
    }

    /// Seed the history cache from durable storage. Seeded messages
    /// are renumbered so `seq` stays strictly increasing within this
    /// process, and the clock floor is advanced past the newest
    /// seeded timestamp.
    pub fn seed(&self, stored: Vec<StoredMessage>) {
        if stored.is_empty() {
            return;
        }

        let seeded: Vec<ChatMessage> = {
            let mut state = self.state.lock();
            stored
                .into_iter()
                .map(|row| {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.last_timestamp = state.last_timestamp.max(row.timestamp);
                    ChatMessage {
                        seq,
                        username: row.username,
                        text: row.text,
                        timestamp: row.timestamp,
                    }
                })
                .collect()
        };

        info!(count = seeded.len(), "Seeded history from durable store");
        self.history.seed(seeded);
    }

    /// Accept one inbound submission: validate, assign `seq` and
    /// timestamp, append to the history cache, broadcast, and hand off
    /// to the durable writer.
    ///
    /// The cache append and the broadcast send happen under one lock,
    /// so every subscriber observes submissions in completion order.
    /// Persistence happens after the lock is released and never delays
    /// delivery.
    pub fn submit(&self, username: &str, raw_text: &str) -> Result<ChatMessage, SubmitError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SubmitError::EmptyUsername);
        }

        let text = raw_text.trim();
        if text.is_empty() {
            return Err(SubmitError::EmptyText);
        }
        let len = text.chars().count();
        if len > self.max_text_len {
            return Err(SubmitError::TextTooLong {
                len,
                max: self.max_text_len,
            });
        }

        let message = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            // Clamp against the previous message so timestamps never
            // go backwards in seq order.
            let timestamp = Utc::now().timestamp_millis().max(state.last_timestamp);
            state.last_timestamp = timestamp;

            let message = ChatMessage {
                seq,
                username: username.to_string(),
                text: text.to_string(),
                timestamp,
            };
            self.history.append(message.clone());
            // A send error only means no subscribers are connected.
            let _ = self.tx.send(message.clone());
            message
        };

        if let Some(writer) = &self.writer {
            writer.save(&message);
        }

        debug!(seq = message.seq, username = %message.username, "Accepted message");
        Ok(message)
    }

    /// Register a subscriber: returns the history snapshot and a live
    /// receiver. Registration and snapshot are taken under the submit
    /// lock, so a concurrent submission lands in exactly one of the
    /// two: the snapshot or the receiver, never both, never neither.
    pub fn subscribe(&self) -> (Vec<ChatMessage>, broadcast::Receiver<ChatMessage>) {
        let _state = self.state.lock();
        let rx = self.tx.subscribe();
        let snapshot = self.history.snapshot();
        (snapshot, rx)
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn history(&self) -> &HistoryCache {
        &self.history
    }

    /// Whether accepted messages are also being persisted.
    pub fn durable(&self) -> bool {
        self.writer.is_some()
    }
}
