//! Minimal real-time chat relay with bounded history and optional
//! durable storage.
//!
//! Clients connect over a WebSocket at `GET /ws`. On connect they
//! receive a `load_messages` event with the most recent messages
//! (bounded, oldest evicted first), then a live stream of
//! `chat_message` events in the order the server accepted them. All
//! connected clients observe the same total order.
//!
//! When a database URL is configured, accepted messages are also
//! persisted to SQLite and replayed across restarts, with rows older
//! than the retention window purged. Persistence is fire-and-forget:
//! a slow or failing store never delays delivery.
//!
//! # Wire protocol
//!
//! Server to client:
//!
//! ```json
//! {"event":"load_messages","data":[{"seq":1,"username":"alice","text":"hi","timestamp":1700000000000}]}
//! {"event":"chat_message","data":{"seq":2,"username":"bob","text":"hey","timestamp":1700000001000}}
//! {"event":"rejected","data":{"reason":"Message text is empty"}}
//! ```
//!
//! Client to server:
//!
//! ```json
//! {"event":"chat_message","data":{"username":"alice","text":"hi"}}
//! ```

pub mod history;
pub mod relay;
pub mod server;
pub mod store;
pub mod types;

pub use history::HistoryCache;
pub use relay::{Relay, SubmitError};
pub use server::{AppState, build_relay, create_router, start_server};
pub use store::{MessageStore, StoreError, StoreWriter, StoredMessage, spawn_store_writer};
pub use types::{ChatMessage, ClientEvent, RelayOptions, ServerEvent, Submission};
