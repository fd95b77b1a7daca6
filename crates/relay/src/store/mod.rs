//! Durable message storage.
//!
//! Best-effort persistence on SQLite via diesel, with time-based
//! expiry. Unavailability is a capability downgrade, never a fatal
//! error: the relay keeps serving from memory, and write failures are
//! logged and swallowed so they can never delay or fail a broadcast.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::{debug, info, warn};

use crate::types::ChatMessage;

mod models;
pub mod schema;

use models::NewMessageRow;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./src/store/migrations");

/// How long to wait for a pooled connection before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the writer thread purges expired rows.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Writer queue capacity. When full, the write is dropped and logged;
/// the message has already reached the cache and every subscriber.
const WRITE_QUEUE_CAPACITY: usize = 1024;

pub type PooledConnection = diesel::r2d2::PooledConnection<ConnectionManager<SqliteConnection>>;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database migration error: {0}")]
    Migration(Box<dyn std::error::Error + Send + Sync>),

    #[error("Failed to insert message: {0}")]
    Insert(diesel::result::Error),

    #[error("Failed to load messages: {0}")]
    Load(diesel::result::Error),

    #[error("Failed to purge expired messages: {0}")]
    Purge(diesel::result::Error),
}

/// A message row loaded from durable storage, before the relay assigns
/// a session sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub username: String,
    pub text: String,
    pub timestamp: i64,
}

/// SQLite-backed message store with a fixed retention window.
pub struct MessageStore {
    pool: DbPool,
    retention_seconds: u64,
}

impl MessageStore {
    /// Open (or create) the database and run pending migrations.
    pub fn open(database_url: &str, retention_seconds: u64) -> StoreResult<Self> {
        debug!("Establishing connection to database at {}", database_url);
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        // One connection: writes are serialized on the writer thread,
        // and `:memory:` URLs get a separate database per connection.
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(CONNECT_TIMEOUT)
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut conn = pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        debug!("Running database migrations");
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(StoreError::Migration)?;

        Ok(Self {
            pool,
            retention_seconds,
        })
    }

    /// Load up to `limit` most-recent, non-expired messages in
    /// ascending timestamp order. Used to seed the history cache at
    /// boot.
    pub fn load_recent(&self, limit: usize) -> StoreResult<Vec<StoredMessage>> {
        let mut conn = self.conn()?;
        let cutoff = self.expiry_cutoff();
        models::load_recent(&mut conn, cutoff, limit as i64).map_err(StoreError::Load)
    }

    /// Persist one accepted message.
    pub fn save(&self, message: &ChatMessage) -> StoreResult<()> {
        let mut conn = self.conn()?;
        NewMessageRow::from(message)
            .insert(&mut conn)
            .map_err(StoreError::Insert)?;
        Ok(())
    }

    /// Delete rows older than the retention window. Returns the number
    /// of rows removed.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let cutoff = self.expiry_cutoff();
        models::purge_older_than(&mut conn, cutoff).map_err(StoreError::Purge)
    }

    /// Timestamp (ms) below which a row counts as expired.
    fn expiry_cutoff(&self) -> i64 {
        Utc::now().timestamp_millis() - (self.retention_seconds as i64) * 1000
    }

    fn conn(&self) -> StoreResult<PooledConnection> {
        self.pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

/// Handle used by the relay to hand accepted messages to the writer
/// thread. Sends never block and never fail the broadcast path.
#[derive(Clone)]
pub struct StoreWriter {
    tx: Sender<ChatMessage>,
}

impl StoreWriter {
    pub fn save(&self, message: &ChatMessage) {
        if self.tx.try_send(message.clone()).is_err() {
            warn!(
                seq = message.seq,
                "Write queue unavailable, message stored in memory only"
            );
        }
    }
}

/// Spawn the dedicated writer thread. It drains the write queue and
/// purges expired rows on a fixed interval; both paths swallow and log
/// failures. The thread stops once every [`StoreWriter`] is dropped.
pub fn spawn_store_writer(store: Arc<MessageStore>) -> (StoreWriter, JoinHandle<()>) {
    spawn_store_writer_with_interval(store, PURGE_INTERVAL)
}

fn spawn_store_writer_with_interval(
    store: Arc<MessageStore>,
    purge_interval: Duration,
) -> (StoreWriter, JoinHandle<()>) {
    let (tx, rx) = bounded::<ChatMessage>(WRITE_QUEUE_CAPACITY);

    let handle = thread::spawn(move || {
        info!("Durable store writer thread started");
        // Purges are due by elapsed time, not queue idleness, so a
        // steady stream of writes cannot starve them.
        let mut last_purge = Instant::now();
        loop {
            match rx.recv_timeout(purge_interval) {
                Ok(message) => {
                    if let Err(e) = store.save(&message) {
                        warn!(
                            seq = message.seq,
                            error = %e,
                            "DB save failed, message kept in memory"
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_purge.elapsed() >= purge_interval {
                match store.purge_expired() {
                    Ok(0) => {}
                    Ok(rows) => debug!(rows, "Purged expired messages"),
                    Err(e) => warn!(error = %e, "Failed to purge expired messages"),
                }
                last_purge = Instant::now();
            }
        }
        info!("Durable store writer thread stopped");
    });

    (StoreWriter { tx }, handle)
}
