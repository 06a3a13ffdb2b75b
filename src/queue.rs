//! Durable outbound event queue
//!
//! A bounded FIFO backed by a small embedded SQLite table. Events are
//! appended in emission order, read oldest-first in batches, and deleted
//! only when the hub acks the batch, which gives at-least-once delivery
//! across reconnects. When the queue is full the oldest rows are dropped
//! and a counter is incremented.

use crate::error::{ProbeError, Result};
use crate::types::{DebugEvent, EventBody, StatsSnapshot};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS event_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// Default maximum number of queued events.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Delivery counters, shared with the stats event.
#[derive(Default)]
pub struct QueueMetrics {
    pub enqueued: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

/// Durable FIFO of pending events.
pub struct EventQueue {
    conn: Mutex<Connection>,
    capacity: usize,
    metrics: QueueMetrics,
}

impl EventQueue {
    /// Open (or create) the queue database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ProbeError::queue(format!("Failed to open queue db: {e}")))?;
        Self::from_connection(conn, DEFAULT_CAPACITY)
    }

    /// In-memory queue for tests and persistence-free hosts.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ProbeError::queue(format!("Failed to open in-memory queue: {e}")))?;
        Self::from_connection(conn, DEFAULT_CAPACITY)
    }

    fn from_connection(conn: Connection, capacity: usize) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(|e| ProbeError::queue(format!("Failed to set queue PRAGMAs: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| ProbeError::queue(format!("Failed to create queue schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            capacity,
            metrics: QueueMetrics::default(),
        })
    }

    /// Override the capacity (events beyond it evict the oldest rows).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Append one event. On overflow the oldest rows are dropped first.
    pub fn enqueue(&self, event: &DebugEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let conn = self.conn.lock().expect("queue lock");
        conn.execute(
            "INSERT INTO event_queue (payload, created_at) VALUES (?1, ?2)",
            params![payload, event.timestamp.to_rfc3339()],
        )
        .map_err(|e| ProbeError::queue(e.to_string()))?;
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);

        let depth: i64 = conn
            .query_row("SELECT COUNT(*) FROM event_queue", [], |row| row.get(0))
            .map_err(|e| ProbeError::queue(e.to_string()))?;
        let excess = depth.saturating_sub(self.capacity as i64);
        if excess > 0 {
            conn.execute(
                "DELETE FROM event_queue WHERE id IN \
                 (SELECT id FROM event_queue ORDER BY id ASC LIMIT ?1)",
                params![excess],
            )
            .map_err(|e| ProbeError::queue(e.to_string()))?;
            self.metrics.dropped.fetch_add(excess as u64, Ordering::Relaxed);
            warn!(dropped = excess, "Event queue overflow, dropped oldest events");
        }
        Ok(())
    }

    /// Read (without deleting) the oldest `limit` events. Rows that no
    /// longer parse are purged and counted as dropped.
    pub fn peek_batch(&self, limit: usize) -> Result<Vec<(i64, DebugEvent)>> {
        self.peek_batch_after(0, limit)
    }

    /// Like `peek_batch`, but only rows with id greater than `after`.
    /// The bridge uses this as a send watermark so un-acked in-flight
    /// batches are not re-sent within one connection.
    pub fn peek_batch_after(&self, after: i64, limit: usize) -> Result<Vec<(i64, DebugEvent)>> {
        let conn = self.conn.lock().expect("queue lock");
        let mut stmt = conn
            .prepare("SELECT id, payload FROM event_queue WHERE id > ?1 ORDER BY id ASC LIMIT ?2")
            .map_err(|e| ProbeError::queue(e.to_string()))?;
        let rows = stmt
            .query_map(params![after, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| ProbeError::queue(e.to_string()))?;

        let mut batch = Vec::new();
        let mut corrupt = Vec::new();
        for row in rows {
            let (id, payload) = row.map_err(|e| ProbeError::queue(e.to_string()))?;
            match serde_json::from_str::<DebugEvent>(&payload) {
                Ok(event) => batch.push((id, event)),
                Err(e) => {
                    warn!(row_id = id, error = %e, "Dropping unparseable queued event");
                    corrupt.push(id);
                }
            }
        }
        drop(stmt);
        if !corrupt.is_empty() {
            Self::delete_rows(&conn, &corrupt)?;
            self.metrics.dropped.fetch_add(corrupt.len() as u64, Ordering::Relaxed);
        }
        Ok(batch)
    }

    /// Delete acked rows and count them as delivered.
    pub fn ack(&self, row_ids: &[i64]) -> Result<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().expect("queue lock");
        Self::delete_rows(&conn, row_ids)?;
        self.metrics.delivered.fetch_add(row_ids.len() as u64, Ordering::Relaxed);
        debug!(count = row_ids.len(), "Acked event batch");
        Ok(())
    }

    fn delete_rows(conn: &Connection, row_ids: &[i64]) -> Result<()> {
        // Queue batches are small (tens of rows), far below SQLite's bind
        // parameter limit.
        let placeholders = vec!["?"; row_ids.len()].join(",");
        let sql = format!("DELETE FROM event_queue WHERE id IN ({placeholders})");
        conn.execute(&sql, rusqlite::params_from_iter(row_ids.iter()))
            .map_err(|e| ProbeError::queue(e.to_string()))?;
        Ok(())
    }

    /// Number of events currently queued.
    pub fn depth(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("queue lock");
        let depth: i64 = conn
            .query_row("SELECT COUNT(*) FROM event_queue", [], |row| row.get(0))
            .map_err(|e| ProbeError::queue(e.to_string()))?;
        Ok(depth as u64)
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Counter snapshot for the stats event.
    pub fn stats(&self, bridge_state: &str) -> StatsSnapshot {
        StatsSnapshot {
            events_enqueued: self.metrics.enqueued.load(Ordering::Relaxed),
            events_delivered: self.metrics.delivered.load(Ordering::Relaxed),
            events_dropped: self.metrics.dropped.load(Ordering::Relaxed),
            queue_depth: self.depth().unwrap_or(0),
            bridge_state: bridge_state.to_string(),
        }
    }
}

/// One-way event emitter handed to plugins through the context.
///
/// Emission is synchronous: the event is serialized and appended to the
/// durable queue on the caller's thread, preserving per-source ordering.
/// A serialization failure drops the event and increments the dropped
/// counter; emission never fails into the host.
#[derive(Clone)]
pub struct EventEmitter {
    queue: Arc<EventQueue>,
    wakeup: Arc<Notify>,
}

impl EventEmitter {
    pub fn new(queue: Arc<EventQueue>, wakeup: Arc<Notify>) -> Self {
        Self { queue, wakeup }
    }

    /// Wrap a body into a DebugEvent (fresh id + timestamp) and enqueue it.
    pub fn emit(&self, body: EventBody) {
        self.emit_event(DebugEvent::new(body));
    }

    pub fn emit_event(&self, event: DebugEvent) {
        match self.queue.enqueue(&event) {
            Ok(()) => self.wakeup.notify_one(),
            Err(e) => {
                self.queue.metrics().dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Failed to enqueue event, dropping");
            }
        }
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}
