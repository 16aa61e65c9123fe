use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rusqlite::{params, Connection};
use serde::{Serialize, Deserialize};
use std::{
    fmt,
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use uuid::Uuid;

use crate::modules::{
    contact::ContactPayload,
    error::RelayError,
};

// Queued rows are only ever inserted or deleted. Delivery failures live in their
// own table so annotating an entry never rewrites the entry itself
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS queued_submissions (
        key           INTEGER PRIMARY KEY AUTOINCREMENT,
        submission_id TEXT    NOT NULL,
        payload       TEXT    NOT NULL,
        enqueued_at   TEXT    NOT NULL,
        offline       INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE IF NOT EXISTS delivery_failures (
        key        INTEGER PRIMARY KEY,
        last_error TEXT    NOT NULL,
        failed_at  TEXT    NOT NULL
    );
";

// Identity of a queued submission, a monotonic counter assigned on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey(pub i64);

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// One form submission waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedSubmission {
    // Position in the queue, insertion order is key order
    pub key: QueueKey,
    // Sent along with every delivery attempt so the destination can dedupe
    pub submission_id: Uuid,
    // The submission itself, never changed after enqueue
    pub payload: ContactPayload,
    // Time of enqueue, in UTC
    pub enqueued_at: DateTime<Utc>,
    // Marks the submission as stored while offline
    pub offline: bool,
    // Most recent failed delivery, if any
    pub last_error: Option<String>,
}

// Durable FIFO of pending submissions backed by SQLite.
// Shared between the dispatcher and the sync worker behind an `Arc`
pub struct SubmissionQueue {
    conn: Mutex<Connection>,
}

impl SubmissionQueue {

    // Open (or create) the queue database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RelayError::StorageUnavailable(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Queue database {:?} opened in {} mode", path, mode);

        Self::with_connection(conn)
    }

    // Volatile queue, used where persistence across restarts is not needed
    pub fn open_in_memory() -> Result<Self, RelayError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|_| RelayError::StorageUnavailable("queue connection poisoned".to_string()))
    }

    // Store a new submission, returning its key
    pub fn enqueue(&self, payload: &ContactPayload) -> Result<QueueKey, RelayError> {
        self.enqueue_with_id(payload, Uuid::new_v4())
    }

    // Store a submission that already went out once under `submission_id`,
    // so a resend can be matched with the earlier attempt
    pub fn enqueue_with_id(&self, payload: &ContactPayload, submission_id: Uuid) -> Result<QueueKey, RelayError> {
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| RelayError::JsonSerializationError(e.to_string()))?;
        let enqueued_at = Utc::now();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO queued_submissions (submission_id, payload, enqueued_at, offline)
             VALUES (?1, ?2, ?3, 1)",
            params![submission_id.to_string(), payload_json, enqueued_at.to_rfc3339()],
        )?;
        let key = QueueKey(conn.last_insert_rowid());

        info!("Submission {} stored offline as {}", submission_id, key);
        Ok(key)
    }

    // All pending submissions in insertion order
    pub fn list_pending(&self) -> Result<Vec<QueuedSubmission>, RelayError> {
        let rows = {
            let conn = self.lock()?;
            let mut statement = conn.prepare(
                "SELECT q.key, q.submission_id, q.payload, q.enqueued_at, q.offline, f.last_error
                 FROM queued_submissions q
                 LEFT JOIN delivery_failures f ON f.key = q.key
                 ORDER BY q.key ASC",
            )?;
            let rows = statement
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }; // Release the connection before decoding

        let mut pending = Vec::with_capacity(rows.len());
        for (key, submission_id, payload, enqueued_at, offline, last_error) in rows {
            // An undecodable row stays in the table untouched, it is only left out of the listing
            match decode_row(key, &submission_id, &payload, &enqueued_at, offline, last_error) {
                Ok(submission) => pending.push(submission),
                Err(e) => error!("Skipping unreadable queue entry #{}: {}", key, e),
            }
        }
        Ok(pending)
    }

    // Delete one entry. Removing an absent key is not an error
    pub fn remove(&self, key: QueueKey) -> Result<(), RelayError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM queued_submissions WHERE key = ?1", params![key.0])?;
        tx.execute("DELETE FROM delivery_failures WHERE key = ?1", params![key.0])?;
        tx.commit()?;

        if removed > 0 {
            debug!("Queue entry {} removed", key);
        }
        Ok(())
    }

    // Remember why the last delivery of `key` failed. Absent keys are ignored
    pub fn record_failure(&self, key: QueueKey, reason: &str) -> Result<(), RelayError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO delivery_failures (key, last_error, failed_at)
             SELECT key, ?2, ?3 FROM queued_submissions WHERE key = ?1
             ON CONFLICT(key) DO UPDATE SET last_error = excluded.last_error, failed_at = excluded.failed_at",
            params![key.0, reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // Empty the queue. Maintenance only, never part of a drain
    pub fn clear_all(&self) -> Result<(), RelayError> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM queued_submissions; DELETE FROM delivery_failures;")?;
        info!("Offline queue cleared");
        Ok(())
    }

    // Number of pending submissions
    pub fn len(&self) -> Result<usize, RelayError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM queued_submissions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // Make every following statement fail, as a vanished database would
    #[cfg(test)]
    pub(crate) fn break_storage(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("DROP TABLE queued_submissions; DROP TABLE delivery_failures;").unwrap();
    }
}

fn decode_row(
    key: i64,
    submission_id: &str,
    payload: &str,
    enqueued_at: &str,
    offline: bool,
    last_error: Option<String>,
) -> Result<QueuedSubmission, RelayError> {
    let submission_id = Uuid::parse_str(submission_id)
        .map_err(|e| RelayError::JsonDeserializationError(e.to_string()))?;
    let payload: ContactPayload = serde_json::from_str(payload)
        .map_err(|e| RelayError::JsonDeserializationError(e.to_string()))?;
    let enqueued_at = DateTime::parse_from_rfc3339(enqueued_at)
        .map_err(|e| RelayError::JsonDeserializationError(e.to_string()))?
        .with_timezone(&Utc);

    Ok(QueuedSubmission {
        key: QueueKey(key),
        submission_id,
        payload,
        enqueued_at,
        offline,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::contact::sample_payload;

    #[test]
    fn lists_in_insertion_order() {
        let queue = SubmissionQueue::open_in_memory().unwrap();
        let a = queue.enqueue(&sample_payload("Ana")).unwrap();
        let b = queue.enqueue(&sample_payload("Beto")).unwrap();
        let c = queue.enqueue(&sample_payload("Carla")).unwrap();

        let pending = queue.list_pending().unwrap();
        let keys: Vec<_> = pending.iter().map(|s| s.key).collect();
        assert_eq!(keys, vec![a, b, c]);
        assert_eq!(pending[1].payload, sample_payload("Beto"));
        assert!(pending.iter().all(|s| s.offline && s.last_error.is_none()));
    }

    #[test]
    fn enqueue_keeps_given_submission_id() {
        let queue = SubmissionQueue::open_in_memory().unwrap();
        let submission_id = Uuid::new_v4();
        queue.enqueue_with_id(&sample_payload("Ana"), submission_id).unwrap();
        queue.enqueue(&sample_payload("Beto")).unwrap();

        let pending = queue.list_pending().unwrap();
        assert_eq!(pending[0].submission_id, submission_id);
        assert_ne!(pending[1].submission_id, submission_id);
    }

    #[test]
    fn remove_absent_key_is_a_no_op() {
        let queue = SubmissionQueue::open_in_memory().unwrap();
        queue.enqueue(&sample_payload("Ana")).unwrap();
        let before = queue.list_pending().unwrap();

        queue.remove(QueueKey(9999)).unwrap();

        assert_eq!(queue.list_pending().unwrap(), before);
    }

    #[test]
    fn remove_is_idempotent() {
        let queue = SubmissionQueue::open_in_memory().unwrap();
        let key = queue.enqueue(&sample_payload("Ana")).unwrap();
        queue.remove(key).unwrap();
        queue.remove(key).unwrap();
        assert_eq!(queue.len().unwrap(), 0);
    }

    #[test]
    fn failures_annotate_without_touching_payload() {
        let queue = SubmissionQueue::open_in_memory().unwrap();
        let key = queue.enqueue(&sample_payload("Ana")).unwrap();
        let original = queue.list_pending().unwrap().remove(0);

        queue.record_failure(key, "first").unwrap();
        queue.record_failure(key, "second").unwrap();
        queue.record_failure(QueueKey(42), "ghost").unwrap();

        let entry = queue.list_pending().unwrap().remove(0);
        assert_eq!(entry.last_error.as_deref(), Some("second"));
        assert_eq!(entry.payload, original.payload);
        assert_eq!(entry.submission_id, original.submission_id);
        assert_eq!(entry.enqueued_at, original.enqueued_at);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn removed_entry_drops_its_failure() {
        let queue = SubmissionQueue::open_in_memory().unwrap();
        let key = queue.enqueue(&sample_payload("Ana")).unwrap();
        queue.record_failure(key, "refused").unwrap();
        queue.remove(key).unwrap();

        let next = queue.enqueue(&sample_payload("Beto")).unwrap();
        assert_ne!(next, key);
        assert_eq!(queue.list_pending().unwrap()[0].last_error, None);
    }

    #[test]
    fn clear_all_empties_queue() {
        let queue = SubmissionQueue::open_in_memory().unwrap();
        queue.enqueue(&sample_payload("Ana")).unwrap();
        queue.enqueue(&sample_payload("Beto")).unwrap();
        queue.clear_all().unwrap();
        assert!(queue.list_pending().unwrap().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.sqlite");

        let key = {
            let queue = SubmissionQueue::open(&path).unwrap();
            queue.enqueue(&sample_payload("Ana")).unwrap()
        };

        let reopened = SubmissionQueue::open(&path).unwrap();
        let pending = reopened.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, key);
        assert_eq!(pending[0].payload, sample_payload("Ana"));
    }

    #[test]
    fn unopenable_path_is_storage_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the database file should be
        let result = SubmissionQueue::open(dir.path());
        assert!(matches!(result, Err(RelayError::StorageUnavailable(_))));
    }
}
