//! # Durable store-and-forward queue.
//!
//! [`PersistentQueue`] is a crash-safe FIFO of telemetry payloads backed
//! by a single SQLite file. Each enqueue and each removal commits on its
//! own, so abrupt power loss never corrupts the index. A single database
//! also keeps IOPS far below one-file-per-payload spooling, which matters
//! for flash wear on SD-card gateways.
//!
//! ## Rules
//! - Entries are ordered by ascending auto-increment `id`; reads return
//!   oldest first.
//! - `synchronous=FULL` + WAL: every commit reaches stable storage.
//! - An optional row cap evicts the oldest entries (FIFO) on overflow.
//! - On Unix the state directory is `0750` and the database file `0600`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::TelemetryError;
use crate::telemetry::payload::TelemetryPayload;

/// DDL for the queue table.
const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS telemetry_queue (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    payload       BLOB NOT NULL,
    enqueued_at   INTEGER NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0
);
";

/// One row read back from the queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Queue row id (ascending enqueue order).
    pub id: i64,
    /// The stored payload.
    pub payload: TelemetryPayload,
    /// Unix seconds at enqueue time.
    pub enqueued_at: i64,
    /// How many delivery attempts this row has survived.
    pub attempt_count: u32,
}

/// SQLite-backed durable FIFO of telemetry payloads.
pub struct PersistentQueue {
    conn: Mutex<Connection>,
    max_rows: Option<u64>,
}

impl PersistentQueue {
    /// Opens (or creates) the queue at `path`.
    ///
    /// Creates the parent directory when missing. `max_rows` of `None`
    /// keeps retention unbounded.
    pub fn open(path: &Path, max_rows: Option<u64>) -> Result<Self, TelemetryError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            restrict_permissions(dir, 0o750);
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        conn.execute_batch(SCHEMA)?;

        #[cfg(unix)]
        restrict_permissions(path, 0o600);

        info!(path = %path.display(), "telemetry queue opened");
        Ok(Self {
            conn: Mutex::new(conn),
            max_rows,
        })
    }

    /// Opens an in-memory queue (tests).
    pub fn open_in_memory(max_rows: Option<u64>) -> Result<Self, TelemetryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_rows,
        })
    }

    /// Appends a payload; returns its queue id.
    pub fn enqueue(&self, payload: &TelemetryPayload) -> Result<i64, TelemetryError> {
        let bytes = serde_json::to_vec(payload)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let conn = self.conn.lock().expect("queue lock poisoned");
        conn.execute(
            "INSERT INTO telemetry_queue (payload, enqueued_at) VALUES (?1, ?2)",
            rusqlite::params![bytes, now],
        )?;
        let id = conn.last_insert_rowid();

        if let Some(cap) = self.max_rows {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM telemetry_queue", [], |r| r.get(0))?;
            let excess = count - cap as i64;
            if excess > 0 {
                conn.execute(
                    "DELETE FROM telemetry_queue WHERE id IN \
                     (SELECT id FROM telemetry_queue ORDER BY id ASC LIMIT ?1)",
                    rusqlite::params![excess],
                )?;
                warn!(evicted = excess, cap, "queue over capacity, evicted oldest rows");
            }
        }

        Ok(id)
    }

    /// Returns up to `limit` oldest entries in ascending id order.
    ///
    /// A row whose payload no longer decodes is deleted and skipped: it
    /// can never be delivered and would block the queue head forever.
    pub fn peek_batch(&self, limit: usize) -> Result<Vec<QueueEntry>, TelemetryError> {
        let conn = self.conn.lock().expect("queue lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, payload, enqueued_at, attempt_count FROM telemetry_queue \
             ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        let mut corrupt: Vec<i64> = Vec::new();
        for row in rows {
            let (id, bytes, enqueued_at, attempts) = row?;
            match serde_json::from_slice::<TelemetryPayload>(&bytes) {
                Ok(payload) => entries.push(QueueEntry {
                    id,
                    payload,
                    enqueued_at,
                    attempt_count: attempts.max(0) as u32,
                }),
                Err(e) => {
                    warn!(id, error = %e, "dropping undecodable queue row");
                    corrupt.push(id);
                }
            }
        }
        drop(stmt);
        for id in corrupt {
            conn.execute(
                "DELETE FROM telemetry_queue WHERE id = ?1",
                rusqlite::params![id],
            )?;
        }
        Ok(entries)
    }

    /// Removes a delivered entry.
    pub fn remove(&self, id: i64) -> Result<(), TelemetryError> {
        let conn = self.conn.lock().expect("queue lock poisoned");
        conn.execute(
            "DELETE FROM telemetry_queue WHERE id = ?1",
            rusqlite::params![id],
        )?;
        Ok(())
    }

    /// Records one more failed delivery attempt for an entry.
    pub fn bump_attempt(&self, id: i64) -> Result<(), TelemetryError> {
        let conn = self.conn.lock().expect("queue lock poisoned");
        conn.execute(
            "UPDATE telemetry_queue SET attempt_count = attempt_count + 1 WHERE id = ?1",
            rusqlite::params![id],
        )?;
        Ok(())
    }

    /// Number of queued entries.
    pub fn len(&self) -> Result<u64, TelemetryError> {
        let conn = self.conn.lock().expect("queue lock poisoned");
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM telemetry_queue", [], |r| r.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// True when the queue holds no entries.
    pub fn is_empty(&self) -> Result<bool, TelemetryError> {
        Ok(self.len()? == 0)
    }

    /// Imports legacy per-payload `*.json` spill files from `dir` into the
    /// queue, deleting each file after a successful import. Files that do
    /// not parse are moved to `dir/.quarantine/` instead of being lost.
    ///
    /// Returns the number of payloads imported.
    pub fn import_spill_dir(&self, dir: &Path) -> Result<usize, TelemetryError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };

        let mut imported = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<TelemetryPayload>(&bytes).map_err(|e| e.to_string())
                }) {
                Ok(payload) => {
                    self.enqueue(&payload)?;
                    let _ = std::fs::remove_file(&path);
                    imported += 1;
                }
                Err(reason) => {
                    warn!(file = %path.display(), reason, "quarantining unreadable spill file");
                    quarantine(dir, &path);
                }
            }
        }
        if imported > 0 {
            info!(imported, "migrated legacy spill files into the queue");
        }
        Ok(imported)
    }
}

fn quarantine(dir: &Path, file: &Path) {
    let qdir: PathBuf = dir.join(".quarantine");
    if std::fs::create_dir_all(&qdir).is_ok() {
        if let Some(name) = file.file_name() {
            let _ = std::fs::rename(file, qdir.join(name));
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(n: u32) -> TelemetryPayload {
        TelemetryPayload::new("edge-test", "event", json!({ "n": n }))
    }

    #[test]
    fn enqueue_then_peek_is_fifo() {
        let q = PersistentQueue::open_in_memory(None).unwrap();
        for n in 0..5 {
            q.enqueue(&payload(n)).unwrap();
        }
        let batch = q.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 5);
        for (i, entry) in batch.iter().enumerate() {
            assert_eq!(entry.payload.body["n"], i as u64);
        }
        assert!(batch.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn remove_and_bump() {
        let q = PersistentQueue::open_in_memory(None).unwrap();
        let id = q.enqueue(&payload(1)).unwrap();
        q.bump_attempt(id).unwrap();
        q.bump_attempt(id).unwrap();
        let batch = q.peek_batch(1).unwrap();
        assert_eq!(batch[0].attempt_count, 2);
        q.remove(id).unwrap();
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn round_trip_preserves_payload() {
        let q = PersistentQueue::open_in_memory(None).unwrap();
        let p = payload(42);
        q.enqueue(&p).unwrap();
        let got = q.peek_batch(1).unwrap().remove(0);
        assert_eq!(got.payload, p);
    }

    #[test]
    fn cap_evicts_oldest_rows() {
        let q = PersistentQueue::open_in_memory(Some(3)).unwrap();
        for n in 0..5 {
            q.enqueue(&payload(n)).unwrap();
        }
        let batch = q.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 3);
        // The two oldest entries were evicted.
        assert_eq!(batch[0].payload.body["n"], 2);
    }

    #[test]
    fn survives_reopen_with_order_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");
        {
            let q = PersistentQueue::open(&path, None).unwrap();
            for n in 0..3 {
                q.enqueue(&payload(n)).unwrap();
            }
        }
        let q = PersistentQueue::open(&path, None).unwrap();
        let batch = q.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].payload.body["n"], 0);
        assert_eq!(batch[2].payload.body["n"], 2);
    }

    #[test]
    fn spill_dir_import_and_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let good = payload(7);
        std::fs::write(
            dir.path().join("spill-1.json"),
            serde_json::to_vec(&good).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.json"), b"not json at all").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), b"whatever").unwrap();

        let q = PersistentQueue::open_in_memory(None).unwrap();
        let imported = q.import_spill_dir(dir.path()).unwrap();
        assert_eq!(imported, 1);
        assert_eq!(q.len().unwrap(), 1);
        assert!(!dir.path().join("spill-1.json").exists());
        assert!(dir.path().join(".quarantine/bad.json").exists());
        assert!(dir.path().join("ignored.txt").exists());
    }
}
