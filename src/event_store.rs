//! SQLite-backed persistence: dedupe by content hash, recent-drop queries,
//! and the `timeout`/`bad`/`invalid` marker tables.
//!
//! Exactly one task is expected to hold an [`EventStore`] at a time (see
//! [`crate::policy::PolicyEngine`]), so batching is implemented with a plain
//! `AtomicBool` dirty flag rather than a lock.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::line_parser::{Direction, Event};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("event already recorded")]
    EventExists,
}

/// A row read back out of the `events` table. Narrower than [`Event`]: the
/// bit-exact schema only persists the fields operators have historically
/// needed to triage a repeat offender, not the full parsed record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub hash: String,
    pub hostname: String,
    pub r#in: Option<String>,
    pub out: Option<String>,
    pub src: String,
    pub src_mac: String,
    pub dst: String,
    pub dst_mac: String,
    pub spt: i64,
    pub dpt: i64,
    pub direction: Direction,
    pub timestamp: i64,
    pub line: String,
}

fn direction_from_str(s: &str) -> Direction {
    match s {
        "inbound" => Direction::Inbound,
        "outbound" => Direction::Outbound,
        _ => Direction::Forward,
    }
}

pub struct EventStore {
    pool: SqlitePool,
    dirty: AtomicBool,
}

impl EventStore {
    pub async fn open(db_file: &str, log: &slog::Logger) -> Result<EventStore, StoreError> {
        let options = if db_file.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(db_file)?.create_if_missing(true)
        } else {
            SqliteConnectOptions::new()
                .filename(db_file)
                .create_if_missing(true)
        };
        // A single connection, since EventStore is the only owner of this
        // SQLite connection and is accessed from one task.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        slog::info!(log, "opened event store"; "db_file" => db_file);

        let store = EventStore {
            pool,
            dirty: AtomicBool::new(false),
        };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                hostname TEXT,
                in_dev TEXT,
                out_dev TEXT,
                src TEXT,
                src_mac TEXT,
                dst TEXT,
                dst_mac TEXT,
                spt INTEGER,
                dpt INTEGER,
                direction TEXT,
                timestamp TEXT,
                line TEXT
            )"#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS timeout (ip TEXT PRIMARY KEY, time TEXT)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS bad (ip TEXT PRIMARY KEY, time TEXT)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS invalid (logline TEXT PRIMARY KEY, time TEXT)")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Inserts an event, failing with [`StoreError::EventExists`] when its
    /// hash is already present.
    pub async fn insert_event(&self, e: &Event) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"INSERT INTO events
                (id, hostname, in_dev, out_dev, src, src_mac, dst, dst_mac, spt, dpt, direction, timestamp, line)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
        )
        .bind(&e.hash)
        .bind(&e.hostname)
        .bind(&e.r#in)
        .bind(&e.out)
        .bind(&e.src)
        .bind(e.src_mac.to_string())
        .bind(&e.dst)
        .bind(e.dst_mac.to_string())
        .bind(e.spt as i64)
        .bind(e.dpt as i64)
        .bind(e.direction.as_str())
        .bind(e.timestamp.to_string())
        .bind(&e.line)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {
                tx.commit().await?;
                self.mark_dirty();
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE constraint") => {
                Err(StoreError::EventExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Events from `ip` seen within the last `max_age_seconds`.
    pub async fn recent_from(
        &self,
        ip: &str,
        max_age_seconds: i64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let cutoff = chrono::Utc::now().timestamp() - max_age_seconds;
        let rows = sqlx::query(
            r#"SELECT id, hostname, in_dev, out_dev, src, src_mac, dst, dst_mac, spt, dpt, direction, timestamp, line
               FROM events WHERE src = ?1 AND CAST(timestamp AS INTEGER) > ?2"#,
        )
        .bind(ip)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| StoredEvent {
                hash: row.get("id"),
                hostname: row.get("hostname"),
                r#in: row.get("in_dev"),
                out: row.get("out_dev"),
                src: row.get("src"),
                src_mac: row.get("src_mac"),
                dst: row.get("dst"),
                dst_mac: row.get("dst_mac"),
                spt: row.get("spt"),
                dpt: row.get("dpt"),
                direction: direction_from_str(row.get::<String, _>("direction").as_str()),
                timestamp: row
                    .get::<String, _>("timestamp")
                    .parse()
                    .unwrap_or_default(),
                line: row.get("line"),
            })
            .collect())
    }

    /// Archives a rejected line. Silent on repeat: invalid lines recur often.
    pub async fn insert_invalid(&self, line: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp().to_string();
        sqlx::query("INSERT OR IGNORE INTO invalid (logline, time) VALUES (?1, ?2)")
            .bind(line)
            .bind(now)
            .execute(&self.pool)
            .await?;
        self.mark_dirty();
        Ok(())
    }

    pub async fn insert_timeout(&self, ip: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp().to_string();
        sqlx::query("INSERT OR IGNORE INTO timeout (ip, time) VALUES (?1, ?2)")
            .bind(ip)
            .bind(now)
            .execute(&self.pool)
            .await?;
        self.mark_dirty();
        Ok(())
    }

    pub async fn is_timed_out(&self, ip: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM timeout WHERE ip = ?1")
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn insert_bad(&self, ip: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp().to_string();
        sqlx::query("INSERT OR IGNORE INTO bad (ip, time) VALUES (?1, ?2)")
            .bind(ip)
            .bind(now)
            .execute(&self.pool)
            .await?;
        self.mark_dirty();
        Ok(())
    }

    pub async fn is_bad(&self, ip: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM bad WHERE ip = ?1")
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_bad(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT ip FROM bad")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("ip")).collect())
    }

    /// Commits batched writes if any have occurred since the last commit.
    /// SQLite autocommits each statement already; this flag exists to match
    /// the drain-pass batching contract, and is where a future WAL-mode
    /// checkpoint or explicit BEGIN/COMMIT batching would hook in.
    pub async fn commit(&self) -> Result<(), StoreError> {
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.commit().await?;
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_parser::parse;

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    const EXEMPLAR: &str = "Dec 28 22:16:18 hostname kernel: [2794371.848017] Dropped input traffic: IN=wan OUT= MAC=aa:bb:cc:dd:ee:ff:ff:ee:dd:cc:bb:aa:08:00 SRC=1.2.3.4 DST=4.3.2.1 LEN=48 TOS=0x00 PREC=0x00 TTL=113 ID=1609 DF PROTO=TCP SPT=51004 DPT=37888 WINDOW=64240 RES=0x00 SYN URGP=0 ";

    async fn memory_store() -> EventStore {
        EventStore::open("sqlite::memory:", &test_log())
            .await
            .expect("open in-memory store")
    }

    #[tokio::test]
    async fn dedups_by_hash() {
        let store = memory_store().await;
        let event = parse(EXEMPLAR).unwrap();
        store.insert_event(&event).await.unwrap();
        let err = store.insert_event(&event).await.unwrap_err();
        assert!(matches!(err, StoreError::EventExists));
    }

    #[tokio::test]
    async fn recent_from_counts_same_source() {
        let store = memory_store().await;
        let event = parse(EXEMPLAR).unwrap();
        store.insert_event(&event).await.unwrap();
        let recent = store.recent_from("1.2.3.4", 300).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].src, "1.2.3.4");
        assert_eq!(recent[0].direction, Direction::Inbound);

        let none = store.recent_from("9.9.9.9", 300).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn timeout_and_bad_markers_are_idempotent() {
        let store = memory_store().await;
        assert!(!store.is_timed_out("1.2.3.4").await.unwrap());
        store.insert_timeout("1.2.3.4").await.unwrap();
        store.insert_timeout("1.2.3.4").await.unwrap();
        assert!(store.is_timed_out("1.2.3.4").await.unwrap());

        assert!(!store.is_bad("9.9.9.9").await.unwrap());
        store.insert_bad("9.9.9.9").await.unwrap();
        store.insert_bad("9.9.9.9").await.unwrap();
        assert!(store.is_bad("9.9.9.9").await.unwrap());
        assert_eq!(store.list_bad().await.unwrap(), vec!["9.9.9.9".to_string()]);
    }

    #[tokio::test]
    async fn insert_invalid_is_silent_on_repeat() {
        let store = memory_store().await;
        store.insert_invalid("garbage").await.unwrap();
        store.insert_invalid("garbage").await.unwrap();
    }
}
