use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::types::{Reading, ReadingKind, StoredReading};

/// Typed error for store operations.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Db(rusqlite::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "store io error: {e}"),
            Self::Db(e) => write!(f, "store db error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e)
    }
}

/// Truncates a timestamp to its minute bucket, in Unix seconds.
pub fn minute_bucket(ts: DateTime<Utc>) -> i64 {
    let secs = ts.timestamp();
    secs - secs.rem_euclid(60)
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Time series of per-instrument readings backed by a single SQLite file.
///
/// Writes go through one writer connection behind a mutex, which is the
/// store-wide serialization point for every batch of every kind. Reads use a
/// separate read-only connection; with WAL they never wait on a writer and
/// only ever see committed batches.
#[derive(Clone)]
pub struct SnapshotStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    /// Opens (or creates) the database at `path` and runs migrations.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)?;
        writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        writer.busy_timeout(Duration::from_secs(5))?;

        let mut schema = String::new();
        for kind in ReadingKind::ALL {
            let (table, col) = (kind.table(), kind.value_column());
            schema.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    symbol      TEXT NOT NULL,
                    timestamp   INTEGER NOT NULL,
                    {col}       REAL NOT NULL,
                    PRIMARY KEY (symbol, timestamp)
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_symbol_timestamp
                    ON {table}(symbol, timestamp);"
            ));
        }
        writer.execute_batch(&schema)?;

        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let reader = Connection::open_with_flags(path, flags)?;
        reader.busy_timeout(Duration::from_secs(5))?;

        tracing::info!("Snapshot store initialized at {path}");
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Upserts a batch of readings in one transaction and returns how many
    /// were written. Each reading's timestamp is truncated to the minute, so a
    /// second write in the same minute replaces the value. Entries that fail
    /// individually are logged and skipped; only a transaction-level failure
    /// is returned as an error.
    pub fn upsert_batch(&self, kind: ReadingKind, readings: &[Reading]) -> Result<usize, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let (table, col) = (kind.table(), kind.value_column());
        let sql = format!(
            "INSERT INTO {table} (symbol, timestamp, {col}) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol, timestamp) DO UPDATE SET {col} = excluded.{col}"
        );

        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for r in readings {
                if r.symbol.is_empty() || !r.value.is_finite() {
                    tracing::warn!("Rejected {table} entry symbol={:?} value={}", r.symbol, r.value);
                    continue;
                }
                match stmt.execute(rusqlite::params![r.symbol, minute_bucket(r.timestamp), r.value]) {
                    Ok(_) => written += 1,
                    Err(e) => tracing::warn!("Failed to upsert {table} entry for {}: {e}", r.symbol),
                }
            }
        }
        tx.commit()?;

        let rejected = readings.len() - written;
        if rejected > 0 {
            tracing::warn!("{table}: wrote {written}/{} entries ({rejected} rejected)", readings.len());
        }
        Ok(written)
    }

    /// Value of the newest entry with `timestamp <= at`. Read failures are
    /// logged and reported as absent.
    pub fn latest_at_or_before(&self, kind: ReadingKind, symbol: &str, at: DateTime<Utc>) -> Option<f64> {
        let (table, col) = (kind.table(), kind.value_column());
        let sql = format!(
            "SELECT {col} FROM {table}
             WHERE symbol = ?1 AND timestamp <= ?2
             ORDER BY timestamp DESC
             LIMIT 1"
        );

        let conn = self.reader();
        let result = conn.prepare_cached(&sql).and_then(|mut stmt| {
            stmt.query_row(rusqlite::params![symbol, at.timestamp()], |row| row.get(0))
                .optional()
        });
        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("{table} lookback failed for {symbol}: {e}");
                None
            }
        }
    }

    /// Last `limit` values for one instrument, oldest first. Empty on failure.
    pub fn recent_values(&self, kind: ReadingKind, symbol: &str, limit: usize) -> Vec<f64> {
        let (table, col) = (kind.table(), kind.value_column());
        let sql = format!(
            "SELECT {col} FROM {table}
             WHERE symbol = ?1
             ORDER BY timestamp DESC
             LIMIT ?2"
        );

        let conn = self.reader();
        let result = conn.prepare_cached(&sql).and_then(|mut stmt| {
            let values = stmt
                .query_map(rusqlite::params![symbol, limit as i64], |row| row.get::<_, f64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(values)
        });
        match result {
            Ok(mut values) => {
                values.reverse();
                values
            }
            Err(e) => {
                tracing::warn!("{table} history read failed for {symbol}: {e}");
                Vec::new()
            }
        }
    }

    /// Newest `limit` entries across all instruments, newest first.
    pub fn most_recent(&self, kind: ReadingKind, limit: u32) -> Result<Vec<StoredReading>, StoreError> {
        let (table, col) = (kind.table(), kind.value_column());
        let sql = format!(
            "SELECT symbol, timestamp, {col} FROM {table}
             ORDER BY timestamp DESC, symbol ASC
             LIMIT ?1"
        );

        let conn = self.reader();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params![limit], |row| {
                Ok(StoredReading {
                    symbol: row.get(0)?,
                    timestamp: from_unix(row.get(1)?),
                    value: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self, kind: ReadingKind) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let conn = self.reader();
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Deletes entries older than `cutoff` from every table.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for kind in ReadingKind::ALL {
            removed += tx.execute(
                &format!("DELETE FROM {} WHERE timestamp < ?1", kind.table()),
                rusqlite::params![cutoff.timestamp()],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) fn tmp_db_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("crypto_monitor_{tag}_{nanos}.db"))
    }

    pub(crate) fn open_tmp(tag: &str) -> SnapshotStore {
        let path = tmp_db_path(tag);
        SnapshotStore::open(path.to_str().unwrap()).unwrap()
    }

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn minute(m: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::minutes(m)
    }

    #[test]
    fn minute_bucket_truncates_seconds() {
        let ts = t0() + chrono::Duration::seconds(59);
        assert_eq!(minute_bucket(ts), t0().timestamp());
        let before_epoch = Utc.timestamp_opt(-1, 0).unwrap();
        assert_eq!(minute_bucket(before_epoch), -60);
    }

    #[test]
    fn upsert_in_same_minute_keeps_one_row_with_latest_value() {
        let store = open_tmp("upsert");
        let n = store
            .upsert_batch(ReadingKind::Price, &[Reading::new("A", 10.0, t0())])
            .unwrap();
        assert_eq!(n, 1);
        let later_same_minute = t0() + chrono::Duration::seconds(20);
        store
            .upsert_batch(ReadingKind::Price, &[Reading::new("A", 12.0, later_same_minute)])
            .unwrap();

        assert_eq!(store.count(ReadingKind::Price).unwrap(), 1);
        assert_eq!(store.latest_at_or_before(ReadingKind::Price, "A", minute(1)), Some(12.0));

        // Identical rewrite is a no-op.
        store
            .upsert_batch(ReadingKind::Price, &[Reading::new("A", 12.0, t0())])
            .unwrap();
        assert_eq!(store.count(ReadingKind::Price).unwrap(), 1);
    }

    #[test]
    fn lookback_returns_latest_entry_at_or_before() {
        let store = open_tmp("lookback");
        // Written out of order on purpose.
        let batch: Vec<Reading> = [(5, 110.0), (0, 100.0), (2, 103.0), (1, 101.0)]
            .iter()
            .map(|&(m, v)| Reading::new("X", v, minute(m)))
            .collect();
        assert_eq!(store.upsert_batch(ReadingKind::Price, &batch).unwrap(), 4);

        let at = |m| store.latest_at_or_before(ReadingKind::Price, "X", minute(m));
        assert_eq!(at(3), Some(103.0));
        assert_eq!(at(-1), None);
        assert_eq!(at(0), Some(100.0));
        assert_eq!(at(5), Some(110.0));
        assert_eq!(at(60), Some(110.0));
        assert_eq!(store.latest_at_or_before(ReadingKind::Price, "x", minute(3)), None);
    }

    #[test]
    fn kinds_are_stored_separately() {
        let store = open_tmp("kinds");
        store
            .upsert_batch(ReadingKind::Price, &[Reading::new("BTCUSDT", 60_000.0, t0())])
            .unwrap();
        store
            .upsert_batch(ReadingKind::OpenInterest, &[Reading::new("BTCUSDT", 1_000.0, t0())])
            .unwrap();

        assert_eq!(
            store.latest_at_or_before(ReadingKind::Price, "BTCUSDT", t0()),
            Some(60_000.0)
        );
        assert_eq!(
            store.latest_at_or_before(ReadingKind::OpenInterest, "BTCUSDT", t0()),
            Some(1_000.0)
        );
    }

    #[test]
    fn bad_entries_are_skipped_without_failing_the_batch() {
        let store = open_tmp("partial");
        let batch = vec![
            Reading::new("A", 1.0, t0()),
            Reading::new("B", f64::NAN, t0()),
            Reading::new("", 3.0, t0()),
            Reading::new("C", 4.0, t0()),
        ];
        assert_eq!(store.upsert_batch(ReadingKind::OpenInterest, &batch).unwrap(), 2);
        assert_eq!(store.count(ReadingKind::OpenInterest).unwrap(), 2);
        assert_eq!(store.latest_at_or_before(ReadingKind::OpenInterest, "B", t0()), None);
    }

    #[test]
    fn most_recent_is_newest_first_across_instruments() {
        let store = open_tmp("recent");
        let batch = vec![
            Reading::new("A", 1.0, minute(0)),
            Reading::new("B", 2.0, minute(1)),
            Reading::new("A", 3.0, minute(2)),
            Reading::new("C", 4.0, minute(2)),
        ];
        store.upsert_batch(ReadingKind::Price, &batch).unwrap();

        let rows = store.most_recent(ReadingKind::Price, 3).unwrap();
        let got: Vec<(&str, f64)> = rows.iter().map(|r| (r.symbol.as_str(), r.value)).collect();
        assert_eq!(got, vec![("A", 3.0), ("C", 4.0), ("B", 2.0)]);
        assert_eq!(rows[0].timestamp, minute(2));
    }

    #[test]
    fn recent_values_are_oldest_first() {
        let store = open_tmp("values");
        let batch: Vec<Reading> = (0..5)
            .map(|m| Reading::new("A", 100.0 + m as f64, minute(m)))
            .collect();
        store.upsert_batch(ReadingKind::Price, &batch).unwrap();

        assert_eq!(
            store.recent_values(ReadingKind::Price, "A", 3),
            vec![102.0, 103.0, 104.0]
        );
        assert!(store.recent_values(ReadingKind::Price, "Z", 3).is_empty());
    }

    #[test]
    fn prune_removes_old_rows_from_every_table() {
        let store = open_tmp("prune");
        for kind in ReadingKind::ALL {
            store
                .upsert_batch(
                    kind,
                    &[Reading::new("A", 1.0, minute(0)), Reading::new("A", 2.0, minute(10))],
                )
                .unwrap();
        }
        assert_eq!(store.prune_before(minute(5)).unwrap(), 2);
        for kind in ReadingKind::ALL {
            assert_eq!(store.count(kind).unwrap(), 1);
            assert_eq!(store.latest_at_or_before(kind, "A", minute(5)), None);
        }
    }

    #[test]
    fn read_failures_come_back_as_absent() {
        let path = tmp_db_path("read_failure");
        let store = SnapshotStore::open(path.to_str().unwrap()).unwrap();
        store
            .upsert_batch(ReadingKind::Price, &[Reading::new("A", 1.0, t0())])
            .unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("DROP TABLE price_history").unwrap();

        assert_eq!(store.latest_at_or_before(ReadingKind::Price, "A", t0()), None);
        assert!(store.recent_values(ReadingKind::Price, "A", 5).is_empty());
        assert!(store.most_recent(ReadingKind::Price, 5).is_err());
    }

    #[test]
    fn concurrent_batches_commit_whole() {
        let store = open_tmp("concurrent");
        let symbols: Vec<String> = (0..200).map(|i| format!("SYM{i:03}USDT")).collect();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                let symbols = symbols.clone();
                std::thread::spawn(move || {
                    let kind = if w % 2 == 0 {
                        ReadingKind::Price
                    } else {
                        ReadingKind::OpenInterest
                    };
                    let batch: Vec<Reading> = symbols
                        .iter()
                        .map(|s| Reading::new(s.clone(), f64::from(w + 1), t0()))
                        .collect();
                    for _ in 0..5 {
                        assert_eq!(store.upsert_batch(kind, &batch).unwrap(), 200);
                    }
                })
            })
            .collect();

        // Every snapshot a reader sees holds one writer's batch, never a mix.
        let distinct_values = |kind| {
            let mut values: Vec<f64> = store
                .most_recent(kind, 1_000)
                .unwrap()
                .iter()
                .map(|r| r.value)
                .collect();
            values.sort_by(f64::total_cmp);
            values.dedup();
            values
        };
        for _ in 0..50 {
            for kind in ReadingKind::ALL {
                assert!(distinct_values(kind).len() <= 1);
            }
        }

        for w in writers {
            w.join().unwrap();
        }
        for kind in ReadingKind::ALL {
            assert_eq!(store.count(kind).unwrap(), 200);
            let last = distinct_values(kind);
            assert_eq!(last.len(), 1);
            assert_eq!(
                store.latest_at_or_before(kind, "SYM000USDT", t0()),
                Some(last[0])
            );
        }
        // Price came from writers 0 and 2, open interest from 1 and 3.
        assert!([1.0, 3.0].contains(&distinct_values(ReadingKind::Price)[0]));
        assert!([2.0, 4.0].contains(&distinct_values(ReadingKind::OpenInterest)[0]));
    }
}
