/// Escalation history: SQLite-backed record of when each (issue, rule, level)
/// last fired, plus the chain anchor used for level progression.
///
/// Uses `rusqlite` with the `bundled` feature so SQLite is compiled in.
///
/// Every `record()` commits its own transaction before returning, so a crash
/// between runs never loses a committed firing. A crash *mid*-run loses at most
/// the firing in flight, which the next run re-sends rather than skips.
///
/// Writes take `&mut self`: one run owns the store and is its only writer.
///
/// Timestamps are stored as RFC 3339 text. A row whose timestamps no longer
/// parse is logged and treated as absent instead of failing the whole load.
use crate::error::HistoryStoreError;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

pub type Result<T> = std::result::Result<T, HistoryStoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub issue_key:          String,
    pub rule_name:          String,
    pub level:              u32,
    /// First level-1 firing for this issue under this rule name.
    pub first_triggered_at: DateTime<Utc>,
    pub last_triggered_at:  DateTime<Utc>,
}

pub struct HistoryStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

impl HistoryStore {
    /// Open (creating if needed) the history database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        apply_schema(&conn)?;
        tracing::debug!("History store opened at {:?}", path);
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous  = FULL;

        CREATE TABLE IF NOT EXISTS escalation_history (
            issue_key          TEXT    NOT NULL,
            rule_name          TEXT    NOT NULL,
            level              INTEGER NOT NULL,
            first_triggered_at TEXT    NOT NULL,
            last_triggered_at  TEXT    NOT NULL,
            PRIMARY KEY (issue_key, rule_name, level)
        );

        CREATE INDEX IF NOT EXISTS idx_history_issue ON escalation_history(issue_key);
    ")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct RawRow {
    issue_key: String,
    rule_name: String,
    level:     i64,
    first:     String,
    last:      String,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        issue_key: row.get(0)?,
        rule_name: row.get(1)?,
        level:     row.get(2)?,
        first:     row.get(3)?,
        last:      row.get(4)?,
    })
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

impl RawRow {
    /// `None` (with a warning) when the row is unreadable.
    fn decode(self) -> Option<HistoryRecord> {
        let level = u32::try_from(self.level).ok().filter(|l| *l >= 1);
        match (level, parse_ts(&self.first), parse_ts(&self.last)) {
            (Some(level), Some(first_triggered_at), Some(last_triggered_at)) => Some(HistoryRecord {
                issue_key: self.issue_key,
                rule_name: self.rule_name,
                level,
                first_triggered_at,
                last_triggered_at,
            }),
            _ => {
                tracing::warn!(
                    "Ignoring unreadable history record {}/{}/L{} (first={:?}, last={:?})",
                    self.issue_key, self.rule_name, self.level, self.first, self.last
                );
                None
            }
        }
    }
}

const SELECT_COLUMNS: &str =
    "SELECT issue_key, rule_name, level, first_triggered_at, last_triggered_at \
     FROM escalation_history";

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

impl HistoryStore {
    pub fn get(&self, issue_key: &str, rule_name: &str, level: u32) -> Result<Option<HistoryRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("{} WHERE issue_key = ?1 AND rule_name = ?2 AND level = ?3", SELECT_COLUMNS),
                params![issue_key, rule_name, level],
                raw_row,
            )
            .optional()?;
        Ok(raw.and_then(RawRow::decode))
    }

    /// The chain anchor: when level 1 of `rule_name` first fired for this
    /// issue. Absent if level 1 never fired (or its record is unreadable).
    pub fn first_triggered(&self, issue_key: &str, rule_name: &str) -> Result<Option<DateTime<Utc>>> {
        first_triggered_on(&self.conn, issue_key, rule_name)
    }

    /// Every readable record, ordered by issue key, rule name and level.
    pub fn list_all(&self) -> Result<Vec<HistoryRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} ORDER BY issue_key, rule_name, level",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], raw_row)?;

        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(raw) => records.extend(raw.decode()),
                Err(e)  => tracing::warn!("Ignoring unreadable history row: {}", e),
            }
        }
        Ok(records)
    }

    /// Records still on cooldown at `now`: last fired less than `cooldown` ago.
    pub fn list_active(&self, cooldown: Duration, now: DateTime<Utc>) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|r| now.signed_duration_since(r.last_triggered_at) < cooldown)
            .collect())
    }

    /// Every readable record, frozen. A run gates all of its decisions on one
    /// snapshot so its own writes never feed back into later decisions.
    pub fn snapshot(&self) -> Result<HistorySnapshot> {
        let records = self
            .list_all()?
            .into_iter()
            .map(|r| ((r.issue_key.clone(), r.rule_name.clone(), r.level), r))
            .collect();
        Ok(HistorySnapshot { records })
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only copy of the history as it stood when taken.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    records: HashMap<(String, String, u32), HistoryRecord>,
}

impl HistorySnapshot {
    pub fn get(&self, issue_key: &str, rule_name: &str, level: u32) -> Option<&HistoryRecord> {
        self.records
            .get(&(issue_key.to_owned(), rule_name.to_owned(), level))
    }

    /// Chain anchor, as `HistoryStore::first_triggered`.
    pub fn first_triggered(&self, issue_key: &str, rule_name: &str) -> Option<DateTime<Utc>> {
        self.get(issue_key, rule_name, 1).map(|r| r.first_triggered_at)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn first_triggered_on(conn: &Connection, issue_key: &str, rule_name: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT MIN(first_triggered_at) FROM escalation_history \
             WHERE issue_key = ?1 AND rule_name = ?2 AND level = 1",
            params![issue_key, rule_name],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten();

    Ok(raw.and_then(|s| {
        let parsed = parse_ts(&s);
        if parsed.is_none() {
            tracing::warn!(
                "Ignoring unreadable chain anchor for {}/{}: {:?}",
                issue_key, rule_name, s
            );
        }
        parsed
    }))
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

impl HistoryStore {
    /// Record a firing of (issue, rule, level) at `now`.
    ///
    /// The chain anchor is copied from the existing level-1 record of this
    /// rule name, or set to `now` when there is none yet.
    pub fn record(&mut self, issue_key: &str, rule_name: &str, level: u32, now: DateTime<Utc>) -> Result<HistoryRecord> {
        let tx = self.conn.transaction()?;

        let anchor = first_triggered_on(&tx, issue_key, rule_name)?.unwrap_or(now);

        tx.execute(
            "INSERT INTO escalation_history \
                 (issue_key, rule_name, level, first_triggered_at, last_triggered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (issue_key, rule_name, level) DO UPDATE SET \
                 first_triggered_at = excluded.first_triggered_at, \
                 last_triggered_at  = excluded.last_triggered_at",
            params![issue_key, rule_name, level, format_ts(anchor), format_ts(now)],
        )?;
        tx.commit()?;

        Ok(HistoryRecord {
            issue_key:          issue_key.to_owned(),
            rule_name:          rule_name.to_owned(),
            level,
            first_triggered_at: anchor,
            last_triggered_at:  now,
        })
    }

    /// Delete every record. Returns the number removed.
    pub fn clear_all(&mut self) -> Result<usize> {
        let n = self.conn.execute("DELETE FROM escalation_history", [])?;
        tracing::info!("Cleared {} history records", n);
        Ok(n)
    }

    /// Delete every record for one issue, all rules and levels.
    pub fn clear_for_issue(&mut self, issue_key: &str) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM escalation_history WHERE issue_key = ?1",
            params![issue_key],
        )?;
        tracing::info!("Cleared {} history records for {}", n, issue_key);
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn first_record_sets_anchor_to_now() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        let rec = store.record("X-1", "Stale review", 1, t0()).unwrap();
        assert_eq!(rec.first_triggered_at, t0());
        assert_eq!(rec.last_triggered_at, t0());

        let loaded = store.get("X-1", "Stale review", 1).unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(store.first_triggered("X-1", "Stale review").unwrap(), Some(t0()));
    }

    #[test]
    fn refiring_keeps_anchor() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("X-1", "Stale review", 1, t0()).unwrap();
        let later = t0() + Duration::hours(30);
        let rec = store.record("X-1", "Stale review", 1, later).unwrap();
        assert_eq!(rec.first_triggered_at, t0());
        assert_eq!(rec.last_triggered_at, later);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn higher_levels_copy_level_one_anchor() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("X-1", "Stale review", 1, t0()).unwrap();
        let l2 = store
            .record("X-1", "Stale review", 2, t0() + Duration::days(2))
            .unwrap();
        assert_eq!(l2.first_triggered_at, t0());
        assert_eq!(l2.last_triggered_at, t0() + Duration::days(2));
    }

    #[test]
    fn anchor_is_scoped_to_issue_and_rule_name() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("X-1", "Stale review", 1, t0()).unwrap();
        assert_eq!(store.first_triggered("X-2", "Stale review").unwrap(), None);
        assert_eq!(store.first_triggered("X-1", "Unassigned bug").unwrap(), None);
        assert!(store.get("X-1", "Stale review", 2).unwrap().is_none());
    }

    #[test]
    fn anchor_absent_without_level_one() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("X-1", "Stale review", 2, t0()).unwrap();
        assert_eq!(store.first_triggered("X-1", "Stale review").unwrap(), None);
    }

    #[test]
    fn list_active_respects_cooldown() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("X-1", "Stale review", 1, t0()).unwrap();
        store.record("X-2", "Stale review", 1, t0() + Duration::hours(20)).unwrap();

        let now = t0() + Duration::hours(24);
        let active = store.list_active(Duration::hours(24), now).unwrap();
        let keys: Vec<&str> = active.iter().map(|r| r.issue_key.as_str()).collect();
        // X-1 fired exactly 24h ago, so its cooldown has just expired.
        assert_eq!(keys, vec!["X-2"]);
    }

    #[test]
    fn clears_all_or_one_issue() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("X-1", "Stale review", 1, t0()).unwrap();
        store.record("X-1", "Stale review", 2, t0()).unwrap();
        store.record("X-2", "Stale review", 1, t0()).unwrap();

        assert_eq!(store.clear_for_issue("X-1").unwrap(), 2);
        assert_eq!(store.list_all().unwrap().len(), 1);
        assert_eq!(store.clear_for_issue("X-404").unwrap(), 0);
        assert_eq!(store.clear_all().unwrap(), 1);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn snapshot_is_frozen_at_capture() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("X-1", "Stale review", 1, t0()).unwrap();
        let snap = store.snapshot().unwrap();

        store.record("X-1", "Stale review", 2, t0() + Duration::hours(1)).unwrap();
        store.record("X-1", "Stale review", 1, t0() + Duration::hours(2)).unwrap();

        assert_eq!(snap.len(), 1);
        assert!(snap.get("X-1", "Stale review", 2).is_none());
        assert_eq!(snap.get("X-1", "Stale review", 1).unwrap().last_triggered_at, t0());
        assert_eq!(snap.first_triggered("X-1", "Stale review"), Some(t0()));
        assert_eq!(snap.first_triggered("X-2", "Stale review"), None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("history.sqlite");
        {
            let mut store = HistoryStore::open(&path).unwrap();
            store.record("X-1", "Stale review", 1, t0()).unwrap();
        }
        let store = HistoryStore::open(&path).unwrap();
        let rec = store.get("X-1", "Stale review", 1).unwrap().unwrap();
        assert_eq!(rec.first_triggered_at, t0());
    }

    #[test]
    fn corrupt_rows_are_skipped_not_fatal() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("X-1", "Stale review", 1, t0()).unwrap();
        store
            .conn
            .execute(
                "INSERT INTO escalation_history VALUES ('X-2', 'Stale review', 1, 'garbage', 'garbage')",
                [],
            )
            .unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].issue_key, "X-1");
        assert!(store.get("X-2", "Stale review", 1).unwrap().is_none());
        assert_eq!(store.first_triggered("X-2", "Stale review").unwrap(), None);

        // A fresh firing overwrites the unreadable row.
        store.record("X-2", "Stale review", 1, t0()).unwrap();
        assert!(store.get("X-2", "Stale review", 1).unwrap().is_some());
    }
}
