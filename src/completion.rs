// src/completion.rs

use crate::error::ReconError;
use crate::model::{CompletionAction, CompletionEntry, RecordKey};
use rusqlite::{Connection, params};
use std::collections::BTreeMap;
use std::path::Path;
use time::Date;
use time::macros::format_description;
use tracing::info;

const DATE_FMT: &'static [time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Append-only operator log. Rows are never updated or deleted; the
/// latest row per key (by insertion order) decides whether the key is
/// currently resolved. Lives in its own database file so that wiping
/// upload state cannot take resolutions with it.
pub struct CompletionLog {
    conn: Connection,
}

impl CompletionLog {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, ReconError> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS completion_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                uid TEXT NOT NULL UNIQUE,
                date TEXT NOT NULL,
                department TEXT NOT NULL,
                item TEXT NOT NULL,
                action TEXT NOT NULL,
                at_epoch_ms INTEGER NOT NULL,
                operator TEXT,
                note TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_completion_key
             ON completion_log(date, department, item)",
            [],
        )?;

        info!("Completion log initialized");
        Ok(Self { conn })
    }

    /// Record that the operator resolved `key`. Fails with
    /// `DuplicateResolution` when the key is already resolved, so a
    /// double-click cannot stack redundant rows.
    pub fn resolve(
        &self,
        key: RecordKey,
        operator: Option<String>,
        note: Option<String>,
    ) -> Result<CompletionEntry, ReconError> {
        if self.is_resolved(&key)? {
            return Err(ReconError::DuplicateResolution {
                key: key.to_string(),
            });
        }
        let entry = CompletionEntry::new(key, CompletionAction::Resolved, operator, note);
        self.append(&entry)?;
        Ok(entry)
    }

    /// Record that the operator reopened `key`. The key must currently
    /// be resolved.
    pub fn reopen(
        &self,
        key: RecordKey,
        operator: Option<String>,
        note: Option<String>,
    ) -> Result<CompletionEntry, ReconError> {
        if !self.is_resolved(&key)? {
            return Err(ReconError::NotResolved {
                key: key.to_string(),
            });
        }
        let entry = CompletionEntry::new(key, CompletionAction::Reopened, operator, note);
        self.append(&entry)?;
        Ok(entry)
    }

    fn append(&self, entry: &CompletionEntry) -> Result<(), ReconError> {
        self.conn.execute(
            "INSERT INTO completion_log
                (uid, date, department, item, action, at_epoch_ms, operator, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.uid,
                entry.key.date.to_string(),
                entry.key.department,
                entry.key.item,
                entry.action.to_string(),
                entry.at_epoch_ms,
                entry.operator,
                entry.note,
            ],
        )?;
        info!(uid = %entry.uid, key = %entry.key, action = %entry.action, "Completion entry appended");
        Ok(())
    }

    /// Whether the chronologically latest log row for `key` marks it
    /// resolved. Ordered by entry timestamp, not insertion order —
    /// imported entries may arrive in any order.
    pub fn is_resolved(&self, key: &RecordKey) -> Result<bool, ReconError> {
        let mut stmt = self.conn.prepare(
            "SELECT action FROM completion_log
             WHERE date = ?1 AND department = ?2 AND item = ?3
             ORDER BY at_epoch_ms DESC, seq DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![key.date.to_string(), key.department, key.item])?;
        match rows.next()? {
            Some(row) => {
                let action: String = row.get(0)?;
                Ok(action == CompletionAction::Resolved.to_string())
            }
            None => Ok(false),
        }
    }

    /// All keys whose chronologically latest entry is a resolution.
    pub fn resolved_keys(&self) -> Result<Vec<RecordKey>, ReconError> {
        let mut rows = self.entries_after(0)?;
        rows.sort_by_key(|(seq, entry)| (entry.at_epoch_ms, *seq));
        let mut latest: BTreeMap<RecordKey, CompletionAction> = BTreeMap::new();
        for (_, entry) in rows {
            latest.insert(entry.key, entry.action);
        }
        Ok(latest
            .into_iter()
            .filter(|(_, action)| *action == CompletionAction::Resolved)
            .map(|(key, _)| key)
            .collect())
    }

    /// Entries with seq strictly greater than `after`, in seq order.
    /// `after = 0` returns the whole log.
    pub fn entries_after(&self, after: i64) -> Result<Vec<(i64, CompletionEntry)>, ReconError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, uid, date, department, item, action, at_epoch_ms, operator, note
             FROM completion_log
             WHERE seq > ?1
             ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![after], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, uid, date, department, item, action, at_epoch_ms, operator, note) = row?;
            entries.push((
                seq,
                CompletionEntry {
                    uid,
                    key: RecordKey {
                        date: parse_stored_date(&date)?,
                        department,
                        item,
                    },
                    action: parse_stored_action(&action)?,
                    at_epoch_ms,
                    operator,
                    note,
                },
            ));
        }
        Ok(entries)
    }

    /// Merge entries pulled from elsewhere. Deduplicates on uid and
    /// never rewrites existing rows. Returns the number actually added.
    pub fn import(&self, entries: &[CompletionEntry]) -> Result<usize, ReconError> {
        let mut added = 0;
        for entry in entries {
            let n = self.conn.execute(
                "INSERT OR IGNORE INTO completion_log
                    (uid, date, department, item, action, at_epoch_ms, operator, note)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.uid,
                    entry.key.date.to_string(),
                    entry.key.department,
                    entry.key.item,
                    entry.action.to_string(),
                    entry.at_epoch_ms,
                    entry.operator,
                    entry.note,
                ],
            )?;
            added += n;
        }
        if added > 0 {
            info!(added = added, "Completion entries imported");
        }
        Ok(added)
    }

    /// Highest seq currently in the log, 0 when empty.
    pub fn last_seq(&self) -> Result<i64, ReconError> {
        let seq: Option<i64> =
            self.conn
                .query_row("SELECT MAX(seq) FROM completion_log", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }
}

fn parse_stored_date(s: &str) -> Result<Date, ReconError> {
    Date::parse(s, DATE_FMT).map_err(|_| ReconError::DateParse {
        value: s.to_string(),
    })
}

fn parse_stored_action(s: &str) -> Result<CompletionAction, ReconError> {
    match s {
        "resolved" => Ok(CompletionAction::Resolved),
        "reopened" => Ok(CompletionAction::Reopened),
        other => Err(ReconError::Value {
            row: 0,
            column: "action".to_string(),
            value: other.to_string(),
        }),
    }
}
