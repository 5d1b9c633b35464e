// src/model.rs

use crate::error::ReconError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use time::{Date, Month, OffsetDateTime};

/// Which side of the reconciliation a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Spreadsheet,
    Document,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spreadsheet => write!(f, "spreadsheet"),
            Self::Document => write!(f, "document"),
        }
    }
}

/// Join key for everything in the system: one delivery line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub date: Date,
    pub department: String,
    pub item: String,
}

impl RecordKey {
    /// Build a key with normalized (trimmed, case-folded) department and item.
    pub fn new(date: Date, department: &str, item: &str) -> Self {
        Self {
            date,
            department: normalize_label(department),
            item: normalize_label(item),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.date, self.department, self.item)
    }
}

/// Trim and case-fold a department or item label.
pub fn normalize_label(s: &str) -> String {
    s.trim().to_lowercase()
}

/// One claimed or received quantity observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub key: RecordKey,
    pub claimed_qty: f64,
    pub received_qty: f64,
    pub source: SourceKind,
}

/// Sub-kind of a discrepancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Both sides present, quantities differ.
    QuantityMismatch,
    /// Spreadsheet row with no document record (received side zero).
    MissingFromDocument,
    /// Document record with no spreadsheet row (claimed side zero).
    MissingFromSpreadsheet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Open,
    Resolved,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Derived view row. Recomputed fresh on every reconciliation pass,
/// never persisted authoritatively and never mutated in place.
#[derive(Debug, Clone, Serialize)]
pub struct DiscrepancyEntry {
    pub key: RecordKey,
    pub claimed_qty: f64,
    pub received_qty: f64,
    pub diff: f64,
    pub kind: DiscrepancyKind,
    pub status: EntryStatus,
}

/// Operator action recorded in the completion log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAction {
    Resolved,
    Reopened,
}

impl fmt::Display for CompletionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Reopened => write!(f, "reopened"),
        }
    }
}

/// One append-only completion log row. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEntry {
    pub uid: String,
    pub key: RecordKey,
    pub action: CompletionAction,
    pub at_epoch_ms: i64,
    pub operator: Option<String>,
    pub note: Option<String>,
}

impl CompletionEntry {
    pub fn new(
        key: RecordKey,
        action: CompletionAction,
        operator: Option<String>,
        note: Option<String>,
    ) -> Self {
        let at_epoch_ms = epoch_ms();
        let uid = entry_uid(&key, action, at_epoch_ms, operator.as_deref(), note.as_deref());
        Self {
            uid,
            key,
            action,
            at_epoch_ms,
            operator,
            note,
        }
    }
}

/// Content-hash identifier for a log entry. The same entry hashed on
/// two machines gets the same uid, which is what sync dedup keys on.
pub fn entry_uid(
    key: &RecordKey,
    action: CompletionAction,
    at_epoch_ms: i64,
    operator: Option<&str>,
    note: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    hasher.update(action.to_string().as_bytes());
    hasher.update(at_epoch_ms.to_le_bytes());
    hasher.update(operator.unwrap_or_default().as_bytes());
    hasher.update(note.unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Contiguous page range of one document attributed to one department.
/// Immutable; a re-ingested document produces a new version's segments
/// instead of overwriting these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSegment {
    pub document_id: String,
    pub version: i64,
    pub department: String,
    /// 1-indexed, inclusive.
    pub page_start: u32,
    pub page_end: u32,
    /// Detection-evidence density over the segment's pages, 0.0..=1.0.
    pub confidence: f64,
}

/// A page that could not be read; extraction continues past it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageGap {
    pub page: u32,
    pub reason: String,
}

/// Parse a calendar date the way source files write them: `YYYY-MM-DD`,
/// `YYYY.M.D`, or a bare `M.D` / `M-D` (also embedded in a filename),
/// inferring the year for the short forms. A short-form month later than
/// the current month is taken to be last year's.
pub fn parse_date(raw: &str) -> Result<Date, ReconError> {
    let s = raw.trim();
    let err = || ReconError::DateParse {
        value: raw.to_string(),
    };

    let ymd = Regex::new(r"^(\d{4})[.-](\d{1,2})[.-](\d{1,2})").unwrap();
    if let Some(cap) = ymd.captures(s) {
        let y: i32 = cap[1].parse().map_err(|_| err())?;
        let m: u8 = cap[2].parse().map_err(|_| err())?;
        let d: u8 = cap[3].parse().map_err(|_| err())?;
        return make_date(y, m, d).ok_or_else(err);
    }

    let md = Regex::new(r"(\d{1,2})[.-](\d{1,2})").unwrap();
    if let Some(cap) = md.captures(s) {
        let m: u8 = cap[1].parse().map_err(|_| err())?;
        let d: u8 = cap[2].parse().map_err(|_| err())?;
        let today = OffsetDateTime::now_utc().date();
        let mut year = today.year();
        if m > u8::from(today.month()) {
            year -= 1;
        }
        return make_date(year, m, d).ok_or_else(err);
    }

    Err(err())
}

fn make_date(y: i32, m: u8, d: u8) -> Option<Date> {
    let month = Month::try_from(m).ok()?;
    Date::from_calendar_date(y, month, d).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn key_normalizes_labels() {
        let key = RecordKey::new(date!(2024 - 05 - 01), "  Pharmacy ", "GAUZE");
        assert_eq!(key.department, "pharmacy");
        assert_eq!(key.item, "gauze");
        assert_eq!(key.to_string(), "2024-05-01/pharmacy/gauze");
    }

    #[test]
    fn parse_full_dates() {
        assert_eq!(parse_date("2024-05-01").unwrap(), date!(2024 - 05 - 01));
        assert_eq!(parse_date("2024.5.1").unwrap(), date!(2024 - 05 - 01));
        assert_eq!(
            parse_date("2025-03-30 00:00:00").unwrap(),
            date!(2025 - 03 - 30)
        );
    }

    #[test]
    fn parse_short_date_from_filename() {
        let d = parse_date("ledger_12.15.pdf").unwrap();
        assert_eq!(u8::from(d.month()), 12);
        assert_eq!(d.day(), 15);
    }

    #[test]
    fn reject_garbage_date() {
        assert!(matches!(
            parse_date("no date here"),
            Err(ReconError::DateParse { .. })
        ));
    }

    #[test]
    fn entry_uid_is_stable() {
        let key = RecordKey::new(date!(2024 - 05 - 01), "Pharmacy", "Gauze");
        let a = entry_uid(&key, CompletionAction::Resolved, 1000, None, None);
        let b = entry_uid(&key, CompletionAction::Resolved, 1000, None, None);
        let c = entry_uid(&key, CompletionAction::Reopened, 1000, None, None);
        let d = entry_uid(&key, CompletionAction::Resolved, 1000, Some("kim"), None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
