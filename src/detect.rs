// src/detect.rs

use crate::model::{
    DeliveryRecord, DiscrepancyEntry, DiscrepancyKind, EntryStatus, RecordKey, SourceKind,
};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Two records with the same key from the same source. Reported for
/// operator disambiguation; never auto-summed.
#[derive(Debug, Clone)]
pub struct AmbiguousKey {
    pub key: RecordKey,
    pub source: SourceKind,
    pub count: usize,
}

#[derive(Debug)]
pub struct Detection {
    /// Sorted by key; one entry per key with a nonzero diff.
    pub entries: Vec<DiscrepancyEntry>,
    pub ambiguous: Vec<AmbiguousKey>,
}

#[derive(Default)]
struct Sides {
    claimed: Option<f64>,
    received: Option<f64>,
    sheet_count: usize,
    doc_count: usize,
}

/// Join spreadsheet and document records on the key triple and emit a
/// discrepancy wherever the claimed and received totals differ. The
/// claimed side comes from spreadsheet records, the received side from
/// document records; a key present on only one side treats the missing
/// side as zero. Deterministic and order-independent.
pub fn detect(records: &[DeliveryRecord]) -> Detection {
    let mut sides: BTreeMap<RecordKey, Sides> = BTreeMap::new();

    for record in records {
        let entry = sides.entry(record.key.clone()).or_default();
        match record.source {
            SourceKind::Spreadsheet => {
                entry.sheet_count += 1;
                // First occurrence wins; duplicates are flagged below.
                if entry.sheet_count == 1 {
                    entry.claimed = Some(record.claimed_qty);
                }
            }
            SourceKind::Document => {
                entry.doc_count += 1;
                if entry.doc_count == 1 {
                    entry.received = Some(record.received_qty);
                }
            }
        }
    }

    let mut ambiguous = Vec::new();
    for (key, s) in &sides {
        if s.sheet_count > 1 {
            ambiguous.push(AmbiguousKey {
                key: key.clone(),
                source: SourceKind::Spreadsheet,
                count: s.sheet_count,
            });
        }
        if s.doc_count > 1 {
            ambiguous.push(AmbiguousKey {
                key: key.clone(),
                source: SourceKind::Document,
                count: s.doc_count,
            });
        }
    }
    if !ambiguous.is_empty() {
        warn!(count = ambiguous.len(), "Ambiguous duplicate keys flagged");
    }

    let mut entries = Vec::new();
    for (key, s) in sides {
        let kind = match (s.claimed, s.received) {
            (Some(_), Some(_)) => DiscrepancyKind::QuantityMismatch,
            (Some(_), None) => DiscrepancyKind::MissingFromDocument,
            (None, Some(_)) => DiscrepancyKind::MissingFromSpreadsheet,
            (None, None) => continue,
        };
        let claimed = s.claimed.unwrap_or(0.0);
        let received = s.received.unwrap_or(0.0);
        let diff = received - claimed;
        if diff == 0.0 {
            continue;
        }
        entries.push(DiscrepancyEntry {
            key,
            claimed_qty: claimed,
            received_qty: received,
            diff,
            kind,
            status: EntryStatus::Open,
        });
    }

    info!(entries = entries.len(), "Discrepancies detected");
    Detection { entries, ambiguous }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn rec(dept: &str, item: &str, claimed: f64, received: f64, source: SourceKind) -> DeliveryRecord {
        DeliveryRecord {
            key: RecordKey::new(date!(2024 - 05 - 01), dept, item),
            claimed_qty: claimed,
            received_qty: received,
            source,
        }
    }

    #[test]
    fn matching_quantities_emit_nothing() {
        let records = vec![
            rec("pharmacy", "gauze", 10.0, 0.0, SourceKind::Spreadsheet),
            rec("pharmacy", "gauze", 0.0, 10.0, SourceKind::Document),
        ];
        let detection = detect(&records);
        assert!(detection.entries.is_empty());
        assert!(detection.ambiguous.is_empty());
    }

    #[test]
    fn quantity_mismatch_has_signed_diff() {
        let records = vec![
            rec("pharmacy", "gauze", 10.0, 0.0, SourceKind::Spreadsheet),
            rec("pharmacy", "gauze", 0.0, 8.0, SourceKind::Document),
        ];
        let detection = detect(&records);
        assert_eq!(detection.entries.len(), 1);
        let e = &detection.entries[0];
        assert_eq!(e.kind, DiscrepancyKind::QuantityMismatch);
        assert_eq!(e.diff, -2.0);
        assert_eq!(e.status, EntryStatus::Open);
    }

    #[test]
    fn spreadsheet_only_key_is_one_sided_with_zero_received() {
        // The row's own received column does not feed the document side.
        let records = vec![rec("pharmacy", "gauze", 10.0, 8.0, SourceKind::Spreadsheet)];
        let detection = detect(&records);
        assert_eq!(detection.entries.len(), 1);
        let e = &detection.entries[0];
        assert_eq!(e.kind, DiscrepancyKind::MissingFromDocument);
        assert_eq!(e.received_qty, 0.0);
        assert_eq!(e.diff, -10.0);
    }

    #[test]
    fn document_only_key_is_one_sided_with_zero_claimed() {
        let records = vec![rec("icu", "syringe", 0.0, 4.0, SourceKind::Document)];
        let detection = detect(&records);
        let e = &detection.entries[0];
        assert_eq!(e.kind, DiscrepancyKind::MissingFromSpreadsheet);
        assert_eq!(e.diff, 4.0);
    }

    #[test]
    fn same_source_duplicates_flagged_not_summed() {
        let records = vec![
            rec("pharmacy", "gauze", 10.0, 0.0, SourceKind::Spreadsheet),
            rec("pharmacy", "gauze", 7.0, 0.0, SourceKind::Spreadsheet),
        ];
        let detection = detect(&records);
        assert_eq!(detection.ambiguous.len(), 1);
        assert_eq!(detection.ambiguous[0].count, 2);
        // First occurrence kept for the claimed total, not 17.
        assert_eq!(detection.entries[0].claimed_qty, 10.0);
    }

    #[test]
    fn output_is_deterministic_and_order_independent() {
        let a = vec![
            rec("icu", "syringe", 3.0, 0.0, SourceKind::Spreadsheet),
            rec("pharmacy", "gauze", 10.0, 0.0, SourceKind::Spreadsheet),
            rec("pharmacy", "gauze", 0.0, 8.0, SourceKind::Document),
        ];
        let mut b = a.clone();
        b.reverse();

        let da = detect(&a);
        let db = detect(&b);
        let keys_a: Vec<String> = da.entries.iter().map(|e| e.key.to_string()).collect();
        let keys_b: Vec<String> = db.entries.iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys_a, keys_b);
        assert!(keys_a.windows(2).all(|w| w[0] < w[1]));

        let again = detect(&a);
        assert_eq!(again.entries.len(), da.entries.len());
    }
}
