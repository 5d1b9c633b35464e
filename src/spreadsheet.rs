// src/spreadsheet.rs

use crate::config::SheetColumns;
use crate::error::ReconError;
use crate::model::{DeliveryRecord, RecordKey, SourceKind, parse_date};
use std::fmt;
use time::Date;
use tracing::{info, warn};

/// How many leading rows to scan for the header row. Real files often
/// carry a title block above the table.
const HEADER_SCAN_ROWS: usize = 10;

/// A bad row or cell, collected and reported instead of aborting the file.
#[derive(Debug, Clone)]
pub struct RowIssue {
    /// 1-indexed row number in the source file.
    pub row: usize,
    pub column: String,
    pub value: String,
}

impl fmt::Display for RowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {}: bad '{}' value '{}'",
            self.row, self.column, self.value
        )
    }
}

/// Output of normalizing one spreadsheet upload.
#[derive(Debug)]
pub struct SheetBatch {
    pub records: Vec<DeliveryRecord>,
    pub issues: Vec<RowIssue>,
}

struct ColumnIndex {
    date: Option<usize>,
    department: usize,
    item: usize,
    claimed: usize,
    received: usize,
}

/// Normalize raw delimited rows into `DeliveryRecord`s. `upload_date`
/// applies to rows without their own date cell. Pure transformation;
/// rows with unparseable quantities are excluded and reported.
pub fn normalize(
    upload_date: Date,
    data: &[u8],
    columns: &SheetColumns,
) -> Result<SheetBatch, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data);

    let rows: Vec<csv::StringRecord> = reader
        .records()
        .collect::<Result<_, _>>()
        .map_err(|e| ReconError::Schema {
            column: format!("unreadable table: {e}"),
        })?;

    let (header_row, index) = find_header(&rows, columns)?;
    info!(header_row = header_row + 1, rows = rows.len(), "Sheet header located");

    let mut records = Vec::new();
    let mut issues = Vec::new();

    for (i, row) in rows.iter().enumerate().skip(header_row + 1) {
        let row_no = i + 1;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }

        let department = cell(row, index.department);
        let item = cell(row, index.item);
        if department.is_empty() || item.is_empty() {
            issues.push(RowIssue {
                row: row_no,
                column: if department.is_empty() {
                    "department".to_string()
                } else {
                    "item".to_string()
                },
                value: String::new(),
            });
            continue;
        }

        let date = match index.date.map(|c| cell(row, c)) {
            Some(raw) if !raw.is_empty() => match parse_date(&raw) {
                Ok(d) => d,
                Err(_) => {
                    issues.push(RowIssue {
                        row: row_no,
                        column: "date".to_string(),
                        value: raw,
                    });
                    continue;
                }
            },
            _ => upload_date,
        };

        let claimed = match parse_qty(&cell(row, index.claimed)) {
            Ok(v) => v,
            Err(value) => {
                issues.push(RowIssue {
                    row: row_no,
                    column: "claimed".to_string(),
                    value,
                });
                continue;
            }
        };
        let received = match parse_qty(&cell(row, index.received)) {
            Ok(v) => v,
            Err(value) => {
                issues.push(RowIssue {
                    row: row_no,
                    column: "received".to_string(),
                    value,
                });
                continue;
            }
        };

        records.push(DeliveryRecord {
            key: RecordKey::new(date, &department, &item),
            claimed_qty: claimed,
            received_qty: received,
            source: SourceKind::Spreadsheet,
        });
    }

    if !issues.is_empty() {
        warn!(count = issues.len(), "Rows excluded from sheet batch");
    }
    info!(records = records.len(), "Sheet normalized");
    Ok(SheetBatch { records, issues })
}

fn cell(row: &csv::StringRecord, idx: usize) -> String {
    row.get(idx).unwrap_or("").trim().to_string()
}

/// Blank cells count as zero (operators leave undelivered lines empty);
/// anything else must parse as a non-negative number.
fn parse_qty(raw: &str) -> Result<f64, String> {
    if raw.is_empty() {
        return Ok(0.0);
    }
    match raw.replace(',', "").parse::<f64>() {
        Ok(v) if v >= 0.0 => Ok(v),
        _ => Err(raw.to_string()),
    }
}

/// Scan the first rows for one containing every required column header.
fn find_header(
    rows: &[csv::StringRecord],
    columns: &SheetColumns,
) -> Result<(usize, ColumnIndex), ReconError> {
    for (i, row) in rows.iter().take(HEADER_SCAN_ROWS).enumerate() {
        let cells: Vec<String> = row.iter().map(|c| c.trim().to_lowercase()).collect();
        let department = find_column(&cells, &columns.department);
        let item = find_column(&cells, &columns.item);
        let claimed = find_column(&cells, &columns.claimed);
        let received = find_column(&cells, &columns.received);
        if let (Some(department), Some(item), Some(claimed), Some(received)) =
            (department, item, claimed, received)
        {
            return Ok((
                i,
                ColumnIndex {
                    date: find_column(&cells, &columns.date),
                    department,
                    item,
                    claimed,
                    received,
                },
            ));
        }
    }

    // Report the first alias of the first column set that never matched.
    let missing = ["department", "item", "claimed", "received"]
        .into_iter()
        .zip([
            &columns.department,
            &columns.item,
            &columns.claimed,
            &columns.received,
        ])
        .find_map(|(name, aliases)| {
            let found = rows.iter().take(HEADER_SCAN_ROWS).any(|row| {
                let cells: Vec<String> = row.iter().map(|c| c.trim().to_lowercase()).collect();
                find_column(&cells, aliases).is_some()
            });
            (!found).then(|| name.to_string())
        })
        .unwrap_or_else(|| "header row".to_string());

    Err(ReconError::Schema { column: missing })
}

fn find_column(cells: &[String], aliases: &[String]) -> Option<usize> {
    cells
        .iter()
        .position(|cell| aliases.iter().any(|a| cell == &a.trim().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    const SHEET: &str = "\
Daily delivery ledger,,,,
Date,Department,Item,Claimed,Received
2024-05-01,Pharmacy,Gauze,10,8
2024-05-01,Pharmacy,Saline,5,5
2024-05-01,ICU,Syringe,abc,3
2024-05-01,ICU,Gloves,,2
";

    fn columns() -> SheetColumns {
        SheetColumns::default()
    }

    #[test]
    fn normalizes_rows_and_collects_issues() {
        let batch = normalize(date!(2024 - 05 - 01), SHEET.as_bytes(), &columns()).unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.issues.len(), 1);
        assert_eq!(batch.issues[0].column, "claimed");
        assert_eq!(batch.issues[0].value, "abc");

        let gauze = &batch.records[0];
        assert_eq!(gauze.key.department, "pharmacy");
        assert_eq!(gauze.key.item, "gauze");
        assert_eq!(gauze.claimed_qty, 10.0);
        assert_eq!(gauze.received_qty, 8.0);
    }

    #[test]
    fn blank_quantity_is_zero() {
        let batch = normalize(date!(2024 - 05 - 01), SHEET.as_bytes(), &columns()).unwrap();
        let gloves = batch
            .records
            .iter()
            .find(|r| r.key.item == "gloves")
            .unwrap();
        assert_eq!(gloves.claimed_qty, 0.0);
        assert_eq!(gloves.received_qty, 2.0);
    }

    #[test]
    fn header_case_and_whitespace_tolerated() {
        let sheet = "  DATE , DEPARTMENT ,ITEM,CLAIMED,RECEIVED\n2024-05-01,A,B,1,2\n";
        let batch = normalize(date!(2024 - 05 - 01), sheet.as_bytes(), &columns()).unwrap();
        assert_eq!(batch.records.len(), 1);
    }

    #[test]
    fn missing_column_is_schema_error() {
        let sheet = "Date,Department,Item,Claimed\n2024-05-01,A,B,1\n";
        let err = normalize(date!(2024 - 05 - 01), sheet.as_bytes(), &columns()).unwrap_err();
        match err {
            ReconError::Schema { column } => assert_eq!(column, "received"),
            other => panic!("expected schema error, got {other}"),
        }
    }

    #[test]
    fn rows_without_own_date_use_upload_date() {
        let sheet = "Department,Item,Claimed,Received\nPharmacy,Gauze,10,8\n";
        let batch = normalize(date!(2024 - 06 - 02), sheet.as_bytes(), &columns()).unwrap();
        assert_eq!(batch.records[0].key.date, date!(2024 - 06 - 02));
    }

    #[test]
    fn negative_quantity_is_row_issue() {
        let sheet = "Department,Item,Claimed,Received\nPharmacy,Gauze,-4,8\n";
        let batch = normalize(date!(2024 - 05 - 01), sheet.as_bytes(), &columns()).unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.issues[0].value, "-4");
    }
}
