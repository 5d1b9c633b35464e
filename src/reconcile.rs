// src/reconcile.rs

use crate::completion::CompletionLog;
use crate::config::Config;
use crate::detect::{self, AmbiguousKey};
use crate::error::ReconError;
use crate::extract::{self, DocumentExtractor, Extraction};
use crate::model::{
    DeliveryRecord, DiscrepancyEntry, DocumentSegment, EntryStatus, PageGap, RecordKey, SourceKind,
};
use crate::spreadsheet::{self, RowIssue, SheetBatch};
use crate::upload_db::UploadStore;
use std::collections::BTreeSet;
use time::Date;
use tracing::{info, info_span};

/// A page gap in a stored document, tagged with its delivery date.
#[derive(Debug, Clone)]
pub struct GapReport {
    pub date: Date,
    pub gap: PageGap,
}

/// Result of one reconciliation pass. Derived entirely from the latest
/// uploads plus the completion log; throw it away and recompute any
/// time.
#[derive(Debug)]
pub struct ReconView {
    pub open: Vec<DiscrepancyEntry>,
    pub resolved: Vec<DiscrepancyEntry>,
    pub ambiguous: Vec<AmbiguousKey>,
    pub issues: Vec<RowIssue>,
    pub gaps: Vec<GapReport>,
    pub low_confidence: Vec<DocumentSegment>,
}

/// Per-department rollup of the open entries.
#[derive(Debug)]
pub struct DeptSummary {
    pub department: String,
    pub open: usize,
    pub claimed_total: f64,
    pub received_total: f64,
}

pub struct Reconciler {
    store: UploadStore,
    log: CompletionLog,
    config: Config,
}

impl Reconciler {
    pub fn new(store: UploadStore, log: CompletionLog, config: Config) -> Self {
        Self { store, log, config }
    }

    pub fn completion_log(&self) -> &CompletionLog {
        &self.log
    }

    pub fn upload_store(&self) -> &UploadStore {
        &self.store
    }

    /// Validate and store a spreadsheet upload. A schema failure aborts
    /// before anything is written; bad rows are tolerated and reported.
    pub fn ingest_sheet(
        &self,
        date: Date,
        filename: &str,
        data: &[u8],
    ) -> Result<SheetBatch, ReconError> {
        let span = info_span!("ingest_sheet", date = %date, filename = %filename);
        let _enter = span.enter();

        let batch = spreadsheet::normalize(date, data, &self.config.spreadsheet)?;
        let upload = self
            .store
            .insert_upload(date, SourceKind::Spreadsheet, filename, data)?;
        info!(
            version = upload.version,
            records = batch.records.len(),
            issues = batch.issues.len(),
            "Spreadsheet ingested"
        );
        Ok(batch)
    }

    /// Extract and store a document upload: the raw bytes, the
    /// recognized page text, the gaps, and the department segments.
    pub async fn ingest_document(
        &self,
        extractor: &DocumentExtractor,
        date: Date,
        filename: &str,
        data: &[u8],
    ) -> Result<Extraction, ReconError> {
        let span = info_span!("ingest_document", date = %date, filename = %filename);
        let _enter = span.enter();

        let version = self
            .store
            .latest_upload(date, SourceKind::Document)?
            .map(|u| u.version + 1)
            .unwrap_or(1);
        let extraction = extractor.extract(data, date, version).await?;

        let upload = self
            .store
            .insert_upload(date, SourceKind::Document, filename, data)?;
        self.store
            .store_pages(upload.id, &extraction.pages, &extraction.gaps)?;
        self.store.store_segments(upload.id, &extraction.segments)?;
        info!(
            version = upload.version,
            records = extraction.records.len(),
            segments = extraction.segments.len(),
            gaps = extraction.gaps.len(),
            "Document ingested"
        );
        Ok(extraction)
    }

    /// Full recompute: re-normalize the latest spreadsheet of every
    /// date, re-analyze the stored page text of every latest document
    /// (no OCR re-run), detect discrepancies, then split them by the
    /// completion log. Resolution state is never baked into the derived
    /// entries, so a re-upload changes quantities without losing
    /// resolutions.
    pub fn reconcile(&self) -> Result<ReconView, ReconError> {
        let uploads = self.store.latest_uploads()?;
        let mut records: Vec<DeliveryRecord> = Vec::new();
        let mut issues = Vec::new();
        let mut gaps = Vec::new();
        let mut low_confidence = Vec::new();

        for upload in &uploads {
            match upload.kind {
                SourceKind::Spreadsheet => {
                    let batch = spreadsheet::normalize(
                        upload.date,
                        &upload.data,
                        &self.config.spreadsheet,
                    )?;
                    records.extend(batch.records);
                    issues.extend(batch.issues);
                }
                SourceKind::Document => {
                    let pages = self.store.pages_for(upload.id)?;
                    let doc_id = extract::document_id(&upload.data);
                    let analysis = extract::analyze_pages(
                        &pages,
                        upload.date,
                        &doc_id,
                        upload.version,
                        &self.config.departments,
                        &self.config.document,
                    );
                    records.extend(analysis.records);
                    for gap in self.store.gaps_for(upload.id)? {
                        gaps.push(GapReport {
                            date: upload.date,
                            gap,
                        });
                    }
                    for segment in self.store.segments_for(upload.id)? {
                        if segment.confidence < self.config.departments.min_confidence {
                            low_confidence.push(segment);
                        }
                    }
                }
            }
        }

        let detection = detect::detect(&records);
        let resolved_keys: BTreeSet<RecordKey> = self.log.resolved_keys()?.into_iter().collect();

        let mut open = Vec::new();
        let mut resolved = Vec::new();
        for mut entry in detection.entries {
            if resolved_keys.contains(&entry.key) {
                entry.status = EntryStatus::Resolved;
                resolved.push(entry);
            } else {
                open.push(entry);
            }
        }

        info!(
            open = open.len(),
            resolved = resolved.len(),
            ambiguous = detection.ambiguous.len(),
            gaps = gaps.len(),
            "Reconciliation pass complete"
        );
        Ok(ReconView {
            open,
            resolved,
            ambiguous: detection.ambiguous,
            issues,
            gaps,
            low_confidence,
        })
    }

    pub fn resolve(
        &self,
        key: RecordKey,
        operator: Option<String>,
        note: Option<String>,
    ) -> Result<(), ReconError> {
        self.log.resolve(key, operator, note)?;
        Ok(())
    }

    pub fn reopen(
        &self,
        key: RecordKey,
        operator: Option<String>,
        note: Option<String>,
    ) -> Result<(), ReconError> {
        self.log.reopen(key, operator, note)?;
        Ok(())
    }

    /// Per-department rollup of the open entries, in department order.
    pub fn summarize(view: &ReconView) -> Vec<DeptSummary> {
        let mut summaries: Vec<DeptSummary> = Vec::new();
        for entry in &view.open {
            match summaries
                .iter_mut()
                .find(|s| s.department == entry.key.department)
            {
                Some(s) => {
                    s.open += 1;
                    s.claimed_total += entry.claimed_qty;
                    s.received_total += entry.received_qty;
                }
                None => summaries.push(DeptSummary {
                    department: entry.key.department.clone(),
                    open: 1,
                    claimed_total: entry.claimed_qty,
                    received_total: entry.received_qty,
                }),
            }
        }
        summaries.sort_by(|a, b| a.department.cmp(&b.department));
        summaries
    }
}

/// Render a view as CSV, open entries first, then resolved ones.
pub fn export_csv(view: &ReconView) -> Result<String, ReconError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "date",
            "department",
            "item",
            "claimed_qty",
            "received_qty",
            "diff",
            "status",
        ])
        .map_err(csv_err)?;
    for entry in view.open.iter().chain(view.resolved.iter()) {
        writer
            .write_record([
                entry.key.date.to_string(),
                entry.key.department.clone(),
                entry.key.item.clone(),
                entry.claimed_qty.to_string(),
                entry.received_qty.to_string(),
                entry.diff.to_string(),
                entry.status.to_string(),
            ])
            .map_err(csv_err)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ReconError::Io(std::io::Error::other(e.to_string())))?;
    String::from_utf8(bytes).map_err(|e| ReconError::Io(std::io::Error::other(e.to_string())))
}

fn csv_err(e: csv::Error) -> ReconError {
    ReconError::Io(std::io::Error::other(e.to_string()))
}
