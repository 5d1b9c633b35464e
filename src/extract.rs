// src/extract.rs

use crate::config::{DepartmentConfig, DocumentConfig, RetryConfig, TieBreak};
use crate::error::ReconError;
use crate::model::{DeliveryRecord, DocumentSegment, PageGap, RecordKey, SourceKind};
use crate::ocr::{Ocr, Rasterize};
use lopdf::Document;
use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::Date;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Minimum number of non-whitespace characters we expect from a
/// "real" text page. Below this threshold we treat it as scanned.
const MIN_TEXT_CHARS: usize = 30;

/// Recognized text of one page, tagged with how it was obtained.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PageText {
    /// 1-indexed.
    pub page: u32,
    pub text: String,
    pub from_ocr: bool,
}

/// Everything derived from one document ingestion.
#[derive(Debug)]
pub struct Extraction {
    pub document_id: String,
    pub version: i64,
    pub pages: Vec<PageText>,
    pub gaps: Vec<PageGap>,
    pub records: Vec<DeliveryRecord>,
    pub segments: Vec<DocumentSegment>,
}

/// Content hash identifying a document regardless of upload session.
pub fn document_id(pdf: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pdf);
    format!("{:x}", hasher.finalize())
}

pub struct DocumentExtractor {
    ocr: Arc<dyn Ocr>,
    raster: Arc<dyn Rasterize>,
    departments: DepartmentConfig,
    document: DocumentConfig,
    retry: RetryConfig,
    max_concurrency: usize,
}

impl DocumentExtractor {
    pub fn new(
        ocr: Arc<dyn Ocr>,
        raster: Arc<dyn Rasterize>,
        departments: DepartmentConfig,
        document: DocumentConfig,
        retry: RetryConfig,
        max_concurrency: usize,
    ) -> Self {
        Self {
            ocr,
            raster,
            departments,
            document,
            retry,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run the full per-page pipeline on a document: embedded text where
    /// the page has any, OCR otherwise, then department segmentation and
    /// item parsing. A single unreadable page becomes a gap, not a
    /// failure of the whole document.
    pub async fn extract(
        &self,
        pdf: &[u8],
        date: Date,
        version: i64,
    ) -> Result<Extraction, ReconError> {
        let doc_id = document_id(pdf);
        let (pages, gaps) = self.read_pages(pdf).await?;
        info!(
            document_id = %doc_id,
            pages = pages.len(),
            gaps = gaps.len(),
            ocr_pages = pages.iter().filter(|p| p.from_ocr).count(),
            "Document pages read"
        );

        let analysis = analyze_pages(
            &pages,
            date,
            &doc_id,
            version,
            &self.departments,
            &self.document,
        );

        Ok(Extraction {
            document_id: doc_id,
            version,
            pages,
            gaps,
            records: analysis.records,
            segments: analysis.segments,
        })
    }

    /// Read every page's text: embedded text for pages that have fonts,
    /// OCR (bounded concurrency, per-page retry with backoff) for the
    /// rest. Results are re-sorted by page index — the OCR pool finishes
    /// out of order.
    async fn read_pages(&self, pdf: &[u8]) -> Result<(Vec<PageText>, Vec<PageGap>), ReconError> {
        let doc = Document::load_mem(pdf).map_err(|e| ReconError::Pdf {
            detail: format!("failed to parse PDF: {e}"),
        })?;
        let page_map = doc.get_pages();
        if page_map.is_empty() {
            return Err(ReconError::Pdf {
                detail: "document has no pages".to_string(),
            });
        }

        let mut pages = Vec::new();
        let mut needs_ocr = Vec::new();

        for (&page_no, &object_id) in &page_map {
            if page_has_fonts(&doc, object_id) {
                let text = doc.extract_text(&[page_no]).unwrap_or_default();
                let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
                if meaningful >= MIN_TEXT_CHARS {
                    pages.push(PageText {
                        page: page_no,
                        text,
                        from_ocr: false,
                    });
                    continue;
                }
            }
            needs_ocr.push(page_no);
        }

        let mut gaps = Vec::new();
        if !needs_ocr.is_empty() {
            let (ocr_pages, ocr_gaps) = self.ocr_pages(pdf, &needs_ocr).await;
            pages.extend(ocr_pages);
            gaps.extend(ocr_gaps);
        }

        pages.sort_by_key(|p| p.page);
        gaps.sort_by_key(|g| g.page);
        Ok((pages, gaps))
    }

    async fn ocr_pages(&self, pdf: &[u8], page_nos: &[u32]) -> (Vec<PageText>, Vec<PageGap>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let pdf: Arc<[u8]> = Arc::from(pdf);
        let mut set: JoinSet<(u32, Result<String, String>)> = JoinSet::new();

        for &page_no in page_nos {
            let permit_source = Arc::clone(&semaphore);
            let ocr = Arc::clone(&self.ocr);
            let raster = Arc::clone(&self.raster);
            let pdf = Arc::clone(&pdf);
            let retry = self.retry;

            set.spawn(async move {
                let _permit = permit_source.acquire_owned().await.expect("semaphore open");
                let result = recognize_with_retry(&*ocr, &*raster, &pdf, page_no, retry).await;
                (page_no, result.map_err(|e| e.to_string()))
            });
        }

        let mut pages = Vec::new();
        let mut gaps = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((page_no, Ok(text))) => pages.push(PageText {
                    page: page_no,
                    text,
                    from_ocr: true,
                }),
                Ok((page_no, Err(reason))) => {
                    warn!(page = page_no, reason = %reason, "Page recorded as gap");
                    gaps.push(PageGap {
                        page: page_no,
                        reason,
                    });
                }
                Err(e) => warn!(error = %e, "OCR task panicked"),
            }
        }
        (pages, gaps)
    }
}

/// OCR one page, retrying transient unavailability with exponential
/// backoff. Rasterization failures are not retried — the page bytes
/// will not get better.
async fn recognize_with_retry(
    ocr: &dyn Ocr,
    raster: &dyn Rasterize,
    pdf: &[u8],
    page_no: u32,
    retry: RetryConfig,
) -> Result<String, ReconError> {
    let image = raster.rasterize(pdf, page_no)?;

    let mut attempt = 0;
    loop {
        match ocr.recognize(&image).await {
            Ok(text) => return Ok(text),
            Err(ReconError::OcrUnavailable { detail }) => {
                attempt += 1;
                if attempt >= retry.max_attempts {
                    return Err(ReconError::OcrUnavailable { detail });
                }
                let delay = retry.base_delay_ms * (1 << (attempt - 1));
                warn!(
                    page = page_no,
                    attempt,
                    delay_ms = delay,
                    "OCR unavailable — backing off"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(other) => return Err(other),
        }
    }
}

/// Adapted from the page-resource inspection used to spot scanned
/// documents: a page with XObject images but no Font resources has no
/// extractable text.
fn page_has_fonts(doc: &Document, object_id: lopdf::ObjectId) -> bool {
    let Ok(page_obj) = doc.get_object(object_id) else {
        return false;
    };
    let Ok(page_dict) = page_obj.as_dict() else {
        return false;
    };

    page_dict
        .get(b"Resources")
        .ok()
        .and_then(|r| doc.dereference(r).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .and_then(|res| res.get(b"Font").ok())
        .and_then(|f| doc.dereference(f).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .is_some_and(|fonts| !fonts.is_empty())
}

#[derive(Debug)]
pub struct PageAnalysis {
    pub records: Vec<DeliveryRecord>,
    pub segments: Vec<DocumentSegment>,
}

/// Department detection + segmentation + item parsing over ordered page
/// texts. Pure; re-run on stored page text during reconciliation.
pub fn analyze_pages(
    pages: &[PageText],
    date: Date,
    document_id: &str,
    version: i64,
    departments: &DepartmentConfig,
    document: &DocumentConfig,
) -> PageAnalysis {
    let marker = RegexBuilder::new(&departments.marker)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|_| Regex::new(r"^\[?department\]?$").unwrap());
    let item_re = Regex::new(&document.item_pattern)
        .unwrap_or_else(|_| Regex::new(r"L\d{6}").unwrap());
    let qty_re = Regex::new(r"(\d+)\s*$").unwrap();
    let known: Vec<String> = departments
        .known
        .iter()
        .map(|k| crate::model::normalize_label(k))
        .collect();
    // Printed code → the item name spreadsheets carry, so both sides
    // join under the same key.
    let item_names: BTreeMap<String, String> = document
        .item_names
        .iter()
        .map(|(code, name)| {
            (
                crate::model::normalize_label(code),
                crate::model::normalize_label(name),
            )
        })
        .collect();

    // Pass 1: detected department per page (None = OCR noise, inherit).
    let mut detected: Vec<(u32, Option<String>)> = Vec::with_capacity(pages.len());
    for page in pages {
        let mut hits = Vec::new();
        let lines: Vec<&str> = page.text.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if marker.is_match(trimmed) {
                if let Some(next) = lines[i + 1..].iter().find(|l| !l.trim().is_empty()) {
                    let name = crate::model::normalize_label(next);
                    if !name.is_empty() {
                        hits.push(name);
                    }
                }
            } else {
                let folded = crate::model::normalize_label(trimmed);
                if !folded.is_empty() && known.contains(&folded) {
                    hits.push(folded);
                }
            }
        }
        let choice = match departments.tie_break {
            TieBreak::First => hits.first().cloned(),
            TieBreak::Last => hits.last().cloned(),
        };
        detected.push((page.page, choice));
    }

    // Pass 2: contiguous segments. Pages without a detection inherit the
    // running department; leading undetected pages are buffered and
    // attached to the first department found.
    let mut segments = Vec::new();
    let mut current: Option<(String, u32, u32, u32)> = None; // (dept, start, end, evidenced)
    let mut buffered_start: Option<u32> = None;

    for (page_no, choice) in &detected {
        match (choice, current.as_mut()) {
            (Some(dept), Some((cur_dept, _, end, evidenced))) if dept == cur_dept => {
                *end = *page_no;
                *evidenced += 1;
            }
            (Some(dept), Some(_)) => {
                let (d, s, e, ev) = current.take().unwrap();
                segments.push(make_segment(document_id, version, d, s, e, ev));
                current = Some((dept.clone(), *page_no, *page_no, 1));
            }
            (Some(dept), None) => {
                let start = buffered_start.take().unwrap_or(*page_no);
                current = Some((dept.clone(), start, *page_no, 1));
            }
            (None, Some((_, _, end, _))) => *end = *page_no,
            (None, None) => {
                buffered_start.get_or_insert(*page_no);
            }
        }
    }
    if let Some((d, s, e, ev)) = current {
        segments.push(make_segment(document_id, version, d, s, e, ev));
    } else if let Some(start) = buffered_start {
        warn!(
            from_page = start,
            "No department detected anywhere in document"
        );
    }

    // Pass 3: item lines, attributed to the page's segment department.
    // Repeats of an item within one department are continuation lines of
    // the same delivery, so quantities accumulate onto a single record.
    let mut totals: BTreeMap<RecordKey, f64> = BTreeMap::new();
    for page in pages {
        let Some(dept) = segments
            .iter()
            .find(|s| s.page_start <= page.page && page.page <= s.page_end)
            .map(|s| s.department.clone())
        else {
            continue;
        };
        for line in page.text.lines() {
            let Some(m) = item_re.find(line) else {
                continue;
            };
            let code = crate::model::normalize_label(m.as_str());
            let item = item_names.get(&code).unwrap_or(&code);
            let rest = &line[m.end()..];
            // A code with no trailing quantity still proves presence.
            let qty = qty_re
                .captures(rest)
                .and_then(|c| c[1].parse::<f64>().ok())
                .unwrap_or(1.0);
            let key = RecordKey::new(date, &dept, item);
            *totals.entry(key).or_insert(0.0) += qty;
        }
    }

    let records = totals
        .into_iter()
        .map(|(key, qty)| DeliveryRecord {
            key,
            claimed_qty: 0.0,
            received_qty: qty,
            source: SourceKind::Document,
        })
        .collect();

    PageAnalysis { records, segments }
}

fn make_segment(
    document_id: &str,
    version: i64,
    department: String,
    page_start: u32,
    page_end: u32,
    evidenced: u32,
) -> DocumentSegment {
    let span = (page_end - page_start + 1) as f64;
    DocumentSegment {
        document_id: document_id.to_string(),
        version,
        department,
        page_start,
        page_end,
        confidence: f64::from(evidenced) / span,
    }
}

/// Produce a page-range excerpt of the original document for one
/// segment — the department-specific document view.
pub fn department_excerpt(pdf: &[u8], segment: &DocumentSegment) -> Result<Vec<u8>, ReconError> {
    let mut doc = Document::load_mem(pdf).map_err(|e| ReconError::Pdf {
        detail: format!("failed to parse PDF: {e}"),
    })?;
    let total = doc.get_pages().len() as u32;
    let outside: Vec<u32> = (1..=total)
        .filter(|p| *p < segment.page_start || *p > segment.page_end)
        .collect();
    if !outside.is_empty() {
        doc.delete_pages(&outside);
    }
    let _ = doc.prune_objects();
    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(|e| ReconError::Pdf {
        detail: format!("failed to write excerpt: {e}"),
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::date;

    fn page(n: u32, text: &str) -> PageText {
        PageText {
            page: n,
            text: text.to_string(),
            from_ocr: true,
        }
    }

    fn dept_cfg(known: &[&str]) -> DepartmentConfig {
        DepartmentConfig {
            known: known.iter().map(|s| s.to_string()).collect(),
            ..DepartmentConfig::default()
        }
    }

    fn analyze(pages: &[PageText], cfg: &DepartmentConfig) -> PageAnalysis {
        analyze_pages(
            pages,
            date!(2024 - 05 - 01),
            "doc1",
            1,
            cfg,
            &DocumentConfig::default(),
        )
    }

    #[test]
    fn contiguous_pages_become_segments() {
        let pages = vec![
            page(1, "[department]\nPharmacy\nL000001 10"),
            page(2, "L000002 5"),
            page(3, "more lines"),
            page(4, "[department]\nICU\nL000003 2"),
            page(5, ""),
            page(6, "L000004 7"),
        ];
        let analysis = analyze(&pages, &DepartmentConfig::default());
        assert_eq!(analysis.segments.len(), 2);
        let a = &analysis.segments[0];
        let b = &analysis.segments[1];
        assert_eq!((a.department.as_str(), a.page_start, a.page_end), ("pharmacy", 1, 3));
        assert_eq!((b.department.as_str(), b.page_start, b.page_end), ("icu", 4, 6));
    }

    #[test]
    fn leading_undetected_pages_attach_to_first_department() {
        let pages = vec![
            page(1, "cover sheet"),
            page(2, "[department]\nPharmacy"),
            page(3, "tail"),
        ];
        let analysis = analyze(&pages, &DepartmentConfig::default());
        assert_eq!(analysis.segments.len(), 1);
        assert_eq!(analysis.segments[0].page_start, 1);
        assert_eq!(analysis.segments[0].page_end, 3);
    }

    #[test]
    fn confidence_is_evidence_density() {
        let pages = vec![
            page(1, "[department]\nPharmacy"),
            page(2, "noise"),
            page(3, "noise"),
            page(4, "noise"),
        ];
        let analysis = analyze(&pages, &DepartmentConfig::default());
        assert_eq!(analysis.segments.len(), 1);
        assert!((analysis.segments[0].confidence - 0.25).abs() < 1e-9);
    }

    #[test]
    fn known_name_counts_as_detection() {
        let pages = vec![page(1, "Pharmacy\nL000001 3")];
        let analysis = analyze(&pages, &dept_cfg(&["Pharmacy"]));
        assert_eq!(analysis.segments.len(), 1);
        assert_eq!(analysis.segments[0].department, "pharmacy");
    }

    #[test]
    fn tie_break_configurable() {
        let pages = vec![page(1, "Pharmacy\nICU")];
        let known = dept_cfg(&["Pharmacy", "ICU"]);
        let first = analyze(&pages, &known);
        assert_eq!(first.segments[0].department, "pharmacy");

        let last_cfg = DepartmentConfig {
            tie_break: TieBreak::Last,
            ..known
        };
        let last = analyze(&pages, &last_cfg);
        assert_eq!(last.segments[0].department, "icu");
    }

    #[test]
    fn item_quantities_accumulate_per_key() {
        let pages = vec![
            page(1, "[department]\nPharmacy\nL000001 10\nL000002 4"),
            page(2, "L000001 5"),
        ];
        let analysis = analyze(&pages, &DepartmentConfig::default());
        assert_eq!(analysis.records.len(), 2);
        let first = &analysis.records[0];
        assert_eq!(first.key.item, "l000001");
        assert_eq!(first.received_qty, 15.0);
        assert_eq!(first.claimed_qty, 0.0);
        assert_eq!(first.source, SourceKind::Document);
    }

    #[test]
    fn mapped_codes_join_under_item_name() {
        let pages = vec![page(1, "[department]\nPharmacy\nL000001 8\nL000002 3")];
        let doc_cfg = DocumentConfig {
            item_names: [("L000001".to_string(), "Gauze".to_string())]
                .into_iter()
                .collect(),
            ..DocumentConfig::default()
        };
        let analysis = analyze_pages(
            &pages,
            date!(2024 - 05 - 01),
            "doc1",
            1,
            &DepartmentConfig::default(),
            &doc_cfg,
        );
        let items: Vec<&str> = analysis
            .records
            .iter()
            .map(|r| r.key.item.as_str())
            .collect();
        // Mapped code joins under the name; the unmapped one stays a code.
        assert_eq!(items, vec!["gauze", "l000002"]);
    }

    #[test]
    fn code_without_quantity_counts_as_presence() {
        let pages = vec![page(1, "[department]\nPharmacy\nL000009")];
        let analysis = analyze(&pages, &DepartmentConfig::default());
        assert_eq!(analysis.records[0].received_qty, 1.0);
    }

    // ---------------------------------------------------------------
    // OCR retry behavior
    // ---------------------------------------------------------------

    struct FlakyOcr {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Ocr for FlakyOcr {
        async fn recognize(&self, _page_png: &[u8]) -> Result<String, ReconError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ReconError::OcrUnavailable {
                    detail: "connection refused".to_string(),
                });
            }
            Ok("[department]\nPharmacy".to_string())
        }
    }

    struct NullRasterizer;

    impl Rasterize for NullRasterizer {
        fn rasterize(&self, _pdf: &[u8], _page: u32) -> Result<Vec<u8>, ReconError> {
            Ok(vec![0u8; 4])
        }
    }

    #[tokio::test]
    async fn transient_ocr_failure_is_retried() {
        let ocr = FlakyOcr {
            failures_left: Mutex::new(2),
        };
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
        };
        let text = recognize_with_retry(&ocr, &NullRasterizer, b"pdf", 1, retry)
            .await
            .unwrap();
        assert!(text.contains("Pharmacy"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let ocr = FlakyOcr {
            failures_left: Mutex::new(10),
        };
        let retry = RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
        };
        let err = recognize_with_retry(&ocr, &NullRasterizer, b"pdf", 1, retry)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::OcrUnavailable { .. }));
    }
}
