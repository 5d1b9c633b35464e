mod completion;
mod config;
mod detect;
mod error;
mod extract;
mod model;
mod ocr;
mod reconcile;
mod spreadsheet;
mod sync;
mod upload_db;

use completion::CompletionLog;
use config::Config;
use error::ReconError;
use extract::DocumentExtractor;
use model::{RecordKey, normalize_label, parse_date};
use ocr::{DisabledOcr, HttpOcrClient, Ocr, PopplerRasterizer};
use reconcile::Reconciler;
use std::path::Path;
use std::sync::Arc;
use sync::{FsObjectStore, RemoteSync};
use tracing::{info, warn};
use upload_db::UploadStore;

const CONFIG_PATH: &str = "recon.toml";

const USAGE: &str = "\
usage: receipt_recon <command> [args]

commands:
  ingest-sheet <date> <file.csv>              store and validate a spreadsheet
  ingest-doc   <date> <file.pdf>              store and extract a delivery document
  reconcile                                   recompute and show the discrepancy view
  resolve <date> <department> <item> [note]   mark a discrepancy handled
  reopen  <date> <department> <item> [note]   bring a resolved discrepancy back
  export  <out.csv>                           write the current view as CSV
  extract-dept <date> <department> <out.pdf>  save one department's document pages
  sync-push                                   push completion log and uploads
  sync-pull                                   merge remote completion entries and uploads";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = if Path::new(CONFIG_PATH).exists() {
        Config::load(CONFIG_PATH)?
    } else {
        Config::default_config()
    };

    if let Some(parent) = Path::new(&cfg.storage.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = UploadStore::new(&cfg.storage.db_path)?;
    let log = CompletionLog::new(&cfg.storage.completion_db_path)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        return Err("no command given".into());
    };

    match command {
        "ingest-sheet" => {
            let (date, path) = date_and_path(&args)?;
            let data = std::fs::read(&path)?;
            let reconciler = Reconciler::new(store, log, cfg);
            let batch = reconciler.ingest_sheet(date, &path, &data)?;
            for issue in &batch.issues {
                warn!(%issue, "Row excluded");
            }
            info!(records = batch.records.len(), "Sheet ingested");
        }
        "ingest-doc" => {
            let (date, path) = date_and_path(&args)?;
            let data = std::fs::read(&path)?;
            let extractor = build_extractor(&cfg);
            let reconciler = Reconciler::new(store, log, cfg);
            let extraction = reconciler
                .ingest_document(&extractor, date, &path, &data)
                .await?;
            for gap in &extraction.gaps {
                warn!(page = gap.page, reason = %gap.reason, "Unreadable page");
            }
            info!(
                records = extraction.records.len(),
                segments = extraction.segments.len(),
                "Document ingested"
            );
        }
        "reconcile" => {
            let reconciler = Reconciler::new(store, log, cfg);
            let view = reconciler.reconcile()?;
            print_view(&view);
        }
        "resolve" | "reopen" => {
            let key = key_from_args(&args)?;
            let note = args.get(4).cloned();
            let operator = std::env::var("USER").ok();
            let push_dir = cfg.storage.object_store_dir.clone();
            let retry = cfg.storage.retry;
            let reconciler = Reconciler::new(store, log, cfg);
            if command == "resolve" {
                reconciler.resolve(key.clone(), operator, note)?;
                info!(key = %key, "Resolved");
            } else {
                reconciler.reopen(key.clone(), operator, note)?;
                info!(key = %key, "Reopened");
            }
            // Best effort: the log row is already durable locally.
            let remote = RemoteSync::new(Arc::new(FsObjectStore::new(&push_dir)?), retry);
            if let Err(e) = remote.push_completion(reconciler.completion_log()).await {
                warn!(error = %e, "Push failed; entry kept locally");
            }
        }
        "export" => {
            let out = args
                .get(1)
                .ok_or_else(|| usage_err("export needs an output path"))?;
            let reconciler = Reconciler::new(store, log, cfg);
            let view = reconciler.reconcile()?;
            std::fs::write(out, reconcile::export_csv(&view)?)?;
            info!(path = %out, open = view.open.len(), "View exported");
        }
        "extract-dept" => {
            let date = parse_date(args.get(1).ok_or_else(|| usage_err("missing date"))?)?;
            let dept = normalize_label(args.get(2).ok_or_else(|| usage_err("missing department"))?);
            let out = args
                .get(3)
                .ok_or_else(|| usage_err("missing output path"))?;

            let upload = store
                .latest_upload(date, model::SourceKind::Document)?
                .ok_or_else(|| usage_err("no document stored for that date"))?;
            let segment = store
                .segments_for(upload.id)?
                .into_iter()
                .find(|s| s.department == dept)
                .ok_or_else(|| usage_err("no segment for that department"))?;
            let excerpt = extract::department_excerpt(&upload.data, &segment)?;
            std::fs::write(out, excerpt)?;
            info!(
                department = %dept,
                pages = format!("{}-{}", segment.page_start, segment.page_end),
                path = %out,
                "Department excerpt written"
            );
        }
        "sync-push" => {
            let remote = RemoteSync::new(
                Arc::new(FsObjectStore::new(&cfg.storage.object_store_dir)?),
                cfg.storage.retry,
            );
            let pushed = remote.push_completion(&log).await?;
            let mut uploads = 0;
            for upload in store.latest_uploads()? {
                remote.push_upload(&store, &upload).await?;
                uploads += 1;
            }
            info!(entries = pushed, uploads = uploads, "Push complete");
        }
        "sync-pull" => {
            let remote = RemoteSync::new(
                Arc::new(FsObjectStore::new(&cfg.storage.object_store_dir)?),
                cfg.storage.retry,
            );
            let added = remote.pull_completion(&log).await?;
            let restored = remote.pull_uploads(&store).await?;
            info!(added = added, uploads = restored, "Pull complete");
        }
        other => {
            eprintln!("{USAGE}");
            return Err(format!("unknown command '{other}'").into());
        }
    }

    Ok(())
}

fn build_extractor(cfg: &Config) -> DocumentExtractor {
    let ocr: Arc<dyn Ocr> = match HttpOcrClient::from_config(&cfg.ocr) {
        Ok(client) => Arc::new(client),
        Err(_) => {
            warn!("OCR endpoint not configured; scanned pages will become gaps");
            Arc::new(DisabledOcr)
        }
    };
    DocumentExtractor::new(
        ocr,
        Arc::new(PopplerRasterizer::new(&cfg.ocr.pdftoppm_path)),
        cfg.departments.clone(),
        cfg.document.clone(),
        cfg.ocr.retry,
        cfg.ocr.max_concurrency,
    )
}

fn date_and_path(args: &[String]) -> Result<(time::Date, String), ReconError> {
    let date = parse_date(args.get(1).map(String::as_str).unwrap_or_default())?;
    let path = args
        .get(2)
        .cloned()
        .ok_or_else(|| usage_err("missing file path"))?;
    Ok((date, path))
}

fn key_from_args(args: &[String]) -> Result<RecordKey, ReconError> {
    let date = parse_date(args.get(1).map(String::as_str).unwrap_or_default())?;
    let dept = args
        .get(2)
        .ok_or_else(|| usage_err("missing department"))?;
    let item = args.get(3).ok_or_else(|| usage_err("missing item"))?;
    Ok(RecordKey::new(date, dept, item))
}

fn usage_err(msg: &str) -> ReconError {
    ReconError::Config(format!("{msg}\n{USAGE}"))
}

fn print_view(view: &reconcile::ReconView) {
    println!("open discrepancies: {}", view.open.len());
    for entry in &view.open {
        println!(
            "  {}  claimed {:>8.1}  received {:>8.1}  diff {:>+8.1}  {:?}",
            entry.key, entry.claimed_qty, entry.received_qty, entry.diff, entry.kind
        );
    }
    if !view.resolved.is_empty() {
        println!("resolved (hidden from open): {}", view.resolved.len());
    }
    for amb in &view.ambiguous {
        println!(
            "  ambiguous: {} has {} {} records",
            amb.key, amb.count, amb.source
        );
    }
    for issue in &view.issues {
        println!("  sheet issue: {issue}");
    }
    for report in &view.gaps {
        println!(
            "  gap: {} page {} ({})",
            report.date, report.gap.page, report.gap.reason
        );
    }
    for seg in &view.low_confidence {
        println!(
            "  low confidence: {} pages {}-{} ({:.2})",
            seg.department, seg.page_start, seg.page_end, seg.confidence
        );
    }
    for summary in Reconciler::summarize(view) {
        println!(
            "  {}: {} open (claimed {:.1}, received {:.1})",
            summary.department, summary.open, summary.claimed_total, summary.received_total
        );
    }
}
