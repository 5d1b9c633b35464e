// src/sync.rs

use crate::completion::CompletionLog;
use crate::config::RetryConfig;
use crate::error::ReconError;
use crate::extract::PageText;
use crate::model::{CompletionEntry, DocumentSegment, PageGap, SourceKind, epoch_ms};
use crate::upload_db::{StoredUpload, UploadStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

const COMPLETION_PREFIX: &str = "completion/";
const UPLOAD_PREFIX: &str = "uploads/";

/// Blob-store boundary. `get` on a missing key is `NotFound`, which is
/// an answer, not a transport failure; everything else surfaces as a
/// `Sync` error and is retried by the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), ReconError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, ReconError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ReconError>;
}

/// Directory-backed store. Keys map to paths under the root; writes go
/// through a temp file and rename so a crash never leaves a torn blob.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ReconError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), ReconError> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            // Dotted names are in-flight temp files, never blobs.
            if path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            {
                continue;
            }
            if path.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), ReconError> {
        let path = self.path_for(key);
        let parent = path.parent().ok_or_else(|| ReconError::Sync {
            op: format!("put {key}"),
            detail: "key has no parent directory".to_string(),
        })?;
        std::fs::create_dir_all(parent)?;
        let name = path
            .file_name()
            .ok_or_else(|| ReconError::Sync {
                op: format!("put {key}"),
                detail: "key has no file name".to_string(),
            })?
            .to_string_lossy()
            .into_owned();
        let tmp = parent.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ReconError> {
        match std::fs::read(self.path_for(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ReconError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ReconError> {
        let mut keys = Vec::new();
        if self.root.exists() {
            self.collect_keys(&self.root.clone(), &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store with put-failure injection. Test double for the
/// retry and fallback paths.
#[derive(Default)]
pub struct MemoryObjectStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_puts: Mutex<usize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts fail with a transport error.
    pub fn fail_next_puts(&self, n: usize) {
        *self.fail_puts.lock().unwrap() = n;
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), ReconError> {
        {
            let mut remaining = self.fail_puts.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReconError::Sync {
                    op: "put".to_string(),
                    detail: "injected transport failure".to_string(),
                });
            }
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ReconError> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ReconError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ReconError> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Pushes and pulls reconciliation state through an object store.
///
/// Completion entries travel as append-style segment blobs: each push
/// writes one new immutable JSON blob holding only the entries the
/// remote has not seen. Merging is a union keyed on entry uid, so push
/// and pull are both idempotent and two machines can sync through the
/// same bucket without clobbering each other.
pub struct RemoteSync {
    store: Arc<dyn ObjectStore>,
    retry: RetryConfig,
}

impl RemoteSync {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Upload every local completion entry the remote does not have.
    /// Returns how many entries went out. On failure the local log is
    /// untouched and the push can simply be repeated later.
    pub async fn push_completion(&self, log: &CompletionLog) -> Result<usize, ReconError> {
        let remote = self.fetch_remote_entries().await?;
        let fresh: Vec<CompletionEntry> = log
            .entries_after(0)?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| !remote.contains_key(&entry.uid))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let blob = serde_json::to_vec(&fresh).map_err(|e| ReconError::Sync {
            op: "encode".to_string(),
            detail: e.to_string(),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&blob);
        let digest = format!("{:x}", hasher.finalize());
        let key = format!("{COMPLETION_PREFIX}{}-{}.json", epoch_ms(), &digest[..12]);

        self.put_with_retry(&key, &blob).await?;
        info!(key = %key, entries = fresh.len(), "Completion segment pushed");
        Ok(fresh.len())
    }

    /// Merge every remote completion entry into the local log. Returns
    /// how many entries were new locally.
    pub async fn pull_completion(&self, log: &CompletionLog) -> Result<usize, ReconError> {
        let remote = self.fetch_remote_entries().await?;
        let entries: Vec<CompletionEntry> = remote.into_values().collect();
        let added = log.import(&entries)?;
        info!(added = added, "Completion entries pulled");
        Ok(added)
    }

    /// Mirror one stored upload to the remote. Documents also carry
    /// their extraction state (page text, gaps, segments) so a pulling
    /// machine can reconcile without re-running OCR.
    pub async fn push_upload(
        &self,
        store: &UploadStore,
        upload: &StoredUpload,
    ) -> Result<String, ReconError> {
        let key = format!(
            "{UPLOAD_PREFIX}{}/{}-v{}.bin",
            upload.date, upload.kind, upload.version
        );
        self.put_with_retry(&key, &upload.data).await?;

        if upload.kind == SourceKind::Document {
            let state = DocumentState {
                pages: store.pages_for(upload.id)?,
                gaps: store.gaps_for(upload.id)?,
                segments: store.segments_for(upload.id)?,
            };
            let blob = serde_json::to_vec(&state).map_err(|e| ReconError::Sync {
                op: "encode".to_string(),
                detail: e.to_string(),
            })?;
            self.put_with_retry(&state_key(&key), &blob).await?;
        }
        info!(key = %key, bytes = upload.data.len(), "Upload pushed");
        Ok(key)
    }

    /// Restore every remote upload version the local store lacks,
    /// extraction state included. Returns the number restored.
    pub async fn pull_uploads(&self, store: &UploadStore) -> Result<usize, ReconError> {
        let mut restored = 0;
        for key in self.list_with_retry(UPLOAD_PREFIX).await? {
            if !key.ends_with(".bin") {
                continue;
            }
            let Some((date, kind, version)) = parse_upload_key(&key) else {
                warn!(key = %key, "Skipping unrecognized upload key");
                continue;
            };
            let data = self.get_with_retry(&key).await?;
            let Some(upload_id) = store.restore_upload(date, kind, &key, &data, version)? else {
                continue;
            };
            restored += 1;

            if kind == SourceKind::Document {
                match self.get_with_retry(&state_key(&key)).await {
                    Ok(blob) => {
                        let state: DocumentState =
                            serde_json::from_slice(&blob).map_err(|e| ReconError::Sync {
                                op: "decode".to_string(),
                                detail: format!("{key}: {e}"),
                            })?;
                        store.store_pages(upload_id, &state.pages, &state.gaps)?;
                        store.store_segments(upload_id, &state.segments)?;
                    }
                    Err(ReconError::NotFound { .. }) => {
                        warn!(key = %key, "Document restored without extraction state");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if restored > 0 {
            info!(restored = restored, "Uploads pulled");
        }
        Ok(restored)
    }

    async fn fetch_remote_entries(
        &self,
    ) -> Result<BTreeMap<String, CompletionEntry>, ReconError> {
        let keys = self.list_with_retry(COMPLETION_PREFIX).await?;
        let mut merged = BTreeMap::new();
        for key in keys {
            let blob = self.get_with_retry(&key).await?;
            let entries: Vec<CompletionEntry> =
                serde_json::from_slice(&blob).map_err(|e| ReconError::Sync {
                    op: "decode".to_string(),
                    detail: format!("{key}: {e}"),
                })?;
            for entry in entries {
                merged.insert(entry.uid.clone(), entry);
            }
        }
        Ok(merged)
    }

    async fn put_with_retry(&self, key: &str, data: &[u8]) -> Result<(), ReconError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.put(key, data).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.base_delay_ms * (1 << (attempt - 1));
                    warn!(key = %key, attempt = attempt, error = %e, delay_ms = delay, "put failed, retrying");
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    return Err(ReconError::Sync {
                        op: format!("put {key}"),
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    async fn get_with_retry(&self, key: &str) -> Result<Vec<u8>, ReconError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.get(key).await {
                Ok(data) => return Ok(data),
                // A missing key will not appear by retrying.
                Err(ReconError::NotFound { key }) => return Err(ReconError::NotFound { key }),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.base_delay_ms * (1 << (attempt - 1));
                    warn!(key = %key, attempt = attempt, error = %e, delay_ms = delay, "get failed, retrying");
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    return Err(ReconError::Sync {
                        op: format!("get {key}"),
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    async fn list_with_retry(&self, prefix: &str) -> Result<Vec<String>, ReconError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.list(prefix).await {
                Ok(keys) => return Ok(keys),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.base_delay_ms * (1 << (attempt - 1));
                    warn!(prefix = %prefix, attempt = attempt, error = %e, delay_ms = delay, "list failed, retrying");
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    return Err(ReconError::Sync {
                        op: format!("list {prefix}"),
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Extraction state travelling alongside a document blob.
#[derive(Serialize, Deserialize)]
struct DocumentState {
    pages: Vec<PageText>,
    gaps: Vec<PageGap>,
    segments: Vec<DocumentSegment>,
}

fn state_key(bin_key: &str) -> String {
    format!("{}.state.json", bin_key.trim_end_matches(".bin"))
}

/// `uploads/{date}/{kind}-v{version}.bin` → its parts.
fn parse_upload_key(key: &str) -> Option<(time::Date, crate::model::SourceKind, i64)> {
    let rest = key.strip_prefix(UPLOAD_PREFIX)?;
    let (date_part, file_part) = rest.split_once('/')?;
    let date = crate::model::parse_date(date_part).ok()?;
    let stem = file_part.strip_suffix(".bin")?;
    let (kind_part, version_part) = stem.rsplit_once("-v")?;
    let kind = match kind_part {
        "spreadsheet" => crate::model::SourceKind::Spreadsheet,
        "document" => crate::model::SourceKind::Document,
        _ => return None,
    };
    Some((date, kind, version_part.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordKey;
    use time::macros::date;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
        }
    }

    fn open_log() -> (tempfile::TempDir, CompletionLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = CompletionLog::new(dir.path().join("completion.db")).unwrap();
        (dir, log)
    }

    fn key(dept: &str) -> RecordKey {
        RecordKey::new(date!(2024 - 05 - 01), dept, "gauze")
    }

    #[tokio::test]
    async fn push_pull_round_trip() {
        let store = Arc::new(MemoryObjectStore::new());
        let sync = RemoteSync::new(store.clone(), fast_retry());

        let (_d1, local) = open_log();
        local.resolve(key("pharmacy"), None, None).unwrap();
        local.resolve(key("icu"), None, None).unwrap();
        assert_eq!(sync.push_completion(&local).await.unwrap(), 2);

        let (_d2, other) = open_log();
        assert_eq!(sync.pull_completion(&other).await.unwrap(), 2);
        assert!(other.is_resolved(&key("pharmacy")).unwrap());
        assert!(other.is_resolved(&key("icu")).unwrap());
    }

    #[tokio::test]
    async fn push_is_incremental_and_idempotent() {
        let store = Arc::new(MemoryObjectStore::new());
        let sync = RemoteSync::new(store.clone(), fast_retry());

        let (_dir, local) = open_log();
        local.resolve(key("pharmacy"), None, None).unwrap();
        assert_eq!(sync.push_completion(&local).await.unwrap(), 1);
        // Nothing new: no blob written.
        assert_eq!(sync.push_completion(&local).await.unwrap(), 0);
        assert_eq!(store.blob_count(), 1);

        local.resolve(key("icu"), None, None).unwrap();
        assert_eq!(sync.push_completion(&local).await.unwrap(), 1);
        assert_eq!(store.blob_count(), 2);
    }

    #[tokio::test]
    async fn put_retries_through_transient_failures() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_next_puts(2);
        let sync = RemoteSync::new(store.clone(), fast_retry());

        let (_dir, local) = open_log();
        local.resolve(key("pharmacy"), None, None).unwrap();
        assert_eq!(sync.push_completion(&local).await.unwrap(), 1);
        assert_eq!(store.blob_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_local_log_intact() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_next_puts(3);
        let sync = RemoteSync::new(store.clone(), fast_retry());

        let (_dir, local) = open_log();
        local.resolve(key("pharmacy"), None, None).unwrap();
        let err = sync.push_completion(&local).await.unwrap_err();
        assert!(matches!(err, ReconError::Sync { .. }));
        assert_eq!(store.blob_count(), 0);
        // Local state is still the source of truth; a later push succeeds.
        assert!(local.is_resolved(&key("pharmacy")).unwrap());
        assert_eq!(sync.push_completion(&local).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("remote")).unwrap();
        store.put("completion/1-a.json", b"[]").await.unwrap();
        store.put("uploads/2024-05-01/spreadsheet-v1.bin", b"x").await.unwrap();

        assert_eq!(store.get("completion/1-a.json").await.unwrap(), b"[]");
        assert!(matches!(
            store.get("completion/missing.json").await,
            Err(ReconError::NotFound { .. })
        ));
        let keys = store.list("completion/").await.unwrap();
        assert_eq!(keys, vec!["completion/1-a.json".to_string()]);
    }

    #[tokio::test]
    async fn upload_keys_are_versioned() {
        let store = Arc::new(MemoryObjectStore::new());
        let sync = RemoteSync::new(store.clone(), fast_retry());

        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadStore::new(dir.path().join("a.db")).unwrap();
        for _ in 0..3 {
            uploads
                .insert_upload(date!(2024 - 05 - 01), SourceKind::Document, "a.pdf", b"pdf")
                .unwrap();
        }
        let latest = uploads
            .latest_upload(date!(2024 - 05 - 01), SourceKind::Document)
            .unwrap()
            .unwrap();
        let key = sync.push_upload(&uploads, &latest).await.unwrap();
        assert_eq!(key, "uploads/2024-05-01/document-v3.bin");
        assert_eq!(store.get(&key).await.unwrap(), b"pdf");
    }

    #[tokio::test]
    async fn pull_restores_uploads_with_extraction_state() {
        let store = Arc::new(MemoryObjectStore::new());
        let sync = RemoteSync::new(store.clone(), fast_retry());

        let dir = tempfile::tempdir().unwrap();
        let source = UploadStore::new(dir.path().join("a.db")).unwrap();
        let upload = source
            .insert_upload(
                date!(2024 - 05 - 01),
                SourceKind::Document,
                "receipt.pdf",
                b"pdf-bytes",
            )
            .unwrap();
        source
            .store_pages(
                upload.id,
                &[PageText {
                    page: 1,
                    text: "[department]\nPharmacy\nL000001 8".to_string(),
                    from_ocr: true,
                }],
                &[PageGap {
                    page: 2,
                    reason: "recognition failed".to_string(),
                }],
            )
            .unwrap();
        source
            .store_segments(
                upload.id,
                &[DocumentSegment {
                    document_id: "abc".to_string(),
                    version: 1,
                    department: "pharmacy".to_string(),
                    page_start: 1,
                    page_end: 2,
                    confidence: 0.5,
                }],
            )
            .unwrap();
        sync.push_upload(&source, &upload).await.unwrap();

        let target = UploadStore::new(dir.path().join("b.db")).unwrap();
        assert_eq!(sync.pull_uploads(&target).await.unwrap(), 1);
        let restored = target
            .latest_upload(date!(2024 - 05 - 01), SourceKind::Document)
            .unwrap()
            .unwrap();
        assert_eq!(restored.data, b"pdf-bytes");
        assert_eq!(restored.version, 1);

        // The pulled document reconciles without re-extraction: page
        // text, gaps, and segments came across with the bytes.
        let pages = target.pages_for(restored.id).unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].text.contains("L000001"));
        assert_eq!(target.gaps_for(restored.id).unwrap().len(), 1);
        let segments = target.segments_for(restored.id).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].department, "pharmacy");

        // Already present: nothing to restore.
        assert_eq!(sync.pull_uploads(&target).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn abandoned_temp_files_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("remote")).unwrap();
        store.put("completion/1-a.json", b"[]").await.unwrap();
        // A crash between write and rename leaves the temp file behind;
        // it must never surface as a blob.
        std::fs::write(
            dir.path().join("remote/completion/.2-b.json.tmp"),
            b"{trunc",
        )
        .unwrap();

        let keys = store.list("completion/").await.unwrap();
        assert_eq!(keys, vec!["completion/1-a.json".to_string()]);

        let (_d, log) = open_log();
        let sync = RemoteSync::new(Arc::new(store), fast_retry());
        assert_eq!(sync.pull_completion(&log).await.unwrap(), 0);
    }

    #[test]
    fn upload_key_parsing() {
        let (date, kind, version) =
            parse_upload_key("uploads/2024-05-01/spreadsheet-v2.bin").unwrap();
        assert_eq!(date, date!(2024 - 05 - 01));
        assert_eq!(kind, crate::model::SourceKind::Spreadsheet);
        assert_eq!(version, 2);
        assert!(parse_upload_key("uploads/2024-05-01/notes.txt").is_none());
        assert!(parse_upload_key("completion/1-a.json").is_none());
    }
}
