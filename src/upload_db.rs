// src/upload_db.rs

use crate::error::ReconError;
use crate::extract::PageText;
use crate::model::{DocumentSegment, PageGap, SourceKind, epoch_ms};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use time::Date;
use tracing::info;

/// One stored upload. Re-uploading the same (date, kind) never touches
/// existing rows; it gets the next version number and the old versions
/// stay queryable.
#[derive(Debug)]
pub struct StoredUpload {
    pub id: i64,
    pub date: Date,
    pub kind: SourceKind,
    pub filename: String,
    pub sha256: String,
    pub version: i64,
    pub uploaded_at_ms: i64,
    pub data: Vec<u8>,
}

pub struct UploadStore {
    conn: Connection,
}

impl UploadStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, ReconError> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS uploads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                kind TEXT NOT NULL,
                filename TEXT NOT NULL,
                data BLOB NOT NULL,
                sha256 TEXT NOT NULL,
                version INTEGER NOT NULL,
                uploaded_at_ms INTEGER NOT NULL,
                UNIQUE(date, kind, version)
            )",
            [],
        )?;

        // Recognized page text per document upload, so reconciliation
        // can re-run without another OCR pass.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pages (
                upload_id INTEGER NOT NULL,
                page INTEGER NOT NULL,
                text TEXT NOT NULL,
                from_ocr INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (upload_id, page),
                FOREIGN KEY (upload_id) REFERENCES uploads(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS page_gaps (
                upload_id INTEGER NOT NULL,
                page INTEGER NOT NULL,
                reason TEXT NOT NULL,
                PRIMARY KEY (upload_id, page),
                FOREIGN KEY (upload_id) REFERENCES uploads(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS segments (
                upload_id INTEGER NOT NULL,
                document_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                department TEXT NOT NULL,
                page_start INTEGER NOT NULL,
                page_end INTEGER NOT NULL,
                confidence REAL NOT NULL,
                FOREIGN KEY (upload_id) REFERENCES uploads(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_uploads_date_kind ON uploads(date, kind)",
            [],
        )?;

        info!("Upload store initialized");
        Ok(Self { conn })
    }

    /// Store an upload under the next version for its (date, kind).
    pub fn insert_upload(
        &self,
        date: Date,
        kind: SourceKind,
        filename: &str,
        data: &[u8],
    ) -> Result<StoredUpload, ReconError> {
        let version: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM uploads WHERE date = ?1 AND kind = ?2",
            params![date.to_string(), kind.to_string()],
            |row| row.get(0),
        )?;

        let mut hasher = Sha256::new();
        hasher.update(data);
        let sha256 = format!("{:x}", hasher.finalize());
        let uploaded_at_ms = epoch_ms();

        self.conn.execute(
            "INSERT INTO uploads (date, kind, filename, data, sha256, version, uploaded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                date.to_string(),
                kind.to_string(),
                filename,
                data,
                sha256,
                version,
                uploaded_at_ms,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(id = id, date = %date, kind = %kind, version = version, "Upload stored");

        Ok(StoredUpload {
            id,
            date,
            kind,
            filename: filename.to_string(),
            sha256,
            version,
            uploaded_at_ms,
            data: data.to_vec(),
        })
    }

    /// Restore an upload at an explicit version (sync pull). A version
    /// already present locally is left alone. Returns the new row id,
    /// or `None` when the version already existed.
    pub fn restore_upload(
        &self,
        date: Date,
        kind: SourceKind,
        filename: &str,
        data: &[u8],
        version: i64,
    ) -> Result<Option<i64>, ReconError> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let sha256 = format!("{:x}", hasher.finalize());

        let added = self.conn.execute(
            "INSERT OR IGNORE INTO uploads (date, kind, filename, data, sha256, version, uploaded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                date.to_string(),
                kind.to_string(),
                filename,
                data,
                sha256,
                version,
                epoch_ms(),
            ],
        )?;
        if added > 0 {
            let id = self.conn.last_insert_rowid();
            info!(id = id, date = %date, kind = %kind, version = version, "Upload restored");
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    /// Latest version for one (date, kind), if any.
    pub fn latest_upload(
        &self,
        date: Date,
        kind: SourceKind,
    ) -> Result<Option<StoredUpload>, ReconError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, date, kind, filename, data, sha256, version, uploaded_at_ms
             FROM uploads
             WHERE date = ?1 AND kind = ?2
             ORDER BY version DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![date.to_string(), kind.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_upload(row)?)),
            None => Ok(None),
        }
    }

    /// Latest version of every (date, kind) pair, ordered by date then
    /// kind. This is the working set a reconciliation pass reads.
    pub fn latest_uploads(&self) -> Result<Vec<StoredUpload>, ReconError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, date, kind, filename, data, sha256, version, uploaded_at_ms
             FROM uploads u
             WHERE version = (SELECT MAX(version) FROM uploads
                              WHERE date = u.date AND kind = u.kind)
             ORDER BY date, kind",
        )?;
        let mut rows = stmt.query([])?;
        let mut uploads = Vec::new();
        while let Some(row) = rows.next()? {
            uploads.push(row_to_upload(row)?);
        }
        Ok(uploads)
    }

    /// Persist recognized page text and gaps for a document upload.
    pub fn store_pages(
        &self,
        upload_id: i64,
        pages: &[PageText],
        gaps: &[PageGap],
    ) -> Result<(), ReconError> {
        for page in pages {
            self.conn.execute(
                "INSERT OR REPLACE INTO pages (upload_id, page, text, from_ocr)
                 VALUES (?1, ?2, ?3, ?4)",
                params![upload_id, page.page, page.text, page.from_ocr],
            )?;
        }
        for gap in gaps {
            self.conn.execute(
                "INSERT OR REPLACE INTO page_gaps (upload_id, page, reason)
                 VALUES (?1, ?2, ?3)",
                params![upload_id, gap.page, gap.reason],
            )?;
        }
        info!(upload_id = upload_id, pages = pages.len(), gaps = gaps.len(), "Pages stored");
        Ok(())
    }

    pub fn pages_for(&self, upload_id: i64) -> Result<Vec<PageText>, ReconError> {
        let mut stmt = self.conn.prepare(
            "SELECT page, text, from_ocr FROM pages WHERE upload_id = ?1 ORDER BY page",
        )?;
        let rows = stmt.query_map(params![upload_id], |row| {
            Ok(PageText {
                page: row.get(0)?,
                text: row.get(1)?,
                from_ocr: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn gaps_for(&self, upload_id: i64) -> Result<Vec<PageGap>, ReconError> {
        let mut stmt = self.conn.prepare(
            "SELECT page, reason FROM page_gaps WHERE upload_id = ?1 ORDER BY page",
        )?;
        let rows = stmt.query_map(params![upload_id], |row| {
            Ok(PageGap {
                page: row.get(0)?,
                reason: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Persist segments for one document version. Segments for a
    /// version are written once and never updated.
    pub fn store_segments(
        &self,
        upload_id: i64,
        segments: &[DocumentSegment],
    ) -> Result<(), ReconError> {
        for seg in segments {
            self.conn.execute(
                "INSERT INTO segments
                    (upload_id, document_id, version, department, page_start, page_end, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    upload_id,
                    seg.document_id,
                    seg.version,
                    seg.department,
                    seg.page_start,
                    seg.page_end,
                    seg.confidence,
                ],
            )?;
        }
        info!(upload_id = upload_id, segments = segments.len(), "Segments stored");
        Ok(())
    }

    pub fn segments_for(&self, upload_id: i64) -> Result<Vec<DocumentSegment>, ReconError> {
        let mut stmt = self.conn.prepare(
            "SELECT document_id, version, department, page_start, page_end, confidence
             FROM segments
             WHERE upload_id = ?1
             ORDER BY page_start",
        )?;
        let rows = stmt.query_map(params![upload_id], |row| {
            Ok(DocumentSegment {
                document_id: row.get(0)?,
                version: row.get(1)?,
                department: row.get(2)?,
                page_start: row.get(3)?,
                page_end: row.get(4)?,
                confidence: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn row_to_upload(row: &rusqlite::Row<'_>) -> Result<StoredUpload, ReconError> {
    let date: String = row.get(1)?;
    let kind: String = row.get(2)?;
    Ok(StoredUpload {
        id: row.get(0)?,
        date: crate::model::parse_date(&date)?,
        kind: match kind.as_str() {
            "spreadsheet" => SourceKind::Spreadsheet,
            _ => SourceKind::Document,
        },
        filename: row.get(3)?,
        data: row.get(4)?,
        sha256: row.get(5)?,
        version: row.get(6)?,
        uploaded_at_ms: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn open_store() -> (tempfile::TempDir, UploadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("recon.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn reupload_gets_new_version_and_keeps_old() {
        let (_dir, store) = open_store();
        let d = date!(2024 - 05 - 01);
        let first = store
            .insert_upload(d, SourceKind::Spreadsheet, "a.csv", b"one")
            .unwrap();
        let second = store
            .insert_upload(d, SourceKind::Spreadsheet, "a.csv", b"two")
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);

        let latest = store.latest_upload(d, SourceKind::Spreadsheet).unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.data, b"two");
        assert_ne!(first.sha256, second.sha256);
    }

    #[test]
    fn versions_are_per_date_and_kind() {
        let (_dir, store) = open_store();
        let a = store
            .insert_upload(date!(2024 - 05 - 01), SourceKind::Spreadsheet, "a.csv", b"x")
            .unwrap();
        let b = store
            .insert_upload(date!(2024 - 05 - 01), SourceKind::Document, "a.pdf", b"x")
            .unwrap();
        let c = store
            .insert_upload(date!(2024 - 05 - 02), SourceKind::Spreadsheet, "b.csv", b"x")
            .unwrap();
        assert_eq!(a.version, 1);
        assert_eq!(b.version, 1);
        assert_eq!(c.version, 1);
    }

    #[test]
    fn latest_uploads_collapses_versions() {
        let (_dir, store) = open_store();
        let d = date!(2024 - 05 - 01);
        store
            .insert_upload(d, SourceKind::Spreadsheet, "a.csv", b"one")
            .unwrap();
        store
            .insert_upload(d, SourceKind::Spreadsheet, "a.csv", b"two")
            .unwrap();
        store
            .insert_upload(d, SourceKind::Document, "a.pdf", b"doc")
            .unwrap();

        let latest = store.latest_uploads().unwrap();
        assert_eq!(latest.len(), 2);
        let sheet = latest
            .iter()
            .find(|u| u.kind == SourceKind::Spreadsheet)
            .unwrap();
        assert_eq!(sheet.version, 2);
    }

    #[test]
    fn pages_and_gaps_round_trip() {
        let (_dir, store) = open_store();
        let up = store
            .insert_upload(date!(2024 - 05 - 01), SourceKind::Document, "a.pdf", b"doc")
            .unwrap();
        store
            .store_pages(
                up.id,
                &[
                    PageText {
                        page: 1,
                        text: "dept page".to_string(),
                        from_ocr: false,
                    },
                    PageText {
                        page: 3,
                        text: "item page".to_string(),
                        from_ocr: true,
                    },
                ],
                &[PageGap {
                    page: 2,
                    reason: "recognition failed".to_string(),
                }],
            )
            .unwrap();

        let pages = store.pages_for(up.id).unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages[1].from_ocr);
        let gaps = store.gaps_for(up.id).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].page, 2);
    }

    #[test]
    fn segments_round_trip() {
        let (_dir, store) = open_store();
        let up = store
            .insert_upload(date!(2024 - 05 - 01), SourceKind::Document, "a.pdf", b"doc")
            .unwrap();
        store
            .store_segments(
                up.id,
                &[DocumentSegment {
                    document_id: "abc".to_string(),
                    version: up.version,
                    department: "pharmacy".to_string(),
                    page_start: 1,
                    page_end: 3,
                    confidence: 0.75,
                }],
            )
            .unwrap();
        let segs = store.segments_for(up.id).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].page_end, 3);
    }
}
