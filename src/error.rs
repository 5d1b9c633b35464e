use std::fmt;

#[derive(Debug)]
pub enum ReconError {
    /// Malformed spreadsheet structure — fatal for the file.
    Schema { column: String },
    /// A single bad row/cell. Collected per file, never fatal.
    Value {
        row: usize,
        column: String,
        value: String,
    },
    /// The OCR service is unreachable (after retries exhaust the page
    /// becomes a gap instead).
    OcrUnavailable { detail: String },
    /// Remote storage unreachable or inconsistent after retries.
    Sync { op: String, detail: String },
    /// Blob missing from the object store.
    NotFound { key: String },
    /// The key's latest completion entry is already Resolved.
    DuplicateResolution { key: String },
    /// Reopen requested for a key that is not currently resolved.
    NotResolved { key: String },
    /// Unparseable calendar date.
    DateParse { value: String },
    /// PDF could not be parsed at all.
    Pdf { detail: String },
    /// Configuration file problem.
    Config(String),
    Db(rusqlite::Error),
    Io(std::io::Error),
}

impl fmt::Display for ReconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema { column } => write!(f, "required column '{column}' not found"),
            Self::Value { row, column, value } => {
                write!(f, "row {row}: cannot parse '{column}' value '{value}'")
            }
            Self::OcrUnavailable { detail } => write!(f, "OCR unavailable: {detail}"),
            Self::Sync { op, detail } => write!(f, "sync {op} failed: {detail}"),
            Self::NotFound { key } => write!(f, "object not found: {key}"),
            Self::DuplicateResolution { key } => {
                write!(f, "key already resolved: {key}")
            }
            Self::NotResolved { key } => write!(f, "key is not resolved: {key}"),
            Self::DateParse { value } => write!(f, "cannot parse date '{value}'"),
            Self::Pdf { detail } => write!(f, "PDF error: {detail}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Db(e) => write!(f, "database error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for ReconError {}

impl From<rusqlite::Error> for ReconError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e)
    }
}

impl From<std::io::Error> for ReconError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
