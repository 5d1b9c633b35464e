use serde::Deserialize;
use std::collections::BTreeMap;
use std::{fs, path::Path};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub departments: DepartmentConfig,
    #[serde(default)]
    pub spreadsheet: SheetColumns,
    #[serde(default)]
    pub document: DocumentConfig,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_completion_db_path")]
    pub completion_db_path: String,
    /// Directory backing the object-store boundary.
    #[serde(default = "default_store_dir")]
    pub object_store_dir: String,
    #[serde(default = "default_retry")]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
pub struct OcrConfig {
    pub endpoint_url: Option<String>,
    pub secret: Option<String>,
    #[serde(default = "default_ocr_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_retry")]
    pub retry: RetryConfig,
    #[serde(default = "default_pdftoppm")]
    pub pdftoppm_path: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

/// Which department wins when a page mentions more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    First,
    Last,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepartmentConfig {
    /// Line pattern announcing a department; the department name sits on
    /// the following line of the recognized text.
    #[serde(default = "default_dept_marker")]
    pub marker: String,
    /// Known department names; a recognized line equal to one of these
    /// also counts as a detection.
    #[serde(default)]
    pub known: Vec<String>,
    #[serde(default)]
    pub tie_break: TieBreak,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

/// Accepted header spellings for each required spreadsheet column.
/// Matching is done on trimmed, case-folded header cells.
#[derive(Debug, Deserialize)]
pub struct SheetColumns {
    #[serde(default = "default_date_aliases")]
    pub date: Vec<String>,
    #[serde(default = "default_department_aliases")]
    pub department: Vec<String>,
    #[serde(default = "default_item_aliases")]
    pub item: Vec<String>,
    #[serde(default = "default_claimed_aliases")]
    pub claimed: Vec<String>,
    #[serde(default = "default_received_aliases")]
    pub received: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    /// Item-code pattern in recognized text; a trailing integer on the
    /// same line is the received quantity.
    #[serde(default = "default_item_pattern")]
    pub item_pattern: String,
    /// Code → item name, for documents that print codes where
    /// spreadsheets carry names. Mapped codes join under the name;
    /// unmapped codes join as themselves.
    #[serde(default)]
    pub item_names: BTreeMap<String, String>,
}

fn default_db_path() -> String {
    "store/recon.db".to_string()
}

fn default_completion_db_path() -> String {
    "store/completion.db".to_string()
}

fn default_store_dir() -> String {
    "store/remote".to_string()
}

fn default_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 250,
    }
}

fn default_ocr_concurrency() -> usize {
    4
}

fn default_pdftoppm() -> String {
    "pdftoppm".to_string()
}

fn default_dept_marker() -> String {
    r"^\[?department\]?$".to_string()
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_item_pattern() -> String {
    r"L\d{6}".to_string()
}

fn default_date_aliases() -> Vec<String> {
    vec!["date".to_string()]
}

fn default_department_aliases() -> Vec<String> {
    vec!["department".to_string(), "dept".to_string()]
}

fn default_item_aliases() -> Vec<String> {
    vec!["item".to_string(), "item code".to_string()]
}

fn default_claimed_aliases() -> Vec<String> {
    vec!["claimed".to_string(), "claimed qty".to_string()]
}

fn default_received_aliases() -> Vec<String> {
    vec!["received".to_string(), "received qty".to_string()]
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            completion_db_path: default_completion_db_path(),
            object_store_dir: default_store_dir(),
            retry: default_retry(),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            secret: None,
            max_concurrency: default_ocr_concurrency(),
            retry: default_retry(),
            pdftoppm_path: default_pdftoppm(),
        }
    }
}

impl Default for DepartmentConfig {
    fn default() -> Self {
        Self {
            marker: default_dept_marker(),
            known: Vec::new(),
            tie_break: TieBreak::First,
            min_confidence: default_min_confidence(),
        }
    }
}

impl Default for SheetColumns {
    fn default() -> Self {
        Self {
            date: default_date_aliases(),
            department: default_department_aliases(),
            item: default_item_aliases(),
            claimed: default_claimed_aliases(),
            received: default_received_aliases(),
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            item_pattern: default_item_pattern(),
            item_names: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Defaults for running without a config file.
    pub fn default_config() -> Self {
        Self {
            storage: StorageConfig::default(),
            ocr: OcrConfig::default(),
            departments: DepartmentConfig::default(),
            spreadsheet: SheetColumns::default(),
            document: DocumentConfig::default(),
        }
    }
}
