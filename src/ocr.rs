// src/ocr.rs

use crate::config::OcrConfig;
use crate::error::ReconError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::{info, warn};

/// The OCR collaborator. Black box: no retry or backoff in here — that
/// is the document extractor's job.
#[async_trait]
pub trait Ocr: Send + Sync {
    async fn recognize(&self, page_png: &[u8]) -> Result<String, ReconError>;
}

/// Page-rasterization capability. Pages are 1-indexed.
pub trait Rasterize: Send + Sync {
    fn rasterize(&self, pdf: &[u8], page: u32) -> Result<Vec<u8>, ReconError>;
}

#[derive(Debug, Serialize)]
struct OcrRequest {
    version: String,
    #[serde(rename = "requestId")]
    request_id: String,
    timestamp: i64,
    images: Vec<OcrImage>,
}

#[derive(Debug, Serialize)]
struct OcrImage {
    format: String,
    name: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    images: Vec<OcrImageResult>,
}

#[derive(Debug, Deserialize)]
struct OcrImageResult {
    #[serde(default)]
    fields: Vec<OcrField>,
}

#[derive(Debug, Deserialize)]
struct OcrField {
    #[serde(rename = "inferText")]
    infer_text: String,
}

/// HTTP OCR client. Posts a base64 page image as JSON and joins the
/// recognized fields into line-oriented text.
pub struct HttpOcrClient {
    client: Client,
    endpoint_url: String,
    secret: String,
}

impl HttpOcrClient {
    pub fn from_config(cfg: &OcrConfig) -> Result<Self, ReconError> {
        let endpoint_url = cfg
            .endpoint_url
            .clone()
            .ok_or_else(|| ReconError::Config("ocr.endpoint_url is not set".to_string()))?;
        Ok(Self {
            client: Client::new(),
            endpoint_url,
            secret: cfg.secret.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Ocr for HttpOcrClient {
    async fn recognize(&self, page_png: &[u8]) -> Result<String, ReconError> {
        let request = OcrRequest {
            version: "V2".to_string(),
            request_id: "receipt-recon".to_string(),
            timestamp: crate::model::epoch_ms(),
            images: vec![OcrImage {
                format: "png".to_string(),
                name: "page".to_string(),
                data: BASE64.encode(page_png),
            }],
        };

        let response = self
            .client
            .post(&self.endpoint_url)
            .header("X-OCR-SECRET", &self.secret)
            .json(&request)
            .send()
            .await
            .map_err(|e| ReconError::OcrUnavailable {
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(status = %status, "OCR service returned non-OK status");
            return Err(ReconError::OcrUnavailable {
                detail: format!("status {status}"),
            });
        }

        let parsed: OcrResponse =
            response
                .json()
                .await
                .map_err(|e| ReconError::OcrUnavailable {
                    detail: format!("bad response body: {e}"),
                })?;

        let text = parsed
            .images
            .first()
            .map(|img| {
                img.fields
                    .iter()
                    .map(|f| f.infer_text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        info!(chars = text.len(), "Page recognized");
        Ok(text)
    }
}

/// Stand-in used when no OCR endpoint is configured. Scanned pages
/// then surface as gaps instead of blocking text-only documents.
pub struct DisabledOcr;

#[async_trait]
impl Ocr for DisabledOcr {
    async fn recognize(&self, _page_png: &[u8]) -> Result<String, ReconError> {
        Err(ReconError::OcrUnavailable {
            detail: "no OCR endpoint configured".to_string(),
        })
    }
}

/// Rasterizer shelling out to poppler's `pdftoppm`.
pub struct PopplerRasterizer {
    pdftoppm_path: String,
}

impl PopplerRasterizer {
    pub fn new(pdftoppm_path: &str) -> Self {
        Self {
            pdftoppm_path: pdftoppm_path.to_string(),
        }
    }
}

impl Rasterize for PopplerRasterizer {
    fn rasterize(&self, pdf: &[u8], page: u32) -> Result<Vec<u8>, ReconError> {
        let dir = tempfile::tempdir()?;
        let pdf_path = dir.path().join("input.pdf");
        std::fs::write(&pdf_path, pdf)?;

        let prefix = dir.path().join("page");
        let status = Command::new(&self.pdftoppm_path)
            .arg("-png")
            .arg("-r")
            .arg("300")
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg(&pdf_path)
            .arg(&prefix)
            .status()
            .map_err(|e| ReconError::Pdf {
                detail: format!("cannot run {}: {e}", self.pdftoppm_path),
            })?;

        if !status.success() {
            return Err(ReconError::Pdf {
                detail: format!("pdftoppm exited with {status} for page {page}"),
            });
        }

        // pdftoppm zero-pads the page number depending on the page count;
        // pick up whatever single file it produced.
        let produced = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().is_some_and(|ext| ext == "png"))
            .ok_or_else(|| ReconError::Pdf {
                detail: format!("pdftoppm produced no output for page {page}"),
            })?;

        Ok(std::fs::read(produced)?)
    }
}
