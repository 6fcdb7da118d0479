//! Remote document source, DOCX text extraction and the registry book grammar.

use std::path::PathBuf;

use armory_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub mod extract;
pub mod grammar;

pub use extract::{extract_docx_text, extract_document_text, normalize_text};
pub use grammar::RecordGrammar;

pub const CRATE_NAME: &str = "armory-adapters";

pub const DEFAULT_DRIVE_ENDPOINT: &str = "https://www.googleapis.com/drive/v3";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reading document artifact {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable document container: {0}")]
    Container(#[from] zip::result::ZipError),
    #[error("document part {0} not found")]
    MissingPart(&'static str),
    #[error("document part {part} exceeds {limit} bytes")]
    TooLarge { part: &'static str, limit: u64 },
    #[error("malformed document xml: {0}")]
    Xml(String),
    #[error("anchor phrase {0:?} not found; document layout not recognised")]
    MissingAnchor(String),
    #[error("invalid record grammar: {0}")]
    Grammar(#[from] regex::Error),
    #[error("document produced no records; refusing to empty the registry")]
    EmptyBook,
    #[error("storing document artifact: {0:#}")]
    Artifact(anyhow::Error),
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

/// What the remote host reports about the current document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    /// Raw modification time as reported, e.g. `2024-03-01T09:15:27.514Z`.
    pub modified_time: String,
    /// Where the document body can be downloaded from.
    pub content_location: String,
}

/// Remote host of the authoritative document. One attempt per call, no internal retries.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_metadata(&self) -> Result<DocumentMetadata, FetchError>;
    async fn fetch_content(&self, content_location: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct DriveSourceConfig {
    pub endpoint: String,
    pub file_id: String,
    pub api_key: Option<String>,
}

/// Google Drive v3 file metadata + content download.
#[derive(Debug, Clone)]
pub struct DriveDocumentSource {
    http: HttpFetcher,
    config: DriveSourceConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileMetadata {
    modified_time: Option<String>,
    web_content_link: Option<String>,
}

impl DriveDocumentSource {
    pub fn new(http: HttpFetcher, config: DriveSourceConfig) -> Self {
        Self { http, config }
    }

    pub fn metadata_url(&self) -> Result<String, FetchError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(FetchError::MissingCredential("drive api key"))?;
        Ok(format!(
            "{}/files/{}?fields=modifiedTime%2CwebContentLink&key={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.file_id,
            key
        ))
    }
}

pub fn parse_drive_metadata(body: &[u8]) -> Result<DocumentMetadata, FetchError> {
    let parsed: DriveFileMetadata =
        serde_json::from_slice(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
    let modified_time = parsed
        .modified_time
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FetchError::Malformed("missing modifiedTime".to_string()))?;
    let content_location = parsed
        .web_content_link
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FetchError::Malformed("missing webContentLink".to_string()))?;
    Ok(DocumentMetadata {
        modified_time,
        content_location,
    })
}

#[async_trait]
impl DocumentSource for DriveDocumentSource {
    async fn fetch_metadata(&self) -> Result<DocumentMetadata, FetchError> {
        let url = self.metadata_url()?;
        let body = self.http.fetch_bytes(&url).await?;
        parse_drive_metadata(&body)
    }

    async fn fetch_content(&self, content_location: &str) -> Result<Vec<u8>, FetchError> {
        self.http.fetch_bytes(content_location).await
    }
}
