//! Content-addressed document storage.
//!
//! Documents are validated locally, pushed to the gateway's `add` endpoint
//! and referenced on-chain by the returned content hash.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{DashboardError, Result};

/// Largest accepted document, 10 MiB.
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

const ALLOWED_TYPES: [&str; 6] = [
    "application/pdf",
    "image/jpeg",
    "image/png",
    "image/jpg",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl DocumentFile {
    /// MIME type, falling back to the file extension when none was supplied.
    pub fn mime_type(&self) -> Option<String> {
        if let Some(ct) = self.content_type.as_deref().filter(|ct| !ct.is_empty()) {
            return Some(ct.to_ascii_lowercase());
        }
        let ext = self.file_name.rsplit_once('.')?.1.to_ascii_lowercase();
        let mime = match ext.as_str() {
            "pdf" => "application/pdf",
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "doc" => "application/msword",
            "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            _ => return None,
        };
        Some(mime.to_string())
    }
}

/// Checks type and size before anything is sent to the gateway.
pub fn validate_file(file: &DocumentFile) -> Result<()> {
    let allowed = file
        .mime_type()
        .is_some_and(|mime| ALLOWED_TYPES.contains(&mime.as_str()));
    if !allowed {
        return Err(DashboardError::InvalidFile(
            "Invalid file type. Allowed: PDF, JPG, PNG, DOC, DOCX".into(),
        ));
    }
    if file.bytes.len() > MAX_FILE_SIZE {
        return Err(DashboardError::InvalidFile(
            "File size exceeds 10MB limit".into(),
        ));
    }
    Ok(())
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Stores the bytes and returns their content hash.
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String>;

    /// Retrieval URL for a content hash; empty for an empty hash.
    fn url_for(&self, hash: &str) -> String;
}

/// Validates and uploads one document.
pub async fn upload_document(gateway: &dyn StorageGateway, file: DocumentFile) -> Result<String> {
    validate_file(&file)?;
    let size = file.bytes.len();
    let hash = gateway.upload(&file.file_name, file.bytes).await?;
    log::info!("Uploaded {} ({} bytes) as {}", file.file_name, size, hash);
    Ok(hash)
}

/// Uploads several documents in order; the first failure aborts the batch.
pub async fn upload_many(gateway: &dyn StorageGateway, files: Vec<DocumentFile>) -> Result<Vec<String>> {
    let mut hashes = Vec::with_capacity(files.len());
    for file in files {
        hashes.push(upload_document(gateway, file).await?);
    }
    Ok(hashes)
}

pub fn join_url(base: &str, hash: &str) -> String {
    if hash.is_empty() {
        return String::new();
    }
    format!("{}/{}", base.trim_end_matches('/'), hash)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

/// IPFS HTTP API client (`POST {api}/add`).
pub struct IpfsGateway {
    http: reqwest::Client,
    api_url: String,
    gateway_url: String,
}

impl IpfsGateway {
    pub fn new(api_url: &str, gateway_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            gateway_url: gateway_url.to_string(),
        }
    }
}

#[async_trait]
impl StorageGateway for IpfsGateway {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/add", self.api_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| DashboardError::Upload(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DashboardError::Upload(format!(
                "gateway returned {}",
                response.status()
            )));
        }
        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| DashboardError::Upload(format!("unexpected gateway response: {}", e)))?;
        if added.hash.is_empty() {
            return Err(DashboardError::Upload("gateway returned an empty hash".into()));
        }
        Ok(added.hash)
    }

    fn url_for(&self, hash: &str) -> String {
        join_url(&self.gateway_url, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, content_type: Option<&str>, size: usize) -> DocumentFile {
        DocumentFile {
            file_name: name.into(),
            content_type: content_type.map(String::from),
            bytes: vec![0u8; size],
        }
    }

    #[test]
    fn accepts_allowed_documents() {
        assert!(validate_file(&file("deed.pdf", Some("application/pdf"), 1024)).is_ok());
        assert!(validate_file(&file("map.jpg", Some("image/jpg"), 10)).is_ok());
        assert!(validate_file(&file("plan.docx", None, 10)).is_ok());
        assert!(validate_file(&file("limit.png", Some("image/png"), MAX_FILE_SIZE)).is_ok());
    }

    #[test]
    fn rejects_disallowed_type() {
        let err = validate_file(&file("run.exe", Some("application/x-msdownload"), 10)).unwrap_err();
        assert!(matches!(err, DashboardError::InvalidFile(_)));
        assert!(validate_file(&file("notes.txt", None, 10)).is_err());
        assert!(validate_file(&file("noextension", None, 10)).is_err());
    }

    #[test]
    fn rejects_oversized_files() {
        let err = validate_file(&file("deed.pdf", Some("application/pdf"), MAX_FILE_SIZE + 1)).unwrap_err();
        assert_eq!(err.user_message(), "File size exceeds 10MB limit");
    }

    #[tokio::test]
    async fn batch_upload_stops_at_first_invalid_file() {
        let gateway = crate::mock::MockGateway::new();
        let hashes = upload_many(
            &gateway,
            vec![
                file("a.pdf", Some("application/pdf"), 4),
                file("b.png", Some("image/png"), 8),
            ],
        )
        .await
        .unwrap();
        assert_eq!(hashes.len(), 2);
        assert_ne!(hashes[0], hashes[1]);

        let err = upload_many(
            &gateway,
            vec![file("c.pdf", None, 4), file("d.exe", None, 4), file("e.pdf", None, 4)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DashboardError::InvalidFile(_)));
        assert_eq!(gateway.uploads(), vec!["a.pdf", "b.png", "c.pdf"]);
    }

    #[test]
    fn builds_retrieval_urls() {
        let gateway = IpfsGateway::new("http://127.0.0.1:5001/api/v0/", "https://ipfs.io/ipfs/");
        assert_eq!(gateway.url_for("QmHash"), "https://ipfs.io/ipfs/QmHash");
        assert_eq!(gateway.url_for(""), "");
        assert_eq!(join_url("https://gw.example", "QmX"), "https://gw.example/QmX");
    }
}
