//! Client for the upstream case-management API.
//!
//! [`CaseSource`] is the seam the orchestrator pulls cases and evidence
//! through; [`HttpCaseSource`] is the production implementation. Requests
//! carry bearer auth and retry transient failures (HTTP 429/5xx, network
//! errors) with exponential backoff; other 4xx responses fail immediately.
//!
//! Evidence downloads use a separate client with a long timeout, since
//! evidence archives can be large.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::CaseSourceConfig;
use crate::error::SourceError;
use crate::models::{CaseMetadata, EvidenceRef};

/// Upstream source of cases and evidence files.
#[async_trait]
pub trait CaseSource: Send + Sync {
    /// Fetch metadata for one case. `Err(CaseNotFound)` when the upstream
    /// does not know the id.
    async fn fetch_case(&self, case_id: i64) -> Result<CaseMetadata, SourceError>;

    /// List the evidence files attached to a case.
    async fn list_evidence(&self, case_id: i64) -> Result<Vec<EvidenceRef>, SourceError>;

    /// Download the raw bytes of one evidence file.
    async fn download_evidence(
        &self,
        case_id: i64,
        evidence_id: i64,
    ) -> Result<Vec<u8>, SourceError>;
}

#[derive(Deserialize)]
struct CaseListResponse {
    data: Vec<CaseListItem>,
}

#[derive(Deserialize)]
struct CaseListItem {
    case_id: i64,
    case_name: String,
    #[serde(default)]
    case_description: Option<String>,
    #[serde(default)]
    client_name: Option<String>,
}

#[derive(Deserialize)]
struct EvidenceListResponse {
    data: EvidenceListData,
}

#[derive(Deserialize)]
struct EvidenceListData {
    #[serde(default)]
    evidences: Vec<EvidenceItem>,
}

#[derive(Deserialize)]
struct EvidenceItem {
    id: i64,
    filename: String,
    #[serde(default)]
    file_size: Option<i64>,
    #[serde(default)]
    file_description: Option<String>,
    #[serde(default)]
    file_type: Option<String>,
}

/// HTTP implementation of [`CaseSource`].
pub struct HttpCaseSource {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    download_client: reqwest::Client,
    max_retries: u32,
}

impl HttpCaseSource {
    pub fn new(config: &CaseSourceConfig) -> Result<Self, SourceError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("CASE_SOURCE_API_KEY").ok());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let download_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()?;

        Ok(Self {
            base_url,
            api_key,
            client,
            download_client,
            max_retries: config.max_retries,
        })
    }

    /// GET with retry/backoff; returns the successful response.
    async fn get_with_retry(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<reqwest::Response, SourceError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = client.get(url);
            if let Some(key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(SourceError::Auth);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body = response.text().await.unwrap_or_default();
                        last_err = Some(format!("case source error {}: {}", status, body));
                        continue;
                    }

                    if status.as_u16() == 404 {
                        return Err(SourceError::Api(format!("not found: {}", url)));
                    }

                    let body = response.text().await.unwrap_or_default();
                    return Err(SourceError::Api(format!(
                        "case source error {}: {}",
                        status, body
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(SourceError::Transient(last_err.unwrap_or_else(|| {
            "case source request failed after retries".to_string()
        })))
    }
}

#[async_trait]
impl CaseSource for HttpCaseSource {
    async fn fetch_case(&self, case_id: i64) -> Result<CaseMetadata, SourceError> {
        let url = format!("{}/manage/cases/list", self.base_url);
        let response = self.get_with_retry(&self.client, &url).await?;
        let list: CaseListResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Api(format!("unexpected case list shape: {}", e)))?;

        list.data
            .into_iter()
            .find(|c| c.case_id == case_id)
            .map(|c| CaseMetadata {
                case_id: c.case_id,
                case_name: c.case_name,
                case_description: c.case_description,
                client_name: c.client_name,
            })
            .ok_or(SourceError::CaseNotFound(case_id))
    }

    async fn list_evidence(&self, case_id: i64) -> Result<Vec<EvidenceRef>, SourceError> {
        let url = format!("{}/case/evidences/list?cid={}", self.base_url, case_id);
        let response = self.get_with_retry(&self.client, &url).await?;
        let list: EvidenceListResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Api(format!("unexpected evidence list shape: {}", e)))?;

        Ok(list
            .data
            .evidences
            .into_iter()
            .map(|e| EvidenceRef {
                id: e.id,
                filename: e.filename,
                // file_type is free-form upstream; only pass through real
                // MIME strings and let byte sniffing handle the rest.
                mime_hint: e.file_type.filter(|t| t.contains('/')),
                byte_size: e.file_size,
                description: e.file_description,
            })
            .collect())
    }

    async fn download_evidence(
        &self,
        case_id: i64,
        evidence_id: i64,
    ) -> Result<Vec<u8>, SourceError> {
        let url = format!(
            "{}/case/evidences/{}/download?cid={}",
            self.base_url, evidence_id, case_id
        );
        let response = match self.get_with_retry(&self.download_client, &url).await {
            Ok(r) => r,
            Err(SourceError::Api(msg)) if msg.starts_with("not found") => {
                return Err(SourceError::EvidenceNotFound(evidence_id));
            }
            Err(e) => return Err(e),
        };

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn source_for(server: &MockServer, max_retries: u32) -> HttpCaseSource {
        HttpCaseSource::new(&CaseSourceConfig {
            base_url: server.base_url(),
            api_key: Some("test-key".to_string()),
            timeout_secs: 5,
            download_timeout_secs: 5,
            max_retries,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_case_finds_the_requested_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/manage/cases/list")
                    .header("Authorization", "Bearer test-key");
                then.status(200).json_body(json!({
                    "status": "success",
                    "data": [
                        {"case_id": 1, "case_name": "Phishing wave"},
                        {"case_id": 7, "case_name": "Ransomware", "client_name": "Acme"}
                    ]
                }));
            })
            .await;

        let source = source_for(&server, 0);
        let case = source.fetch_case(7).await.unwrap();
        assert_eq!(case.case_name, "Ransomware");
        assert_eq!(case.client_name.as_deref(), Some("Acme"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_case_is_case_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/manage/cases/list");
                then.status(200)
                    .json_body(json!({"status": "success", "data": []}));
            })
            .await;

        let source = source_for(&server, 0);
        assert!(matches!(
            source.fetch_case(42).await,
            Err(SourceError::CaseNotFound(42))
        ));
    }

    #[tokio::test]
    async fn evidence_list_maps_fields() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/case/evidences/list")
                    .query_param("cid", "7");
                then.status(200).json_body(json!({
                    "data": {
                        "evidences": [
                            {
                                "id": 11,
                                "filename": "triage.pdf",
                                "file_size": 2048,
                                "file_type": "application/pdf",
                                "file_description": "host triage report"
                            },
                            {"id": 12, "filename": "notes.txt", "file_type": "report"}
                        ]
                    }
                }));
            })
            .await;

        let source = source_for(&server, 0);
        let evidence = source.list_evidence(7).await.unwrap();
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].mime_hint.as_deref(), Some("application/pdf"));
        assert_eq!(evidence[0].byte_size, Some(2048));
        // Free-form type strings are not MIME hints
        assert_eq!(evidence[1].mime_hint, None);
    }

    #[tokio::test]
    async fn download_returns_raw_bytes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/case/evidences/11/download")
                    .query_param("cid", "7");
                then.status(200).body(b"raw evidence bytes");
            })
            .await;

        let source = source_for(&server, 0);
        let bytes = source.download_evidence(7, 11).await.unwrap();
        assert_eq!(bytes, b"raw evidence bytes");
    }

    #[tokio::test]
    async fn missing_download_is_evidence_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/case/evidences/99/download");
                then.status(404);
            })
            .await;

        let source = source_for(&server, 0);
        assert!(matches!(
            source.download_evidence(7, 99).await,
            Err(SourceError::EvidenceNotFound(99))
        ));
    }

    #[tokio::test]
    async fn auth_rejection_fails_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/manage/cases/list");
                then.status(401);
            })
            .await;

        let source = source_for(&server, 3);
        assert!(matches!(
            source.fetch_case(1).await,
            Err(SourceError::Auth)
        ));
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn server_errors_exhaust_retries_as_transient() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/manage/cases/list");
                then.status(503);
            })
            .await;

        let source = source_for(&server, 1);
        assert!(matches!(
            source.fetch_case(1).await,
            Err(SourceError::Transient(_))
        ));
        assert_eq!(mock.hits_async().await, 2);
    }
}
