use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::IngestionConfig;

/// Request body for a signed upload URL. The timestamp must already be in
/// canonical UTC form (see [`normalize_timestamp`]).
#[derive(Debug, Clone, Serialize)]
pub struct UploadRequest {
    pub user_id: String,
    pub prospect_id: String,
    pub unit_id: String,
    pub recording_type: String,
    pub timestamp: String,
    pub topic: String,
    pub api_key: String,
    pub metadata: UploadMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    pub extension: String,
}

/// Signed upload target; the PUT must carry every returned header.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadTicket {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Client for the recording ingestion API.
pub struct IngestionClient {
    http: reqwest::Client,
    api_url: String,
}

impl IngestionClient {
    pub fn new(config: &IngestionConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn generate_upload_url(&self, request: &UploadRequest) -> Result<UploadTicket> {
        let url = format!("{}/api_recording_uri", self.api_url);
        let response = self.http.post(url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "upload URL request failed with status {}",
                response.status()
            ));
        }
        Ok(response.json().await?)
    }

    /// Streams the local file to the signed URL as a raw PUT, with a content
    /// type inferred from the file extension plus the ticket's headers.
    pub async fn upload_recording(&self, path: &Path, ticket: &UploadTicket) -> Result<()> {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let file = tokio::fs::File::open(path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let mut request = self
            .http
            .put(&ticket.url)
            .header(reqwest::header::CONTENT_TYPE, mime.as_ref())
            .body(body);
        for (key, value) in &ticket.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to upload recording, status code: {}",
                response.status()
            ));
        }
        debug!("uploaded {} to ingestion", path.display());
        Ok(())
    }
}

/// Normalizes a call timestamp to `YYYY-MM-DDTHH:MM:SSZ` UTC. Accepts the
/// PBX's `DD/MM/YYYY hh:mm:ss AM/PM` form (taken as UTC) and ISO-8601; any
/// other input is a hard error, never a silently defaulted timestamp.
pub fn normalize_timestamp(input: &str) -> Result<String> {
    const CANONICAL: &str = "%Y-%m-%dT%H:%M:%SZ";

    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Ok(parsed.with_timezone(&Utc).format(CANONICAL).to_string());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%d/%m/%Y %I:%M:%S %p") {
        return Ok(naive.and_utc().format(CANONICAL).to_string());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc().format(CANONICAL).to_string());
    }
    Err(anyhow!("unable to parse date: {}", input))
}
