use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{RecordingPage, TokenResponse};
use crate::config::PbxConfig;
use crate::error::RelayError;
use crate::fsutil;

const API_PATH: &str = "openapi/v1.0";

/// Signed, short-lived download reference for one recording.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DownloadDescriptor {
    pub remote_file: String,
    pub signed_url: String,
}

#[derive(Debug, serde::Deserialize)]
struct DownloadResponse {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    file: String,
    #[serde(default)]
    download_resource_url: String,
}

/// Typed client for the PBX OpenAPI surface.
pub struct PbxClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl PbxClient {
    pub fn new(config: &PbxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent("OpenAPI")
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_PATH, endpoint)
    }

    pub async fn get_token(&self) -> Result<TokenResponse> {
        let response: TokenResponse = self
            .http
            .post(self.api_url("get_token"))
            .json(&json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?
            .json()
            .await?;
        if response.errcode != 0 {
            return Err(RelayError::Auth(response.errmsg).into());
        }
        Ok(response)
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let response: TokenResponse = self
            .http
            .post(self.api_url("refresh_token"))
            .json(&json!({
                "refresh_token": refresh_token,
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?
            .json()
            .await?;
        if response.errcode != 0 {
            return Err(RelayError::Auth(response.errmsg).into());
        }
        Ok(response)
    }

    pub async fn list_recordings(
        &self,
        access_token: &str,
        page: u32,
        page_size: u32,
    ) -> Result<RecordingPage> {
        let url = format!(
            "{}?access_token={}&page={}&page_size={}&sort_by=time&order_by=desc",
            self.api_url("recording/list"),
            access_token,
            page,
            page_size
        );
        let response: RecordingPage = self.http.get(url).send().await?.json().await?;
        if response.errcode != 0 {
            return Err(anyhow!("recording list refused: {}", response.errmsg));
        }
        Ok(response)
    }

    /// Asks the PBX to sign a download URL for one recording id. The returned
    /// resource URL is relative and only valid with the current access token.
    pub async fn get_download_descriptor(
        &self,
        access_token: &str,
        recording_id: u64,
    ) -> Result<DownloadDescriptor> {
        let url = format!(
            "{}?access_token={}&id={}",
            self.api_url("recording/download"),
            access_token,
            recording_id
        );
        let response: DownloadResponse = self.http.get(url).send().await?.json().await?;
        if response.errcode != 0 {
            return Err(anyhow!("download URL refused: {}", response.errmsg));
        }
        Ok(DownloadDescriptor {
            remote_file: response.file,
            signed_url: format!(
                "{}{}?access_token={}",
                self.base_url, response.download_resource_url, access_token
            ),
        })
    }

    /// Streams the recording body to `<root>/<remote_file>`, creating parent
    /// directories. A failed transfer removes the partial file so a later
    /// stage never observes an incomplete download.
    pub async fn download_recording(
        &self,
        descriptor: &DownloadDescriptor,
        download_root: &str,
    ) -> Result<PathBuf> {
        let dest = fsutil::download_path(download_root, &descriptor.remote_file);
        fsutil::ensure_parent_dir(&dest).await?;

        let result = self.stream_to_file(&descriptor.signed_url, &dest).await;
        if result.is_err() {
            fsutil::cleanup_file(&dest).await;
        }
        result?;

        debug!("recording downloaded to {}", dest.display());
        Ok(dest)
    }

    async fn stream_to_file(&self, url: &str, dest: &std::path::Path) -> Result<()> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to download recording, status code: {}",
                response.status()
            ));
        }

        let mut file = File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
