use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

mod client;
pub use client::{DownloadDescriptor, PbxClient};
mod session;
pub use session::{CredentialReceiver, SessionManager};

/// Access/refresh token pair held by the session manager. Never persisted;
/// a process restart re-fetches from scratch.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: Instant,
    pub expires_in: Duration,
}

impl Credential {
    /// Time until the next refresh should fire: the reported lifetime minus
    /// a small margin, never past expiry.
    pub fn refresh_delay(&self, margin: Duration) -> Duration {
        self.expires_in
            .saturating_sub(margin)
            .saturating_sub(self.issued_at.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() >= self.expires_in
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub access_token_expire_time: u64,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token_expire_time: u64,
    #[serde(default)]
    pub refresh_token: String,
}

/// One entry of the REST recording listing (the backfill producer's shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEntry {
    pub id: u64,
    pub time: String,
    #[serde(default)]
    pub uid: String,
    pub call_from: String,
    pub call_to: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub call_type: String,
    pub file: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordingPage {
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub total_number: u64,
    #[serde(default)]
    pub data: Vec<RecordingEntry>,
}

/// Inner call record carried by a stream message envelope (the live
/// producer's shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCall {
    #[serde(default)]
    pub id: u64,
    pub call_id: String,
    #[serde(default)]
    pub time_start: String,
    #[serde(default)]
    pub call_from: String,
    #[serde(default)]
    pub call_to: String,
    #[serde(default)]
    pub call_duration: u64,
    #[serde(default)]
    pub talk_duration: u64,
    #[serde(default)]
    pub status: String,
    pub r#type: String,
    #[serde(default)]
    pub recording: String,
    #[serde(default)]
    pub did_number: String,
}

impl StreamCall {
    /// Dedup key: the numeric prefix of the PBX call id (call ids look like
    /// `1709024846.123`), falling back to the raw id when no digits lead.
    pub fn derived_id(&self) -> String {
        let digits: String = self
            .call_id
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            self.call_id.clone()
        } else {
            digits
        }
    }
}
