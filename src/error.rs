use thiserror::Error;

/// Error kinds the relay distinguishes. Only `Stage` failures and exhausted
/// `Delivery` attempts require operator follow-up; everything else is
/// self-healing (reconnect, re-refresh, drop-and-continue).
#[derive(Debug, Error)]
pub enum RelayError {
    /// Credential fetch or refresh rejected by the PBX.
    #[error("pbx auth rejected: {0}")]
    Auth(String),

    /// Connection-level failure on the event stream.
    #[error("stream transport error: {0}")]
    Transport(String),

    /// Outbound stream message abandoned after bounded retries.
    #[error("outbound delivery abandoned after {attempts} attempts")]
    Delivery { attempts: u32 },

    /// Malformed inbound frame or embedded record; the frame is dropped.
    #[error("unparseable frame: {0}")]
    Parse(#[from] serde_json::Error),

    /// A pipeline stage failed; redelivery is up to the job queue.
    #[error("stage {stage} failed: {reason}")]
    Stage { stage: &'static str, reason: String },
}

impl RelayError {
    pub fn stage(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Stage {
            stage,
            reason: err.to_string(),
        }
    }
}
