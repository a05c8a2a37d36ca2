use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Credential, PbxClient, TokenResponse};
use crate::config::PbxConfig;

pub type CredentialReceiver = watch::Receiver<Option<Credential>>;

/// Retry spacing when a refresh attempt fails; short enough to recover well
/// before a typical token lifetime runs out.
const REFRESH_RETRY: Duration = Duration::from_secs(30);

/// Owns the PBX credential pair and keeps it alive indefinitely. The held
/// credential is replaced as a single value on a watch channel, so a reader
/// can never observe a half-applied refresh; every successful rotation is
/// visible to subscribers (the gateway reconnects on rotation, since the
/// stream authenticates only at connect time).
pub struct SessionManager {
    client: Arc<PbxClient>,
    margin: Duration,
    current: watch::Sender<Option<Credential>>,
    refresh_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(client: Arc<PbxClient>, config: &PbxConfig) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            client,
            margin: Duration::from_secs(config.refresh_margin_secs),
            current,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> CredentialReceiver {
        self.current.subscribe()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.current.borrow().clone()
    }

    /// Fetches the initial credential pair. Idempotent: an unexpired held
    /// credential is returned without a network call.
    pub async fn initialize(&self) -> Result<Credential> {
        if let Some(credential) = self.credential() {
            if !credential.is_expired() {
                return Ok(credential);
            }
        }
        let response = self.client.get_token().await?;
        let credential = self.install(response);
        info!("pbx session established");
        Ok(credential)
    }

    /// Exchanges the refresh token for a new pair and replaces the held
    /// credential atomically. Serialized against itself.
    pub async fn refresh(&self) -> Result<Credential> {
        let _guard = self.refresh_lock.lock().await;
        let refresh_token = self
            .credential()
            .map(|c| c.refresh_token)
            .ok_or_else(|| anyhow!("no credential held, initialize first"))?;
        let response = self.client.refresh_token(&refresh_token).await?;
        let credential = self.install(response);
        debug!("pbx access token refreshed");
        Ok(credential)
    }

    fn install(&self, response: TokenResponse) -> Credential {
        let credential = Credential {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            issued_at: Instant::now(),
            expires_in: Duration::from_secs(response.access_token_expire_time),
        };
        self.current.send_replace(Some(credential.clone()));
        credential
    }

    /// Drives the refresh schedule forever: sleep until just before expiry,
    /// refresh, repeat. A failed refresh is retried on a short fixed delay
    /// and falls back to a full re-initialize once the pair has expired;
    /// no failure mode terminates the loop.
    pub async fn serve(&self, cancel_token: CancellationToken) {
        loop {
            let delay = match self.credential() {
                Some(credential) => credential.refresh_delay(self.margin),
                None => REFRESH_RETRY,
            };
            select! {
                _ = cancel_token.cancelled() => {
                    info!("session manager stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let result = match self.credential() {
                Some(credential) if !credential.is_expired() => self.refresh().await,
                _ => self.initialize().await,
            };
            if let Err(e) = result {
                error!("token refresh failed, retrying in {:?}: {}", REFRESH_RETRY, e);
                select! {
                    _ = cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(REFRESH_RETRY) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_replaces_credential_atomically() {
        let config = PbxConfig::default();
        let client = Arc::new(PbxClient::new(&config).unwrap());
        let manager = SessionManager::new(client, &config);
        let mut receiver = manager.subscribe();
        assert!(receiver.borrow().is_none());

        manager.install(TokenResponse {
            errcode: 0,
            errmsg: String::new(),
            access_token_expire_time: 1800,
            access_token: "at-1".to_string(),
            refresh_token_expire_time: 3600,
            refresh_token: "rt-1".to_string(),
        });
        assert!(receiver.has_changed().unwrap());
        let held = receiver.borrow_and_update().clone().unwrap();
        assert_eq!(held.access_token, "at-1");
        assert_eq!(held.expires_in, Duration::from_secs(1800));

        manager.install(TokenResponse {
            errcode: 0,
            errmsg: String::new(),
            access_token_expire_time: 1800,
            access_token: "at-2".to_string(),
            refresh_token_expire_time: 3600,
            refresh_token: "rt-2".to_string(),
        });
        let held = manager.credential().unwrap();
        assert_eq!(held.access_token, "at-2");
        assert_eq!(held.refresh_token, "rt-2");
    }

    #[tokio::test]
    async fn test_refresh_without_credential_errors() {
        let config = PbxConfig::default();
        let client = Arc::new(PbxClient::new(&config).unwrap());
        let manager = SessionManager::new(client, &config);
        assert!(manager.refresh().await.is_err());
    }
}
