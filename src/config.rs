use anyhow::Error;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "pbxrelay.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    #[serde(default = "default_download_path")]
    pub download_path: String,
    #[serde(default)]
    pub pbx: PbxConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PbxConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub topic: u32,
    pub heartbeat_secs: u64,
    pub reconnect_secs: u64,
    /// Bounded attempts for the reconnect-and-flush procedure when an
    /// outbound send finds the socket closed.
    pub send_retry_attempts: u32,
    pub send_retry_spacing_secs: u64,
    /// Subtracted from the reported token lifetime before the next refresh.
    pub refresh_margin_secs: u64,
    pub http_timeout_secs: u64,
    pub backfill_page_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    pub api_url: String,
    pub api_key: String,
    pub team_prefix: String,
    pub team_suffix: String,
    pub default_team: String,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DedupConfig {
    Memory,
    Redis { url: String, ttl_secs: u64 },
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub retry_attempts: u32,
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TeamConfig {
    pub name: String,
    pub members: Vec<u32>,
}

fn default_download_path() -> String {
    #[cfg(target_os = "windows")]
    return "./downloads".to_string();
    #[cfg(not(target_os = "windows"))]
    return "/tmp/pbxrelay/downloads".to_string();
}

impl Default for PbxConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            topic: 30012,
            heartbeat_secs: 5,
            reconnect_secs: 5,
            send_retry_attempts: 5,
            send_retry_spacing_secs: 120,
            refresh_margin_secs: 5,
            http_timeout_secs: 30,
            backfill_page_size: 50,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            team_prefix: "org-".to_string(),
            team_suffix: "".to_string(),
            default_team: "default".to_string(),
            http_timeout_secs: 60,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_attempts: 3,
            retry_backoff_secs: 30,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            download_path = "/var/lib/pbxrelay"

            [pbx]
            base_url = "https://pbx.example.com:8088"
            username = "api"
            password = "secret"
            topic = 30012
            heartbeat_secs = 5
            reconnect_secs = 5
            send_retry_attempts = 5
            send_retry_spacing_secs = 120
            refresh_margin_secs = 5
            http_timeout_secs = 30
            backfill_page_size = 50

            [ingestion]
            api_url = "https://ingest.example.com"
            api_key = "key"
            team_prefix = "org-"
            team_suffix = "-ar"
            default_team = "team-2"
            http_timeout_secs = 60

            [dedup]
            type = "redis"
            url = "redis://127.0.0.1:6379"
            ttl_secs = 86400

            [queue]
            workers = 4
            retry_attempts = 3
            retry_backoff_secs = 30

            [[teams]]
            name = "team-1"
            members = [202, 309]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pbx.topic, 30012);
        assert!(matches!(config.dedup, DedupConfig::Redis { .. }));
        assert_eq!(config.teams[0].members, vec![202, 309]);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.queue.workers, 4);
        assert!(matches!(config.dedup, DedupConfig::Memory));
        assert_eq!(config.pbx.heartbeat_secs, 5);
    }
}
