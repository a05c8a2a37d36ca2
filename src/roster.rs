use crate::config::{IngestionConfig, TeamConfig};
use once_cell::sync::Lazy;
use regex::Regex;

static CALLER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<user_id>[^<]+)<(?P<extension>[^>]+)>$").unwrap());

/// Result of splitting a from-party string of the form `name<extension>`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub extension: String,
}

/// Splits `name<extension>`. When the bracket pattern is absent the whole
/// input doubles as both name and extension (original PBX feeds mix formats).
pub fn parse_caller(input: &str) -> CallerIdentity {
    match CALLER_RE.captures(input) {
        Some(caps) => CallerIdentity {
            user_id: caps["user_id"].trim().to_string(),
            extension: caps["extension"].trim().to_string(),
        },
        None => CallerIdentity {
            user_id: input.to_string(),
            extension: input.to_string(),
        },
    }
}

/// Config-driven extension-to-team mapping. Pure lookup, no I/O; the table
/// ships in the TOML config so a roster change never requires a rebuild.
pub struct Roster {
    teams: Vec<TeamConfig>,
    prefix: String,
    suffix: String,
    default_team: String,
}

impl Roster {
    pub fn new(teams: Vec<TeamConfig>, ingestion: &IngestionConfig) -> Self {
        Self {
            teams,
            prefix: ingestion.team_prefix.clone(),
            suffix: ingestion.team_suffix.clone(),
            default_team: ingestion.default_team.clone(),
        }
    }

    /// Resolves an extension to a fully qualified team identifier, falling
    /// back to the configured default team when no roster entry matches.
    pub fn resolve_team(&self, extension: &str) -> String {
        let name = extension
            .parse::<u32>()
            .ok()
            .and_then(|ext| {
                self.teams
                    .iter()
                    .find(|team| team.members.contains(&ext))
                    .map(|team| team.name.as_str())
            })
            .unwrap_or(self.default_team.as_str());
        format!("{}{}{}", self.prefix, name, self.suffix)
    }
}
