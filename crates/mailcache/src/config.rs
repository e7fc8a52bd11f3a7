//! Engine tunables (`engine.json`) and the OAuth client used for token
//! refresh

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Engine settings filename in the config directory
const ENGINE_CONFIG_FILE: &str = "engine.json";

/// Credentials filename in the config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Longest loop interval honoured; larger settings are capped
const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Tunables for the sync engine and background workers
///
/// Every field has a default, so a partial `engine.json` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Periodic sync interval per account
    pub sync_interval_secs: u64,
    /// Cap on messages listed by a full sync
    pub max_initial_messages: usize,
    /// Page size for list requests
    pub page_size: usize,
    /// Refresh access tokens this long before they expire
    pub token_refresh_skew_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_ceiling_secs: u64,
    /// Poll interval for scheduled sends and reminders
    pub due_poll_interval_secs: u64,
    pub scheduled_send_max_attempts: u32,
    /// A claim older than this is considered abandoned by a crashed worker
    pub stale_claim_secs: u64,
    pub newsletter_window_days: i64,
    pub newsletter_min_messages: u32,
    /// Fraction of a sender's mail that must carry list signals
    pub newsletter_bulk_ratio: f64,
    pub newsletter_scan_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
            max_initial_messages: 2000,
            page_size: 100,
            token_refresh_skew_secs: 300,
            backoff_base_secs: 30,
            backoff_ceiling_secs: 1800,
            due_poll_interval_secs: 60,
            scheduled_send_max_attempts: 3,
            stale_claim_secs: 900,
            newsletter_window_days: 90,
            newsletter_min_messages: 3,
            newsletter_bulk_ratio: 0.6,
            newsletter_scan_interval_secs: 3600,
        }
    }
}

impl EngineConfig {
    /// Load `engine.json` from the config directory, or defaults if absent
    pub fn load() -> Result<Self> {
        if config::config_exists(ENGINE_CONFIG_FILE) {
            return config::load_json(ENGINE_CONFIG_FILE).context("Failed to load engine config");
        }
        log::info!("[CONFIG] No {} found, using defaults", ENGINE_CONFIG_FILE);
        Ok(Self::default())
    }

    /// Load from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    pub fn sync_interval(&self) -> Duration {
        loop_interval(self.sync_interval_secs)
    }

    pub fn due_poll_interval(&self) -> Duration {
        loop_interval(self.due_poll_interval_secs)
    }

    pub fn newsletter_scan_interval(&self) -> Duration {
        loop_interval(self.newsletter_scan_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_ceiling_secs)
    }

    pub fn stale_claim_age(&self) -> chrono::TimeDelta {
        seconds_delta(self.stale_claim_secs)
    }

    pub fn token_refresh_skew(&self) -> chrono::TimeDelta {
        seconds_delta(self.token_refresh_skew_secs)
    }
}

/// Timer loops need a non-zero period
fn loop_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(1, MAX_INTERVAL_SECS))
}

fn seconds_delta(secs: u64) -> chrono::TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .unwrap_or(chrono::TimeDelta::MAX)
}

/// OAuth client used to refresh Gmail access tokens
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuthClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Client secrets as downloaded from the Google Cloud Console. Desktop
/// clients nest under `installed`, web clients under `web`.
#[derive(Deserialize)]
struct ClientSecrets {
    #[serde(alias = "web")]
    installed: Option<OAuthClientCredentials>,
}

const ENV_CLIENT_ID: &str = "GMAIL_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "GMAIL_CLIENT_SECRET";

impl OAuthClientCredentials {
    /// Resolve the client from the first source that has one: embedded at
    /// build time, the secrets file in the config directory, then the
    /// environment
    pub fn load() -> Result<Self> {
        if let Some(embedded) = Self::from_compile_time() {
            return Ok(embedded);
        }
        match Self::default_credentials_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Self::from_env(),
        }
    }

    /// Credentials baked in with `GOOGLE_CLIENT_ID` / `GOOGLE_CLIENT_SECRET`
    /// set during the build
    pub fn from_compile_time() -> Option<Self> {
        Self::non_empty(
            option_env!("GOOGLE_CLIENT_ID")?,
            option_env!("GOOGLE_CLIENT_SECRET")?,
        )
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let secrets: ClientSecrets = config::load_json_file(path)?;
        Self::from_secrets(secrets)
            .with_context(|| format!("No OAuth client in {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let secrets: ClientSecrets =
            serde_json::from_str(json).context("Failed to parse client secrets JSON")?;
        Self::from_secrets(secrets)
    }

    pub fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name).with_context(|| format!("{} environment variable not set", name))
        };
        let (id, secret) = (var(ENV_CLIENT_ID)?, var(ENV_CLIENT_SECRET)?);
        Self::non_empty(&id, &secret)
            .with_context(|| format!("{} and {} must not be empty", ENV_CLIENT_ID, ENV_CLIENT_SECRET))
    }

    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }

    fn from_secrets(secrets: ClientSecrets) -> Result<Self> {
        let client = secrets
            .installed
            .context("Client secrets have no 'installed' or 'web' section")?;
        Self::non_empty(&client.client_id, &client.client_secret)
            .context("Client id and secret must not be empty")
    }

    fn non_empty(client_id: &str, client_secret: &str) -> Option<Self> {
        (!client_id.is_empty() && !client_secret.is_empty()).then(|| Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_engine_config_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sync_interval(), Duration::from_secs(300));
        assert_eq!(cfg.backoff_base(), Duration::from_secs(30));
        assert_eq!(cfg.backoff_ceiling(), Duration::from_secs(1800));
        assert_eq!(cfg.scheduled_send_max_attempts, 3);
        assert_eq!(cfg.token_refresh_skew(), chrono::Duration::seconds(300));
    }

    #[test]
    fn test_engine_config_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sync_interval_secs": 60, "newsletter_bulk_ratio": 0.8}}"#).unwrap();

        let cfg = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.sync_interval_secs, 60);
        assert_eq!(cfg.newsletter_bulk_ratio, 0.8);
        assert_eq!(cfg.max_initial_messages, 2000);
    }

    #[test]
    fn test_engine_config_out_of_range_values() {
        let zero: EngineConfig = serde_json::from_str(
            r#"{"sync_interval_secs": 0, "due_poll_interval_secs": 0, "newsletter_scan_interval_secs": 0}"#,
        )
        .unwrap();
        assert_eq!(zero.sync_interval(), Duration::from_secs(1));
        assert_eq!(zero.due_poll_interval(), Duration::from_secs(1));
        assert_eq!(zero.newsletter_scan_interval(), Duration::from_secs(1));

        let huge = EngineConfig {
            due_poll_interval_secs: u64::MAX,
            stale_claim_secs: u64::MAX,
            token_refresh_skew_secs: i64::MAX as u64,
            ..EngineConfig::default()
        };
        assert_eq!(huge.due_poll_interval(), Duration::from_secs(MAX_INTERVAL_SECS));
        assert_eq!(huge.stale_claim_age(), chrono::TimeDelta::MAX);
        assert_eq!(huge.token_refresh_skew(), chrono::TimeDelta::MAX);
    }

    #[test]
    fn test_parse_installed_credentials() {
        let json = r#"{
            "installed": {
                "client_id": "test-client-id.apps.googleusercontent.com",
                "client_secret": "test-secret",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;

        let creds = OAuthClientCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "test-client-id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "test-secret");
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = OAuthClientCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "web-id");
    }

    #[test]
    fn test_invalid_json() {
        assert!(OAuthClientCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let json = r#"{ "installed": { "client_id": "id", "client_secret": "" } }"#;
        assert!(OAuthClientCredentials::from_json(json).is_err());
    }
}
