use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

pub mod feeds;

pub use feeds::{AssetSpec, FeedSpec, FeedTable, SourceSpec, Validation};

const DEFAULT_CLIENT_ID: i64 = 101;
const BACKEND_KEY_ENV: &str = "SYNC_BACKEND_KEY";

/// Screen identity written once by provisioning and read by every feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScreenConfig {
    pub client_id: i64,
    pub model: i64,
}

impl ScreenConfig {
    /// Read `config.json`, degrading to `default_id` on any failure.
    pub fn load(path: &Path, default_id: i64) -> Self {
        let fallback = Self {
            client_id: default_id,
            model: 0,
        };
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!("config: {} unreadable ({err}); using client {default_id}", path.display());
                return fallback;
            }
        };
        let value: Value = match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(err) => {
                warn!("config: {} is malformed ({err}); using client {default_id}", path.display());
                return fallback;
            }
        };
        let client_id = value
            .get("tela_id")
            .and_then(integer_field)
            .unwrap_or(default_id);
        let model = value.get("modelo").and_then(integer_field).unwrap_or(0);
        Self { client_id, model }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::json!({
            "tela_id": self.client_id,
            "modelo": self.model,
        });
        let bytes = serde_json::to_vec_pretty(&body)
            .map_err(|e| SyncError::Config(format!("failed to serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// Accepts both `101` and `"101"`; the wizard historically wrote strings.
fn integer_field(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Parse the wizard's `"<client>_<model>"` entry. The model part is optional.
pub fn parse_screen_id(input: &str) -> Result<ScreenConfig> {
    let trimmed = input.trim();
    let mut parts = trimmed.splitn(2, '_');
    let client = parts.next().unwrap_or_default();
    let client_id = client
        .parse::<i64>()
        .map_err(|_| SyncError::Config(format!("screen id must start with a number, got {trimmed:?}")))?;
    let model = parts
        .next()
        .and_then(|m| m.parse::<i64>().ok())
        .unwrap_or(0);
    Ok(ScreenConfig { client_id, model })
}

/// Runtime knobs, merged over built-in defaults from `settings.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_client_id: i64,
    pub update_server: String,
    pub backend_url: String,
    pub backend_key: String,
    pub storage_region: String,
    pub check_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub download_attempts: u32,
    pub retry_backoff_secs: u64,
    pub interval_secs: u64,
    pub retry_delay_secs: u64,
    pub deletion_grace_secs: u64,
    pub in_use_ttl_secs: u64,
    pub watchdog_interval_secs: u64,
    pub terminate_timeout_secs: u64,
    pub app_match: String,
    pub app_command: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_client_id: DEFAULT_CLIENT_ID,
            update_server: "http://127.0.0.1:8000".into(),
            backend_url: "http://127.0.0.1:54321".into(),
            backend_key: String::new(),
            storage_region: "sa-east-1".into(),
            check_timeout_secs: 10,
            download_timeout_secs: 20,
            download_attempts: 3,
            retry_backoff_secs: 3,
            interval_secs: 1200,
            retry_delay_secs: 30,
            deletion_grace_secs: 600,
            in_use_ttl_secs: 120,
            watchdog_interval_secs: 1200,
            terminate_timeout_secs: 5,
            app_match: "app.py".into(),
            app_command: vec!["python".into(), "app.py".into()],
        }
    }
}

impl Settings {
    /// Load `settings.json` if present. A malformed file is a hard error so
    /// that a typo never silently points the kiosk at the wrong backend.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<Settings>(&contents).map_err(|e| {
                SyncError::Config(format!("{} parse error: {e}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(err) => return Err(err.into()),
        };
        if let Ok(key) = std::env::var(BACKEND_KEY_ENV)
            && !key.trim().is_empty()
        {
            settings.backend_key = key.trim().to_owned();
        }
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.download_attempts == 0 {
            return Err(SyncError::Config("download_attempts must be at least 1".into()));
        }
        if self.interval_secs == 0 || self.retry_delay_secs == 0 {
            return Err(SyncError::Config("intervals must be non-zero".into()));
        }
        if self.app_command.is_empty() {
            return Err(SyncError::Config("app_command must name a program".into()));
        }
        Ok(())
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn deletion_grace(&self) -> Duration {
        Duration::from_secs(self.deletion_grace_secs)
    }

    pub fn in_use_ttl(&self) -> Duration {
        Duration::from_secs(self.in_use_ttl_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}
