//! Configuration management for the server.
//!
//! Runtime settings come from environment variables; durable security
//! material lives in `<state dir>/security.json`, generated on first run.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Storage DSN (`sqlite:...`); unset or `memory:` selects the in-memory
    /// document store
    pub database_url: Option<String>,
    /// Broker DSN for multi-instance fan-out
    pub redis_url: Option<String>,
    /// Disables script debug logging and loosens nothing else
    pub production: bool,
    /// State directory holding security.json, resources/ and data/
    pub state_dir: PathBuf,
    /// Wall-clock budget for a single script invocation
    pub script_timeout_ms: u64,
}

/// Durable security settings, persisted to `security.json` (mode 0600).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettings {
    pub master_key: String,
    pub jwt_secret: String,
    /// Token lifetime in seconds
    pub jwt_expiration: i64,
    pub allow_registration: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "2403".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        let redis_url = env::var("REDIS_URL").ok().filter(|v| !v.is_empty());
        let production = env::var("PRODUCTION")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let state_dir = env::var("HAVEN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".haven"));

        let script_timeout_ms = env::var("SCRIPT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);

        Ok(Self {
            host,
            port,
            database_url,
            redis_url,
            production,
            state_dir,
            script_timeout_ms,
        })
    }

    /// Directory holding per-collection configs and event scripts.
    pub fn resources_dir(&self) -> PathBuf {
        self.state_dir.join("resources")
    }

    /// Directory for compiled native script modules.
    pub fn plugin_dir(&self) -> PathBuf {
        self.state_dir.join("plugins")
    }

    /// Directory for SQLite database files.
    pub fn data_dir(&self) -> PathBuf {
        self.state_dir.join("data")
    }

    fn security_path(&self) -> PathBuf {
        self.state_dir.join("security.json")
    }

    /// Load `security.json`, creating it with generated keys on first run.
    ///
    /// `MASTER_KEY` and `JWT_SECRET` override the stored values; in
    /// production a `JWT_SECRET` must be supplied explicitly.
    pub fn load_security(&self) -> Result<SecuritySettings, ConfigError> {
        let path = self.security_path();
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
            serde_json::from_str(&raw)
                .map_err(|e| ConfigError::InvalidSecurityFile(e.to_string()))?
        } else {
            let settings = SecuritySettings {
                master_key: generate_key(),
                jwt_secret: generate_key(),
                jwt_expiration: 7 * 24 * 3600,
                allow_registration: true,
            };
            persist_security(&path, &settings)?;
            tracing::info!(path = %path.display(), "generated master key and security settings");
            settings
        };

        if let Ok(key) = env::var("MASTER_KEY") {
            if !key.is_empty() {
                settings.master_key = key;
            }
        }
        match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => settings.jwt_secret = secret,
            _ if self.production => return Err(ConfigError::MissingJwtSecret),
            _ => {}
        }

        Ok(settings)
    }

    /// Persist updated security settings back to disk.
    pub fn save_security(&self, settings: &SecuritySettings) -> Result<(), ConfigError> {
        persist_security(&self.security_path(), settings)
    }
}

fn persist_security(path: &Path, settings: &SecuritySettings) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Io(parent.display().to_string(), e.to_string()))?;
    }
    let raw = serde_json::to_string_pretty(settings)
        .map_err(|e| ConfigError::InvalidSecurityFile(e.to_string()))?;
    std::fs::write(path, raw)
        .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
    }

    Ok(())
}

/// 32 random bytes as lowercase hex.
fn generate_key() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid PORT value")]
    InvalidPort,

    #[error("unsupported DATABASE_URL '{0}'")]
    InvalidDatabaseUrl(String),

    #[error("JWT_SECRET is required in production")]
    MissingJwtSecret,

    #[error("invalid security.json: {0}")]
    InvalidSecurityFile(String),

    #[error("io error at {0}: {1}")]
    Io(String, String),
}
