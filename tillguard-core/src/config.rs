//! Configuration management

use crate::error::{ErrorContext, TillError, TillResult};
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for a tillguard client instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TillConfig {
    pub api: ApiSettings,
    pub session: SessionSettings,
    pub permissions: PermissionOverrides,
    pub logging: LoggingConfig,
}

/// Remote API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Base URL all endpoint paths are resolved against
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string
    pub user_agent: String,
    /// Issue `GET permissions` after login to enrich the user's role
    pub fetch_permissions: bool,
    pub login_path: String,
    pub refresh_path: String,
    pub profile_path: String,
    pub logout_path: String,
    pub permissions_path: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/".to_string(),
            timeout_seconds: 30,
            user_agent: "tillguard/0.1".to_string(),
            fetch_permissions: false,
            login_path: "login".to_string(),
            refresh_path: "token/refresh".to_string(),
            profile_path: "profile".to_string(),
            logout_path: "logout".to_string(),
            permissions_path: "permissions".to_string(),
        }
    }
}

impl ApiSettings {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_seconds.saturating_mul(1000)
    }
}

/// Session lifetime and persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Session lifetime after the last activity, in milliseconds
    pub duration_ms: u64,
    /// Minimum gap between two activity-driven extensions
    pub activity_throttle_ms: u64,
    /// Interval of the remote validity check; 0 disables it
    pub validation_interval_ms: u64,
    /// Prefix of every key written to the credential store
    pub storage_namespace: String,
    /// Directory of the file-backed credential store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            duration_ms: 3_600_000,
            activity_throttle_ms: 30_000,
            validation_interval_ms: 300_000,
            storage_namespace: "tillguard".to_string(),
            storage_dir: None,
        }
    }
}

impl SessionSettings {
    pub fn session_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.duration_ms.min(i64::MAX as u64) as i64)
    }

    pub fn activity_throttle(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.activity_throttle_ms.min(i64::MAX as u64) as i64)
    }

    /// `None` when the validator is disabled
    pub fn validation_interval(&self) -> Option<std::time::Duration> {
        (self.validation_interval_ms > 0)
            .then(|| std::time::Duration::from_millis(self.validation_interval_ms))
    }

    /// Configured storage directory, falling back to the platform data dir
    pub fn resolved_storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("tillguard"))
                .unwrap_or_else(|| PathBuf::from(".tillguard"))
        })
    }
}

/// Raw role/menu table overrides; codes are validated where the tables are built
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionOverrides {
    /// role name -> permission codes
    pub roles: BTreeMap<String, Vec<String>>,
    /// menu identifier -> required permission codes
    pub menus: BTreeMap<String, Vec<String>>,
}

impl PermissionOverrides {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.menus.is_empty()
    }
}

impl TillConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> TillResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TillError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        let config: TillConfig = toml::from_str(&content).map_err(|e| TillError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })?;

        Ok(config)
    }

    /// Load from an explicit path, else from the default location if it exists,
    /// else fall back to defaults
    pub fn load(path: Option<&Path>) -> TillResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// `<config dir>/tillguard/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tillguard").join("config.toml"))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> TillResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| TillError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content).map_err(|e| TillError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> TillResult<()> {
        if let Err(e) = url::Url::parse(&self.api.base_url) {
            return Err(TillError::Config {
                message: format!("Invalid api.base_url '{}': {}", self.api.base_url, e),
                source: Some(Box::new(e)),
                context: ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Use an absolute URL such as https://pos.example.com/api/"),
            });
        }

        if self.api.timeout_seconds == 0 {
            return Err(crate::config_error!(
                "api.timeout_seconds must be greater than 0",
                "config",
                "Set api.timeout_seconds to a positive value",
            ));
        }

        if self.session.duration_ms == 0 {
            return Err(crate::config_error!(
                "session.duration_ms must be greater than 0",
                "config",
                "Set session.duration_ms to a positive value",
            ));
        }

        if self.session.activity_throttle_ms >= self.session.duration_ms {
            return Err(crate::config_error!(
                "session.activity_throttle_ms must be shorter than session.duration_ms",
                "config",
                "Lower the throttle window or lengthen the session",
            ));
        }

        if self.session.storage_namespace.trim().is_empty() {
            return Err(crate::config_error!(
                "session.storage_namespace cannot be empty",
                "config",
                "Set session.storage_namespace, e.g. \"tillguard\"",
            ));
        }

        Ok(())
    }
}
