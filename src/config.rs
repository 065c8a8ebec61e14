use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditLogStore, HeaderAllowList};
use crate::error::{AuditError, Result};

/// Optional configuration file read from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "secure-audit.toml";

/// Prefix of environment overrides, e.g. `SECURE_AUDIT__AUDIT__LOG_PATH`.
pub const ENV_PREFIX: &str = "SECURE_AUDIT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_path: PathBuf,
    pub root_path: PathBuf,
    pub append_timeout_ms: u64,
    /// Appends allowed on the blocking pool at once; more are dropped.
    pub max_pending_appends: usize,
    pub allowed_headers: Vec<String>,
    /// Zero disables the background integrity check.
    pub verify_interval_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Defaults, then `path` if it exists, then the environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = Config::builder()
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 3000_i64)?
            .set_default("audit.enabled", true)?
            .set_default("audit.log_path", "secure_audit.log")?
            .set_default("audit.root_path", "merkle_root.txt")?
            .set_default("audit.append_timeout_ms", 250_i64)?
            .set_default("audit.max_pending_appends", 8_i64)?
            .set_default("audit.allowed_headers", vec!["user-agent", "referer"])?
            .set_default("audit.verify_interval_secs", 300_i64)?
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("audit.allowed_headers")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;

        info!(
            "Configuration loaded (audit log: {}, root: {})",
            config.audit.log_path.display(),
            config.audit.root_path.display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.audit.validate()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_path.as_os_str().is_empty() {
            return Err(AuditError::Config("audit.log_path is empty".to_string()));
        }
        if self.root_path.as_os_str().is_empty() {
            return Err(AuditError::Config("audit.root_path is empty".to_string()));
        }
        if self.log_path == self.root_path {
            return Err(AuditError::Config(format!(
                "audit log and Merkle root must be separate files (both {})",
                self.log_path.display()
            )));
        }
        if self.append_timeout_ms == 0 {
            return Err(AuditError::Config(
                "audit.append_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_pending_appends == 0 {
            return Err(AuditError::Config(
                "audit.max_pending_appends must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    pub fn verify_interval(&self) -> Option<Duration> {
        (self.verify_interval_secs > 0).then(|| Duration::from_secs(self.verify_interval_secs))
    }

    pub fn allow_list(&self) -> HeaderAllowList {
        HeaderAllowList::new(&self.allowed_headers)
    }

    pub fn open_store(&self) -> AuditLogStore {
        AuditLogStore::new(&self.log_path, &self.root_path)
    }
}
