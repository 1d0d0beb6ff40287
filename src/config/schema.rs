//! Configuration schema for the platform.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error};

/// Reverse proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Address the proxy listens on.
    #[serde(default = "default_proxy_listen")]
    pub listen: String,

    /// Base domain; requests arrive as `<subdomain>.<base_domain>`.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Upper bound in seconds for an on-demand restart triggered by a request.
    #[serde(default = "default_restart_wait")]
    pub restart_wait_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            base_domain: default_base_domain(),
            restart_wait_secs: default_restart_wait(),
        }
    }
}

/// Process isolation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationConfig {
    /// First UID/GID handed out to deployment principals.
    #[serde(default = "default_base_uid")]
    pub base_uid: u32,

    /// Directory holding per-principal home directories.
    #[serde(default = "default_users_dir")]
    pub users_dir: PathBuf,

    /// Directory holding per-subdomain chroot jails.
    #[serde(default = "default_jail_dir")]
    pub jail_dir: PathBuf,

    /// Stage a chroot jail for each instance. Jail staging failures are fatal
    /// only when this is enabled.
    #[serde(default)]
    pub enable_jail: bool,

    /// Memory ceiling per instance in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,

    /// CPU quota in microseconds per 100ms period (50000 = half a core).
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota_us: u64,

    /// Maximum process count per instance.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            base_uid: default_base_uid(),
            users_dir: default_users_dir(),
            jail_dir: default_jail_dir(),
            enable_jail: false,
            memory_limit_bytes: default_memory_limit(),
            cpu_quota_us: default_cpu_quota(),
            pids_limit: default_pids_limit(),
        }
    }
}

/// Main platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    /// SQLite database path.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory holding per-subdomain workspaces and runtime logs.
    #[serde(default = "default_deployments_dir")]
    pub deployments_dir: PathBuf,

    /// Symmetric key material for the secrets vault. Padded/truncated to 32
    /// bytes for AES-256. Overridable via SLIPWAY_ENCRYPTION_KEY.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// First port handed to deployed instances (inclusive).
    #[serde(default = "default_port_start")]
    pub port_range_start: u16,

    /// End of the instance port range (exclusive).
    #[serde(default = "default_port_end")]
    pub port_range_end: u16,

    /// Seconds to wait after launch before declaring an instance alive.
    #[serde(default = "default_grace_secs")]
    pub launch_grace_secs: u64,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub isolation: IsolationConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            deployments_dir: default_deployments_dir(),
            encryption_key: None,
            port_range_start: default_port_start(),
            port_range_end: default_port_end(),
            launch_grace_secs: default_grace_secs(),
            proxy: ProxyConfig::default(),
            isolation: IsolationConfig::default(),
        }
    }
}

impl PlatformConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.port_range_start >= self.port_range_end {
            return Err(ConfigError::ValidationError(format!(
                "port range {}..{} is empty",
                self.port_range_start, self.port_range_end
            ))
            .into());
        }

        if self.proxy.base_domain.is_empty() {
            return Err(
                ConfigError::ValidationError("base domain cannot be empty".to_string()).into(),
            );
        }

        if self.isolation.base_uid < 1000 {
            return Err(ConfigError::ValidationError(format!(
                "base UID {} would collide with system accounts",
                self.isolation.base_uid
            ))
            .into());
        }

        Ok(())
    }

    /// The effective vault key material: env override, then config, then the
    /// development fallback.
    pub fn effective_encryption_key(&self) -> String {
        std::env::var("SLIPWAY_ENCRYPTION_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.encryption_key.clone())
            .unwrap_or_else(|| "slipway-dev-key-change-in-production".to_string())
    }

    /// Workspace directory for a subdomain.
    pub fn workspace_dir(&self, subdomain: &str) -> PathBuf {
        self.deployments_dir.join(subdomain)
    }

    /// Runtime log file for a subdomain.
    pub fn runtime_log_path(&self, subdomain: &str) -> PathBuf {
        self.deployments_dir.join("logs").join(format!("{}.log", subdomain))
    }
}

fn default_proxy_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_restart_wait() -> u64 {
    10
}

fn default_base_uid() -> u32 {
    10000
}

fn default_users_dir() -> PathBuf {
    PathBuf::from("/var/lib/slipway/users")
}

fn default_jail_dir() -> PathBuf {
    PathBuf::from("/var/lib/slipway/jails")
}

fn default_memory_limit() -> u64 {
    512 * 1024 * 1024
}

fn default_cpu_quota() -> u64 {
    50_000
}

fn default_pids_limit() -> u32 {
    100
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/slipway.db")
}

fn default_deployments_dir() -> PathBuf {
    PathBuf::from("./deployments")
}

fn default_port_start() -> u16 {
    3000
}

fn default_port_end() -> u16 {
    4000
}

fn default_grace_secs() -> u64 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PlatformConfig::default();
        config.validate().unwrap();
        assert_eq!(config.port_range_start, 3000);
        assert_eq!(config.port_range_end, 4000);
        assert_eq!(config.proxy.base_domain, "localhost");
        assert!(!config.isolation.enable_jail);
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let config = PlatformConfig {
            port_range_start: 4000,
            port_range_end: 4000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_low_base_uid_rejected() {
        let mut config = PlatformConfig::default();
        config.isolation.base_uid = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_workspace_paths() {
        let config = PlatformConfig::default();
        assert_eq!(
            config.workspace_dir("demo-ab12"),
            PathBuf::from("./deployments/demo-ab12")
        );
        assert_eq!(
            config.runtime_log_path("demo-ab12"),
            PathBuf::from("./deployments/logs/demo-ab12.log")
        );
    }
}
