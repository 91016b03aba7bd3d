//! Application configuration.
//!
//! Loaded once from a YAML file at startup and immutable afterwards. Field
//! defaults are applied during deserialization; [`Config::load`] then runs a
//! validation pass whose failures are fatal (exit code 1).
//!
//! In mock mode (`debug.use_mock`) the GitHub credentials are not required
//! and placeholders are filled in so the rest of the system sees a complete
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to determine current directory")]
    CurrentDir(#[source] std::io::Error),
    #[error("runners.cache_url must end with a trailing slash")]
    CacheUrlTrailingSlash,
    #[error("github.app_id is required when debug.use_mock is false")]
    MissingAppId,
    #[error("github.app_private_key_path is required when debug.use_mock is false")]
    MissingPrivateKey,
    #[error("github app private key file not found at {path}")]
    PrivateKeyNotFound { path: PathBuf },
    #[error("either github.org or github.user is required when debug.use_mock is false")]
    MissingAccount,
    #[error("personal accounts require github.repo to be set (account-scoped runners are organization-only)")]
    AccountScopeUnsupported,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub github: GithubConfig,
    pub runners: RunnersConfig,
    pub hyperv: HyperVConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub app_id: Option<u64>,
    pub app_private_key_path: Option<PathBuf>,
    pub org: Option<String>,
    /// Alternative to `org` for personal accounts; requires `repo`.
    pub user: Option<String>,
    pub repo: Option<String>,
}

impl GithubConfig {
    /// The account runners register under: the organization if set, else the
    /// user.
    pub fn account(&self) -> Option<&str> {
        self.org.as_deref().or(self.user.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnersConfig {
    /// Number of slots. An explicit `0` is honored: the process starts,
    /// sweeps, and idles until shutdown.
    pub pool_size: usize,
    pub name_prefix: String,
    /// Custom labels appended after the built-in defaults.
    pub labels: Vec<String>,
    /// Runner group, meaningful for account-scoped (organization) runners
    /// only.
    pub runner_group: Option<String>,
    /// Custom cache server URL; must end with `/`.
    pub cache_url: Option<String>,
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            name_prefix: default_name_prefix(),
            labels: Vec::new(),
            runner_group: None,
            cache_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HyperVConfig {
    pub template_path: String,
    pub storage_path: String,
    /// PowerShell Direct credentials for the guest.
    pub vm_username: String,
    pub vm_password: String,
    pub vm_memory_mb: u32,
    pub vm_cpu_count: u32,
}

impl Default for HyperVConfig {
    fn default() -> Self {
        Self {
            template_path: String::new(),
            storage_path: String::new(),
            vm_username: default_vm_username(),
            vm_password: default_vm_password(),
            vm_memory_mb: default_vm_memory_mb(),
            vm_cpu_count: default_vm_cpu_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_check_interval_seconds: u64,
    pub creation_timeout_minutes: u64,
    pub grace_period_minutes: u64,
}

impl MonitoringConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_secs(self.creation_timeout_minutes * 60)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_minutes * 60)
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: 30,
            creation_timeout_minutes: 5,
            grace_period_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `debug`, `info`, `warn` or `error`.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
    /// When set, a daily `YYYY-MM-DD.log` file is written here in addition
    /// to stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Swap the Hyper-V driver and GitHub client for in-process mocks.
    pub use_mock: bool,
}

fn default_pool_size() -> usize {
    1
}

fn default_name_prefix() -> String {
    "runner-".to_string()
}

fn default_vm_username() -> String {
    "Administrator".to_string()
}

fn default_vm_password() -> String {
    "password".to_string()
}

fn default_vm_memory_mb() -> u32 {
    4096
}

fn default_vm_cpu_count() -> u32 {
    2
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.finalize()
    }

    /// Fill derived defaults and validate. Consumes and returns the config
    /// so a half-validated value cannot escape.
    fn finalize(mut self) -> Result<Self, ConfigError> {
        if self.hyperv.template_path.is_empty() || self.hyperv.storage_path.is_empty() {
            let cwd = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
            if self.hyperv.template_path.is_empty() {
                self.hyperv.template_path =
                    format!(r"{}\vms\templates\runner-template.vhdx", cwd.display());
            }
            if self.hyperv.storage_path.is_empty() {
                self.hyperv.storage_path = format!(r"{}\vms\storage", cwd.display());
            }
        }

        if let Some(cache_url) = &self.runners.cache_url {
            if !cache_url.ends_with('/') {
                return Err(ConfigError::CacheUrlTrailingSlash);
            }
        }

        // A personal account cannot host account-scoped runners, mock or not.
        if self.github.user.is_some() && self.github.org.is_none() && self.github.repo.is_none() {
            return Err(ConfigError::AccountScopeUnsupported);
        }

        if self.debug.use_mock {
            if self.github.app_id.is_none() {
                self.github.app_id = Some(123_456);
            }
            if self.github.app_private_key_path.is_none() {
                self.github.app_private_key_path = Some(PathBuf::from("/mock/path/to/key.pem"));
            }
            if self.github.account().is_none() {
                self.github.org = Some("mock-org".to_string());
            }
        } else {
            if self.github.app_id.is_none() {
                return Err(ConfigError::MissingAppId);
            }
            let key_path = self
                .github
                .app_private_key_path
                .as_ref()
                .ok_or(ConfigError::MissingPrivateKey)?;
            if self.github.account().is_none() {
                return Err(ConfigError::MissingAccount);
            }
            if !key_path.exists() {
                return Err(ConfigError::PrivateKeyNotFound {
                    path: key_path.clone(),
                });
            }
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_mock_config_gets_defaults_and_placeholders() {
        let config = Config::from_yaml("debug:\n  use_mock: true\n").unwrap();
        assert_eq!(config.runners.pool_size, 1);
        assert_eq!(config.runners.name_prefix, "runner-");
        assert_eq!(config.hyperv.vm_username, "Administrator");
        assert_eq!(config.hyperv.vm_memory_mb, 4096);
        assert_eq!(config.hyperv.vm_cpu_count, 2);
        assert_eq!(config.monitoring.health_check_interval_seconds, 30);
        assert_eq!(config.monitoring.creation_timeout_minutes, 5);
        assert_eq!(config.monitoring.grace_period_minutes, 5);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.github.app_id, Some(123_456));
        assert_eq!(config.github.account(), Some("mock-org"));
        assert!(config.hyperv.template_path.ends_with("runner-template.vhdx"));
        assert!(!config.hyperv.storage_path.is_empty());
    }

    #[test]
    fn explicit_zero_pool_size_is_honored() {
        let config =
            Config::from_yaml("runners:\n  pool_size: 0\ndebug:\n  use_mock: true\n").unwrap();
        assert_eq!(config.runners.pool_size, 0);
    }

    #[test]
    fn absent_pool_size_defaults_to_one() {
        let config =
            Config::from_yaml("runners:\n  name_prefix: r-\ndebug:\n  use_mock: true\n").unwrap();
        assert_eq!(config.runners.pool_size, 1);
        assert_eq!(config.runners.name_prefix, "r-");
    }

    #[test]
    fn cache_url_without_trailing_slash_is_rejected() {
        let err = Config::from_yaml(
            "runners:\n  cache_url: http://cache.local\ndebug:\n  use_mock: true\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::CacheUrlTrailingSlash));
    }

    #[test]
    fn cache_url_with_trailing_slash_is_accepted() {
        let config = Config::from_yaml(
            "runners:\n  cache_url: http://cache.local/\ndebug:\n  use_mock: true\n",
        )
        .unwrap();
        assert_eq!(
            config.runners.cache_url.as_deref(),
            Some("http://cache.local/")
        );
    }

    #[test]
    fn user_account_without_repo_is_rejected() {
        let err =
            Config::from_yaml("github:\n  user: somebody\ndebug:\n  use_mock: true\n").unwrap_err();
        assert!(matches!(err, ConfigError::AccountScopeUnsupported));
    }

    #[test]
    fn user_account_with_repo_is_accepted() {
        let config = Config::from_yaml(
            "github:\n  user: somebody\n  repo: widgets\ndebug:\n  use_mock: true\n",
        )
        .unwrap();
        assert_eq!(config.github.account(), Some("somebody"));
        assert_eq!(config.github.repo.as_deref(), Some("widgets"));
    }

    #[test]
    fn non_mock_mode_requires_github_credentials() {
        assert!(matches!(
            Config::from_yaml("github:\n  org: acme\n").unwrap_err(),
            ConfigError::MissingAppId
        ));
        assert!(matches!(
            Config::from_yaml("github:\n  app_id: 1\n  org: acme\n").unwrap_err(),
            ConfigError::MissingPrivateKey
        ));
        assert!(matches!(
            Config::from_yaml("github:\n  app_id: 1\n  app_private_key_path: /dev/null\n")
                .unwrap_err(),
            ConfigError::MissingAccount
        ));
        assert!(matches!(
            Config::from_yaml(
                "github:\n  app_id: 1\n  app_private_key_path: /no/such/key.pem\n  org: acme\n"
            )
            .unwrap_err(),
            ConfigError::PrivateKeyNotFound { .. }
        ));
    }

    #[test]
    fn org_takes_precedence_over_user_as_account() {
        let config = Config::from_yaml(
            "github:\n  org: acme\n  user: somebody\ndebug:\n  use_mock: true\n",
        )
        .unwrap();
        assert_eq!(config.github.account(), Some("acme"));
    }

    #[test]
    fn monitoring_durations_convert_units() {
        let config = Config::from_yaml(
            "monitoring:\n  health_check_interval_seconds: 2\n  creation_timeout_minutes: 1\n  grace_period_minutes: 3\ndebug:\n  use_mock: true\n",
        )
        .unwrap();
        assert_eq!(
            config.monitoring.health_check_interval(),
            Duration::from_secs(2)
        );
        assert_eq!(config.monitoring.creation_timeout(), Duration::from_secs(60));
        assert_eq!(config.monitoring.grace_period(), Duration::from_secs(180));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = Config::from_yaml("runners: [not a map\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "runners:\n  pool_size: 4\ndebug:\n  use_mock: true\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.runners.pool_size, 4);

        let err = Config::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
