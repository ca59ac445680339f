//! Preflight configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `MSU_PREFLIGHT_*` environment variables. Every layer is validated before
//! the run touches the host.

pub mod env;
pub mod source;

pub use env::{ENV_PREFIX, EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use crate::converge::ConvergePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_INSTALL_ROOT: &str = "/Library/Managed Installs";
pub const DEFAULT_SECURE_CONFIG_PATH: &str =
    "/private/var/root/Library/Preferences/ManagedInstalls.plist";
pub const DEFAULT_USER_CONFIG_PATH: &str = "/Library/Preferences/ManagedInstalls.plist";
pub const DEFAULT_MSU_LOG_PATH: &str =
    "/Users/Shared/.com.googlecode.munki.ManagedSoftwareUpdate.log";
pub const DEFAULT_AUTH_BINARY: &str = "/usr/local/munki/simian/simianauth";

const CONFIG_FILE_VAR: &str = "MSU_PREFLIGHT_CONFIG";

const CONVERGE_ATTEMPTS_RANGE: (u32, u32) = (1, 10);
const CONVERGE_DELAY_MS_RANGE: (u64, u64) = (0, 60_000);
const DNS_TIMEOUT_SECS_RANGE: (u64, u64) = (1, 30);

/// Errors raised while assembling the preflight configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{}", join_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything the preflight run needs to know about the host layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    /// Root of the managed-install tree; `certs/` lives below it.
    pub install_root: PathBuf,
    /// Privileged preferences record (client identifier, HTTP headers).
    pub secure_config_path: PathBuf,
    /// World-readable preferences record (user settings, CA path).
    pub user_config_path: PathBuf,
    /// Activity log written by the update client.
    pub msu_log_path: PathBuf,
    /// Credential-exchange / report executable.
    pub auth_binary: PathBuf,
    /// Scratch directory converged to empty; defaults to `<install_root>/ca`.
    pub scratch_dir: Option<PathBuf>,
    /// Per-run temp directory removed at startup.
    pub temp_dir: Option<PathBuf>,
    pub cellular_interface: String,
    pub wifi_interface: String,
    pub converge_attempts: u32,
    pub converge_delay_ms: u64,
    pub dns_timeout_secs: u64,
    /// Track reported when the secure record carries no identifier yet.
    pub default_track: String,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from(DEFAULT_INSTALL_ROOT),
            secure_config_path: PathBuf::from(DEFAULT_SECURE_CONFIG_PATH),
            user_config_path: PathBuf::from(DEFAULT_USER_CONFIG_PATH),
            msu_log_path: PathBuf::from(DEFAULT_MSU_LOG_PATH),
            auth_binary: PathBuf::from(DEFAULT_AUTH_BINARY),
            scratch_dir: None,
            temp_dir: None,
            cellular_interface: "ppp0".to_string(),
            wifi_interface: "en0".to_string(),
            converge_attempts: 4,
            converge_delay_ms: 1000,
            dns_timeout_secs: 5,
            default_track: "stable".to_string(),
        }
    }
}

impl PreflightConfig {
    /// Load defaults, the optional config file, and the process environment.
    ///
    /// The file is `file` when given, else `$MSU_PREFLIGHT_CONFIG` when set.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_FILE_VAR).map(PathBuf::from));
        Self::load_with(file.as_deref(), EnvParser::new())
    }

    /// Same as [`PreflightConfig::load`] with an explicit environment parser.
    pub fn load_with(file: Option<&Path>, mut env: EnvParser) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&mut env);
        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(source = %ConfigSource::File(path.to_path_buf()), "Loaded preflight config file");
        Ok(config)
    }

    fn apply_env(&mut self, env: &mut EnvParser) {
        fn take<T>(key: &str, slot: &mut T, sourced: Sourced<T>) {
            if sourced.is_env() {
                debug!(key, source = %sourced.source, "Config value overridden");
                *slot = sourced.value;
            }
        }

        let v = env.get_path("INSTALL_ROOT", self.install_root.clone());
        take("install_root", &mut self.install_root, v);
        let v = env.get_path("SECURE_CONFIG_PATH", self.secure_config_path.clone());
        take("secure_config_path", &mut self.secure_config_path, v);
        let v = env.get_path("USER_CONFIG_PATH", self.user_config_path.clone());
        take("user_config_path", &mut self.user_config_path, v);
        let v = env.get_path("MSU_LOG_PATH", self.msu_log_path.clone());
        take("msu_log_path", &mut self.msu_log_path, v);
        let v = env.get_path("AUTH_BINARY", self.auth_binary.clone());
        take("auth_binary", &mut self.auth_binary, v);

        let v = env.get_path("SCRATCH_DIR", self.scratch_dir());
        if v.is_env() {
            debug!(key = "scratch_dir", source = %v.source, "Config value overridden");
            self.scratch_dir = Some(v.value);
        }
        let v = env.get_path("TEMP_DIR", self.temp_dir());
        if v.is_env() {
            debug!(key = "temp_dir", source = %v.source, "Config value overridden");
            self.temp_dir = Some(v.value);
        }

        let v = env.get_string("CELLULAR_INTERFACE", &self.cellular_interface);
        take("cellular_interface", &mut self.cellular_interface, v);
        let v = env.get_string("WIFI_INTERFACE", &self.wifi_interface);
        take("wifi_interface", &mut self.wifi_interface, v);
        let v = env.get_string("DEFAULT_TRACK", &self.default_track);
        take("default_track", &mut self.default_track, v);

        let (min, max) = CONVERGE_ATTEMPTS_RANGE;
        let v = env.get_u32_range("CONVERGE_ATTEMPTS", self.converge_attempts, min, max);
        take("converge_attempts", &mut self.converge_attempts, v);
        let (min, max) = CONVERGE_DELAY_MS_RANGE;
        let v = env.get_u64_range("CONVERGE_DELAY_MS", self.converge_delay_ms, min, max);
        take("converge_delay_ms", &mut self.converge_delay_ms, v);
        let (min, max) = DNS_TIMEOUT_SECS_RANGE;
        let v = env.get_u64_range("DNS_TIMEOUT_SECS", self.dns_timeout_secs, min, max);
        take("dns_timeout_secs", &mut self.dns_timeout_secs, v);
    }

    /// Range checks for values that may have come from the config file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = CONVERGE_ATTEMPTS_RANGE;
        if !(min..=max).contains(&self.converge_attempts) {
            return Err(ConfigError::Invalid {
                field: "converge_attempts",
                reason: format!("{} not in {min}..={max}", self.converge_attempts),
            });
        }
        let (min, max) = CONVERGE_DELAY_MS_RANGE;
        if !(min..=max).contains(&self.converge_delay_ms) {
            return Err(ConfigError::Invalid {
                field: "converge_delay_ms",
                reason: format!("{} not in {min}..={max}", self.converge_delay_ms),
            });
        }
        let (min, max) = DNS_TIMEOUT_SECS_RANGE;
        if !(min..=max).contains(&self.dns_timeout_secs) {
            return Err(ConfigError::Invalid {
                field: "dns_timeout_secs",
                reason: format!("{} not in {min}..={max}", self.dns_timeout_secs),
            });
        }
        for (field, value) in [
            ("cellular_interface", &self.cellular_interface),
            ("wifi_interface", &self.wifi_interface),
            ("default_track", &self.default_track),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Directory the credential exchange writes root CA certificates into.
    pub fn certs_dir(&self) -> PathBuf {
        self.install_root.join("certs")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.install_root.join("ca"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("msu-preflight"))
    }

    pub fn converge_policy(&self) -> ConvergePolicy {
        ConvergePolicy {
            max_attempts: self.converge_attempts,
            delay_unit: Duration::from_millis(self.converge_delay_ms),
        }
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> EnvParser {
        EnvParser::from_map(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = PreflightConfig::load_with(None, env(&[])).unwrap();
        assert_eq!(config, PreflightConfig::default());
        assert_eq!(
            config.scratch_dir(),
            PathBuf::from("/Library/Managed Installs/ca")
        );
        assert_eq!(
            config.certs_dir(),
            PathBuf::from("/Library/Managed Installs/certs")
        );
        assert_eq!(config.dns_timeout(), Duration::from_secs(5));
        assert_eq!(config.converge_policy().max_attempts, 4);
        assert_eq!(config.converge_policy().delay_unit, Duration::from_secs(1));
    }

    #[test]
    fn test_env_overrides() {
        let config = PreflightConfig::load_with(
            None,
            env(&[
                ("MSU_PREFLIGHT_INSTALL_ROOT", "/opt/mi"),
                ("MSU_PREFLIGHT_WIFI_INTERFACE", "en1"),
                ("MSU_PREFLIGHT_CONVERGE_ATTEMPTS", "6"),
            ]),
        )
        .unwrap();
        assert_eq!(config.install_root, PathBuf::from("/opt/mi"));
        assert_eq!(config.scratch_dir(), PathBuf::from("/opt/mi/ca"));
        assert_eq!(config.wifi_interface, "en1");
        assert_eq!(config.converge_attempts, 6);
    }

    #[test]
    fn test_scratch_dir_override() {
        let config = PreflightConfig::load_with(
            None,
            env(&[("MSU_PREFLIGHT_SCRATCH_DIR", "/var/tmp/ca")]),
        )
        .unwrap();
        assert_eq!(config.scratch_dir(), PathBuf::from("/var/tmp/ca"));
    }

    #[test]
    fn test_env_errors_reported_together() {
        let err = PreflightConfig::load_with(
            None,
            env(&[
                ("MSU_PREFLIGHT_CONVERGE_ATTEMPTS", "99"),
                ("MSU_PREFLIGHT_DNS_TIMEOUT_SECS", "x"),
            ]),
        )
        .unwrap_err();
        match err {
            ConfigError::Env(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_file_then_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preflight.toml");
        std::fs::write(
            &path,
            "install_root = \"/srv/mi\"\nwifi_interface = \"en2\"\nconverge_delay_ms = 10\n",
        )
        .unwrap();

        let config = PreflightConfig::load_with(
            Some(&path),
            env(&[("MSU_PREFLIGHT_WIFI_INTERFACE", "en3")]),
        )
        .unwrap();
        assert_eq!(config.install_root, PathBuf::from("/srv/mi"));
        assert_eq!(config.wifi_interface, "en3");
        assert_eq!(config.converge_delay_ms, 10);
        assert_eq!(config.cellular_interface, "ppp0");
    }

    #[test]
    fn test_file_values_validated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preflight.toml");
        std::fs::write(&path, "converge_attempts = 0\n").unwrap();

        let err = PreflightConfig::load_with(Some(&path), env(&[])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "converge_attempts",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err =
            PreflightConfig::load_with(Some(&dir.path().join("nope.toml")), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preflight.toml");
        std::fs::write(&path, "install_root = [").unwrap();
        let err = PreflightConfig::load_with(Some(&path), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
