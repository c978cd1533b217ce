//! ---
//! hm_section: "01-core-functionality"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Shared primitives and utilities for the orchestration runtime."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rollback_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Primary configuration object for the Harbormaster runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "HM_CONFIG";

    /// Load configuration from disk, respecting the `HM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Some(path) = Self::env_override() {
            let config = Self::from_path(&path)?;
            return Ok(LoadedAppConfig {
                config,
                source: Some(path),
            });
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Like [`AppConfig::load_with_source`], but falls back to defaults when no
    /// candidate exists. A candidate that exists but fails to parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let any_present =
            Self::env_override().is_some() || candidates.iter().any(|c| c.as_ref().exists());
        if any_present {
            return Self::load_with_source(candidates);
        }
        debug!("no configuration file present; using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn env_override() -> Option<PathBuf> {
        std::env::var(Self::ENV_CONFIG_PATH)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Timing knobs for the orchestration engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Client-wide timeout applied to every HTTP hook request.
    #[serde(default = "default_http_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub http_timeout: Duration,
    /// Delay unit for hook retries; the k-th retry waits `k * retry_base_delay`.
    /// Fractional seconds are accepted.
    #[serde(default = "default_retry_base_delay")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub retry_base_delay: Duration,
    /// Grace period handed to the backend when stopping containers on `down`.
    #[serde(default = "default_stop_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stop_timeout: Duration,
    /// Grace period used while rolling back a failed `up`.
    #[serde(default = "default_rollback_stop_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub rollback_stop_timeout: Duration,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.http_timeout.is_zero() {
            return Err(anyhow!("engine.http_timeout must be greater than zero"));
        }
        if self.retry_base_delay.is_zero() {
            return Err(anyhow!("engine.retry_base_delay must be greater than zero"));
        }
        if self.stop_timeout.is_zero() || self.rollback_stop_timeout.is_zero() {
            return Err(anyhow!("engine stop timeouts must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_timeout: default_http_timeout(),
            retry_base_delay: default_retry_base_delay(),
            stop_timeout: default_stop_timeout(),
            rollback_stop_timeout: default_rollback_stop_timeout(),
        }
    }
}

/// Which container backend the runtime should attach to.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Try Docker first and fall back to the stub when the daemon is unreachable.
    #[default]
    Auto,
    Docker,
    Stub,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.engine.http_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.engine.rollback_stop_timeout, Duration::from_secs(10));
        assert_eq!(config.backend.kind, BackendKind::Auto);
    }

    #[test]
    fn parses_engine_and_backend_sections() {
        let config: AppConfig = r#"
            [engine]
            http_timeout = 5
            stop_timeout = 12

            [backend]
            kind = "stub"

            [logging]
            format = "structured-json"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.engine.http_timeout, Duration::from_secs(5));
        assert_eq!(config.engine.stop_timeout, Duration::from_secs(12));
        assert_eq!(config.backend.kind, BackendKind::Stub);
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }

    #[test]
    fn zero_http_timeout_is_rejected() {
        let err = "[engine]\nhttp_timeout = 0\n".parse::<AppConfig>().unwrap_err();
        assert!(format!("{err:#}").contains("http_timeout"));
    }

    #[test]
    fn retry_base_delay_accepts_fractional_seconds() {
        let config: AppConfig = "[engine]\nretry_base_delay = 0.25\n".parse().unwrap();
        assert_eq!(config.engine.retry_base_delay, Duration::from_millis(250));

        let whole: AppConfig = "[engine]\nretry_base_delay = 2\n".parse().unwrap();
        assert_eq!(whole.engine.retry_base_delay, Duration::from_secs(2));
    }

    #[test]
    fn zero_retry_base_delay_is_rejected() {
        let err = "[engine]\nretry_base_delay = 0\n".parse::<AppConfig>().unwrap_err();
        assert!(format!("{err:#}").contains("retry_base_delay"));
    }

    #[test]
    fn missing_candidates_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("harbormaster.toml");
        let loaded = AppConfig::load_or_default(&[missing]).unwrap();
        assert!(loaded.source.is_none());
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbormaster.toml");
        fs::write(&path, "[backend]\nkind = \"docker\"\n").unwrap();
        let loaded = AppConfig::load_with_source(&[dir.path().join("absent.toml"), path.clone()])
            .unwrap();
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.backend.kind, BackendKind::Docker);
    }
}
