//! ---
//! hm_section: "02-specification"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Service specification model and compose file parsing."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpecError>;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to render YAML: {0}")]
    Render(#[source] serde_yaml::Error),
    #[error("failed to parse env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("version is required")]
    MissingVersion,
    #[error("at least one service is required")]
    NoServices,
    #[error("service {service}: either image or build must be specified")]
    MissingImage { service: String },
    #[error("service {service}: {message}")]
    InvalidContainer { service: String, message: String },
    #[error("service {service}: container name '{container}' is declared more than once")]
    DuplicateContainer { service: String, container: String },
    #[error("service {service}: hook {hook}: {message}")]
    InvalidHook {
        service: String,
        hook: String,
        message: String,
    },
    #[error("service {service}: hook {hook}: invalid type '{kind}'")]
    UnknownHookType {
        service: String,
        hook: String,
        kind: String,
    },
    #[error("service {service} depends on undefined service {dependency}")]
    UnknownDependency { service: String, dependency: String },
    #[error("{field}: {message}")]
    InvalidDuration { field: String, message: String },
}
