//! ---
//! hm_section: "01-core-functionality"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Shared primitives and utilities for the orchestration runtime."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! Core shared primitives for the Harbormaster workspace.
//! This crate exposes configuration loading, logging initialisation, and
//! the human duration format used by compose files and settings.

pub mod config;
pub mod duration;
pub mod logging;

pub use config::{AppConfig, BackendConfig, BackendKind, EngineConfig, LoggingConfig};
pub use duration::{format_duration, parse_duration};
pub use logging::{init_tracing, LogFormat};
