//! ---
//! hm_section: "02-specification"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Service specification model and compose file parsing."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! Validated in-memory service specification and the parser that produces it.
//!
//! The orchestration engine only ever sees the types in [`model`]; everything
//! that touches raw YAML, environment substitution, or filesystem paths lives
//! in [`parser`].

pub mod env;
pub mod errors;
pub mod model;
pub mod parser;
mod raw;

pub use errors::{Result, SpecError};
pub use model::{
    BuildSpec, ComposeSpec, DependsOn, ExecSpec, Hook, HookAction, HookKind, HookSet, HookSlot,
    HttpRequestSpec, InitContainerSpec, PostContainerSpec, ServiceSpec,
};
pub use parser::ComposeParser;
