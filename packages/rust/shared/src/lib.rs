//! Shared types, error model, and configuration for the threat forecaster.
//!
//! This crate is the foundation depended on by all other biothreat crates.
//! It provides:
//! - [`ForecastError`] - the unified error type
//! - Domain types ([`Source`], [`Document`], [`Capability`], [`ThreatCategory`],
//!   [`Mapping`], [`CycleRun`])
//! - Configuration ([`AppConfig`], [`FetchConfig`], [`PipelinePolicy`], config loading)

pub mod config;
pub mod cycle;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CycleConfig, FetchConfig, FetchSettings, OpenRouterConfig, PipelinePolicy,
    PipelineSettings, StorageConfig, ThreatLevelCuts, config_dir, config_file_path, init_config,
    load_config, load_config_from, validate_api_key,
};
pub use cycle::{CycleOutcome, CycleRun, CycleStage, CycleStatus, SourceOutcome};
pub use error::{ForecastError, Result};
pub use types::{
    Capability, CapabilityCandidate, Document, DocumentCandidate, Mapping, MappingView, Source,
    SourceKind, ThreatCategory, ThreatLevel, content_hash, new_id,
};
