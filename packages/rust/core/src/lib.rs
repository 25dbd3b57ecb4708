//! Forecasting pipeline for the threat forecaster.
//!
//! This crate ties together the fetcher, the language-model client and
//! storage into the fetch -> extract -> map cycle, plus source/catalog
//! registration.

pub mod catalog;
pub mod cycle;
pub mod extractor;
pub mod llm;
pub mod mapper;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::ThreatCatalog;
pub use cycle::{CancelFlag, CycleCoordinator, CycleProgress, SilentProgress};
pub use extractor::CapabilityExtractor;
pub use llm::{Completion, CompletionClient, CompletionRequest, OpenRouterClient};
pub use mapper::{CapabilityMapper, PairOutcome};
pub use registry::{
    ImportReport, MANUAL_SOURCE_NAME, ManualEntry, SeedReport, import_threats, ingest_manual,
    register_source, seed_sources, seed_threats,
};
