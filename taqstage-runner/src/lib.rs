//! taqstage runner: configuration, credentials and the ingestion orchestrator.
//!
//! - TOML config with validation and typed accessors
//! - Credential resolution (environment, secrets file, config)
//! - Symbol list parsing
//! - Single-date and date-range runs with per-date failure isolation

pub mod config;
pub mod credentials;
pub mod orchestrator;
pub mod symbols;

pub use config::{ConfigError, IngestConfig};
pub use credentials::{Credentials, CredentialsError};
pub use orchestrator::{
    DateReport, DayEntry, DayOutcome, Orchestrator, RangeReport, RangeRequest, RunError,
};
