//! DocForge Core - Template-Driven Document Generation
//!
//! # The Rules (Non-Negotiable)
//! 1. Templates Are Contracts: body tokens equal the declared placeholders
//! 2. Versions Are Immutable: change means version N+1
//! 3. Every Document Is Scored
//! 4. Failed Requests Persist Nothing
//! 5. Stores Converge: last write wins, every sync is logged

pub mod error;
pub mod config;
pub mod store;
pub mod templates;
pub mod placeholders;
pub mod datapoints;
pub mod assembler;
pub mod compliance;
pub mod hashing;
pub mod sync;
pub mod pipeline;
pub mod reports;

pub use error::{DocforgeError, Result};
pub use config::EngineConfig;
pub use store::{Collection, DataStore, Filter, Record, SqliteStore, StoreSet};
pub use templates::{Template, TemplateId, TemplateRepository};
pub use placeholders::{ContextPattern, ExpectedType, PlaceholderDefinition, ResolvedValues};
pub use datapoints::{Datapoint, DatapointAggregator, DatapointSet};
pub use assembler::{render, OutputFormat};
pub use compliance::{score, ComplianceReport, ComplianceViolation, RuleCatalog, RuleSet};
pub use hashing::{canonical_json, compute_content_hash, compute_job_hash};
pub use sync::{SyncCoordinator, SyncOutcome, SyncRecord, SyncResolution};
pub use pipeline::{
    GeneratedDocument, GenerationOutcome, GenerationPipeline, GenerationRequest, PeerSyncFailure,
};
pub use reports::{AnalyticsReport, SuiteReport};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
