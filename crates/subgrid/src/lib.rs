//! Schema-aware dataset engine for entity-oriented OData services.
//!
//! ## Components
//! - `core::schema_cache` - EntitySchemaCache (single-flight schema fetches)
//! - `core::relationship` - RelationshipResolver (schema, pattern and record-analysis discovery)
//! - `core::query_builder` - QuerySynthesizer (build, validate, optimize)
//! - `core::executor` - QueryExecutor (single, batched and probe execution)
//! - `core::converter` - RecordConverter (raw rows to grid records)
//! - `core::diagnostics` - ErrorClassifier (rule table, history, self-healing)
//! - `engine` - DatasetEngine facade wiring the above around one `EntityService`
//! - `retry` - opt-in exponential backoff for callers

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod retry;
pub mod service;
pub mod testing;

pub use config::{EngineConfig, RuntimeEnvironment};
pub use crate::core::{
    ClassificationRule, ConnectivityReport, EntitySchemaCache, ErrorClassifier, ErrorKind,
    Matcher, QueryExecutor, QuerySynthesizer, RecordConverter, RelationshipHealer,
    RelationshipResolver,
};
pub use engine::{DatasetEngine, DatasetOutcome};
pub use error::{EngineError, Result};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use service::{EntityService, RetrievedPage};

pub use subgrid_api as api;
