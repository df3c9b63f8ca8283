//! Discovery and query pipeline components.
//!
//! Each component is an explicit object with its own lifetime; shared caches
//! are passed in as `Arc`s rather than living in module-level state.

pub mod converter;
pub mod diagnostics;
pub mod executor;
pub mod query_builder;
pub mod relationship;
pub mod schema_cache;

pub use converter::{FORMATTED_VALUE_SUFFIX, RecordConverter};
pub use diagnostics::{ClassificationRule, ErrorClassifier, ErrorKind, Matcher};
pub use executor::{ConnectivityReport, QueryExecutor};
pub use query_builder::{PLACEHOLDER_VIEW_ID, QueryString, QuerySynthesizer, filter_literal};
pub use relationship::{GENERIC_PARENT_FIELDS, RelationshipHealer, RelationshipResolver};
pub use schema_cache::{EntitySchemaCache, is_valid_entity_name};
