//! Query request, descriptor and result types.
//!
//! A `DatasetRequest` comes from the presentation layer, the synthesizer turns
//! it into a `QueryDescriptor`, and execution yields a terminal `QueryResult`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One row as returned by the entity service.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// Message of the failure returned when no service client is wired in.
pub const SERVICE_UNAVAILABLE_MESSAGE: &str = "Entity service is not available in this context";

// =============================================================================
// Inbound request
// =============================================================================

/// Parent record a relationship-scoped dataset is filtered on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub entity: String,
    pub record_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Logical dataset request issued by a grid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRequest {
    pub target_entity: String,
    pub view_id: Option<String>,
    pub parent: Option<ParentRecord>,
    pub relationship_name: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    pub page_size: Option<u32>,
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub include_count: bool,
    pub source_control_id: Option<String>,
    pub source_form_id: Option<String>,
}

impl DatasetRequest {
    pub fn new(target_entity: impl Into<String>) -> Self {
        Self {
            target_entity: target_entity.into(),
            ..Default::default()
        }
    }

    pub fn with_view(mut self, view_id: impl Into<String>) -> Self {
        self.view_id = Some(view_id.into());
        self
    }

    pub fn with_parent(mut self, entity: impl Into<String>, record_id: impl Into<String>) -> Self {
        self.parent = Some(ParentRecord {
            entity: entity.into(),
            record_id: record_id.into(),
        });
        self
    }

    pub fn with_relationship_name(mut self, name: impl Into<String>) -> Self {
        self.relationship_name = Some(name.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_count(mut self) -> Self {
        self.include_count = true;
        self
    }

    pub fn with_source_control(mut self, control_id: impl Into<String>) -> Self {
        self.source_control_id = Some(control_id.into());
        self
    }

    pub fn with_source_form(mut self, form_id: impl Into<String>) -> Self {
        self.source_form_id = Some(form_id.into());
        self
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// Structured, pre-execution representation of a read request.
///
/// `is_related_query == true` is expected to come with a `relationship_name`;
/// validation only warns when it does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub entity_logical_name: String,
    /// Collection path segment; the executor pluralises the entity name when absent.
    pub collection_name: Option<String>,
    pub view_id: Option<String>,
    pub query_string: String,
    pub relationship_name: Option<String>,
    pub lookup_column: Option<String>,
    pub is_related_query: bool,
    pub source_control_id: Option<String>,
    pub source_form_id: Option<String>,
    pub include_count: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl QueryDescriptor {
    pub fn new(entity_logical_name: impl Into<String>, query_string: impl Into<String>) -> Self {
        Self {
            entity_logical_name: entity_logical_name.into(),
            query_string: query_string.into(),
            ..Default::default()
        }
    }

    pub fn with_collection(mut self, collection_name: impl Into<String>) -> Self {
        self.collection_name = Some(collection_name.into());
        self
    }

    pub fn related(
        mut self,
        relationship_name: impl Into<String>,
        lookup_column: Option<String>,
    ) -> Self {
        self.is_related_query = true;
        self.relationship_name = Some(relationship_name.into());
        self.lookup_column = lookup_column;
        self
    }
}

/// Outcome of `validate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

// =============================================================================
// Failures
// =============================================================================

/// Failure taxonomy for query execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Malformed or incomplete request, caught before any network call.
    Validation,
    /// No service client is available.
    Unavailable,
    /// Connectivity or timeout failure.
    Transport,
    /// The service answered with a failure status.
    Remote,
    /// The response body could not be decoded.
    Parse,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Validation => "validation error",
            FailureKind::Unavailable => "service unavailable",
            FailureKind::Transport => "transport error",
            FailureKind::Remote => "remote error",
            FailureKind::Parse => "parse error",
        };
        f.write_str(label)
    }
}

/// A failed service interaction, as carried in `QueryResult::error`.
///
/// Header names are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ServiceFailure {
    pub kind: FailureKind,
    pub message: String,
    pub status: Option<u16>,
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ServiceFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            body: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn unavailable() -> Self {
        Self::new(FailureKind::Unavailable, SERVICE_UNAVAILABLE_MESSAGE)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Parse, message)
    }

    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(FailureKind::Remote, message)
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            FailureKind::Transport => true,
            FailureKind::Remote => matches!(self.status, Some(408 | 429 | 502 | 503 | 504)),
            _ => false,
        }
    }
}

// =============================================================================
// Result
// =============================================================================

/// Terminal result of executing one descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub entity_logical_name: String,
    pub entities: Vec<RawRow>,
    pub total_count: Option<u64>,
    pub next_page_token: Option<String>,
    pub success: bool,
    pub error: Option<ServiceFailure>,
}

impl QueryResult {
    pub fn succeeded(
        entity_logical_name: impl Into<String>,
        entities: Vec<RawRow>,
        total_count: Option<u64>,
        next_page_token: Option<String>,
    ) -> Self {
        Self {
            entity_logical_name: entity_logical_name.into(),
            entities,
            total_count,
            next_page_token,
            success: true,
            error: None,
        }
    }

    pub fn failed(entity_logical_name: impl Into<String>, failure: ServiceFailure) -> Self {
        Self {
            entity_logical_name: entity_logical_name.into(),
            entities: Vec::new(),
            total_count: None,
            next_page_token: None,
            success: false,
            error: Some(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let failure = ServiceFailure::remote(500, "boom").with_header("REQ_ID", "abc");
        assert_eq!(failure.header("req_id"), Some("abc"));
        assert_eq!(failure.header("Req_Id"), Some("abc"));
        assert_eq!(failure.header("missing"), None);
    }

    #[test]
    fn transient_failures() {
        assert!(ServiceFailure::transport("connection reset").is_transient());
        assert!(ServiceFailure::remote(429, "too many requests").is_transient());
        assert!(ServiceFailure::remote(503, "unavailable").is_transient());
        assert!(!ServiceFailure::remote(400, "bad request").is_transient());
        assert!(!ServiceFailure::validation("empty entity").is_transient());
        assert!(!ServiceFailure::unavailable().is_transient());
    }

    #[test]
    fn failed_result_has_no_rows() {
        let result = QueryResult::failed("task", ServiceFailure::unavailable());
        assert!(!result.success);
        assert!(result.entities.is_empty());
        assert_eq!(
            result.error.map(|e| e.message),
            Some(SERVICE_UNAVAILABLE_MESSAGE.to_string())
        );
    }

    #[test]
    fn request_builder() {
        let request = DatasetRequest::new("task")
            .with_parent("project", "P-1")
            .with_fields(["subject"])
            .with_page_size(25)
            .with_order_by("createdon", SortDirection::Desc);

        assert_eq!(request.parent.as_ref().map(|p| p.entity.as_str()), Some("project"));
        assert_eq!(request.fields, vec!["subject".to_string()]);
        assert_eq!(request.page_size, Some(25));
        assert!(!request.include_count);
    }
}
