use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rate-limit counters reported by the service, when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub burst_remaining: Option<u64>,
    pub time_remaining: Option<u64>,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitInfo {
    pub fn is_empty(&self) -> bool {
        self.burst_remaining.is_none()
            && self.time_remaining.is_none()
            && self.retry_after_secs.is_none()
    }
}

/// What the caller knew about the failing request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisContext {
    pub entity_logical_name: Option<String>,
    pub parent_entity: Option<String>,
    pub child_entity: Option<String>,
    pub lookup_column: Option<String>,
    pub query_string: Option<String>,
}

impl DiagnosisContext {
    pub fn for_entity(entity: impl Into<String>) -> Self {
        Self {
            entity_logical_name: Some(entity.into()),
            ..Default::default()
        }
    }

    pub fn with_relationship(
        mut self,
        parent_entity: impl Into<String>,
        child_entity: impl Into<String>,
    ) -> Self {
        self.parent_entity = Some(parent_entity.into());
        self.child_entity = Some(child_entity.into());
        self
    }

    pub fn with_lookup_column(mut self, lookup_column: impl Into<String>) -> Self {
        self.lookup_column = Some(lookup_column.into());
        self
    }

    pub fn with_query(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = Some(query_string.into());
        self
    }
}

/// Structured diagnosis of one failed request.
///
/// Classifications are independent: a single failure can be both a field and
/// a relationship error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDiagnosis {
    pub is_relationship_error: bool,
    pub is_field_error: bool,
    pub is_entity_error: bool,
    pub is_permission_error: bool,
    pub suggestions: Vec<String>,
    pub status: Option<u16>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
    pub rate_limit: Option<RateLimitInfo>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorDiagnosis {
    pub fn empty() -> Self {
        Self {
            is_relationship_error: false,
            is_field_error: false,
            is_entity_error: false,
            is_permission_error: false,
            suggestions: Vec::new(),
            status: None,
            error_code: None,
            error_message: None,
            correlation_id: None,
            request_id: None,
            rate_limit: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_classified(&self) -> bool {
        self.is_relationship_error
            || self.is_field_error
            || self.is_entity_error
            || self.is_permission_error
    }

    /// Labels of the positive classifications, in a fixed order.
    pub fn classifications(&self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        if self.is_relationship_error {
            labels.push("relationship");
        }
        if self.is_field_error {
            labels.push("field");
        }
        if self.is_entity_error {
            labels.push("entity");
        }
        if self.is_permission_error {
            labels.push("permission");
        }
        labels
    }
}
