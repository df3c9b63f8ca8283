//! Query synthesis.
//!
//! `QuerySynthesizer::build` turns a `DatasetRequest` into a `QueryDescriptor`,
//! consulting the schema cache for the collection and key fields and the
//! relationship resolver for the parent filter column. `validate` and
//! `optimize` are pure functions over descriptors.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RuntimeEnvironment;
use crate::core::relationship::RelationshipResolver;
use crate::core::schema_cache::EntitySchemaCache;
use subgrid_api::{
    DatasetRequest, EntitySchema, QueryDescriptor, SortDirection, ValidationReport, pluralize,
};

/// Saved-view id hosts pass when no real view is bound.
pub const PLACEHOLDER_VIEW_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Ordered `key=value` parameters of an OData query string.
///
/// Keys compare case-sensitively; values are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryString {
    params: Vec<(String, String)>,
}

impl QueryString {
    /// Parse `?a=b&c=d` (the leading `?` is optional).
    pub fn parse(raw: &str) -> Self {
        let params = raw
            .trim()
            .trim_start_matches('?')
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Self { params }
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.push((key.into(), value.into()));
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k == key)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.params.retain(|(k, v)| keep(k, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl fmt::Display for QueryString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.params.iter().enumerate() {
            f.write_str(if index == 0 { "?" } else { "&" })?;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Render a record identifier as an OData literal.
///
/// Braces are stripped; GUIDs come out lower-cased and unquoted, anything else
/// is single-quoted with embedded quotes doubled. Characters that would split
/// the query string are percent-encoded.
pub fn filter_literal(record_id: &str) -> String {
    let trimmed = record_id
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .trim();
    match Uuid::parse_str(trimmed) {
        Ok(id) => id.hyphenated().to_string(),
        Err(_) => {
            let escaped = trimmed
                .replace('%', "%25")
                .replace('&', "%26")
                .replace('#', "%23")
                .replace('+', "%2B")
                .replace('\'', "''");
            format!("'{escaped}'")
        }
    }
}

/// Inverse of the percent-encoding applied by `filter_literal`.
pub fn decode_literal(literal: &str) -> String {
    let unquoted = literal
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .map(|inner| inner.replace("''", "'"))
        .unwrap_or_else(|| literal.to_string());
    unquoted
        .replace("%2B", "+")
        .replace("%23", "#")
        .replace("%26", "&")
        .replace("%25", "%")
}

fn select_clause(schema: Option<&EntitySchema>, fields: &[String]) -> String {
    let requested: Vec<&str> = fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();
    if requested.is_empty() || requested.contains(&"*") {
        return "*".to_string();
    }

    let mut columns: Vec<&str> = Vec::new();
    if let Some(schema) = schema {
        columns.push(&schema.primary_id_attribute);
        if let Some(name) = &schema.primary_name_attribute {
            columns.push(name);
        }
    }
    for field in requested {
        if !columns.contains(&field) {
            columns.push(field);
        }
    }
    columns.join(",")
}

fn has_query_marker(query_string: &str) -> bool {
    query_string.contains('?') || query_string.contains('$')
}

pub struct QuerySynthesizer {
    schemas: Arc<EntitySchemaCache>,
    resolver: Arc<RelationshipResolver>,
    environment: RuntimeEnvironment,
}

impl QuerySynthesizer {
    pub fn new(
        schemas: Arc<EntitySchemaCache>,
        resolver: Arc<RelationshipResolver>,
        environment: RuntimeEnvironment,
    ) -> Self {
        Self {
            schemas,
            resolver,
            environment,
        }
    }

    /// Build a descriptor for `request`.
    ///
    /// Never fails: an unresolvable relationship yields a descriptor carrying
    /// the relationship name, no lookup column and a warning.
    #[tracing::instrument(skip(self, request), fields(entity = %request.target_entity))]
    pub async fn build(&self, request: &DatasetRequest) -> QueryDescriptor {
        let entity = request.target_entity.trim();
        let schema = self.schemas.get_schema(entity).await;
        let collection = schema
            .as_ref()
            .map(|s| s.collection_name.clone())
            .unwrap_or_else(|| pluralize(entity));

        let mut query = QueryString::default();
        query.push("$select", select_clause(schema.as_deref(), &request.fields));

        let mut descriptor = QueryDescriptor::new(entity, "").with_collection(collection);
        descriptor.view_id = request.view_id.clone();
        descriptor.source_control_id = request.source_control_id.clone();
        descriptor.source_form_id = request.source_form_id.clone();
        descriptor.include_count = request.include_count;

        if let Some(parent) = &request.parent {
            let relationship = self.resolver.resolve(&parent.entity, entity).await;
            let relationship_name = request
                .relationship_name
                .clone()
                .or_else(|| relationship.as_ref().map(|r| r.relationship_label.clone()))
                .unwrap_or_else(|| format!("{}_{}", parent.entity, entity));

            match relationship {
                Some(_) if parent.record_id.trim().is_empty() => {
                    warn!(
                        "[QuerySynthesizer] Empty parent record id for '{}'; skipping parent filter",
                        relationship_name
                    );
                    descriptor = descriptor.related(relationship_name, None);
                    descriptor
                        .warnings
                        .push("Parent record id is empty; results are not filtered by parent".to_string());
                }
                Some(found) => {
                    query.push(
                        "$filter",
                        format!(
                            "{} eq {}",
                            found.lookup_column,
                            filter_literal(&parent.record_id)
                        ),
                    );
                    descriptor = descriptor.related(relationship_name, Some(found.lookup_column));
                }
                None => {
                    warn!(
                        "[QuerySynthesizer] No relationship between '{}' and '{}'",
                        parent.entity, entity
                    );
                    descriptor = descriptor.related(relationship_name, None);
                    descriptor.warnings.push(format!(
                        "Could not resolve a lookup column from '{}' to '{}'; results are not filtered by parent",
                        entity, parent.entity
                    ));
                }
            }
        }

        if let Some(order) = &request.order_by {
            let direction = match order.direction {
                SortDirection::Asc => "asc",
                SortDirection::Desc => "desc",
            };
            query.push("$orderby", format!("{} {}", order.field, direction));
        }
        if let Some(page_size) = request.page_size.filter(|size| *size > 0) {
            query.push("$top", page_size.to_string());
        }
        if request.include_count {
            query.push("$count", "true");
        }
        if let Some(view_id) = request.view_id.as_deref() {
            if self.applies_view(view_id) {
                query.push("savedQuery", filter_literal(view_id).trim_matches('\'').to_string());
            } else {
                debug!("[QuerySynthesizer] Skipping view clause for '{}'", view_id);
            }
        }

        descriptor.query_string = query.to_string();
        debug!(
            "[QuerySynthesizer] Built {}{}",
            descriptor.collection_name.as_deref().unwrap_or(entity),
            descriptor.query_string
        );
        descriptor
    }

    fn applies_view(&self, view_id: &str) -> bool {
        let normalized = view_id.trim().trim_start_matches('{').trim_end_matches('}');
        !normalized.is_empty()
            && normalized != PLACEHOLDER_VIEW_ID
            && self.environment != RuntimeEnvironment::Local
    }

    /// Check a descriptor before it reaches the network.
    pub fn validate(descriptor: &QueryDescriptor) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if descriptor.entity_logical_name.trim().is_empty() {
            errors.push("Entity logical name is required".to_string());
        }
        let query_string = descriptor.query_string.trim();
        if query_string.is_empty() {
            errors.push("Query string is required".to_string());
        } else if !has_query_marker(query_string) {
            errors.push(format!(
                "Query string '{query_string}' has no query parameter marker"
            ));
        }

        let relationship_name = descriptor
            .relationship_name
            .as_deref()
            .filter(|name| !name.trim().is_empty());
        if descriptor.is_related_query && relationship_name.is_none() {
            warnings.push("Related query has no relationship name".to_string());
        }
        if let Some(name) = relationship_name {
            if descriptor.lookup_column.is_none() {
                warnings.push(format!(
                    "Relationship '{name}' has no resolved lookup column"
                ));
            }
        }

        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Drop wildcard clauses and ask the service not to count unless a count was requested.
    pub fn optimize(descriptor: &QueryDescriptor) -> QueryDescriptor {
        let mut query = QueryString::parse(&descriptor.query_string);
        query.retain(|key, value| !((key == "$select" || key == "$expand") && value == "*"));
        if !query.contains("$count") {
            query.push("$count", "false");
        }

        QueryDescriptor {
            query_string: query.to_string(),
            ..descriptor.clone()
        }
    }
}
