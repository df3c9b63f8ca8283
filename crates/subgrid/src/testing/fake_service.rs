//! In-memory `EntityService` for tests and offline runs.
//!
//! FakeEntityService serves scripted entity definitions and rows:
//! - evaluates `$select`, `$filter=<field> eq <literal>` (joined with `and`), `$orderby`, `$top`, `$count`
//! - rejects unknown properties and collections with service-shaped 400/404 failures
//! - records call counts and the in-flight high-water mark for concurrency assertions

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::query_builder::{QueryString, decode_literal};
use crate::service::{EntityService, RetrievedPage};
use subgrid_api::{EntityDefinition, EntitySchema, RawRow, ServiceFailure};

#[derive(Default)]
struct FakeState {
    definitions: HashMap<String, EntityDefinition>,
    rows: HashMap<String, Vec<RawRow>>,
    definition_failures: HashMap<String, VecDeque<ServiceFailure>>,
    collection_failures: HashMap<String, ServiceFailure>,
    latency: HashMap<String, Duration>,
    definition_latency: Duration,
    definition_calls: HashMap<String, usize>,
    queries: Vec<(String, String)>,
}

impl FakeState {
    fn definition_for_collection(&self, collection: &str) -> Option<&EntityDefinition> {
        self.definitions
            .values()
            .find(|def| EntitySchema::from_definition((*def).clone()).collection_name == collection)
    }

    fn known_fields(&self, collection: &str) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        if let Some(rows) = self.rows.get(collection) {
            for row in rows {
                fields.extend(row.keys().filter(|k| !k.contains('@')).cloned());
            }
        }
        if let Some(definition) = self.definition_for_collection(collection) {
            let schema = EntitySchema::from_definition(definition.clone());
            fields.insert(schema.primary_id_attribute);
            fields.extend(schema.primary_name_attribute);
            fields.extend(definition.attributes.iter().map(|a| a.logical_name.clone()));
            fields.extend(
                schema
                    .lookup_attributes
                    .into_iter()
                    .map(|l| l.lookup_field_name),
            );
        }
        fields
    }
}

/// Decrements the in-flight counter when a call finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeEntityService {
    state: Mutex<FakeState>,
    list_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for FakeEntityService {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEntityService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            list_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_entity(self, definition: EntityDefinition) -> Self {
        self.add_entity(definition);
        self
    }

    pub fn with_rows(self, collection: &str, rows: Vec<RawRow>) -> Self {
        self.add_rows(collection, rows);
        self
    }

    /// Fail the next definition fetch for `entity` once.
    pub fn fail_next_definition(self, entity: &str, failure: ServiceFailure) -> Self {
        self.state
            .lock()
            .definition_failures
            .entry(entity.to_string())
            .or_default()
            .push_back(failure);
        self
    }

    /// Fail every list query against `collection` until `clear_failures`.
    pub fn fail_collection(self, collection: &str, failure: ServiceFailure) -> Self {
        self.state
            .lock()
            .collection_failures
            .insert(collection.to_string(), failure);
        self
    }

    pub fn with_latency(self, collection: &str, latency: Duration) -> Self {
        self.state
            .lock()
            .latency
            .insert(collection.to_string(), latency);
        self
    }

    pub fn with_definition_latency(self, latency: Duration) -> Self {
        self.state.lock().definition_latency = latency;
        self
    }

    /// Add or replace an entity definition.
    pub fn add_entity(&self, definition: EntityDefinition) {
        self.state
            .lock()
            .definitions
            .insert(definition.logical_name.clone(), definition);
    }

    /// Replace the rows served for `collection`.
    pub fn add_rows(&self, collection: &str, rows: Vec<RawRow>) {
        self.state.lock().rows.insert(collection.to_string(), rows);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.definition_failures.clear();
        state.collection_failures.clear();
    }

    pub fn definition_calls(&self, entity: &str) -> usize {
        self.state
            .lock()
            .definition_calls
            .get(entity)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_definition_calls(&self) -> usize {
        self.state.lock().definition_calls.values().sum()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Highest number of list queries observed running at once.
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every `(collection, query)` received, in arrival order.
    pub fn queries(&self) -> Vec<(String, String)> {
        self.state.lock().queries.clone()
    }

    fn answer(&self, collection: &str, query: &str) -> Result<RetrievedPage, ServiceFailure> {
        let state = self.state.lock();
        if let Some(failure) = state.collection_failures.get(collection) {
            return Err(failure.clone());
        }

        let definition = state.definition_for_collection(collection);
        let Some(rows) = state
            .rows
            .get(collection)
            .cloned()
            .or_else(|| definition.map(|_| Vec::new()))
        else {
            return Err(not_found_segment(collection));
        };
        let type_name = definition
            .map(|d| d.logical_name.clone())
            .unwrap_or_else(|| collection.to_string());
        let known = state.known_fields(collection);
        drop(state);

        let params = QueryString::parse(query);
        let check = |field: &str| -> Result<(), ServiceFailure> {
            if known.is_empty() || known.contains(field) {
                Ok(())
            } else {
                Err(unknown_property(field, &type_name))
            }
        };

        let selected: Option<Vec<String>> = match params.get("$select") {
            None | Some("*") => None,
            Some(list) => Some(list.split(',').map(|f| f.trim().to_string()).collect()),
        };
        if let Some(fields) = &selected {
            for field in fields {
                check(field)?;
            }
        }

        let conditions = match params.get("$filter") {
            Some(filter) => parse_filter(filter)?,
            None => Vec::new(),
        };
        for (field, _) in &conditions {
            check(field)?;
        }

        let mut matching: Vec<RawRow> = rows
            .into_iter()
            .filter(|row| {
                conditions
                    .iter()
                    .all(|(field, literal)| row.get(field).is_some_and(|v| matches_literal(v, literal)))
            })
            .collect();

        if let Some(order) = params.get("$orderby") {
            let mut parts = order.split_whitespace();
            if let Some(field) = parts.next() {
                let descending = parts.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
                matching.sort_by(|a, b| {
                    let ordering = compare_values(a.get(field), b.get(field));
                    if descending { ordering.reverse() } else { ordering }
                });
            }
        }

        let total = matching.len();
        let mut next_link = None;
        if let Some(top) = params.get("$top").and_then(|t| t.parse::<usize>().ok()) {
            if matching.len() > top {
                matching.truncate(top);
                next_link = Some(format!("{collection}?$skiptoken={top}"));
            }
        }

        if let Some(fields) = &selected {
            for row in &mut matching {
                row.retain(|key, _| {
                    let base = key.split('@').next().unwrap_or(key);
                    fields.iter().any(|f| f == base)
                });
            }
        }

        Ok(RetrievedPage {
            rows: matching,
            total_count: (params.get("$count") == Some("true")).then_some(total as u64),
            next_link,
        })
    }
}

fn error_body(code: &str, message: &str) -> String {
    serde_json::json!({ "error": { "code": code, "message": message } }).to_string()
}

fn not_found_segment(collection: &str) -> ServiceFailure {
    let message = format!("Resource not found for the segment '{collection}'.");
    ServiceFailure::remote(404, message.clone()).with_body(error_body("0x8006088a", &message))
}

fn unknown_property(field: &str, type_name: &str) -> ServiceFailure {
    let message = format!(
        "Could not find a property named '{field}' on type 'Microsoft.Dynamics.CRM.{type_name}'."
    );
    ServiceFailure::remote(400, message.clone()).with_body(error_body("0x80060888", &message))
}

fn parse_filter(filter: &str) -> Result<Vec<(String, String)>, ServiceFailure> {
    filter
        .split(" and ")
        .map(|clause| {
            let mut parts = clause.trim().splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(field), Some(op), Some(literal)) if op.eq_ignore_ascii_case("eq") => {
                    Ok((field.to_string(), decode_literal(literal.trim())))
                }
                _ => Err(ServiceFailure::remote(
                    400,
                    format!("Syntax error in filter clause '{clause}'."),
                )),
            }
        })
        .collect()
}

fn matches_literal(value: &serde_json::Value, literal: &str) -> bool {
    let normalize = |s: &str| {
        s.trim_start_matches('{')
            .trim_end_matches('}')
            .to_ascii_lowercase()
    };
    match value {
        serde_json::Value::String(s) => normalize(s) == normalize(literal),
        serde_json::Value::Number(n) => n.to_string() == literal,
        serde_json::Value::Bool(b) => b.to_string() == literal,
        serde_json::Value::Null => literal == "null",
        _ => false,
    }
}

fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> CmpOrdering {
    match (a, b) {
        (Some(serde_json::Value::Number(x)), Some(serde_json::Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        (None, None) => CmpOrdering::Equal,
    }
}

#[async_trait]
impl EntityService for FakeEntityService {
    async fn retrieve_multiple(
        &self,
        collection: &str,
        query: &str,
    ) -> Result<RetrievedPage, ServiceFailure> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let latency = {
            let mut state = self.state.lock();
            state
                .queries
                .push((collection.to_string(), query.to_string()));
            state.latency.get(collection).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.answer(collection, query)
    }

    async fn retrieve_entity_definition(
        &self,
        logical_name: &str,
    ) -> Result<EntityDefinition, ServiceFailure> {
        let latency = {
            let mut state = self.state.lock();
            *state
                .definition_calls
                .entry(logical_name.to_string())
                .or_default() += 1;
            state.definition_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if let Some(failure) = state
            .definition_failures
            .get_mut(logical_name)
            .and_then(VecDeque::pop_front)
        {
            return Err(failure);
        }
        state.definitions.get(logical_name).cloned().ok_or_else(|| {
            let message = format!("Could not find entity with logical name '{logical_name}'.");
            ServiceFailure::remote(404, message.clone())
                .with_body(error_body("0x80040217", &message))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use subgrid_api::{AttributeDefinition, FailureKind};

    fn row(value: serde_json::Value) -> RawRow {
        value.as_object().cloned().unwrap_or_default()
    }

    fn service() -> FakeEntityService {
        FakeEntityService::new()
            .with_entity(
                EntityDefinition::new("task", "taskid").with_attribute(
                    AttributeDefinition::lookup("project", ["project"]).with_lookup_field("project_ref"),
                ),
            )
            .with_rows(
                "tasks",
                vec![
                    row(json!({"taskid": "t1", "subject": "b", "project_ref": "P-1",
                               "subject@OData.Community.Display.V1.FormattedValue": "B"})),
                    row(json!({"taskid": "t2", "subject": "a", "project_ref": "P-1"})),
                    row(json!({"taskid": "t3", "subject": "c", "project_ref": "P-2"})),
                ],
            )
    }

    #[tokio::test]
    async fn filters_selects_and_counts() {
        let page = service()
            .retrieve_multiple(
                "tasks",
                "?$select=taskid,subject&$filter=project_ref eq 'P-1'&$orderby=subject asc&$top=1&$count=true",
            )
            .await
            .unwrap();

        assert_eq!(page.total_count, Some(2));
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].get("taskid"), Some(&json!("t2")));
        assert!(!page.rows[0].contains_key("project_ref"));
        assert!(page.next_link.is_some());
    }

    #[tokio::test]
    async fn keeps_formatted_companions_of_selected_fields() {
        let page = service()
            .retrieve_multiple("tasks", "?$select=subject&$filter=taskid eq 't1'")
            .await
            .unwrap();
        assert_eq!(page.rows[0].len(), 2);
    }

    #[tokio::test]
    async fn unknown_property_is_a_400() {
        let failure = service()
            .retrieve_multiple("tasks", "?$filter=_parentid_value eq 'P-1'")
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Remote);
        assert_eq!(failure.status, Some(400));
        assert!(failure.message.contains("_parentid_value"));
        assert!(failure.body.is_some());
    }

    #[tokio::test]
    async fn unknown_collection_is_a_404() {
        let failure = service().retrieve_multiple("widgets", "?$top=1").await.unwrap_err();
        assert_eq!(failure.status, Some(404));
        assert!(failure.message.contains("segment 'widgets'"));
    }

    #[tokio::test]
    async fn scripted_definition_failure_fires_once() {
        let fake = service().fail_next_definition("task", ServiceFailure::transport("reset"));
        assert!(fake.retrieve_entity_definition("task").await.is_err());
        assert!(fake.retrieve_entity_definition("task").await.is_ok());
        assert_eq!(fake.definition_calls("task"), 2);
    }
}
