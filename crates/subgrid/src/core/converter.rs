//! Raw service rows to grid records.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::schema_cache::{EntitySchemaCache, is_valid_entity_name};
use crate::error::{EngineError, Result};
use subgrid_api::{
    ConvertedRecordSet, DatasetRecord, EntitySchema, FieldValidation, FieldValue, RawRow, Value,
};

/// Annotation suffix carrying the service-formatted rendering of a field.
pub const FORMATTED_VALUE_SUFFIX: &str = "@OData.Community.Display.V1.FormattedValue";

/// Name-like fields tried when the primary name attribute is empty.
const NAME_FALLBACKS: &[&str] = &["name", "fullname", "title", "subject"];

pub struct RecordConverter {
    schemas: Arc<EntitySchemaCache>,
}

impl RecordConverter {
    pub fn new(schemas: Arc<EntitySchemaCache>) -> Self {
        Self { schemas }
    }

    /// Convert `rows` of `entity` into a record set keyed by primary id.
    ///
    /// Fails when the entity name is invalid or its schema cannot be loaded.
    pub async fn convert(&self, rows: &[RawRow], entity: &str) -> Result<ConvertedRecordSet> {
        if !is_valid_entity_name(entity) {
            return Err(EngineError::InvalidEntityName(entity.to_string()));
        }
        let schema = self
            .schemas
            .get_schema(entity)
            .await
            .ok_or_else(|| EngineError::SchemaUnavailable {
                entity: entity.trim().to_string(),
            })?;
        Ok(convert_with_schema(rows, &schema))
    }
}

/// Conversion against an already-resolved schema.
pub fn convert_with_schema(rows: &[RawRow], schema: &EntitySchema) -> ConvertedRecordSet {
    let mut set = ConvertedRecordSet::new(schema.logical_name.clone());

    for (index, row) in rows.iter().enumerate() {
        let Some(record_id) = row.get(&schema.primary_id_attribute).and_then(id_text) else {
            warn!(
                "[RecordConverter] Skipping {} row {}: no '{}' value",
                schema.logical_name, index, schema.primary_id_attribute
            );
            set.skipped_count += 1;
            continue;
        };

        let record = DatasetRecord {
            primary_name: primary_name(row, schema, &record_id),
            fields: wrap_fields(row),
            entity_type: schema.logical_name.clone(),
            record_id,
        };
        let record_id = record.record_id.clone();
        if set.insert(record) {
            warn!(
                "[RecordConverter] Duplicate {} id '{}'; keeping the later row",
                schema.logical_name, record_id
            );
        }
    }

    debug!(
        "[RecordConverter] Converted {} {} rows: {} records, {} duplicates, {} skipped",
        rows.len(),
        schema.logical_name,
        set.len(),
        set.duplicate_count,
        set.skipped_count
    );
    set
}

fn id_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty_str<'a>(row: &'a RawRow, field: &str) -> Option<&'a str> {
    row.get(field)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn primary_name(row: &RawRow, schema: &EntitySchema, record_id: &str) -> String {
    schema
        .primary_name_attribute
        .as_deref()
        .into_iter()
        .chain(NAME_FALLBACKS.iter().copied())
        .find_map(|field| non_empty_str(row, field))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} ({})", schema.display_name, record_id))
}

fn wrap_fields(row: &RawRow) -> HashMap<String, FieldValue> {
    let timestamp = Utc::now();
    row.iter()
        .filter(|(name, _)| !name.contains('@'))
        .map(|(name, value)| {
            let formatted_value = row
                .get(&format!("{name}{FORMATTED_VALUE_SUFFIX}"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            (
                name.clone(),
                FieldValue {
                    value: Value::from_json_value(value.clone()),
                    formatted_value,
                    timestamp,
                    validation: FieldValidation::valid(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::EntityService;
    use crate::testing::FakeEntityService;
    use serde_json::json;
    use subgrid_api::EntityDefinition;

    fn row(value: serde_json::Value) -> RawRow {
        value.as_object().cloned().unwrap_or_default()
    }

    fn task_schema() -> EntitySchema {
        EntitySchema::from_definition(
            EntityDefinition::new("task", "taskid")
                .with_display_name("Task")
                .with_primary_name("subject"),
        )
    }

    #[test]
    fn duplicate_ids_collapse_to_last_row() {
        let rows = vec![
            row(json!({"taskid": "t1", "subject": "first"})),
            row(json!({"taskid": "t1", "subject": "second"})),
        ];
        let set = convert_with_schema(&rows, &task_schema());

        assert_eq!(set.len(), 1);
        assert_eq!(set.duplicate_count, 1);
        assert_eq!(set.get("t1").map(|r| r.primary_name.as_str()), Some("second"));
    }

    #[test]
    fn rows_without_key_are_skipped_and_counted() {
        let rows = vec![
            row(json!({"subject": "orphan"})),
            row(json!({"taskid": null, "subject": "null id"})),
            row(json!({"taskid": 42, "subject": "numeric"})),
        ];
        let set = convert_with_schema(&rows, &task_schema());

        assert_eq!(set.skipped_count, 2);
        assert!(set.get("42").is_some());
    }

    #[test]
    fn name_falls_back_then_uses_placeholder() {
        let rows = vec![
            row(json!({"taskid": "t1", "subject": "", "title": "From title"})),
            row(json!({"taskid": "t2"})),
        ];
        let set = convert_with_schema(&rows, &task_schema());

        assert_eq!(set.get("t1").unwrap().primary_name, "From title");
        assert_eq!(set.get("t2").unwrap().primary_name, "Task (t2)");
    }

    #[test]
    fn annotations_attach_as_formatted_values() {
        let rows = vec![row(json!({
            "@odata.etag": "W/\"1\"",
            "taskid": "t1",
            "prioritycode": 2,
            "prioritycode@OData.Community.Display.V1.FormattedValue": "High",
        }))];
        let set = convert_with_schema(&rows, &task_schema());
        let record = set.get("t1").unwrap();

        assert_eq!(record.fields.len(), 2);
        let priority = record.field("prioritycode").unwrap();
        assert_eq!(priority.value, Value::Integer(2));
        assert_eq!(priority.formatted_value.as_deref(), Some("High"));
        assert!(priority.validation.is_valid);
    }

    #[tokio::test]
    async fn convert_requires_a_schema() {
        let fake: Arc<dyn EntityService> = Arc::new(FakeEntityService::new());
        let converter = RecordConverter::new(Arc::new(EntitySchemaCache::new(fake)));

        assert!(matches!(
            converter.convert(&[], "").await,
            Err(EngineError::InvalidEntityName(_))
        ));
        assert!(matches!(
            converter.convert(&[], "task").await,
            Err(EngineError::SchemaUnavailable { .. })
        ));
    }
}
