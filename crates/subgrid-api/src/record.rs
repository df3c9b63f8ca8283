//! Converted record shapes consumed by the grid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValidation {
    pub is_valid: bool,
    pub error_message: Option<String>,
}

impl FieldValidation {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error_message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error_message: Some(message.into()),
        }
    }
}

/// A field value wrapped with its formatted companion and validation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Value,
    pub formatted_value: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub validation: FieldValidation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub record_id: String,
    pub entity_type: String,
    pub primary_name: String,
    pub fields: HashMap<String, FieldValue>,
}

impl DatasetRecord {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Formatted value when present, otherwise the raw value rendered as text.
    pub fn display_value(&self, name: &str) -> Option<String> {
        let field = self.fields.get(name)?;
        field
            .formatted_value
            .clone()
            .or_else(|| field.value.to_display_string())
    }
}

/// Records keyed by id.
///
/// Ids are unique: inserting an id that is already present replaces the prior
/// record and increments `duplicate_count`. `order` keeps first-sighting order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvertedRecordSet {
    pub entity_type: String,
    pub records: HashMap<String, DatasetRecord>,
    pub order: Vec<String>,
    pub duplicate_count: usize,
    pub skipped_count: usize,
}

impl ConvertedRecordSet {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    /// Insert a record; returns `true` when it replaced an existing id.
    pub fn insert(&mut self, record: DatasetRecord) -> bool {
        let id = record.record_id.clone();
        match self.records.insert(id.clone(), record) {
            Some(_) => {
                self.duplicate_count += 1;
                true
            }
            None => {
                self.order.push(id);
                false
            }
        }
    }

    /// Merge another page into this set, last write wins.
    pub fn merge(&mut self, other: ConvertedRecordSet) {
        self.skipped_count += other.skipped_count;
        self.duplicate_count += other.duplicate_count;
        let mut records = other.records;
        for id in other.order {
            if let Some(record) = records.remove(&id) {
                self.insert(record);
            }
        }
    }

    pub fn get(&self, record_id: &str) -> Option<&DatasetRecord> {
        self.records.get(record_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in first-sighting order.
    pub fn iter(&self) -> impl Iterator<Item = &DatasetRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }
}
