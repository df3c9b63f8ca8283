//! Entity schema types.
//!
//! This module provides the schema shapes exchanged with the entity service:
//! - `EntityDefinition`, `AttributeDefinition`: raw introspection payload
//! - `EntitySchema`, `LookupAttribute`: the derived, cached view the engine works with

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Sentinel entity name hosts pass when the bound entity is not known yet.
pub const UNKNOWN_ENTITY: &str = "unknown";

// =============================================================================
// Raw introspection payload
// =============================================================================

/// Attribute type as reported by the schema-introspection endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    String,
    Memo,
    Integer,
    BigInt,
    Decimal,
    Double,
    Money,
    Boolean,
    DateTime,
    Picklist,
    State,
    Status,
    Uniqueidentifier,
    Lookup,
    Customer,
    Owner,
    Other(String),
}

impl AttributeType {
    /// Parse the service's type name (e.g. `"Lookup"`, `"Picklist"`).
    pub fn from_type_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "string" => AttributeType::String,
            "memo" => AttributeType::Memo,
            "integer" => AttributeType::Integer,
            "bigint" => AttributeType::BigInt,
            "decimal" => AttributeType::Decimal,
            "double" => AttributeType::Double,
            "money" => AttributeType::Money,
            "boolean" => AttributeType::Boolean,
            "datetime" => AttributeType::DateTime,
            "picklist" => AttributeType::Picklist,
            "state" => AttributeType::State,
            "status" => AttributeType::Status,
            "uniqueidentifier" => AttributeType::Uniqueidentifier,
            "lookup" => AttributeType::Lookup,
            "customer" => AttributeType::Customer,
            "owner" => AttributeType::Owner,
            _ => AttributeType::Other(name.to_string()),
        }
    }

    /// Whether values of this type reference a record of another entity.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            AttributeType::Lookup | AttributeType::Customer | AttributeType::Owner
        )
    }
}

/// One attribute of an entity definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub logical_name: String,
    pub display_name: Option<String>,
    pub attribute_type: AttributeType,
    /// Entity types a reference attribute may point at. Empty for scalars.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Wire-level filter field when the service does not follow the
    /// `_<attribute>_value` convention.
    #[serde(default)]
    pub lookup_field_name: Option<String>,
}

impl AttributeDefinition {
    pub fn new(logical_name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            logical_name: logical_name.into(),
            display_name: None,
            attribute_type,
            targets: Vec::new(),
            lookup_field_name: None,
        }
    }

    /// Build a lookup attribute targeting the given entities.
    pub fn lookup<I, S>(logical_name: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::new(logical_name, AttributeType::Lookup)
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_lookup_field(mut self, field: impl Into<String>) -> Self {
        self.lookup_field_name = Some(field.into());
        self
    }
}

/// Entity definition as returned by the schema-introspection endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub logical_name: String,
    pub display_name: Option<String>,
    /// REST path segment; derived by pluralisation when the service omits it.
    pub entity_set_name: Option<String>,
    pub primary_id_attribute: String,
    pub primary_name_attribute: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,
}

impl EntityDefinition {
    pub fn new(logical_name: impl Into<String>, primary_id_attribute: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            display_name: None,
            entity_set_name: None,
            primary_id_attribute: primary_id_attribute.into(),
            primary_name_attribute: None,
            attributes: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_entity_set_name(mut self, entity_set_name: impl Into<String>) -> Self {
        self.entity_set_name = Some(entity_set_name.into());
        self
    }

    pub fn with_primary_name(mut self, primary_name_attribute: impl Into<String>) -> Self {
        self.primary_name_attribute = Some(primary_name_attribute.into());
        self
    }

    pub fn with_attribute(mut self, attribute: AttributeDefinition) -> Self {
        self.attributes.push(attribute);
        self
    }
}

// =============================================================================
// Derived schema
// =============================================================================

/// Reference attribute on an entity.
///
/// `targets` may hold several entity names: a lookup can be polymorphic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupAttribute {
    pub logical_name: String,
    pub display_name: String,
    pub targets: BTreeSet<String>,
    /// Field name to use in `$filter` clauses.
    pub lookup_field_name: String,
}

impl LookupAttribute {
    pub fn targets_entity(&self, entity: &str) -> bool {
        self.targets.contains(entity)
    }
}

/// Schema of one entity, immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub logical_name: String,
    pub display_name: String,
    pub collection_name: String,
    pub primary_id_attribute: String,
    /// `None` when the service declares no primary name column.
    pub primary_name_attribute: Option<String>,
    pub lookup_attributes: Vec<LookupAttribute>,
}

impl EntitySchema {
    /// Derive the schema from a raw definition.
    ///
    /// Every attribute whose type is a reference type becomes a
    /// `LookupAttribute`; the wire field defaults to `_<attribute>_value`.
    pub fn from_definition(definition: EntityDefinition) -> Self {
        let lookup_attributes = definition
            .attributes
            .iter()
            .filter(|attr| attr.attribute_type.is_reference())
            .map(|attr| LookupAttribute {
                logical_name: attr.logical_name.clone(),
                display_name: attr
                    .display_name
                    .clone()
                    .unwrap_or_else(|| attr.logical_name.clone()),
                targets: attr.targets.iter().cloned().collect(),
                lookup_field_name: attr
                    .lookup_field_name
                    .clone()
                    .unwrap_or_else(|| format!("_{}_value", attr.logical_name)),
            })
            .collect();

        let collection_name = definition
            .entity_set_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| pluralize(&definition.logical_name));
        let primary_name_attribute = definition
            .primary_name_attribute
            .filter(|name| !name.is_empty());

        Self {
            display_name: definition
                .display_name
                .unwrap_or_else(|| definition.logical_name.clone()),
            logical_name: definition.logical_name,
            collection_name,
            primary_id_attribute: definition.primary_id_attribute,
            primary_name_attribute,
            lookup_attributes,
        }
    }

    /// Lookup attributes whose targets include `parent_entity`, in schema order.
    pub fn lookups_targeting(&self, parent_entity: &str) -> Vec<&LookupAttribute> {
        self.lookup_attributes
            .iter()
            .filter(|lookup| lookup.targets_entity(parent_entity))
            .collect()
    }
}

/// Pluralise an entity logical name into a collection path segment.
///
/// `opportunity` → `opportunities`, `address` → `addresses`, `task` → `tasks`.
pub fn pluralize(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    if let Some(stem) = name.strip_suffix('y') {
        let before = stem.chars().last();
        if before.is_some_and(|c| !"aeiou".contains(c.to_ascii_lowercase())) {
            return format!("{stem}ies");
        }
    }
    if ["s", "x", "z", "ch", "sh"]
        .iter()
        .any(|suffix| name.ends_with(suffix))
    {
        return format!("{name}es");
    }
    format!("{name}s")
}
