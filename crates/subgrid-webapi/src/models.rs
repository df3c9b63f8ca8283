//! Wire shapes of the OData Web API and their mapping to engine types.

use serde::Deserialize;

use subgrid::RetrievedPage;
use subgrid_api::{AttributeDefinition, AttributeType, EntityDefinition, RawRow, ServiceFailure};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Label {
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalizedLabel {
    pub user_localized_label: Option<Label>,
}

impl LocalizedLabel {
    fn text(&self) -> Option<String> {
        self.user_localized_label
            .as_ref()
            .map(|l| l.label.clone())
            .filter(|l| !l.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeMetadata {
    pub logical_name: String,
    pub attribute_type: Option<String>,
    pub display_name: Option<LocalizedLabel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntityMetadata {
    pub logical_name: String,
    pub entity_set_name: Option<String>,
    pub primary_id_attribute: Option<String>,
    pub primary_name_attribute: Option<String>,
    pub display_name: Option<LocalizedLabel>,
    #[serde(default)]
    pub attributes: Vec<AttributeMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LookupAttributeMetadata {
    pub logical_name: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ODataList<T> {
    pub value: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct CollectionPage {
    #[serde(default)]
    value: Vec<RawRow>,
    #[serde(rename = "@odata.count")]
    count: Option<u64>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Merge entity metadata with lookup targets into an `EntityDefinition`.
pub fn parse_entity_definition(
    entity_body: &str,
    lookups_body: Option<&str>,
) -> Result<EntityDefinition, ServiceFailure> {
    let metadata: EntityMetadata = serde_json::from_str(entity_body)
        .map_err(|e| ServiceFailure::parse(format!("Invalid entity metadata: {e}")))?;
    let lookups: Vec<LookupAttributeMetadata> = match lookups_body {
        Some(body) => {
            serde_json::from_str::<ODataList<LookupAttributeMetadata>>(body)
                .map_err(|e| ServiceFailure::parse(format!("Invalid lookup metadata: {e}")))?
                .value
        }
        None => Vec::new(),
    };

    let primary_id_attribute = metadata
        .primary_id_attribute
        .unwrap_or_else(|| format!("{}id", metadata.logical_name));
    let mut definition = EntityDefinition::new(metadata.logical_name, primary_id_attribute);
    definition.entity_set_name = metadata.entity_set_name;
    definition.primary_name_attribute = metadata.primary_name_attribute;
    definition.display_name = metadata.display_name.as_ref().and_then(LocalizedLabel::text);

    for attribute in metadata.attributes {
        let attribute_type = attribute
            .attribute_type
            .as_deref()
            .map(AttributeType::from_type_name)
            .unwrap_or(AttributeType::Other("Unknown".to_string()));
        let mut parsed = AttributeDefinition::new(attribute.logical_name, attribute_type);
        parsed.display_name = attribute.display_name.as_ref().and_then(LocalizedLabel::text);
        if parsed.attribute_type.is_reference() {
            parsed.targets = lookups
                .iter()
                .find(|l| l.logical_name == parsed.logical_name)
                .map(|l| l.targets.clone())
                .unwrap_or_default();
        }
        definition.attributes.push(parsed);
    }
    Ok(definition)
}

/// Decode a collection response body.
pub fn parse_collection_page(body: &str) -> Result<RetrievedPage, ServiceFailure> {
    let page: CollectionPage = serde_json::from_str(body)
        .map_err(|e| ServiceFailure::parse(format!("Invalid collection response: {e}")))?;
    Ok(RetrievedPage {
        rows: page.value,
        total_count: page.count,
        next_link: page.next_link,
    })
}

/// `message` of an OData error envelope, if the body is one.
pub fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use subgrid_api::{EntitySchema, FailureKind};

    const TASK_METADATA: &str = r#"{
        "@odata.context": "https://example.test/api/data/v9.2/$metadata#EntityDefinitions(...)",
        "LogicalName": "task",
        "EntitySetName": "tasks",
        "PrimaryIdAttribute": "activityid",
        "PrimaryNameAttribute": "subject",
        "DisplayName": { "UserLocalizedLabel": { "Label": "Task" } },
        "Attributes": [
            { "LogicalName": "subject", "AttributeType": "String", "DisplayName": { "UserLocalizedLabel": null } },
            { "LogicalName": "regardingobjectid", "AttributeType": "Lookup",
              "DisplayName": { "UserLocalizedLabel": { "Label": "Regarding" } } },
            { "LogicalName": "ownerid", "AttributeType": "Owner" }
        ]
    }"#;

    const TASK_LOOKUPS: &str = r#"{
        "value": [
            { "LogicalName": "regardingobjectid", "Targets": ["account", "contact"] },
            { "LogicalName": "ownerid", "Targets": ["systemuser", "team"] }
        ]
    }"#;

    #[test]
    fn merges_lookup_targets() {
        let definition = parse_entity_definition(TASK_METADATA, Some(TASK_LOOKUPS)).unwrap();
        assert_eq!(definition.display_name.as_deref(), Some("Task"));
        assert_eq!(definition.attributes.len(), 3);

        let schema = EntitySchema::from_definition(definition);
        assert_eq!(schema.collection_name, "tasks");
        assert_eq!(schema.primary_id_attribute, "activityid");
        assert_eq!(schema.lookups_targeting("contact").len(), 1);
        assert_eq!(
            schema.lookups_targeting("team")[0].lookup_field_name,
            "_ownerid_value"
        );
    }

    #[test]
    fn missing_primary_id_defaults_from_name() {
        let definition = parse_entity_definition(r#"{"LogicalName": "widget"}"#, None).unwrap();
        assert_eq!(definition.primary_id_attribute, "widgetid");
    }

    #[test]
    fn collection_page_annotations() {
        let body = r#"{
            "@odata.count": 12,
            "@odata.nextLink": "https://example.test/api/data/v9.2/tasks?$skiptoken=abc",
            "value": [ { "activityid": "1", "subject": "a" } ]
        }"#;
        let page = parse_collection_page(body).unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.total_count, Some(12));
        assert!(page.next_link.unwrap().contains("skiptoken"));
    }

    #[test]
    fn undecodable_body_is_a_parse_failure() {
        let failure = parse_collection_page("<html/>").unwrap_err();
        assert_eq!(failure.kind, FailureKind::Parse);
    }

    #[test]
    fn error_envelope_message() {
        let body = r#"{"error":{"code":"0x80060888","message":"Resource not found for the segment 'widgets'."}}"#;
        assert_eq!(
            error_message(body).as_deref(),
            Some("Resource not found for the segment 'widgets'.")
        );
        assert_eq!(error_message("not json"), None);
    }
}
