use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use subgrid::api::{
    AttributeDefinition, Confidence, DatasetRequest, DiscoverySource, EntityDefinition,
    FailureKind, QueryDescriptor, RawRow,
};
use subgrid::testing::FakeEntityService;
use subgrid::{
    DatasetEngine, EngineConfig, EntitySchemaCache, EntityService, QueryExecutor,
    QuerySynthesizer, RecordConverter, RelationshipResolver, RuntimeEnvironment,
};

fn row(value: serde_json::Value) -> RawRow {
    value.as_object().cloned().unwrap_or_default()
}

/// "project" (projectId/title) and "task" with a `project` lookup wired to `project_ref`.
fn project_and_tasks() -> FakeEntityService {
    FakeEntityService::new()
        .with_entity(EntityDefinition::new("project", "projectId").with_primary_name("title"))
        .with_entity(
            EntityDefinition::new("task", "taskId")
                .with_primary_name("subject")
                .with_attribute(
                    AttributeDefinition::lookup("project", ["project"])
                        .with_lookup_field("project_ref"),
                ),
        )
        .with_rows(
            "projects",
            vec![row(json!({"projectId": "P-1", "title": "Launch"}))],
        )
        .with_rows(
            "tasks",
            vec![
                row(json!({"taskId": "T-1", "subject": "Draft plan", "project_ref": "P-1"})),
                row(json!({"taskId": "T-2", "subject": "Review plan", "project_ref": "P-1"})),
                row(json!({"taskId": "T-3", "subject": "Other work", "project_ref": "P-9"})),
            ],
        )
}

struct Pipeline {
    fake: Arc<FakeEntityService>,
    schemas: Arc<EntitySchemaCache>,
    resolver: Arc<RelationshipResolver>,
    synthesizer: QuerySynthesizer,
    executor: QueryExecutor,
    converter: RecordConverter,
}

fn pipeline(fake: FakeEntityService) -> Pipeline {
    let fake = Arc::new(fake);
    let schemas = Arc::new(EntitySchemaCache::new(fake.clone() as Arc<dyn EntityService>));
    let resolver = Arc::new(RelationshipResolver::new(schemas.clone()));
    Pipeline {
        synthesizer: QuerySynthesizer::new(
            schemas.clone(),
            resolver.clone(),
            RuntimeEnvironment::Hosted,
        ),
        executor: QueryExecutor::default(),
        converter: RecordConverter::new(schemas.clone()),
        fake,
        schemas,
        resolver,
    }
}

#[tokio::test]
async fn project_tasks_end_to_end() -> Result<()> {
    let p = pipeline(project_and_tasks());

    let relationship = p
        .resolver
        .resolve("project", "task")
        .await
        .context("relationship should resolve")?;
    assert_eq!(relationship.lookup_column, "project_ref");
    assert_eq!(relationship.confidence, Confidence::High);
    assert_eq!(relationship.source, DiscoverySource::Schema);

    let request = DatasetRequest::new("task").with_parent("project", "P-1");
    let descriptor = p.synthesizer.build(&request).await;
    assert!(descriptor.query_string.contains("project_ref eq 'P-1'"));

    let result = p
        .executor
        .execute(&descriptor, Some(p.fake.as_ref() as &dyn EntityService))
        .await;
    assert!(result.success, "query failed: {:?}", result.error);

    let records = p.converter.convert(&result.entities, "task").await?;
    assert_eq!(records.len(), 2);
    assert!(records.get("T-1").is_some());
    assert!(records.get("T-2").is_some());
    assert_eq!(
        records.get("T-1").map(|r| r.primary_name.as_str()),
        Some("Draft plan")
    );
    Ok(())
}

#[tokio::test]
async fn engine_facade_runs_the_same_scenario() -> Result<()> {
    let fake = Arc::new(project_and_tasks());
    let engine = DatasetEngine::new(EngineConfig::default(), fake.clone());

    let outcome = engine
        .load_dataset(&DatasetRequest::new("task").with_parent("project", "P-1"))
        .await;

    let records = outcome.records().context("dataset should load")?;
    assert_eq!(records.len(), 2);
    assert_eq!(
        outcome.descriptor().lookup_column.as_deref(),
        Some("project_ref")
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schema_requests_share_one_fetch() -> Result<()> {
    let fake = project_and_tasks().with_definition_latency(Duration::from_millis(40));
    let p = pipeline(fake);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let schemas = p.schemas.clone();
            tokio::spawn(async move { schemas.get_schema("task").await })
        })
        .collect();

    let mut schemas = Vec::new();
    for handle in handles {
        schemas.push(handle.await?.context("schema should load")?);
    }

    assert_eq!(p.fake.definition_calls("task"), 1);
    assert!(schemas.windows(2).all(|pair| pair[0] == pair[1]));

    let again = p.schemas.get_schema("task").await.context("cached")?;
    assert_eq!(again, schemas[0]);
    assert_eq!(p.fake.definition_calls("task"), 1);
    Ok(())
}

#[tokio::test]
async fn confidence_tracks_number_of_schema_matches() -> Result<()> {
    let fake = FakeEntityService::new()
        .with_entity(
            EntityDefinition::new("one", "oneid")
                .with_attribute(AttributeDefinition::lookup("project", ["project"])),
        )
        .with_entity(
            EntityDefinition::new("two", "twoid")
                .with_attribute(AttributeDefinition::lookup("project", ["project"]))
                .with_attribute(AttributeDefinition::lookup("origin", ["project", "account"])),
        )
        .with_entity(EntityDefinition::new("zero", "zeroid"))
        .with_rows(
            "zeros",
            vec![row(json!({"zeroid": "z1", "_projectid_value": "P-1"}))],
        );
    let p = pipeline(fake);

    let high = p.resolver.resolve("project", "one").await.context("one")?;
    let medium = p.resolver.resolve("project", "two").await.context("two")?;
    let low = p.resolver.resolve("project", "zero").await.context("zero")?;

    assert_eq!(high.confidence, Confidence::High);
    assert_eq!(medium.confidence, Confidence::Medium);
    assert_eq!(low.confidence, Confidence::Low);
    assert_eq!(low.source, DiscoverySource::Pattern);
    assert!(high.confidence > medium.confidence && medium.confidence > low.confidence);
    Ok(())
}

#[tokio::test]
async fn invalid_descriptor_is_rejected_before_the_network() {
    let p = pipeline(project_and_tasks());
    let descriptor = QueryDescriptor::new("", "?$select=*");

    let report = QuerySynthesizer::validate(&descriptor);
    assert!(!report.is_valid);

    let result = p
        .executor
        .execute(&descriptor, Some(p.fake.as_ref() as &dyn EntityService))
        .await;
    assert_eq!(
        result.error.map(|e| e.kind),
        Some(FailureKind::Validation)
    );
    assert_eq!(p.fake.list_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_results_stay_index_aligned() {
    let entities = ["project", "task", "project", "task", "widget", "task", "project"];
    let fake = project_and_tasks()
        .with_latency("projects", Duration::from_millis(40))
        .with_latency("tasks", Duration::from_millis(5));
    let p = pipeline(fake);

    let descriptors: Vec<_> = entities
        .iter()
        .map(|entity| QueryDescriptor::new(*entity, "?$select=*"))
        .collect();
    let results = p
        .executor
        .execute_batch(&descriptors, Some(p.fake.clone() as Arc<dyn EntityService>), 3)
        .await;

    assert_eq!(results.len(), 7);
    for (result, entity) in results.iter().zip(entities) {
        assert_eq!(result.entity_logical_name, entity);
    }
    assert!(!results[4].success);
    assert!(p.fake.max_concurrent_lists() <= 3);
}

#[tokio::test]
async fn relationship_stays_cached_after_schema_changes() -> Result<()> {
    let p = pipeline(project_and_tasks());
    let first = p.resolver.resolve("project", "task").await.context("first")?;

    p.fake.add_entity(
        EntityDefinition::new("task", "taskId").with_attribute(
            AttributeDefinition::lookup("project", ["project"]).with_lookup_field("renamed_ref"),
        ),
    );
    p.schemas.clear();

    let second = p.resolver.resolve("project", "task").await.context("second")?;
    assert_eq!(first, second);

    p.resolver.clear();
    let third = p.resolver.resolve("project", "task").await.context("third")?;
    assert_eq!(third.lookup_column, "renamed_ref");
    Ok(())
}

#[tokio::test]
async fn duplicate_rows_collapse_during_conversion() -> Result<()> {
    let p = pipeline(project_and_tasks());
    let rows = vec![
        row(json!({"taskId": "T-1", "subject": "old"})),
        row(json!({"taskId": "T-1", "subject": "new"})),
    ];

    let records = p.converter.convert(&rows, "task").await?;

    assert_eq!(records.len(), 1);
    assert_eq!(records.duplicate_count, 1);
    assert_eq!(
        records.get("T-1").map(|r| r.primary_name.as_str()),
        Some("new")
    );
    Ok(())
}

#[tokio::test]
async fn entity_without_primary_name_loads_with_explicit_fields() -> Result<()> {
    let fake = FakeEntityService::new()
        .with_entity(EntityDefinition::new("connection", "connectionid"))
        .with_rows(
            "connections",
            vec![row(json!({"connectionid": "C-1", "record1id": "A-1"}))],
        );
    let engine = DatasetEngine::new(EngineConfig::default(), Arc::new(fake));

    let outcome = engine
        .load_dataset(&DatasetRequest::new("connection").with_fields(["record1id"]))
        .await;

    assert!(
        !outcome.descriptor().query_string.contains("name"),
        "unexpected column in {}",
        outcome.descriptor().query_string
    );
    let records = outcome.records().context("dataset should load")?;
    assert_eq!(records.len(), 1);
    assert_eq!(
        records.get("C-1").map(|r| r.primary_name.as_str()),
        Some("connection (C-1)")
    );
    Ok(())
}
