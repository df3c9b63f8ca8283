//! Dataset engine facade.
//!
//! Wires the schema cache, resolver, synthesizer, executor, converter and
//! classifier around one `EntityService` and one `EngineConfig`:
//! request → build → optimize → execute → convert, or classify on failure.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::core::{
    ConnectivityReport, EntitySchemaCache, ErrorClassifier, QueryExecutor, QuerySynthesizer,
    RecordConverter, RelationshipResolver,
};
use crate::service::EntityService;
use subgrid_api::{
    ApiError, ConvertedRecordSet, DatasetRequest, DiagnosisContext, DiscoveredRelationship, ErrorDiagnosis,
    QueryDescriptor, QueryResult, ServiceFailure,
};

/// Outcome of loading one dataset.
#[derive(Debug, Clone)]
pub enum DatasetOutcome {
    Loaded {
        descriptor: QueryDescriptor,
        records: ConvertedRecordSet,
        total_count: Option<u64>,
        next_page_token: Option<String>,
    },
    Failed {
        descriptor: QueryDescriptor,
        failure: ServiceFailure,
        diagnosis: ErrorDiagnosis,
        report: String,
    },
}

impl DatasetOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, DatasetOutcome::Loaded { .. })
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        match self {
            DatasetOutcome::Loaded { descriptor, .. } | DatasetOutcome::Failed { descriptor, .. } => {
                descriptor
            }
        }
    }

    pub fn records(&self) -> Option<&ConvertedRecordSet> {
        match self {
            DatasetOutcome::Loaded { records, .. } => Some(records),
            DatasetOutcome::Failed { .. } => None,
        }
    }

    pub fn diagnosis(&self) -> Option<&ErrorDiagnosis> {
        match self {
            DatasetOutcome::Failed { diagnosis, .. } => Some(diagnosis),
            DatasetOutcome::Loaded { .. } => None,
        }
    }

    /// The failure in the serialisable form hosts render.
    pub fn api_error(&self) -> Option<ApiError> {
        match self {
            DatasetOutcome::Failed { failure, .. } => Some(ApiError::from(failure)),
            DatasetOutcome::Loaded { .. } => None,
        }
    }
}

pub struct DatasetEngine {
    config: EngineConfig,
    service: Arc<dyn EntityService>,
    schemas: Arc<EntitySchemaCache>,
    resolver: Arc<RelationshipResolver>,
    synthesizer: QuerySynthesizer,
    executor: QueryExecutor,
    converter: RecordConverter,
    classifier: ErrorClassifier,
}

impl DatasetEngine {
    pub fn new(config: EngineConfig, service: Arc<dyn EntityService>) -> Self {
        let schemas = Arc::new(
            EntitySchemaCache::new(Arc::clone(&service))
                .with_ttl(config.schema_ttl())
                .with_request_timeout(config.request_timeout()),
        );
        let resolver = Arc::new(
            RelationshipResolver::new(Arc::clone(&schemas))
                .with_sample_sizes(config.sample_size, config.parent_sample_size)
                .with_request_timeout(config.request_timeout()),
        );
        let synthesizer =
            QuerySynthesizer::new(Arc::clone(&schemas), Arc::clone(&resolver), config.environment);
        let executor = QueryExecutor::new(config.request_timeout()).with_probe(
            config.probe_collection.clone(),
            config.probe_query.clone(),
            config.probe_timeout(),
        );
        let converter = RecordConverter::new(Arc::clone(&schemas));
        let mut classifier = ErrorClassifier::new().with_history_limit(config.history_limit);
        if config.self_healing {
            classifier = classifier.with_healer(resolver.clone());
        }

        Self {
            config,
            service,
            schemas,
            resolver,
            synthesizer,
            executor,
            converter,
            classifier,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schemas(&self) -> &Arc<EntitySchemaCache> {
        &self.schemas
    }

    pub fn resolver(&self) -> &Arc<RelationshipResolver> {
        &self.resolver
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Build the optimized descriptor for `request` without executing it.
    pub async fn plan(&self, request: &DatasetRequest) -> QueryDescriptor {
        let descriptor = self.synthesizer.build(request).await;
        QuerySynthesizer::optimize(&descriptor)
    }

    #[tracing::instrument(skip(self, request), fields(entity = %request.target_entity))]
    pub async fn load_dataset(&self, request: &DatasetRequest) -> DatasetOutcome {
        let descriptor = self.plan(request).await;
        let result = self
            .executor
            .execute(&descriptor, Some(self.service.as_ref()))
            .await;
        self.finish(request, descriptor, result).await
    }

    /// Load several datasets with at most `max_concurrency` plans or queries in flight.
    /// Outcomes are index-aligned with `requests`.
    pub async fn load_datasets(&self, requests: &[DatasetRequest]) -> Vec<DatasetOutcome> {
        let descriptors: Vec<QueryDescriptor> = stream::iter(requests)
            .map(|request| self.plan(request))
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        let results = self
            .executor
            .execute_batch(
                &descriptors,
                Some(Arc::clone(&self.service)),
                self.config.max_concurrency,
            )
            .await;

        let mut outcomes = Vec::with_capacity(requests.len());
        for ((request, descriptor), result) in requests.iter().zip(descriptors).zip(results) {
            outcomes.push(self.finish(request, descriptor, result).await);
        }
        outcomes
    }

    async fn finish(
        &self,
        request: &DatasetRequest,
        descriptor: QueryDescriptor,
        result: QueryResult,
    ) -> DatasetOutcome {
        let failure = match (result.success, result.error) {
            (true, _) => {
                match self
                    .converter
                    .convert(&result.entities, &descriptor.entity_logical_name)
                    .await
                {
                    Ok(records) => {
                        info!(
                            "[DatasetEngine] Loaded {} {} records",
                            records.len(),
                            descriptor.entity_logical_name
                        );
                        return DatasetOutcome::Loaded {
                            descriptor,
                            records,
                            total_count: result.total_count,
                            next_page_token: result.next_page_token,
                        };
                    }
                    Err(e) => ServiceFailure::validation(e.to_string()),
                }
            }
            (false, Some(failure)) => failure,
            (false, None) => ServiceFailure::transport("Query failed without an error"),
        };

        let mut context = DiagnosisContext::for_entity(descriptor.entity_logical_name.clone())
            .with_query(descriptor.query_string.clone());
        if let Some(parent) = &request.parent {
            context = context.with_relationship(
                parent.entity.clone(),
                descriptor.entity_logical_name.clone(),
            );
        }
        if let Some(column) = &descriptor.lookup_column {
            context = context.with_lookup_column(column.clone());
        }

        let diagnosis = self.classifier.classify(&failure, Some(&context)).await;
        let report = ErrorClassifier::report(&failure, &diagnosis);
        DatasetOutcome::Failed {
            descriptor,
            failure,
            diagnosis,
            report,
        }
    }

    pub async fn discover_relationship(
        &self,
        parent_entity: &str,
        child_entity: &str,
    ) -> Option<DiscoveredRelationship> {
        self.resolver.resolve(parent_entity, child_entity).await
    }

    pub fn register_relationship(
        &self,
        parent_entity: &str,
        child_entity: &str,
        lookup_column: &str,
        label: &str,
    ) -> DiscoveredRelationship {
        self.resolver
            .register_manual(parent_entity, child_entity, lookup_column, label)
    }

    /// Drop cached schemas and relationships.
    pub fn clear_metadata_cache(&self) {
        self.schemas.clear();
        self.resolver.clear();
    }

    pub async fn test_connectivity(&self) -> ConnectivityReport {
        self.executor
            .test_connectivity(Some(self.service.as_ref()))
            .await
    }

    pub fn diagnosis_history(&self) -> Vec<ErrorDiagnosis> {
        self.classifier.history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEntityService;
    use serde_json::json;
    use subgrid_api::{AttributeDefinition, EntityDefinition, RawRow};

    fn row(value: serde_json::Value) -> RawRow {
        value.as_object().cloned().unwrap_or_default()
    }

    fn engine_with(fake: Arc<FakeEntityService>, config: EngineConfig) -> DatasetEngine {
        DatasetEngine::new(config, fake as Arc<dyn EntityService>)
    }

    fn fake() -> Arc<FakeEntityService> {
        Arc::new(
            FakeEntityService::new()
                .with_entity(EntityDefinition::new("account", "accountid"))
                .with_entity(EntityDefinition::new("contact", "contactid").with_primary_name("fullname"))
                .with_rows(
                    "contacts",
                    vec![
                        row(json!({"contactid": "c1", "fullname": "Ada", "_parentcustomerid_value": "a1"})),
                        row(json!({"contactid": "c2", "fullname": "Grace", "_parentcustomerid_value": "a2"})),
                    ],
                ),
        )
    }

    #[tokio::test]
    async fn loads_unscoped_dataset() {
        let engine = engine_with(fake(), EngineConfig::default());
        let outcome = engine.load_dataset(&DatasetRequest::new("contact")).await;

        let records = outcome.records().expect("loaded");
        assert_eq!(records.len(), 2);
        assert_eq!(records.get("c1").map(|r| r.primary_name.as_str()), Some("Ada"));
        assert_eq!(outcome.descriptor().query_string, "?$count=false");
    }

    #[tokio::test]
    async fn failure_is_classified_and_recorded() {
        let engine = engine_with(fake(), EngineConfig::default());
        let outcome = engine
            .load_dataset(&DatasetRequest::new("contact").with_fields(["nickname"]))
            .await;

        let diagnosis = outcome.diagnosis().expect("failed");
        assert!(diagnosis.is_field_error);
        assert!(!diagnosis.suggestions.is_empty());
        assert_eq!(engine.diagnosis_history().len(), 1);
        assert!(matches!(outcome.api_error(), Some(ApiError::Internal { .. })));
        match outcome {
            DatasetOutcome::Failed { report, .. } => assert!(report.contains("nickname")),
            DatasetOutcome::Loaded { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn manual_relationship_scopes_the_query() {
        let engine = engine_with(fake(), EngineConfig::default());
        engine.register_relationship("account", "contact", "_parentcustomerid_value", "account_contacts");

        let outcome = engine
            .load_dataset(&DatasetRequest::new("contact").with_parent("account", "a2"))
            .await;

        let records = outcome.records().expect("loaded");
        assert_eq!(records.len(), 1);
        assert!(records.get("c2").is_some());
        assert_eq!(
            outcome.descriptor().relationship_name.as_deref(),
            Some("account_contacts")
        );
    }

    #[tokio::test]
    async fn clear_metadata_cache_empties_both_caches() {
        let fake = fake();
        let engine = engine_with(fake.clone(), EngineConfig::default());
        engine.register_relationship("account", "contact", "_parentcustomerid_value", "x");
        engine.load_dataset(&DatasetRequest::new("contact")).await;
        assert!(!engine.schemas().is_empty());

        engine.clear_metadata_cache();

        assert!(engine.schemas().is_empty());
        assert!(engine.resolver().is_empty());
    }

    #[tokio::test]
    async fn batch_outcomes_follow_request_order() {
        let engine = engine_with(fake(), EngineConfig::default());
        let requests = vec![
            DatasetRequest::new("contact"),
            DatasetRequest::new("widget"),
            DatasetRequest::new("account"),
        ];

        let outcomes = engine.load_datasets(&requests).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_loaded());
        assert!(!outcomes[1].is_loaded());
        assert!(outcomes[1].diagnosis().is_some_and(|d| d.is_entity_error));
        assert!(matches!(outcomes[1].api_error(), Some(ApiError::NotFound { .. })));
        assert!(outcomes[2].is_loaded());
        assert!(outcomes[2].api_error().is_none());
        assert_eq!(outcomes[2].descriptor().entity_logical_name, "account");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_planning_respects_max_concurrency() {
        let mut fake = FakeEntityService::new();
        let mut requests = Vec::new();
        for child in ["alpha", "beta", "gamma", "delta"] {
            let collection = format!("{child}s");
            let mut sample = RawRow::new();
            sample.insert(format!("{child}id"), json!("x1"));
            sample.insert("_projectid_value".to_string(), json!("P-1"));
            fake = fake
                .with_entity(EntityDefinition::new(child, format!("{child}id")))
                .with_rows(&collection, vec![sample])
                .with_latency(&collection, std::time::Duration::from_millis(30));
            requests.push(DatasetRequest::new(child).with_parent("project", "P-1"));
        }
        let fake = Arc::new(fake);
        let config = EngineConfig {
            max_concurrency: 1,
            ..EngineConfig::default()
        };
        let engine = engine_with(fake.clone(), config);

        let outcomes = engine.load_datasets(&requests).await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(engine.resolver().len(), 4);
        assert_eq!(fake.max_concurrent_lists(), 1);
    }

    #[tokio::test]
    async fn self_healing_follows_config() {
        let fake = Arc::new(
            FakeEntityService::new()
                .with_entity(
                    EntityDefinition::new("task", "taskid").with_attribute(
                        AttributeDefinition::lookup("project", ["project"])
                            .with_lookup_field("project_ref"),
                    ),
                )
                .with_rows("tasks", vec![row(json!({"taskid": "t1", "project_ref": "P-1"}))]),
        );
        let failure = ServiceFailure::remote(
            400,
            "Could not find a property named '_parentid_value' on type 'Microsoft.Dynamics.CRM.task'.",
        );
        let context = DiagnosisContext::for_entity("task").with_relationship("project", "task");

        let healing = engine_with(fake.clone(), EngineConfig::default());
        let diagnosis = healing.classifier().classify(&failure, Some(&context)).await;
        assert!(diagnosis.suggestions[0].contains("project_ref"));

        let config = EngineConfig {
            self_healing: false,
            ..EngineConfig::default()
        };
        let plain = engine_with(fake, config);
        let diagnosis = plain.classifier().classify(&failure, Some(&context)).await;
        assert!(!diagnosis.suggestions[0].contains("project_ref"));
    }
}
