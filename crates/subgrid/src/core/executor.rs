//! Query execution against an `EntityService`.
//!
//! Every failure is folded into a failed `QueryResult`; nothing here returns
//! an error to the caller.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::core::query_builder::QuerySynthesizer;
use crate::service::{EntityService, call_with_timeout};
use subgrid_api::{QueryDescriptor, QueryResult, ServiceFailure, pluralize};

/// Outcome of the connectivity probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityReport {
    pub success: bool,
    pub error: Option<ServiceFailure>,
    pub elapsed: Duration,
}

pub struct QueryExecutor {
    request_timeout: Duration,
    probe_collection: String,
    probe_query: String,
    probe_timeout: Duration,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl QueryExecutor {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            probe_collection: "systemusers".to_string(),
            probe_query: "?$select=systemuserid&$top=1".to_string(),
            probe_timeout: Duration::from_secs(5),
        }
    }

    /// Collection, query and timeout used by `test_connectivity`.
    pub fn with_probe(
        mut self,
        collection: impl Into<String>,
        query: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        self.probe_collection = collection.into();
        self.probe_query = query.into();
        self.probe_timeout = timeout;
        self
    }

    /// Validate and run one descriptor.
    #[tracing::instrument(skip_all, fields(entity = %descriptor.entity_logical_name))]
    pub async fn execute(
        &self,
        descriptor: &QueryDescriptor,
        service: Option<&dyn EntityService>,
    ) -> QueryResult {
        let entity = descriptor.entity_logical_name.as_str();

        let report = QuerySynthesizer::validate(descriptor);
        if !report.is_valid {
            let message = report.errors.join("; ");
            warn!("[QueryExecutor] Rejected invalid query for '{}': {}", entity, message);
            return QueryResult::failed(entity, ServiceFailure::validation(message));
        }
        for warning in &report.warnings {
            debug!("[QueryExecutor] {}: {}", entity, warning);
        }

        let Some(service) = service else {
            warn!("[QueryExecutor] No entity service available for '{}'", entity);
            return QueryResult::failed(entity, ServiceFailure::unavailable());
        };

        let collection = descriptor
            .collection_name
            .clone()
            .unwrap_or_else(|| pluralize(entity));
        let started = Instant::now();
        match call_with_timeout(
            self.request_timeout,
            service.retrieve_multiple(&collection, &descriptor.query_string),
        )
        .await
        {
            Ok(page) => {
                debug!(
                    "[QueryExecutor] {}{} returned {} rows in {:?}",
                    collection,
                    descriptor.query_string,
                    page.rows.len(),
                    started.elapsed()
                );
                QueryResult::succeeded(entity, page.rows, page.total_count, page.next_link)
            }
            Err(failure) => {
                warn!(
                    "[QueryExecutor] {}{} failed: {}",
                    collection, descriptor.query_string, failure
                );
                QueryResult::failed(entity, failure)
            }
        }
    }

    /// Run `descriptors` with at most `max_concurrency` in flight.
    ///
    /// The output is index-aligned with the input whatever the completion order.
    pub async fn execute_batch(
        &self,
        descriptors: &[QueryDescriptor],
        service: Option<Arc<dyn EntityService>>,
        max_concurrency: usize,
    ) -> Vec<QueryResult> {
        let permits = Semaphore::new(max_concurrency.max(1));
        let service = service.as_deref();

        let mut pending: FuturesUnordered<_> = descriptors
            .iter()
            .enumerate()
            .map(|(index, descriptor)| {
                let permits = &permits;
                async move {
                    // The semaphore is never closed.
                    let _permit = permits.acquire().await.ok();
                    (index, self.execute(descriptor, service).await)
                }
            })
            .collect();

        let mut slots: Vec<Option<QueryResult>> = vec![None; descriptors.len()];
        while let Some((index, result)) = pending.next().await {
            slots[index] = Some(result);
        }

        let results: Vec<QueryResult> = slots.into_iter().flatten().collect();
        info!(
            "[QueryExecutor] Batch of {} finished: {} succeeded",
            results.len(),
            results.iter().filter(|r| r.success).count()
        );
        results
    }

    /// Issue a minimal query against an always-present collection.
    pub async fn test_connectivity(&self, service: Option<&dyn EntityService>) -> ConnectivityReport {
        let started = Instant::now();
        let Some(service) = service else {
            return ConnectivityReport {
                success: false,
                error: Some(ServiceFailure::unavailable()),
                elapsed: started.elapsed(),
            };
        };

        let outcome = call_with_timeout(
            self.probe_timeout,
            service.retrieve_multiple(&self.probe_collection, &self.probe_query),
        )
        .await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(_) => {
                info!("[QueryExecutor] Connectivity probe succeeded in {:?}", elapsed);
                ConnectivityReport {
                    success: true,
                    error: None,
                    elapsed,
                }
            }
            Err(failure) => {
                warn!("[QueryExecutor] Connectivity probe failed: {}", failure);
                ConnectivityReport {
                    success: false,
                    error: Some(failure),
                    elapsed,
                }
            }
        }
    }
}
