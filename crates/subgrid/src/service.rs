//! Outbound seam to the remote entity service.
//!
//! Implementations talk to a real endpoint (`subgrid-webapi`) or serve canned
//! data (`testing::FakeEntityService`). Every call returns a `ServiceFailure`
//! value on failure; implementations never panic on remote errors.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use subgrid_api::{EntityDefinition, RawRow, ServiceFailure};

/// One page returned by a list query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedPage {
    pub rows: Vec<RawRow>,
    pub total_count: Option<u64>,
    /// Opaque continuation the caller passes back to fetch the next page.
    pub next_link: Option<String>,
}

impl RetrievedPage {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait EntityService: Send + Sync {
    /// Run a read-only list query against `collection`.
    ///
    /// `query` is an OData query string including its leading `?`.
    async fn retrieve_multiple(
        &self,
        collection: &str,
        query: &str,
    ) -> Result<RetrievedPage, ServiceFailure>;

    /// Fetch the raw schema definition of one entity.
    async fn retrieve_entity_definition(
        &self,
        logical_name: &str,
    ) -> Result<EntityDefinition, ServiceFailure>;
}

/// Bound a service call by `timeout`; expiry becomes a transport failure.
pub async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ServiceFailure>
where
    F: Future<Output = Result<T, ServiceFailure>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ServiceFailure::transport(format!(
            "Request timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subgrid_api::FailureKind;

    #[tokio::test]
    async fn timeout_becomes_transport_failure() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, ServiceFailure>(())
        };
        let failure = call_with_timeout(Duration::from_millis(5), slow)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transport);
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let value = call_with_timeout(Duration::from_secs(1), async { Ok::<_, ServiceFailure>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
