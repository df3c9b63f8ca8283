//! Relationship discovery between a parent and a child entity.
//!
//! Strategies run in priority order and stop at the first hit:
//! 1. cached result for the `(parent, child)` pair
//! 2. child schema lookups targeting the parent (`high`, or `medium` when ambiguous)
//! 3. conventional lookup-field names probed against sampled child rows (`low`)
//! 4. foreign-key-looking child fields whose values overlap parent ids (`low`)
//!
//! Concurrent resolves of one pair share a single discovery. Successful
//! discoveries are cached until `clear`; misses are not cached.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::schema_cache::{EntitySchemaCache, is_valid_entity_name};
use crate::service::{EntityService, call_with_timeout};
use subgrid_api::{
    Confidence, DiscoveredRelationship, DiscoverySource, EntitySchema, RawRow, pluralize,
};

/// Generic parent-reference fields some entities expose instead of a typed lookup.
pub const GENERIC_PARENT_FIELDS: &[&str] = &["_parentid_value", "_regardingobjectid_value"];

/// Callback the error classifier uses to rediscover a relationship.
#[async_trait]
pub trait RelationshipHealer: Send + Sync {
    async fn rediscover(
        &self,
        parent_entity: &str,
        child_entity: &str,
    ) -> Option<DiscoveredRelationship>;
}

type PairKey = (String, String);
type PairDiscovery = Shared<BoxFuture<'static, Option<DiscoveredRelationship>>>;

#[derive(Default)]
struct ResolverState {
    cache: HashMap<PairKey, DiscoveredRelationship>,
    /// Running discoveries keyed by pair, tagged with their generation.
    in_flight: HashMap<PairKey, (u64, PairDiscovery)>,
    /// Bumped by `clear`; discoveries started before a clear are not cached.
    epoch: u64,
}

pub struct RelationshipResolver {
    schemas: Arc<EntitySchemaCache>,
    state: Arc<Mutex<ResolverState>>,
    generations: AtomicU64,
    sample_size: usize,
    parent_sample_size: usize,
    request_timeout: Duration,
}

/// Everything one discovery run needs, owned so the run can outlive the caller.
#[derive(Clone)]
struct Discovery {
    schemas: Arc<EntitySchemaCache>,
    sample_size: usize,
    parent_sample_size: usize,
    request_timeout: Duration,
}

impl RelationshipResolver {
    pub fn new(schemas: Arc<EntitySchemaCache>) -> Self {
        Self {
            schemas,
            state: Arc::new(Mutex::new(ResolverState::default())),
            generations: AtomicU64::new(0),
            sample_size: 5,
            parent_sample_size: 50,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_sample_sizes(mut self, sample_size: usize, parent_sample_size: usize) -> Self {
        self.sample_size = sample_size.max(1);
        self.parent_sample_size = parent_sample_size.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Resolve the lookup column linking `child_entity` rows to `parent_entity`.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(
        &self,
        parent_entity: &str,
        child_entity: &str,
    ) -> Option<DiscoveredRelationship> {
        let parent = parent_entity.trim();
        let child = child_entity.trim();
        if !is_valid_entity_name(parent) || !is_valid_entity_name(child) {
            debug!(
                "[RelationshipResolver] Invalid pair ('{}', '{}')",
                parent_entity, child_entity
            );
            return None;
        }

        let key = (parent.to_string(), child.to_string());
        let discovery = {
            let mut state = self.state.lock();
            if let Some(hit) = state.cache.get(&key) {
                return Some(hit.clone());
            }
            match state.in_flight.get(&key) {
                Some((_, running)) => {
                    debug!(
                        "[RelationshipResolver] Joining running discovery for {} -> {}",
                        parent, child
                    );
                    running.clone()
                }
                None => self.start_discovery(key, &mut state),
            }
        };

        discovery.await
    }

    fn start_discovery(&self, key: PairKey, state: &mut ResolverState) -> PairDiscovery {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch = state.epoch;
        let shared_state = Arc::clone(&self.state);
        let discovery = Discovery {
            schemas: Arc::clone(&self.schemas),
            sample_size: self.sample_size,
            parent_sample_size: self.parent_sample_size,
            request_timeout: self.request_timeout,
        };
        let (parent, child) = key.clone();

        let running = async move {
            let discovered = discovery.run(&parent, &child).await;

            let mut state = shared_state.lock();
            if state
                .in_flight
                .get(&(parent.clone(), child.clone()))
                .is_some_and(|(g, _)| *g == generation)
            {
                state.in_flight.remove(&(parent.clone(), child.clone()));
            }

            let Some(relationship) = discovered else {
                warn!(
                    "[RelationshipResolver] No relationship found from '{}' to '{}'",
                    parent, child
                );
                return None;
            };
            let stored = if state.epoch == epoch {
                state
                    .cache
                    .entry((parent.clone(), child.clone()))
                    .or_insert(relationship)
                    .clone()
            } else {
                relationship
            };
            info!(
                "[RelationshipResolver] {} -> {} via '{}' (confidence: {}, source: {})",
                parent, child, stored.lookup_column, stored.confidence, stored.source
            );
            Some(stored)
        }
        .boxed()
        .shared();

        state.in_flight.insert(key, (generation, running.clone()));
        running
    }

    /// Cache a caller-declared relationship, replacing any prior entry for the pair.
    pub fn register_manual(
        &self,
        parent_entity: &str,
        child_entity: &str,
        lookup_column: &str,
        label: &str,
    ) -> DiscoveredRelationship {
        let relationship = DiscoveredRelationship::new(
            parent_entity.trim(),
            child_entity.trim(),
            lookup_column,
            label,
            Confidence::High,
            DiscoverySource::Manual,
        );
        self.state
            .lock()
            .cache
            .insert(relationship.key(), relationship.clone());
        info!(
            "[RelationshipResolver] Registered {} -> {} via '{}' (manual)",
            relationship.parent_entity, relationship.child_entity, lookup_column
        );
        relationship
    }

    /// Evict the pair and run discovery again.
    pub async fn rediscover(
        &self,
        parent_entity: &str,
        child_entity: &str,
    ) -> Option<DiscoveredRelationship> {
        self.state
            .lock()
            .cache
            .remove(&(parent_entity.trim().to_string(), child_entity.trim().to_string()));
        self.resolve(parent_entity, child_entity).await
    }

    pub fn cached(&self, parent_entity: &str, child_entity: &str) -> Option<DiscoveredRelationship> {
        self.state
            .lock()
            .cache
            .get(&(parent_entity.to_string(), child_entity.to_string()))
            .cloned()
    }

    /// Drop cached relationships. Running discoveries finish but are not cached.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        info!(
            "[RelationshipResolver] Cleared {} cached relationships",
            state.cache.len()
        );
        state.cache.clear();
        state.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of discovery runs started since construction.
    pub fn discovery_count(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }
}

impl Discovery {
    fn service(&self) -> &dyn EntityService {
        self.schemas.service().as_ref()
    }

    async fn run(&self, parent: &str, child: &str) -> Option<DiscoveredRelationship> {
        let child_schema = self.schemas.get_schema(child).await;
        match child_schema.as_deref().and_then(|s| from_schema(s, parent)) {
            Some(found) => Some(found),
            None => self.from_records(parent, child, child_schema.as_deref()).await,
        }
    }

    /// Sample child rows and try conventional names, then value overlap.
    async fn from_records(
        &self,
        parent: &str,
        child: &str,
        child_schema: Option<&EntitySchema>,
    ) -> Option<DiscoveredRelationship> {
        let collection = child_schema
            .map(|s| s.collection_name.clone())
            .unwrap_or_else(|| pluralize(child));
        let candidates = candidate_columns(parent);

        let sample = match call_with_timeout(
            self.request_timeout,
            self.service()
                .retrieve_multiple(&collection, &format!("?$top={}", self.sample_size)),
        )
        .await
        {
            Ok(page) => page.rows,
            Err(failure) => {
                warn!(
                    "[RelationshipResolver] Could not sample '{}': {}",
                    collection, failure
                );
                return None;
            }
        };

        if sample.is_empty() {
            return self.probe_columns(parent, child, &collection, &candidates).await;
        }

        if let Some(column) = candidates
            .iter()
            .find(|column| sample.iter().any(|row| row.contains_key(column.as_str())))
        {
            return Some(DiscoveredRelationship::new(
                parent,
                child,
                column.clone(),
                format!("{parent}_{child}"),
                Confidence::Low,
                DiscoverySource::Pattern,
            ));
        }

        let child_key = child_schema.map(|s| s.primary_id_attribute.as_str());
        let parent_ids = self.sample_parent_ids(parent).await?;
        overlapping_column(&sample, &parent_ids, child_key).map(|column| {
            DiscoveredRelationship::new(
                parent,
                child,
                column,
                format!("{parent}_{child}"),
                Confidence::Low,
                DiscoverySource::RecordAnalysis,
            )
        })
    }

    /// With no rows to inspect, ask the service whether each candidate column exists.
    async fn probe_columns(
        &self,
        parent: &str,
        child: &str,
        collection: &str,
        candidates: &[String],
    ) -> Option<DiscoveredRelationship> {
        for column in candidates {
            let probe = format!("?$select={column}&$top=1");
            let outcome = call_with_timeout(
                self.request_timeout,
                self.service().retrieve_multiple(collection, &probe),
            )
            .await;
            if outcome.is_ok() {
                return Some(DiscoveredRelationship::new(
                    parent,
                    child,
                    column.clone(),
                    format!("{parent}_{child}"),
                    Confidence::Low,
                    DiscoverySource::Pattern,
                ));
            }
            debug!(
                "[RelationshipResolver] Column '{}' not accepted by '{}'",
                column, collection
            );
        }
        None
    }

    async fn sample_parent_ids(&self, parent: &str) -> Option<HashSet<String>> {
        let schema = self.schemas.get_schema(parent).await?;
        let query = format!(
            "?$select={}&$top={}",
            schema.primary_id_attribute, self.parent_sample_size
        );
        let page = call_with_timeout(
            self.request_timeout,
            self.service()
                .retrieve_multiple(&schema.collection_name, &query),
        )
        .await
        .map_err(|failure| {
            warn!(
                "[RelationshipResolver] Could not sample parent '{}': {}",
                parent, failure
            );
        })
        .ok()?;

        let ids: HashSet<String> = page
            .rows
            .iter()
            .filter_map(|row| row.get(&schema.primary_id_attribute))
            .filter_map(comparable_id)
            .collect();
        (!ids.is_empty()).then_some(ids)
    }
}

#[async_trait]
impl RelationshipHealer for RelationshipResolver {
    async fn rediscover(
        &self,
        parent_entity: &str,
        child_entity: &str,
    ) -> Option<DiscoveredRelationship> {
        RelationshipResolver::rediscover(self, parent_entity, child_entity).await
    }
}

fn from_schema(schema: &EntitySchema, parent: &str) -> Option<DiscoveredRelationship> {
    let matches = schema.lookups_targeting(parent);
    let first = matches.first()?;
    let confidence = if matches.len() == 1 {
        Confidence::High
    } else {
        debug!(
            "[RelationshipResolver] {} lookups on '{}' target '{}'; picking '{}'",
            matches.len(),
            schema.logical_name,
            parent,
            first.logical_name
        );
        Confidence::Medium
    };
    Some(DiscoveredRelationship::new(
        parent,
        schema.logical_name.clone(),
        first.lookup_field_name.clone(),
        first.logical_name.clone(),
        confidence,
        DiscoverySource::Schema,
    ))
}

/// Conventional lookup-field names for a parent, most specific first.
fn candidate_columns(parent: &str) -> Vec<String> {
    let parent = parent.to_ascii_lowercase();
    let mut columns = vec![
        format!("_{parent}_value"),
        format!("_{parent}id_value"),
        format!("{parent}id"),
    ];
    columns.extend(GENERIC_PARENT_FIELDS.iter().map(|f| f.to_string()));
    columns
}

fn comparable_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(
            s.trim_start_matches('{')
                .trim_end_matches('}')
                .to_ascii_lowercase(),
        ),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn looks_like_foreign_key(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    !field.contains('@') && (lower.ends_with("_value") || lower.ends_with("id"))
}

/// Foreign-key-looking column with the most values found among `parent_ids`.
fn overlapping_column(
    rows: &[RawRow],
    parent_ids: &HashSet<String>,
    child_key: Option<&str>,
) -> Option<String> {
    let mut hits: BTreeMap<&str, usize> = BTreeMap::new();
    for row in rows {
        for (field, value) in row {
            if Some(field.as_str()) == child_key || !looks_like_foreign_key(field) {
                continue;
            }
            if comparable_id(value).is_some_and(|id| parent_ids.contains(&id)) {
                *hits.entry(field.as_str()).or_default() += 1;
            }
        }
    }
    // Highest count wins; BTreeMap order breaks ties alphabetically.
    let best = hits.values().copied().max()?;
    hits.into_iter()
        .find(|(_, count)| *count == best)
        .map(|(field, _)| field.to_string())
}
