//! Per-entity schema cache with request coalescing.
//!
//! At most one definition fetch per entity key is outstanding at any time:
//! the first caller on a miss starts a shared fetch future and every later
//! caller for the same key awaits that same future. Failed fetches are not
//! cached, so a later call goes back to the network.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::service::{EntityService, call_with_timeout};
use subgrid_api::{EntitySchema, UNKNOWN_ENTITY};

type SchemaFetch = Shared<BoxFuture<'static, Option<Arc<EntitySchema>>>>;

struct CachedSchema {
    schema: Arc<EntitySchema>,
    fetched_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedSchema>,
    /// In-flight fetches keyed by entity, tagged with the fetch generation.
    in_flight: HashMap<String, (u64, SchemaFetch)>,
    /// Bumped by `clear`; fetches started before a clear do not populate the cache.
    epoch: u64,
}

pub struct EntitySchemaCache {
    service: Arc<dyn EntityService>,
    state: Arc<Mutex<CacheState>>,
    ttl: Option<Duration>,
    request_timeout: Duration,
    fetches: AtomicU64,
}

/// Whether `name` can identify an entity at all.
pub fn is_valid_entity_name(name: &str) -> bool {
    let name = name.trim();
    !name.is_empty() && !name.eq_ignore_ascii_case(UNKNOWN_ENTITY)
}

impl EntitySchemaCache {
    pub fn new(service: Arc<dyn EntityService>) -> Self {
        Self {
            service,
            state: Arc::new(Mutex::new(CacheState::default())),
            ttl: None,
            request_timeout: Duration::from_secs(30),
            fetches: AtomicU64::new(0),
        }
    }

    /// Entries older than `ttl` are treated as misses.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn service(&self) -> &Arc<dyn EntityService> {
        &self.service
    }

    /// Get the schema for `logical_name`, fetching it on a miss.
    ///
    /// Returns `None` without a network call for empty or sentinel names, and
    /// `None` when the fetch fails.
    #[tracing::instrument(skip(self))]
    pub async fn get_schema(&self, logical_name: &str) -> Option<Arc<EntitySchema>> {
        if !is_valid_entity_name(logical_name) {
            debug!(
                "[SchemaCache] Rejecting entity name '{}' without a fetch",
                logical_name
            );
            return None;
        }
        let key = logical_name.trim();

        let fetch = {
            let mut state = self.state.lock();
            if let Some(cached) = state.entries.get(key) {
                if self.is_fresh(cached) {
                    return Some(Arc::clone(&cached.schema));
                }
                debug!("[SchemaCache] Entry for '{}' expired", key);
                state.entries.remove(key);
            }

            match state.in_flight.get(key) {
                Some((_, fetch)) => {
                    debug!("[SchemaCache] Joining in-flight fetch for '{}'", key);
                    fetch.clone()
                }
                None => self.start_fetch(key, &mut state),
            }
        };

        fetch.await
    }

    fn start_fetch(&self, key: &str, state: &mut CacheState) -> SchemaFetch {
        let generation = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch = state.epoch;
        let service = Arc::clone(&self.service);
        let shared_state = Arc::clone(&self.state);
        let timeout = self.request_timeout;
        let name = key.to_string();

        debug!("[SchemaCache] Fetching definition for '{}'", name);

        let fetch = async move {
            let fetched =
                call_with_timeout(timeout, service.retrieve_entity_definition(&name)).await;
            let outcome = match fetched {
                Ok(definition) => {
                    let schema = EntitySchema::from_definition(definition);
                    info!(
                        "[SchemaCache] Cached schema for '{}': collection={}, lookups={}",
                        name,
                        schema.collection_name,
                        schema.lookup_attributes.len()
                    );
                    Some(Arc::new(schema))
                }
                Err(failure) => {
                    warn!(
                        "[SchemaCache] Failed to fetch schema for '{}': {}",
                        name, failure
                    );
                    None
                }
            };

            {
                let mut state = shared_state.lock();
                if state
                    .in_flight
                    .get(&name)
                    .is_some_and(|(g, _)| *g == generation)
                {
                    state.in_flight.remove(&name);
                }
                if let Some(schema) = &outcome {
                    if state.epoch == epoch {
                        state.entries.insert(
                            name.clone(),
                            CachedSchema {
                                schema: Arc::clone(schema),
                                fetched_at: Instant::now(),
                            },
                        );
                    }
                }
            }

            outcome
        }
        .boxed()
        .shared();

        state
            .in_flight
            .insert(key.to_string(), (generation, fetch.clone()));
        fetch
    }

    fn is_fresh(&self, cached: &CachedSchema) -> bool {
        match self.ttl {
            Some(ttl) => cached.fetched_at.elapsed() < ttl,
            None => true,
        }
    }

    /// Cached schema without triggering a fetch.
    pub fn peek(&self, logical_name: &str) -> Option<Arc<EntitySchema>> {
        let state = self.state.lock();
        state
            .entries
            .get(logical_name.trim())
            .filter(|cached| self.is_fresh(cached))
            .map(|cached| Arc::clone(&cached.schema))
    }

    /// Drop every cached schema. In-flight fetches stay joinable and finish
    /// without populating the cache.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.epoch += 1;
        info!("[SchemaCache] Cleared {} cached schemas", dropped);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of definition fetches started since construction.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}
