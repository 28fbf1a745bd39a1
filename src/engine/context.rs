//! Explicit engine context shared by the dispatcher and the coordinator.

use std::sync::Arc;

use metrics::counter;
use sideline_protocol::ServerMessage;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

use super::lifecycle::GenerationRegistry;
use super::request::AbortSignal;
use super::response::EngineResponse;
use crate::cache::{CacheStore, Generation, RegionKind, RegionName, RequestKey, Snapshot};
use crate::infra::network::Network;

const NOTICE_CAPACITY: usize = 32;

/// Everything a handler needs: the store, the network, the upstream origin
/// and the generation registry.
pub struct EngineContext {
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    origin: Url,
    registry: GenerationRegistry,
    notices: broadcast::Sender<ServerMessage>,
}

impl EngineContext {
    pub fn new(store: Arc<dyn CacheStore>, network: Arc<dyn Network>, origin: Url) -> Arc<Self> {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Arc::new(Self {
            store,
            network,
            origin,
            registry: GenerationRegistry::default(),
            notices,
        })
    }

    pub fn store(&self) -> &dyn CacheStore {
        self.store.as_ref()
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn registry(&self) -> &GenerationRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.notices.subscribe()
    }

    pub(crate) fn notify(&self, message: ServerMessage) {
        // No open channel is not an error.
        let _ = self.notices.send(message);
    }

    /// Resolve a path or absolute URL against the upstream origin.
    pub fn resolve(&self, reference: &str) -> Option<Url> {
        self.origin.join(reference).ok()
    }

    /// Look up one region; store errors degrade to a miss.
    pub(crate) async fn lookup(&self, region: &RegionName, key: &RequestKey) -> Option<Snapshot> {
        let label = region.kind().map_or("foreign", RegionKind::as_str);
        match self.store.match_entry(region, key).await {
            Ok(Some(snapshot)) => {
                counter!("sideline_cache_hit_total", "region" => label).increment(1);
                debug!(region = %region, url = %key.url(), outcome = "hit", "Cache lookup");
                Some(snapshot)
            }
            Ok(None) => {
                counter!("sideline_cache_miss_total", "region" => label).increment(1);
                debug!(region = %region, url = %key.url(), outcome = "miss", "Cache lookup");
                None
            }
            Err(err) => {
                counter!("sideline_cache_miss_total", "region" => label).increment(1);
                warn!(
                    region = %region,
                    url = %key.url(),
                    error = %err,
                    "Cache read failed; treating as miss"
                );
                None
            }
        }
    }

    /// Look `key` up in the given regions of `generation`, in order.
    pub(crate) async fn lookup_in(
        &self,
        generation: &Generation,
        key: &RequestKey,
        kinds: &[RegionKind],
    ) -> Option<EngineResponse> {
        for kind in kinds {
            let region = RegionName::for_kind(*kind, generation);
            if let Some(snapshot) = self.lookup(&region, key).await {
                return Some(EngineResponse::new(snapshot, (*kind).into()));
            }
        }
        None
    }

    /// Opportunistic write into the runtime region of `generation`.
    ///
    /// Dropped when the request was aborted, when the response is not
    /// storable, or when `generation` is no longer active. Failures are
    /// swallowed.
    pub(crate) async fn store_runtime(
        &self,
        generation: &Generation,
        key: &RequestKey,
        snapshot: &Snapshot,
        abort: &AbortSignal,
    ) {
        if abort.is_aborted() {
            debug!(url = %key.url(), "Request aborted; dropping cache write");
            return;
        }
        if !snapshot.is_storable() {
            debug!(url = %key.url(), status = snapshot.status, "Response not storable");
            return;
        }
        if !self.registry.is_active(generation) {
            debug!(
                generation = %generation,
                url = %key.url(),
                "Generation no longer active; dropping cache write"
            );
            return;
        }

        let region = RegionName::runtime(generation);
        if let Err(err) = self.store.put(&region, key, snapshot.clone()).await {
            counter!("sideline_cache_write_error_total").increment(1);
            warn!(
                region = %region,
                url = %key.url(),
                error = %err,
                "Cache write failed"
            );
            return;
        }

        // A cutover during the put has already pruned this region; the put
        // recreated it.
        if !self.registry.is_active(generation) {
            debug!(region = %region, "Generation superseded during cache write; removing region");
            if let Err(err) = self.store.delete_region(&region).await {
                warn!(region = %region, error = %err, "Failed to remove superseded region");
            }
        }
    }
}
