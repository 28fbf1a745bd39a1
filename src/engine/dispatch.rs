//! Fetch Strategy Dispatcher.
//!
//! Every intercepted GET is classified against the active generation's route
//! table and handled by one strategy:
//!
//! | class             | strategy                         |
//! |-------------------|----------------------------------|
//! | `navigation-html` | network first, cache fallback    |
//! | `static-asset`    | cache first                      |
//! | `api-like`        | stale while revalidate           |
//!
//! A strategy always resolves to a response; errors never reach the caller.

use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::classify::{ResourceClass, Strategy};
use super::context::EngineContext;
use super::definition::GenerationProfile;
use super::fallback::FallbackResolver;
use super::request::InterceptedRequest;
use super::response::{EngineResponse, OfflineFlavor};
use crate::cache::{RegionKind, RequestKey, Snapshot};
use crate::infra::network::{NetworkError, OutboundRequest};

const CACHE_FIRST_ORDER: [RegionKind; 2] = [RegionKind::Precache, RegionKind::Runtime];
const RUNTIME_FIRST_ORDER: [RegionKind; 2] = [RegionKind::Runtime, RegionKind::Precache];

/// Why the engine left a request to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    NotGet,
    CrossOrigin,
    NoActiveGeneration,
}

impl DeclineReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeclineReason::NotGet => "not_get",
            DeclineReason::CrossOrigin => "cross_origin",
            DeclineReason::NoActiveGeneration => "no_active_generation",
        }
    }
}

#[derive(Debug)]
pub enum Interception {
    /// The platform should perform a normal fetch.
    Declined(DeclineReason),
    Responded(EngineResponse),
}

impl Interception {
    pub fn response(self) -> Option<EngineResponse> {
        match self {
            Interception::Responded(response) => Some(response),
            Interception::Declined(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<EngineContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn handle(&self, request: &InterceptedRequest) -> Interception {
        let Some(profile) = self.ctx.registry().active_profile() else {
            return Interception::Declined(DeclineReason::NoActiveGeneration);
        };
        let Some(class) = profile.routes.classify(request) else {
            return Interception::Declined(DeclineReason::NotGet);
        };

        let same_origin = request.is_same_origin(self.ctx.origin());
        if !same_origin && class != ResourceClass::StaticAsset {
            return Interception::Declined(DeclineReason::CrossOrigin);
        }

        let strategy = class.strategy();
        debug!(
            generation = %profile.generation,
            class = class.as_str(),
            strategy = strategy.as_str(),
            "Dispatching request"
        );

        let response = match strategy {
            Strategy::NetworkFirst => self.network_first(request, &profile).await,
            Strategy::CacheFirst => self.cache_first(request, &profile, same_origin).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, &profile).await,
        };
        Interception::Responded(response)
    }

    async fn network_first(
        &self,
        request: &InterceptedRequest,
        profile: &GenerationProfile,
    ) -> EngineResponse {
        let key = request.key();
        let outbound = OutboundRequest::from_intercepted(request).bypassing_caches();

        match self.ctx.network().send(outbound).await {
            Ok(fresh) => {
                self.ctx
                    .store_runtime(&profile.generation, &key, &fresh, &request.abort)
                    .await;
                EngineResponse::network(fresh)
            }
            Err(err) => {
                record_network_failure(&err, Strategy::NetworkFirst);
                if let Some(cached) = self
                    .ctx
                    .lookup_in(&profile.generation, &key, &RUNTIME_FIRST_ORDER)
                    .await
                {
                    return cached;
                }
                // The resolver starts with the cached root document.
                FallbackResolver::new(&self.ctx, profile)
                    .resolve(OfflineFlavor::Text)
                    .await
            }
        }
    }

    async fn cache_first(
        &self,
        request: &InterceptedRequest,
        profile: &GenerationProfile,
        same_origin: bool,
    ) -> EngineResponse {
        let key = request.key();
        if let Some(cached) = self
            .ctx
            .lookup_in(&profile.generation, &key, &CACHE_FIRST_ORDER)
            .await
        {
            return cached;
        }

        match self
            .ctx
            .network()
            .send(OutboundRequest::from_intercepted(request))
            .await
        {
            Ok(fresh) => {
                if same_origin {
                    self.ctx
                        .store_runtime(&profile.generation, &key, &fresh, &request.abort)
                        .await;
                }
                EngineResponse::network(fresh)
            }
            Err(err) => {
                record_network_failure(&err, Strategy::CacheFirst);
                FallbackResolver::new(&self.ctx, profile)
                    .resolve(OfflineFlavor::Text)
                    .await
            }
        }
    }

    async fn stale_while_revalidate(
        &self,
        request: &InterceptedRequest,
        profile: &GenerationProfile,
    ) -> EngineResponse {
        let key = request.key();
        let revalidation = self.spawn_revalidation(request, profile, key.clone());

        if let Some(cached) = self
            .ctx
            .lookup_in(&profile.generation, &key, &RUNTIME_FIRST_ORDER)
            .await
        {
            debug!(url = %key.url(), "Serving cached response while revalidating");
            return cached;
        }

        match revalidation.await {
            Ok(Some(fresh)) => EngineResponse::network(fresh),
            Ok(None) => EngineResponse::offline(OfflineFlavor::Json),
            Err(err) => {
                warn!(url = %key.url(), error = %err, "Revalidation task failed");
                EngineResponse::offline(OfflineFlavor::Json)
            }
        }
    }

    /// Detached fetch whose only side effect is the runtime-region write.
    ///
    /// Dropping the returned handle does not cancel the task.
    fn spawn_revalidation(
        &self,
        request: &InterceptedRequest,
        profile: &GenerationProfile,
        key: RequestKey,
    ) -> JoinHandle<Option<Snapshot>> {
        let ctx = Arc::clone(&self.ctx);
        let outbound = OutboundRequest::from_intercepted(request);
        let abort = request.abort.clone();
        let generation = profile.generation.clone();

        tokio::spawn(async move {
            match ctx.network().send(outbound).await {
                Ok(fresh) => {
                    ctx.store_runtime(&generation, &key, &fresh, &abort).await;
                    Some(fresh)
                }
                Err(err) => {
                    record_network_failure(&err, Strategy::StaleWhileRevalidate);
                    None
                }
            }
        })
    }
}

fn record_network_failure(err: &NetworkError, strategy: Strategy) {
    counter!(
        "sideline_network_failure_total",
        "kind" => err.kind(),
        "strategy" => strategy.as_str()
    )
    .increment(1);
    warn!(
        error = %err,
        strategy = strategy.as_str(),
        "Network fetch failed; falling back"
    );
}
