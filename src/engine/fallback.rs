//! Offline Fallback Resolver.
//!
//! Used only once the network and the applicable cache lookups have failed.
//! The chain is fixed: cached root document of the active generation, then
//! the designated offline documents in order, then a synthesized response.

use metrics::counter;
use tracing::{debug, warn};

use super::context::EngineContext;
use super::definition::GenerationProfile;
use super::response::{EngineResponse, OfflineFlavor, ResponseSource};
use crate::cache::{RegionKind, RequestKey};

const ROOT_PATH: &str = "/";

const LOOKUP_ORDER: [RegionKind; 2] = [RegionKind::Precache, RegionKind::Runtime];

pub struct FallbackResolver<'a> {
    ctx: &'a EngineContext,
    profile: &'a GenerationProfile,
}

impl<'a> FallbackResolver<'a> {
    pub fn new(ctx: &'a EngineContext, profile: &'a GenerationProfile) -> Self {
        Self { ctx, profile }
    }

    /// Cached root document of the active generation, if any.
    pub async fn cached_root(&self) -> Option<EngineResponse> {
        let root = self.ctx.resolve(ROOT_PATH)?;
        self.ctx
            .lookup_in(
                &self.profile.generation,
                &RequestKey::from_url(&root),
                &LOOKUP_ORDER,
            )
            .await
    }

    /// Never fails: the last step always produces a response.
    pub async fn resolve(&self, flavor: OfflineFlavor) -> EngineResponse {
        if let Some(root) = self.cached_root().await {
            counter!("sideline_fallback_total", "step" => "root").increment(1);
            debug!(generation = %self.profile.generation, "Serving cached root as fallback");
            return root;
        }

        for document in &self.profile.offline_documents {
            let Some(url) = self.ctx.resolve(document) else {
                warn!(document = %document, "Offline document is not a valid URL");
                continue;
            };
            let key = RequestKey::from_url(&url);
            if let Some(found) = self
                .ctx
                .lookup_in(&self.profile.generation, &key, &LOOKUP_ORDER)
                .await
            {
                counter!("sideline_fallback_total", "step" => "offline_document").increment(1);
                debug!(document = %document, "Serving offline document");
                return EngineResponse::new(found.snapshot, ResponseSource::OfflineDocument);
            }
        }

        counter!("sideline_fallback_total", "step" => "synthesized").increment(1);
        debug!(generation = %self.profile.generation, "Synthesizing offline response");
        EngineResponse::offline(flavor)
    }
}
