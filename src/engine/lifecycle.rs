//! Lifecycle Coordinator.
//!
//! Each generation runs its own small state machine:
//!
//! ```text
//! installing -> waiting -> activating -> active -> superseded
//!                  \______________________________/
//! ```
//!
//! Slots never refer to each other; the registry records which generation is
//! active and which is waiting, and generations communicate only through the
//! cache store and the notice channel. The registry lock is never held across
//! an await point.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use sideline_protocol::{AckOutcome, ClientMessage, EngineStatus, MessageAck, RegionStatus, ServerMessage};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::context::EngineContext;
use super::definition::{DefinitionError, DefinitionSource, GenerationDefinition, GenerationProfile};
use crate::cache::lock::mutex_lock;
use crate::cache::{Generation, RegionKind, RegionName, RequestKey, StoreError};
use crate::infra::network::{NetworkError, OutboundRequest};

const LOCK_TARGET: &str = "engine::lifecycle";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("install of `{generation}` failed: none of {attempted} core assets could be fetched")]
    PrecacheFailed {
        generation: Generation,
        attempted: usize,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("no generation definition source is configured")]
    NoDefinitionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Installing,
    Waiting,
    Activating,
    Active,
    Superseded,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Installing => "installing",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Superseded => "superseded",
        }
    }

    fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Installing, Waiting)
                | (Waiting, Activating)
                | (Waiting, Superseded)
                | (Activating, Active)
                | (Active, Superseded)
        )
    }
}

#[derive(Debug)]
struct GenerationSlot {
    definition: Arc<GenerationDefinition>,
    profile: Arc<GenerationProfile>,
    state: LifecycleState,
}

impl GenerationSlot {
    fn installing(definition: &GenerationDefinition) -> Self {
        Self {
            definition: Arc::new(definition.clone()),
            profile: Arc::new(definition.profile()),
            state: LifecycleState::Installing,
        }
    }

    /// A generation that was already active when the store was last used.
    fn restored(definition: GenerationDefinition) -> Self {
        Self {
            profile: Arc::new(definition.profile()),
            definition: Arc::new(definition),
            state: LifecycleState::Active,
        }
    }

    fn generation(&self) -> &Generation {
        &self.profile.generation
    }

    fn advance(&mut self, next: LifecycleState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal lifecycle transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        debug!(
            generation = %self.profile.generation,
            from = self.state.as_str(),
            to = next.as_str(),
            "Lifecycle transition"
        );
        self.state = next;
    }
}

/// What the store keeps about the lifecycle between runs.
#[derive(Debug, Serialize, Deserialize)]
struct LifecycleRecord {
    active: GenerationDefinition,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: Option<GenerationSlot>,
    waiting: Option<GenerationSlot>,
    installing: HashSet<Generation>,
    /// Open pages and the generation controlling each one.
    clients: HashMap<Uuid, Option<Generation>>,
    pending_update: bool,
}

impl RegistryState {
    fn active_generation(&self) -> Option<Generation> {
        self.active.as_ref().map(|slot| slot.generation().clone())
    }

    fn waiting_generation(&self) -> Option<Generation> {
        self.waiting.as_ref().map(|slot| slot.generation().clone())
    }

    fn state_of(&self, generation: &Generation) -> Option<LifecycleState> {
        [self.active.as_ref(), self.waiting.as_ref()]
            .into_iter()
            .flatten()
            .find(|slot| slot.generation() == generation)
            .map(|slot| slot.state)
            .or_else(|| {
                self.installing
                    .contains(generation)
                    .then_some(LifecycleState::Installing)
            })
    }

    fn active_has_clients(&self) -> bool {
        let Some(active) = self.active.as_ref().map(GenerationSlot::generation) else {
            return false;
        };
        self.clients
            .values()
            .any(|controller| controller.as_ref() == Some(active))
    }

    fn protected_generations(&self) -> HashSet<String> {
        self.active
            .iter()
            .chain(self.waiting.iter())
            .map(|slot| slot.generation().as_str().to_string())
            .chain(self.installing.iter().map(|g| g.as_str().to_string()))
            .collect()
    }
}

/// Which generation is active, which is waiting, and who is watching.
#[derive(Debug, Default)]
pub struct GenerationRegistry {
    state: Mutex<RegistryState>,
}

impl GenerationRegistry {
    fn lock(&self, op: &'static str) -> MutexGuard<'_, RegistryState> {
        mutex_lock(&self.state, LOCK_TARGET, op)
    }

    pub fn active_profile(&self) -> Option<Arc<GenerationProfile>> {
        self.lock("active_profile")
            .active
            .as_ref()
            .map(|slot| Arc::clone(&slot.profile))
    }

    pub fn active_generation(&self) -> Option<Generation> {
        self.lock("active_generation").active_generation()
    }

    pub fn waiting_generation(&self) -> Option<Generation> {
        self.lock("waiting_generation").waiting_generation()
    }

    pub fn is_active(&self, generation: &Generation) -> bool {
        self.lock("is_active")
            .active
            .as_ref()
            .is_some_and(|slot| slot.generation() == generation)
    }

    pub fn state_of(&self, generation: &Generation) -> Option<LifecycleState> {
        self.lock("state_of").state_of(generation)
    }

    /// True while a waiting generation exists.
    pub fn pending_update(&self) -> bool {
        self.lock("pending_update").pending_update
    }

    pub fn client_count(&self) -> usize {
        self.lock("client_count").clients.len()
    }
}

/// Result of a completed install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub generation: Generation,
    pub cached: Vec<RequestKey>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The generation was already known; nothing was fetched.
    Unchanged {
        generation: Generation,
        state: LifecycleState,
    },
    Waiting(InstallReport),
    Activated {
        install: InstallReport,
        activation: ActivationReport,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    /// Generation promoted by this activation, if any.
    pub promoted: Option<Generation>,
    /// Generation that was active before the promotion.
    pub previous: Option<Generation>,
    pub active: Option<Generation>,
    pub forced: bool,
    /// Regions removed by the prune that follows every activation.
    pub deleted: Vec<RegionName>,
}

/// An open page attached to the notice channel.
pub struct ClientAttachment {
    pub id: Uuid,
    pub notices: broadcast::Receiver<ServerMessage>,
    /// Notice the page missed because it attached after it was sent.
    pub replay: Option<ServerMessage>,
}

#[derive(Debug, Error)]
enum PrecacheSkip {
    #[error("`{0}` does not resolve against the upstream origin")]
    InvalidUrl(String),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("upstream answered with status {0}")]
    Status(u16),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Coordinator {
    ctx: Arc<EngineContext>,
    source: Option<Arc<dyn DefinitionSource>>,
}

impl Coordinator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx, source: None }
    }

    pub fn with_source(mut self, source: Arc<dyn DefinitionSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, RegistryState> {
        self.ctx.registry().lock(op)
    }

    /// Install `definition`: precache its assets, then either activate it or
    /// leave it waiting behind the active generation.
    ///
    /// A failed install leaves the active generation untouched.
    #[instrument(skip_all, fields(generation = %definition.generation))]
    pub async fn install(
        &self,
        definition: &GenerationDefinition,
    ) -> Result<InstallOutcome, LifecycleError> {
        definition.validate()?;
        let generation = definition.generation.clone();

        {
            let mut state = self.lock("install.begin");
            if let Some(current) = state.state_of(&generation) {
                debug!(state = current.as_str(), "Generation already known");
                return Ok(InstallOutcome::Unchanged {
                    generation,
                    state: current,
                });
            }
            state.installing.insert(generation.clone());
        }

        info!("Installing generation");
        let precache_region = RegionName::precache(&generation);
        let preexisting = match self.ctx.store().list_regions().await {
            Ok(regions) => regions.contains(&precache_region),
            Err(err) => {
                warn!(error = %err, "Failed to list cache regions before install");
                true
            }
        };

        let mut slot = GenerationSlot::installing(definition);
        let (report, core_cached) = match self.precache(definition).await {
            Ok(precached) => precached,
            Err(err) => {
                self.lock("install.abort").installing.remove(&generation);
                return Err(err);
            }
        };

        let attempted = definition.assets.len();
        if attempted > 0 && core_cached == 0 {
            self.discard_failed_install(&generation, preexisting).await;
            return Err(LifecycleError::PrecacheFailed {
                generation,
                attempted,
            });
        }

        slot.advance(LifecycleState::Waiting);
        let (superseded, activate_now) = {
            let mut state = self.lock("install.finish");
            state.installing.remove(&generation);
            let superseded = state.waiting.replace(slot).map(|mut old| {
                old.advance(LifecycleState::Superseded);
                old.generation().clone()
            });
            let activate_now =
                state.active.is_none() || definition.skip_waiting || !state.active_has_clients();
            if !activate_now {
                state.pending_update = true;
            }
            (superseded, activate_now)
        };

        if let Some(old) = superseded {
            info!(superseded = %old, "Waiting generation replaced before promotion");
            self.delete_generation(&old).await;
        }

        if activate_now {
            let activation = self.activate_waiting(definition.skip_waiting).await;
            return Ok(InstallOutcome::Activated {
                install: report,
                activation,
            });
        }

        info!(
            cached = report.cached.len(),
            skipped = report.skipped.len(),
            "Generation installed and waiting"
        );
        self.ctx.notify(ServerMessage::UpdateReady {
            generation: generation.to_string(),
        });
        Ok(InstallOutcome::Waiting(report))
    }

    /// Populate the precache region. Also returns how many core assets made it.
    async fn precache(
        &self,
        definition: &GenerationDefinition,
    ) -> Result<(InstallReport, usize), LifecycleError> {
        let region = RegionName::precache(&definition.generation);
        self.ctx.store().open(&region).await?;

        let entries = definition.precache_entries();
        let results = join_all(
            entries
                .iter()
                .map(|entry| self.precache_one(&region, &entry.url)),
        )
        .await;

        let mut report = InstallReport {
            generation: definition.generation.clone(),
            cached: Vec::new(),
            skipped: Vec::new(),
        };
        let mut core_cached = 0;
        for (entry, result) in entries.into_iter().zip(results) {
            match result {
                Ok(key) => {
                    core_cached += usize::from(entry.core);
                    report.cached.push(key);
                }
                Err(reason) => {
                    counter!("sideline_precache_asset_failed_total").increment(1);
                    warn!(
                        url = %entry.url,
                        core = entry.core,
                        reason = %reason,
                        "Skipping precache asset"
                    );
                    report.skipped.push(entry.url);
                }
            }
        }

        Ok((report, core_cached))
    }

    async fn precache_one(
        &self,
        region: &RegionName,
        reference: &str,
    ) -> Result<RequestKey, PrecacheSkip> {
        let url = self
            .ctx
            .resolve(reference)
            .ok_or_else(|| PrecacheSkip::InvalidUrl(reference.to_string()))?;
        let key = RequestKey::from_url(&url);
        let snapshot = self
            .ctx
            .network()
            .send(OutboundRequest::get(url).bypassing_caches())
            .await?;
        if !snapshot.is_success() || snapshot.is_partial() {
            return Err(PrecacheSkip::Status(snapshot.status));
        }
        self.ctx.store().put(region, &key, snapshot).await?;
        Ok(key)
    }

    /// A precache region that existed before the install began belongs to an
    /// earlier run and is kept.
    async fn discard_failed_install(&self, generation: &Generation, preexisting: bool) {
        warn!(generation = %generation, "No core asset could be precached; install failed");
        if preexisting {
            info!(generation = %generation, "Keeping precache region from an earlier run");
        } else if let Err(err) = self
            .ctx
            .store()
            .delete_region(&RegionName::precache(generation))
            .await
        {
            warn!(generation = %generation, error = %err, "Failed to discard partial precache");
        }
        self.lock("install.fail").installing.remove(generation);
    }

    /// Promote the waiting generation, if any, then prune.
    ///
    /// Safe to call repeatedly: with nothing waiting it only re-runs the prune,
    /// which finds nothing left to delete.
    pub async fn activate(&self) -> ActivationReport {
        self.activate_waiting(false).await
    }

    /// Handle `PROMOTE_NOW`: promote immediately and claim every open page.
    pub async fn promote_now(&self) -> ActivationReport {
        self.activate_waiting(true).await
    }

    async fn activate_waiting(&self, forced: bool) -> ActivationReport {
        let promotion = {
            let mut state = self.lock("activate");
            match state.waiting.take() {
                Some(mut next) => {
                    next.advance(LifecycleState::Activating);
                    let previous = state.active.take().map(|mut old| {
                        old.advance(LifecycleState::Superseded);
                        old.generation().clone()
                    });
                    next.advance(LifecycleState::Active);
                    let generation = next.generation().clone();
                    let definition = Arc::clone(&next.definition);
                    state.active = Some(next);
                    state.pending_update = false;
                    for controller in state.clients.values_mut() {
                        *controller = Some(generation.clone());
                    }
                    Some((generation, definition, previous))
                }
                None => None,
            }
        };

        let (promoted, previous) = match promotion {
            Some((generation, definition, previous)) => {
                info!(
                    generation = %generation,
                    previous = previous.as_ref().map(Generation::as_str),
                    forced,
                    "Generation activated"
                );
                self.ctx.notify(ServerMessage::Activated {
                    generation: generation.to_string(),
                    forced,
                });
                self.persist_active(&definition).await;
                (Some(generation), previous)
            }
            None => {
                debug!(forced, "Activation requested with nothing waiting");
                (None, None)
            }
        };

        let deleted = self.prune().await;
        ActivationReport {
            promoted,
            previous,
            active: self.ctx.registry().active_generation(),
            forced,
            deleted,
        }
    }

    async fn persist_active(&self, definition: &GenerationDefinition) {
        let record = LifecycleRecord {
            active: definition.clone(),
        };
        let saved = match serde_json::to_vec(&record) {
            Ok(payload) => self.ctx.store().save_record(Bytes::from(payload)).await,
            Err(err) => Err(StoreError::from(err)),
        };
        if let Err(err) = saved {
            warn!(
                generation = %definition.generation,
                error = %err,
                "Failed to record active generation"
            );
        }
    }

    /// Adopt the generation the store recorded as active, without fetching
    /// anything. Does nothing when a generation is already active or the
    /// recorded generation's precache region is gone.
    pub async fn restore(&self) -> Result<Option<Generation>, LifecycleError> {
        let Some(raw) = self.ctx.store().load_record().await? else {
            return Ok(None);
        };
        let record: LifecycleRecord =
            serde_json::from_slice(&raw).map_err(DefinitionError::from)?;
        record.active.validate()?;

        let generation = record.active.generation.clone();
        let region = RegionName::precache(&generation);
        if !self.ctx.store().list_regions().await?.contains(&region) {
            warn!(generation = %generation, "Recorded generation has no precache region");
            return Ok(None);
        }

        {
            let mut state = self.lock("restore");
            if state.active.is_some() {
                debug!(generation = %generation, "A generation is already active; not restoring");
                return Ok(None);
            }
            state.active = Some(GenerationSlot::restored(record.active));
            for controller in state.clients.values_mut() {
                *controller = Some(generation.clone());
            }
        }

        info!(generation = %generation, "Restored active generation");
        Ok(Some(generation))
    }

    /// Delete every region that does not belong to the active generation.
    ///
    /// Regions of a generation that is still installing or waiting are
    /// spared. Best effort: failures are logged and retried on the next
    /// activation.
    async fn prune(&self) -> Vec<RegionName> {
        let protected = {
            let state = self.lock("prune");
            if state.active.is_none() {
                return Vec::new();
            }
            state.protected_generations()
        };

        let regions = match self.ctx.store().list_regions().await {
            Ok(regions) => regions,
            Err(err) => {
                warn!(error = %err, "Failed to list cache regions; skipping prune");
                return Vec::new();
            }
        };

        let mut deleted = Vec::new();
        for region in regions {
            if region
                .generation()
                .is_some_and(|generation| protected.contains(generation))
            {
                continue;
            }
            match self.ctx.store().delete_region(&region).await {
                Ok(true) => {
                    info!(region = %region, "Deleted stale cache region");
                    deleted.push(region);
                }
                Ok(false) => {}
                Err(err) => warn!(region = %region, error = %err, "Failed to delete cache region"),
            }
        }
        deleted
    }

    async fn delete_generation(&self, generation: &Generation) {
        for kind in [RegionKind::Precache, RegionKind::Runtime] {
            let region = RegionName::for_kind(kind, generation);
            if let Err(err) = self.ctx.store().delete_region(&region).await {
                warn!(region = %region, error = %err, "Failed to delete cache region");
            }
        }
    }

    /// Re-read the definition source and install it if it names a new
    /// generation.
    pub async fn check_for_update(&self) -> Result<InstallOutcome, LifecycleError> {
        let source = self
            .source
            .as_ref()
            .ok_or(LifecycleError::NoDefinitionSource)?;
        let definition = source.load().await?;
        self.install(&definition).await
    }

    /// Attach an open page to the notice channel. The page is controlled by
    /// the generation active at attach time.
    pub fn attach_client(&self) -> ClientAttachment {
        let id = Uuid::new_v4();
        let notices = self.ctx.subscribe();
        let (count, replay) = {
            let mut state = self.lock("attach_client");
            let controller = state.active_generation();
            state.clients.insert(id, controller);
            let replay = state
                .pending_update
                .then(|| state.waiting_generation())
                .flatten()
                .map(|generation| ServerMessage::UpdateReady {
                    generation: generation.to_string(),
                });
            (state.clients.len(), replay)
        };
        gauge!("sideline_channel_clients").set(count as f64);
        debug!(client = %id, "Client attached");
        ClientAttachment {
            id,
            notices,
            replay,
        }
    }

    /// Detach a page. When it was the last page of the active generation and
    /// a generation is waiting, the waiting generation is promoted.
    pub async fn detach_client(&self, id: Uuid) -> Option<ActivationReport> {
        let (count, promote) = {
            let mut state = self.lock("detach_client");
            state.clients.remove(&id);
            let promote = state.waiting.is_some() && !state.active_has_clients();
            (state.clients.len(), promote)
        };
        gauge!("sideline_channel_clients").set(count as f64);
        debug!(client = %id, "Client detached");

        if promote {
            info!("Last page of the active generation closed; promoting waiting generation");
            Some(self.activate_waiting(false).await)
        } else {
            None
        }
    }

    pub async fn handle_message(&self, message: ClientMessage) -> MessageAck {
        let id = Uuid::new_v4();
        let outcome = match message {
            ClientMessage::PromoteNow => {
                let report = self.promote_now().await;
                if report.promoted.is_some() {
                    AckOutcome::Promoted
                } else {
                    AckOutcome::NothingWaiting
                }
            }
            ClientMessage::CheckForUpdate => match self.check_for_update().await {
                Ok(InstallOutcome::Unchanged { .. }) => AckOutcome::UpToDate,
                Ok(InstallOutcome::Waiting(_) | InstallOutcome::Activated { .. }) => {
                    AckOutcome::Installed
                }
                Err(err) => {
                    warn!(message = %id, error = %err, "Update check failed");
                    AckOutcome::InstallFailed
                }
            },
        };

        let state = self.lock("handle_message");
        MessageAck {
            id,
            outcome,
            active: state.active_generation().map(|g| g.to_string()),
            waiting: state.waiting_generation().map(|g| g.to_string()),
        }
    }

    pub async fn status(&self) -> EngineStatus {
        let (active, waiting, pending_update, clients) = {
            let state = self.lock("status");
            (
                state.active_generation().map(|g| g.to_string()),
                state.waiting_generation().map(|g| g.to_string()),
                state.pending_update,
                state.clients.len(),
            )
        };

        let store = self.ctx.store();
        let mut regions = Vec::new();
        match store.list_regions().await {
            Ok(names) => {
                for name in names {
                    let entries = match store.keys(&name).await {
                        Ok(keys) => keys.len(),
                        Err(err) => {
                            warn!(region = %name, error = %err, "Failed to count region entries");
                            0
                        }
                    };
                    regions.push(RegionStatus {
                        name: name.to_string(),
                        entries,
                    });
                }
            }
            Err(err) => warn!(error = %err, "Failed to list cache regions"),
        }

        EngineStatus {
            active,
            waiting,
            pending_update,
            clients,
            regions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions_follow_the_lifecycle() {
        use LifecycleState::*;
        assert!(Installing.can_advance_to(Waiting));
        assert!(Waiting.can_advance_to(Activating));
        assert!(Activating.can_advance_to(Active));
        assert!(Active.can_advance_to(Superseded));
        assert!(Waiting.can_advance_to(Superseded));

        assert!(!Installing.can_advance_to(Active));
        assert!(!Active.can_advance_to(Waiting));
        assert!(!Superseded.can_advance_to(Active));
    }

    #[test]
    fn registry_state_reports_known_generations() {
        let mut state = RegistryState::default();
        let v1 = GenerationDefinition::new("v1");
        let mut slot = GenerationSlot::installing(&v1);
        slot.advance(LifecycleState::Waiting);
        state.waiting = Some(slot);
        state.installing.insert(Generation::new("v2"));

        assert_eq!(
            state.state_of(&Generation::new("v1")),
            Some(LifecycleState::Waiting)
        );
        assert_eq!(
            state.state_of(&Generation::new("v2")),
            Some(LifecycleState::Installing)
        );
        assert_eq!(state.state_of(&Generation::new("v3")), None);
    }

    #[test]
    fn active_without_clients_is_unheld() {
        let mut state = RegistryState::default();
        let mut slot = GenerationSlot::installing(&GenerationDefinition::new("v1"));
        slot.advance(LifecycleState::Waiting);
        slot.advance(LifecycleState::Activating);
        slot.advance(LifecycleState::Active);
        state.active = Some(slot);
        assert!(!state.active_has_clients());

        state.clients.insert(Uuid::new_v4(), None);
        assert!(!state.active_has_clients());

        state
            .clients
            .insert(Uuid::new_v4(), Some(Generation::new("v1")));
        assert!(state.active_has_clients());
    }
}
