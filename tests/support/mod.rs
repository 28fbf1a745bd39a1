#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sideline::cache::{CacheStore, MemoryStore, Snapshot};
use sideline::engine::{Coordinator, Dispatcher, EngineContext, GenerationDefinition};
use sideline::infra::network::{Network, NetworkError, OutboundRequest};
use tokio::sync::Notify;
use url::Url;

pub const ORIGIN: &str = "http://dash.test/";

pub fn origin() -> Url {
    Url::parse(ORIGIN).expect("origin")
}

pub fn url(path: &str) -> Url {
    origin().join(path).expect("path joins onto origin")
}

pub fn ok(content_type: &str, body: &str) -> Snapshot {
    Snapshot::new(
        200,
        vec![("content-type".to_string(), content_type.to_string())],
        body.to_string(),
    )
}

enum Reply {
    Respond(Snapshot),
    Fail,
    Hold(Arc<Notify>, Snapshot),
}

/// Network double answering from a script keyed by URL. Unscripted URLs get
/// a 404.
#[derive(Default)]
pub struct ScriptedNetwork {
    script: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<OutboundRequest>>,
    offline: AtomicBool,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, path: &str, snapshot: Snapshot) {
        self.set(path, Reply::Respond(snapshot));
    }

    pub fn fail(&self, path: &str) {
        self.set(path, Reply::Fail);
    }

    /// Reply only once the returned handle is notified.
    pub fn hold(&self, path: &str, snapshot: Snapshot) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.set(path, Reply::Hold(Arc::clone(&gate), snapshot));
        gate
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        let target = url(path);
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|request| request.url == target)
            .count()
    }

    pub fn recorded(&self) -> Vec<OutboundRequest> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn set(&self, path: &str, reply: Reply) {
        self.script
            .lock()
            .expect("script lock")
            .insert(url(path).to_string(), reply);
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn send(&self, request: OutboundRequest) -> Result<Snapshot, NetworkError> {
        let target = request.url.clone();
        self.calls.lock().expect("calls lock").push(request);

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::connect(&target, "network unreachable"));
        }

        let (gate, snapshot) = {
            let script = self.script.lock().expect("script lock");
            match script.get(target.as_str()) {
                Some(Reply::Respond(snapshot)) => (None, snapshot.clone()),
                Some(Reply::Fail) => {
                    return Err(NetworkError::connect(&target, "connection refused"));
                }
                Some(Reply::Hold(gate, snapshot)) => (Some(Arc::clone(gate)), snapshot.clone()),
                None => (None, Snapshot::new(404, Vec::new(), "not found")),
            }
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(snapshot)
    }
}

pub struct Harness {
    pub network: Arc<ScriptedNetwork>,
    pub ctx: Arc<EngineContext>,
    pub coordinator: Coordinator,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn CacheStore>) -> Self {
        let network = ScriptedNetwork::new();
        let ctx = EngineContext::new(store, network.clone(), origin());
        Self {
            coordinator: Coordinator::new(Arc::clone(&ctx)),
            dispatcher: Dispatcher::new(Arc::clone(&ctx)),
            network,
            ctx,
        }
    }

    pub fn store(&self) -> &dyn CacheStore {
        self.ctx.store()
    }

    /// Install and activate `definition`, scripting a 200 for every asset.
    pub async fn activate(&self, definition: &GenerationDefinition) {
        for asset in definition.assets.iter().chain(&definition.optional_assets) {
            self.network
                .respond(asset, ok("text/html", &format!("{asset} @ {}", definition.generation)));
        }
        self.coordinator
            .install(definition)
            .await
            .expect("install succeeds");
        assert_eq!(
            self.ctx.registry().active_generation().as_ref(),
            Some(&definition.generation)
        );
    }
}
