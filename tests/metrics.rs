mod support;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::{body::Body, http::Request};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serial_test::serial;
use sideline::cache::{
    CacheStore, MemoryStore, RegionKind, RegionName, RequestKey, Snapshot, StoreError,
};
use sideline::engine::{GenerationDefinition, InterceptedRequest, ResponseSource};
use sideline::infra::http::{HttpState, build_router};
use sideline::infra::telemetry::describe_metrics;
use support::{Harness, ok, url};
use tower::ServiceExt;

static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();

fn snapshotter() -> &'static Snapshotter {
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        describe_metrics();
        snapshotter
    })
}

fn counter(name: &str, labels: &[(&str, &str)]) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(composite_key, _, _, value)| {
            let key = composite_key.key();
            let labelled = labels.iter().all(|(k, v)| {
                key.labels()
                    .any(|label| label.key() == *k && label.value() == *v)
            });
            match value {
                DebugValue::Counter(count) if key.name() == name && labelled => Some(count),
                _ => None,
            }
        })
        .sum()
}

fn gauge(name: &str) -> Option<f64> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(composite_key, _, _, value)| match value {
            DebugValue::Gauge(level) if composite_key.key().name() == name => Some(level.0),
            _ => None,
        })
}

/// Samples per label value of one histogram. Snapshots drain histograms, so
/// each call sees only what was recorded since the previous one.
fn histogram_samples_by(name: &str, label: &str) -> HashMap<String, usize> {
    let mut samples = HashMap::new();
    for (composite_key, _, _, value) in snapshotter().snapshot().into_vec() {
        let key = composite_key.key();
        let DebugValue::Histogram(recorded) = value else {
            continue;
        };
        if key.name() != name {
            continue;
        }
        if let Some(value) = key.labels().find(|l| l.key() == label) {
            *samples.entry(value.value().to_string()).or_default() += recorded.len();
        }
    }
    samples
}

/// Memory store whose runtime regions reject writes.
struct FullRuntimeStore(MemoryStore);

#[async_trait]
impl CacheStore for FullRuntimeStore {
    async fn open(&self, region: &RegionName) -> Result<(), StoreError> {
        self.0.open(region).await
    }

    async fn match_entry(
        &self,
        region: &RegionName,
        key: &RequestKey,
    ) -> Result<Option<Snapshot>, StoreError> {
        self.0.match_entry(region, key).await
    }

    async fn put(
        &self,
        region: &RegionName,
        key: &RequestKey,
        snapshot: Snapshot,
    ) -> Result<(), StoreError> {
        if region.kind() == Some(RegionKind::Runtime) {
            return Err(StoreError::Io(std::io::Error::other("quota exceeded")));
        }
        self.0.put(region, key, snapshot).await
    }

    async fn delete_region(&self, region: &RegionName) -> Result<bool, StoreError> {
        self.0.delete_region(region).await
    }

    async fn list_regions(&self) -> Result<Vec<RegionName>, StoreError> {
        self.0.list_regions().await
    }

    async fn keys(&self, region: &RegionName) -> Result<Vec<RequestKey>, StoreError> {
        self.0.keys(region).await
    }
}

#[tokio::test]
#[serial]
async fn offline_fallback_emits_lookup_failure_and_fallback_counters() {
    snapshotter();
    let harness = Harness::new();
    harness
        .activate(&GenerationDefinition::new("A").with_assets(["/"]))
        .await;
    harness.network.go_offline();

    let misses = counter("sideline_cache_miss_total", &[("region", "runtime")]);
    let hits = counter("sideline_cache_hit_total", &[("region", "precache")]);
    let failures = counter(
        "sideline_network_failure_total",
        &[("kind", "connect"), ("strategy", "cache_first")],
    );
    let fallbacks = counter("sideline_fallback_total", &[("step", "root")]);

    let response = harness
        .dispatcher
        .handle(&InterceptedRequest::get(url("/static/app.css")))
        .await
        .response()
        .expect("responded");
    assert_eq!(response.source, ResponseSource::Precache);

    assert_eq!(
        counter("sideline_cache_miss_total", &[("region", "runtime")]),
        misses + 1
    );
    assert_eq!(
        counter("sideline_cache_hit_total", &[("region", "precache")]),
        hits + 1
    );
    assert_eq!(
        counter(
            "sideline_network_failure_total",
            &[("kind", "connect"), ("strategy", "cache_first")],
        ),
        failures + 1
    );
    assert_eq!(
        counter("sideline_fallback_total", &[("step", "root")]),
        fallbacks + 1
    );
}

#[tokio::test]
#[serial]
async fn swallowed_failures_and_channel_clients_are_recorded() {
    snapshotter();
    let harness = Harness::with_store(Arc::new(FullRuntimeStore(MemoryStore::new())));
    harness.network.respond("/", ok("text/html", "root"));
    harness.network.fail("/system_status_html");

    let skipped = counter("sideline_precache_asset_failed_total", &[]);
    harness
        .coordinator
        .install(
            &GenerationDefinition::new("A")
                .with_assets(["/"])
                .with_optional_assets(["/system_status_html"]),
        )
        .await
        .expect("install");
    assert_eq!(
        counter("sideline_precache_asset_failed_total", &[]),
        skipped + 1
    );

    let write_errors = counter("sideline_cache_write_error_total", &[]);
    harness
        .network
        .respond("/static/app.css", ok("text/css", "body{}"));
    let response = harness
        .dispatcher
        .handle(&InterceptedRequest::get(url("/static/app.css")))
        .await
        .response()
        .expect("responded");
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(
        counter("sideline_cache_write_error_total", &[]),
        write_errors + 1
    );

    let first = harness.coordinator.attach_client();
    let _second = harness.coordinator.attach_client();
    assert_eq!(gauge("sideline_channel_clients"), Some(2.0));
    harness.coordinator.detach_client(first.id).await;
    assert_eq!(gauge("sideline_channel_clients"), Some(1.0));
}

#[tokio::test]
#[serial]
async fn responses_are_timed_by_where_they_came_from() {
    snapshotter();
    let harness = Harness::new();
    harness
        .activate(&GenerationDefinition::new("A").with_assets(["/static/app.css"]))
        .await;
    let router = build_router(HttpState::new(
        harness.dispatcher.clone(),
        harness.coordinator.clone(),
    ));

    histogram_samples_by("sideline_response_ms", "served_from");

    for path in ["/static/app.css", "/__sideline/status"] {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("request");
        router.clone().oneshot(request).await.expect("response");
    }

    let samples = histogram_samples_by("sideline_response_ms", "served_from");
    assert_eq!(samples.get("precache"), Some(&1));
    assert_eq!(samples.get("control"), Some(&1));
}
