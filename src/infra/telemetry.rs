use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Registry, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Client-library targets that log every upstream connection at `info`.
const QUIET_TARGETS: [&str; 3] = ["hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Install the global subscriber: the configured level for sideline, quieter
/// defaults for the HTTP client stack, and `RUST_LOG` on top of both.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    tracing_subscriber::registry()
        .with(fmt_layer(logging.format))
        .with(env_filter(logging)?)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn env_filter(logging: &LoggingSettings) -> Result<EnvFilter, InfraError> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    for target in QUIET_TARGETS {
        let directive = target.parse().map_err(|err| {
            InfraError::telemetry(format!("invalid log directive `{target}`: {err}"))
        })?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn fmt_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    }
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "sideline_cache_hit_total",
            Unit::Count,
            "Cache lookups answered from a region, labelled by region kind."
        );
        describe_counter!(
            "sideline_cache_miss_total",
            Unit::Count,
            "Cache lookups that found nothing, including unreadable entries."
        );
        describe_counter!(
            "sideline_network_failure_total",
            Unit::Count,
            "Network fetches that failed, labelled by error kind and strategy."
        );
        describe_counter!(
            "sideline_fallback_total",
            Unit::Count,
            "Responses produced by the offline fallback chain, labelled by step."
        );
        describe_counter!(
            "sideline_cache_write_error_total",
            Unit::Count,
            "Opportunistic cache writes that failed and were dropped."
        );
        describe_counter!(
            "sideline_precache_asset_failed_total",
            Unit::Count,
            "Precache assets skipped during installation."
        );
        describe_histogram!(
            "sideline_response_ms",
            Unit::Milliseconds,
            "Time to produce response headers, labelled by where the response came from."
        );
        describe_gauge!(
            "sideline_channel_clients",
            Unit::Count,
            "Pages currently attached to the notice channel."
        );
    });
}
