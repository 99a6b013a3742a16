use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    // Logs go to stderr so `render` can write artifacts to stdout.
    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "mathgate_cache_hit_total",
            Unit::Count,
            "Cache hits, labelled by cache (artifact, mathml, response)."
        );
        describe_counter!(
            "mathgate_cache_miss_total",
            Unit::Count,
            "Cache misses, labelled by cache."
        );
        describe_counter!(
            "mathgate_cache_evict_total",
            Unit::Count,
            "Cache evictions due to entry or byte bounds."
        );
        describe_counter!(
            "mathgate_cache_expire_total",
            Unit::Count,
            "Cache entries dropped after their time-to-live."
        );
        describe_counter!(
            "mathgate_engine_initializations_total",
            Unit::Count,
            "Engine initializations and reinitializations."
        );
        describe_histogram!(
            "mathgate_render_ms",
            Unit::Milliseconds,
            "End-to-end render latency by format and result."
        );
        describe_histogram!(
            "mathgate_stage_ms",
            Unit::Milliseconds,
            "Latency of the engine, raster and speech stages."
        );
        describe_counter!(
            "mathgate_fallback_total",
            Unit::Count,
            "Fallback artifacts served, by error kind and format."
        );
    });
}
