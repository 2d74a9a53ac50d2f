use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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
    METRIC_DESCRIPTIONS.call_once(describe_metrics);

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
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

/// Register descriptions for every metric the render pipeline emits with the
/// currently installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        "quire_render_started_total",
        Unit::Count,
        "Total number of accepted render requests."
    );
    describe_counter!(
        "quire_render_rejected_total",
        Unit::Count,
        "Total number of render requests rejected because the subject was locked."
    );
    describe_counter!(
        "quire_render_finished_total",
        Unit::Count,
        "Total number of concluded renders, labelled by final state."
    );
    describe_histogram!(
        "quire_render_duration_ms",
        Unit::Milliseconds,
        "Wall-clock duration of a render from acceptance to conclusion."
    );
    describe_gauge!(
        "quire_render_in_flight",
        Unit::Count,
        "Number of subjects currently holding a render lock."
    );
    describe_counter!(
        "quire_tokens_swept_total",
        Unit::Count,
        "Total number of expired content tokens removed by the sweeper."
    );
}
