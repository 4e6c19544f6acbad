use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{
    BuildError as PrometheusBuildError, PrometheusBuilder, PrometheusHandle,
};
use std::{
    fmt,
    sync::{Mutex, OnceLock},
    time::Instant,
};
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use shopfront_util::{AppConfig, Environment};

#[derive(Debug)]
pub enum TelemetryError {
    Tracing(tracing_subscriber::util::TryInitError),
    Metrics(PrometheusBuildError),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracing(err) => write!(f, "tracing subscriber setup failed: {err}"),
            Self::Metrics(err) => write!(f, "prometheus recorder setup failed: {err}"),
        }
    }
}

impl std::error::Error for TelemetryError {}

static TRACING_READY: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_INSTALL_GUARD: Mutex<()> = Mutex::new(());
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global tracing subscriber. Development and test use the
/// pretty human format; production emits one JSON object per line.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_READY.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_timer(UtcTime::rfc_3339());
    let registry = tracing_subscriber::registry().with(env_filter);

    let init_result = match config.environment {
        Environment::Production => registry.with(base.json()).try_init(),
        Environment::Development | Environment::Test => registry
            .with(base.event_format(tracing_fmt::format().pretty()))
            .try_init(),
    };
    init_result.map_err(TelemetryError::Tracing)?;

    TRACING_READY.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        env = config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the process-wide Prometheus recorder and registers metric
/// descriptions. Safe to call from every test; only the first caller
/// installs.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let _guard = METRICS_INSTALL_GUARD
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(TelemetryError::Metrics)?;
    METRICS_HANDLE.set(handle.clone()).ok();

    describe_counter!(
        "webhook_ingress_total",
        "Count of webhook deliveries that passed signature verification, labelled by event type"
    );
    describe_counter!(
        "webhook_invalid_signature_total",
        "Count of webhook deliveries rejected due to a missing or invalid signature"
    );
    describe_counter!(
        "webhook_duplicate_total",
        "Count of webhook redeliveries short-circuited by the idempotency ledger, labelled by event type"
    );
    describe_counter!(
        "order_transitions_total",
        "Count of order state machine evaluations, labelled by result"
    );
    describe_histogram!(
        "webhook_ack_latency_seconds",
        "Latency in seconds to acknowledge webhook deliveries"
    );
    describe_counter!(
        "db_ttl_deleted_total",
        "Count of rows deleted by TTL sweeps, labelled by table"
    );
    describe_histogram!(
        "db_checkpoint_seconds",
        "Duration of WAL checkpoint operations in seconds"
    );
    describe_counter!(
        "db_busy_total",
        "Number of SQLite busy conditions encountered by maintenance tasks, labelled by operation"
    );

    START_TIME.get_or_init(Instant::now);
    Ok(handle)
}

/// Renders the Prometheus exposition body, appending build and uptime
/// gauges the recorder does not track itself.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();

    body.push_str(&format!(
        "# TYPE app_build_info gauge\n\
         app_build_info{{version=\"{}\",git=\"{}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\n\
         app_uptime_seconds {uptime}\n",
        BUILD_VERSION,
        build_git_sha()
    ));

    body
}
