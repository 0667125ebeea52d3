//! Tracing setup, metric names and the per-call audit trace.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::guardrails::GuardrailVerdict;
use crate::state_machine::AgentKind;

pub const AUDIT_TARGET: &str = "forja::audit";

pub const AGENT_CALLS_TOTAL: &str = "agent_calls_total";
pub const AGENT_ERRORS_TOTAL: &str = "agent_errors_total";
pub const AGENT_RETRIES_TOTAL: &str = "agent_retries_total";
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "rate_limit_rejections_total";
pub const TOKENS_USED_TOTAL: &str = "tokens_used_total";
pub const QUEUE_DEPTH: &str = "queue_depth";
pub const COST_PER_PROJECT_USD: &str = "cost_per_project_usd";
pub const JOB_DURATION_SECONDS: &str = "job_duration_seconds";
pub const AGENT_LATENCY_SECONDS: &str = "agent_latency_seconds";

pub const AGENT_LATENCY_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];
pub const COST_PER_PROJECT_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];
pub const JOB_DURATION_BUCKETS: &[f64] = &[5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

fn prometheus_builder(port: u16) -> Result<PrometheusBuilder, BuildError> {
    let histograms = [
        (AGENT_LATENCY_SECONDS, AGENT_LATENCY_BUCKETS),
        (COST_PER_PROJECT_USD, COST_PER_PROJECT_BUCKETS),
        (JOB_DURATION_SECONDS, JOB_DURATION_BUCKETS),
    ];
    let mut builder = PrometheusBuilder::new().with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)));
    for (name, buckets) in histograms {
        builder = builder.set_buckets_for_metric(Matcher::Full(name.to_string()), buckets)?;
    }
    Ok(builder)
}

/// Install the global Prometheus recorder and serve `/metrics` on `port`.
///
/// Must be called from inside the tokio runtime, which hosts the listener.
pub fn install_prometheus(port: u16) -> Result<(), BuildError> {
    prometheus_builder(port)?.install()?;
    describe_metrics();
    tracing::info!(port, "prometheus metrics at /metrics");
    Ok(())
}

/// Register descriptions with whatever recorder is installed.
pub fn describe_metrics() {
    metrics::describe_counter!(AGENT_CALLS_TOTAL, "Agent invocations");
    metrics::describe_counter!(AGENT_ERRORS_TOTAL, "Failed agent invocations");
    metrics::describe_counter!(AGENT_RETRIES_TOTAL, "Agent retries");
    metrics::describe_counter!(RATE_LIMIT_REJECTIONS_TOTAL, "Jobs refused at admission");
    metrics::describe_counter!(TOKENS_USED_TOTAL, "Tokens recorded in job ledgers");
    metrics::describe_gauge!(QUEUE_DEPTH, "Visible messages in the job queue");
    metrics::describe_histogram!(COST_PER_PROJECT_USD, metrics::Unit::Count, "Cost of a finished job in USD");
    metrics::describe_histogram!(JOB_DURATION_SECONDS, metrics::Unit::Seconds, "Wall time per job run");
    metrics::describe_histogram!(AGENT_LATENCY_SECONDS, metrics::Unit::Seconds, "Provider call latency");
}

/// Install the global subscriber. `RUST_LOG` wins over the defaults.
pub fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "forja=debug" } else { "forja=info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
    }
}

/// One provider call as recorded in the job's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTrace {
    pub job_id: String,
    pub user_id: String,
    pub agent: AgentKind,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub verdicts: Vec<GuardrailVerdict>,
    /// `ok`, or the error code the call ended with.
    pub outcome: String,
    pub at: DateTime<Utc>,
}

impl CallTrace {
    pub fn emit(&self) {
        tracing::info!(
            target: AUDIT_TARGET,
            job_id = %self.job_id,
            user_id = %self.user_id,
            agent = %self.agent,
            model = %self.model,
            input_tokens = self.input_tokens,
            output_tokens = self.output_tokens,
            cost_usd = self.cost_usd,
            latency_ms = self.latency_ms,
            verdicts = self.verdicts.len(),
            outcome = %self.outcome,
            "agent call"
        );
    }
}
