use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::watch;

use forja::anthropic::AnthropicClient;
use forja::artifacts::ArtifactStore;
use forja::cli::{Cli, Command};
use forja::config::ForjaConfig;
use forja::guardrails::Guardrails;
use forja::history::JobStore;
use forja::invoker::{AgentInvoker, CallContext};
use forja::ledger::PricingTable;
use forja::orchestrator::{Orchestrator, StepOutcome};
use forja::prompts::Prompts;
use forja::queue::{DirQueue, JobQueue, QueueSettings};
use forja::rate_limiter::{RateLimitResult, RateLimiter};
use forja::review::ReviewStore;
use forja::router::ModelSelector;
use forja::state_machine::{AgentState, JobLimits, ReviewDecision, State};
use forja::telemetry;
use forja::ui::{self, JobProgress};
use forja::worker::QueueWorker;

/// Everything an orchestrator borrows, owned for the life of one command.
struct Runtime {
    config: ForjaConfig,
    guardrails: Guardrails,
    limiter: RateLimiter,
    pricing: PricingTable,
    limits: JobLimits,
    invoker: AgentInvoker<AnthropicClient>,
}

impl Runtime {
    fn build(config: ForjaConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            bail!("ANTHROPIC_API_KEY is not set (or api_key in forja.toml)");
        }
        let prompts = Prompts::default();
        let guardrails = Guardrails::new(&config.guardrail_settings(), &prompts)?;
        let client = match &config.base_url {
            Some(url) => AnthropicClient::with_base_url(config.api_key.clone(), url.clone(), config.call_timeout())?,
            None => AnthropicClient::new(config.api_key.clone(), config.call_timeout())?,
        };
        let selector = ModelSelector::new(config.model_chain.clone(), config.model_override.clone());
        let invoker = AgentInvoker::new(client, prompts, selector)
            .with_timeout(config.call_timeout())
            .with_max_output_tokens(config.max_output_tokens);

        Ok(Self {
            limiter: RateLimiter::new(config.rate_limits()),
            pricing: config.model_pricing.clone(),
            limits: config.job_limits(),
            guardrails,
            invoker,
            config,
        })
    }

    fn orchestrator(&self) -> Orchestrator<'_, AnthropicClient> {
        let ctx = CallContext {
            limiter: &self.limiter,
            guardrails: &self.guardrails,
            pricing: &self.pricing,
            limits: &self.limits,
        };
        Orchestrator::new(&self.invoker, ctx)
            .with_retry_policy(self.config.retry_policy())
            .with_rate_limit_wait(self.config.rate_limit_max_wait())
            .with_model_routing(self.config.model_routing)
    }
}

fn queue_settings(config: &ForjaConfig) -> QueueSettings {
    QueueSettings {
        visibility_timeout: config.visibility_timeout(),
        max_receives: config.max_receives,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose, cli.json_logs);

    let mut config = ForjaConfig::load(cli.config.as_deref())?;
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(model) = cli.model {
        config.model_override = Some(model.resolve(&config.model_chain));
    }
    config.validate()?;

    match cli.command {
        Command::Run { request, user_id } => run(config, request.join(" "), user_id).await,
        Command::Submit { request, user_id } => {
            let queue = DirQueue::open(&config.queue_dir, queue_settings(&config))?;
            let state = AgentState::new(request.join(" "), user_id);
            JobStore::for_queue(&config.queue_dir).record(&state)?;
            queue.send(&state)?;
            println!("{}", state.job.id);
            Ok(())
        }
        Command::Worker => worker(config).await,
        Command::Approve {
            job_id,
            reject,
            reviewer,
        } => {
            let store = ReviewStore::new(&config.review_dir);
            let path = store.decide(&job_id, &ReviewDecision::new(!reject, reviewer))?;
            println!("{} {job_id} ({})", if reject { "rejected" } else { "approved" }, path.display());
            Ok(())
        }
        Command::Status {
            job_id,
            user_id,
            limit,
        } => status(&config, job_id, user_id, limit),
    }
}

fn status(config: &ForjaConfig, job_id: Option<String>, user_id: Option<String>, limit: usize) -> Result<()> {
    let history = JobStore::for_queue(&config.queue_dir);
    if let Some(job_id) = job_id {
        let Some(record) = history.get(&job_id)? else {
            bail!("no record for job {job_id}");
        };
        ui::print_record(&record);
        return Ok(());
    }
    if user_id.is_none() {
        let queue = DirQueue::open(&config.queue_dir, queue_settings(config))?;
        ui::print_depth(&queue.depth()?);
        println!();
    }
    ui::print_records(&history.list(user_id.as_deref(), limit)?);
    Ok(())
}

async fn run(config: ForjaConfig, request: String, user_id: String) -> Result<()> {
    let runtime = Runtime::build(config)?;
    if let RateLimitResult::Limited { retry_after, limit_type } = runtime.limiter.admit(&user_id) {
        bail!("{limit_type} limit reached for {user_id}, retry after {}s", retry_after.as_secs());
    }

    let mut state = AgentState::new(request.clone(), user_id);
    let progress = JobProgress::start(&request);
    let outcome = runtime
        .orchestrator()
        .run(&mut state, |s| progress.observe(s))
        .await;
    progress.complete(&state);
    let history = JobStore::for_queue(&runtime.config.queue_dir);

    match outcome {
        StepOutcome::Finished(State::Done) => {
            let summary = ArtifactStore::new(&runtime.guardrails)
                .commit(&state)
                .context("committing artifacts")?;
            history.record(&state)?;
            println!("  {} files written under {}", summary.written.len(), summary.root.display());
        }
        StepOutcome::Suspended => {
            // Hand the parked job to the queue so a worker resumes it after review.
            let queue = DirQueue::open(&runtime.config.queue_dir, queue_settings(&runtime.config))?;
            queue.send(&state)?;
            history.record(&state)?;
            println!(
                "  forja approve {} && forja worker   # to resume",
                state.job.id
            );
        }
        _ => {
            history.record(&state)?;
        }
    }
    progress.print_costs(&state);
    Ok(())
}

async fn worker(config: ForjaConfig) -> Result<()> {
    let runtime = Runtime::build(config)?;
    if let Some(port) = runtime.config.metrics_port() {
        telemetry::install_prometheus(port).context("starting metrics exporter")?;
    }
    let queue = DirQueue::open(&runtime.config.queue_dir, queue_settings(&runtime.config))?;
    let reviews = ReviewStore::new(&runtime.config.review_dir);
    let history = JobStore::for_queue(&runtime.config.queue_dir);
    let worker = QueueWorker::new(runtime.orchestrator(), &queue, &reviews)
        .with_history(&history)
        .with_poll_wait(runtime.config.poll_wait());

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested, finishing in-flight job");
        let _ = tx.send(true);
    });

    let processed = worker.run(rx).await?;
    println!("processed {processed} deliveries");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
