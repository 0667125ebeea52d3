//! Interface de terminal do forja: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner de progresso e `console` para cores. O
//! [`JobProgress`] acompanha um job executado pelo comando `run` e, ao final,
//! imprime o detalhamento de tokens e custo por agente.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::history::JobRecord;
use crate::queue::QueueDepth;
use crate::state_machine::{AgentState, JobStatus, State};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Sucesso em verde, falha em vermelho, retentativas e revisão em amarelo.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    /// Inicia o spinner com a descrição do job.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("PLANNING: {description}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza o spinner após cada passo do orquestrador.
    ///
    /// Uma transição para o mesmo estado é uma retentativa e vira uma linha
    /// amarela acima do spinner.
    pub fn observe(&self, state: &AgentState) {
        if let Some(last) = state.history.last()
            && last.from == last.to
        {
            self.pb.println(format!("  {} {}", self.yellow.apply_to("↻"), last.reason));
        }
        self.update_state(state.current_state());
    }

    /// Atualiza a mensagem do spinner para refletir o estado atual.
    pub fn update_state(&self, state: State) {
        self.pb.set_message(format!("{state}"));
    }

    /// Finaliza o spinner e exibe o resultado do job.
    pub fn complete(&self, state: &AgentState) {
        self.pb.finish_and_clear();
        match state.current_state() {
            State::Done => {
                println!("  {} Job {} completed", self.green.apply_to("✓"), state.job.id);
            }
            State::AwaitingReview => {
                let findings = state
                    .pending_review
                    .as_ref()
                    .map(|p| p.findings.join("; "))
                    .unwrap_or_default();
                println!(
                    "  {} Job {} awaiting review: {findings}",
                    self.yellow.apply_to("⏸"),
                    state.job.id
                );
            }
            _ => {
                let reason = state.failure.map(|r| r.as_str()).unwrap_or("unknown");
                let detail = state.failure_detail.as_deref().unwrap_or("");
                println!("  {} Job failed: {reason} ({detail})", self.red.apply_to("✗"));
            }
        }
        for warning in &state.security_warnings {
            println!("  {} {warning}", self.yellow.apply_to("!"));
        }
    }

    /// Imprime a tabela de tokens e custo por agente.
    pub fn print_costs(&self, state: &AgentState) {
        println!();
        println!("{}", self.dim.apply_to("─── Cost Summary ───"));
        println!("  {:<12} {:>6} {:>10} {:>10} {:>10}", "agent", "calls", "input", "output", "usd");
        for (agent, record) in state.ledger.breakdown() {
            println!(
                "  {:<12} {:>6} {:>10} {:>10} {:>10.4}",
                agent.as_str(),
                record.calls,
                record.input_tokens,
                record.output_tokens,
                record.cost_usd
            );
        }
        println!(
            "  {:<12} {:>6} {:>21} {:>10.4}",
            "total",
            "",
            state.ledger.total_tokens(),
            state.ledger.total_cost_usd()
        );
    }
}

/// Imprime a profundidade da fila para o comando `status`.
pub fn print_depth(depth: &QueueDepth) {
    println!("  pending   {}", depth.pending);
    println!("  in-flight {}", depth.in_flight);
    println!("  dead      {}", Style::new().red().apply_to(depth.dead));
}

/// Imprime o registro completo de um job para `status <job_id>`.
pub fn print_record(record: &JobRecord) {
    let dim = Style::new().dim();
    println!("  job       {}", record.job_id);
    println!("  user      {}", record.user_id);
    println!("  request   {}", record.request);
    println!("  status    {}", status_style(record).apply_to(format!("{:?} ({})", record.status, record.state)));
    if let Some(reason) = record.failure {
        println!(
            "  failure   {} {}",
            reason.as_str(),
            record.failure_detail.as_deref().unwrap_or("")
        );
    }
    println!("  tokens    {}", record.total_tokens);
    println!("  cost      ${:.4}", record.cost_usd);
    println!("  retries   {}", record.retries);
    println!("  validated {}", record.validation_passed);
    if !record.models.is_empty() {
        println!("  models    {}", record.models.join(", "));
    }
    println!("  created   {}", record.created_at.to_rfc3339());
    if let Some(finished) = record.finished_at {
        println!("  finished  {}", finished.to_rfc3339());
    }
    if !record.agents.is_empty() {
        println!("{}", dim.apply_to("  ─── per agent ───"));
        for agent in &record.agents {
            println!(
                "  {:<12} {:>6} {:>10} {:>10} {:>10.4}",
                agent.agent.as_str(),
                agent.usage.calls,
                agent.usage.input_tokens,
                agent.usage.output_tokens,
                agent.usage.cost_usd
            );
        }
    }
}

/// Imprime uma linha por job, do mais recente ao mais antigo.
pub fn print_records(records: &[JobRecord]) {
    if records.is_empty() {
        println!("  {}", Style::new().dim().apply_to("no jobs recorded"));
        return;
    }
    for record in records {
        println!(
            "  {}  {:<10} {:<14} {:>8} ${:<8.4} {}",
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.user_id,
            status_style(record).apply_to(format!("{:?}", record.status)),
            record.total_tokens,
            record.cost_usd,
            record.job_id
        );
    }
}

fn status_style(record: &JobRecord) -> Style {
    match record.status {
        JobStatus::Succeeded => Style::new().green(),
        JobStatus::Failed | JobStatus::DeadLettered => Style::new().red(),
        JobStatus::Pending | JobStatus::Running => Style::new().yellow(),
    }
}
