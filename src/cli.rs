//! Interface de linha de comando do forja baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, submit, worker,
//! approve, status) e flags globais (--model, --max-retries, --verbose,
//! --json-logs, --config).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// forja: orquestrador multiagente de geração de código com orçamento e guardrails.
#[derive(Debug, Parser)]
#[command(name = "forja", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Força um nível de modelo para todas as chamadas desta sessão.
    #[arg(long, global = true)]
    pub model: Option<ModelArg>,

    /// Número máximo de retentativas por agente.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite logs em JSON em vez de texto.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,

    /// Caminho para o arquivo de configuração (padrão: `forja.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Argumento de modelo aceito pela CLI, resolvido contra `model_chain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelArg {
    /// Modelo rápido e econômico.
    Haiku,
    /// Modelo equilibrado.
    Sonnet,
    /// Modelo mais capaz.
    Opus,
}

impl ModelArg {
    fn family(self) -> &'static str {
        match self {
            ModelArg::Haiku => "haiku",
            ModelArg::Sonnet => "sonnet",
            ModelArg::Opus => "opus",
        }
    }

    /// Primeiro modelo da cadeia desta família, ou o nome padrão da família.
    pub fn resolve(self, chain: &[String]) -> String {
        chain
            .iter()
            .find(|model| model.contains(self.family()))
            .cloned()
            .unwrap_or_else(|| match self {
                ModelArg::Haiku => "claude-haiku-4-5".to_string(),
                ModelArg::Sonnet => "claude-sonnet-4-5".to_string(),
                ModelArg::Opus => "claude-opus-4-1".to_string(),
            })
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa um job no próprio processo e imprime o resumo de custos.
    Run {
        /// Descrição do projeto a gerar.
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,

        /// Identidade do usuário para limites de taxa.
        #[arg(long, default_value = "local")]
        user_id: String,
    },

    /// Enfileira um job na fila em diretório.
    Submit {
        /// Descrição do projeto a gerar.
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,

        /// Identidade do usuário para limites de taxa.
        #[arg(long, default_value = "local")]
        user_id: String,
    },

    /// Processa a fila até receber ctrl-c.
    Worker,

    /// Registra a decisão de revisão de um job suspenso.
    Approve {
        /// Identificador do job em AWAITING_REVIEW.
        job_id: String,

        /// Rejeita em vez de aprovar.
        #[arg(long, default_value_t = false)]
        reject: bool,

        /// Nome de quem revisou.
        #[arg(long, default_value = "cli")]
        reviewer: String,
    },

    /// Mostra o histórico de um job, ou a profundidade da fila e os jobs
    /// mais recentes.
    Status {
        /// Identificador do job a detalhar.
        job_id: Option<String>,

        /// Lista apenas os jobs deste usuário.
        #[arg(long)]
        user_id: Option<String>,

        /// Quantidade máxima de jobs listados.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["forja", "run", "a", "todo", "app", "--user-id", "alice"]);
        match cli.command {
            Command::Run { request, user_id } => {
                assert_eq!(request.join(" "), "a todo app");
                assert_eq!(user_id, "alice");
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "forja",
            "--model",
            "opus",
            "--max-retries",
            "5",
            "--verbose",
            "--json-logs",
            "--config",
            "custom.toml",
            "status",
        ]);
        assert!(cli.verbose);
        assert!(cli.json_logs);
        assert_eq!(cli.model, Some(ModelArg::Opus));
        assert_eq!(cli.max_retries, Some(5));
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
    }

    #[test]
    fn cli_parses_approve_with_reject() {
        let cli = Cli::parse_from(["forja", "approve", "job-1", "--reject", "--reviewer", "carol"]);
        match cli.command {
            Command::Approve {
                job_id,
                reject,
                reviewer,
            } => {
                assert_eq!(job_id, "job-1");
                assert!(reject);
                assert_eq!(reviewer, "carol");
            }
            _ => panic!("expected Approve command"),
        }
    }

    #[test]
    fn cli_parses_status_forms() {
        let cli = Cli::parse_from(["forja", "status", "job-7"]);
        match cli.command {
            Command::Status { job_id, user_id, limit } => {
                assert_eq!(job_id.as_deref(), Some("job-7"));
                assert!(user_id.is_none());
                assert_eq!(limit, 20);
            }
            _ => panic!("expected Status command"),
        }

        let cli = Cli::parse_from(["forja", "status", "--user-id", "alice", "--limit", "5"]);
        match cli.command {
            Command::Status { job_id, user_id, limit } => {
                assert!(job_id.is_none());
                assert_eq!(user_id.as_deref(), Some("alice"));
                assert_eq!(limit, 5);
            }
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn submit_requires_a_request() {
        assert!(Cli::try_parse_from(["forja", "submit"]).is_err());
    }

    #[test]
    fn model_arg_resolves_against_chain() {
        let chain = vec!["claude-haiku-4-5".to_string(), "claude-sonnet-4-5".to_string()];
        assert_eq!(ModelArg::Sonnet.resolve(&chain), "claude-sonnet-4-5");
        assert_eq!(ModelArg::Opus.resolve(&chain), "claude-opus-4-1");
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
