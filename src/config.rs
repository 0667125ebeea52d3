//! Configuração do forja carregada a partir de `forja.toml`.
//!
//! A struct [`ForjaConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente têm precedência sobre o arquivo, e flags da CLI
//! sobre ambos (aplicadas em `main`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer};

use crate::guardrails::{DEFAULT_INJECTION_PATTERNS, DEFAULT_RISKY_PATTERNS, GuardrailSettings};
use crate::ledger::{ModelPrice, PricingTable};
use crate::rate_limiter::RateLimits;
use crate::state_machine::{AgentKind, JobLimits, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "forja.toml";

/// Teto cumulativo de tokens por agente dentro de um job (inclui retentativas).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentTokenCaps {
    pub router: u64,
    pub planner: u64,
    pub fe_executor: u64,
    pub be_executor: u64,
    pub validator: u64,
}

impl Default for AgentTokenCaps {
    fn default() -> Self {
        Self {
            router: 2_000,
            planner: 10_000,
            fe_executor: 30_000,
            be_executor: 30_000,
            validator: 15_000,
        }
    }
}

impl AgentTokenCaps {
    pub fn cap_for(&self, agent: AgentKind) -> u64 {
        match agent {
            AgentKind::Router => self.router,
            AgentKind::Planner => self.planner,
            AgentKind::FeExecutor => self.fe_executor,
            AgentKind::BeExecutor => self.be_executor,
            AgentKind::Validator => self.validator,
        }
    }
}

/// Configuração de nível superior carregada de `forja.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ForjaConfig {
    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    /// URL alternativa do endpoint Messages (proxy ou testes).
    #[serde(default)]
    pub base_url: Option<String>,

    /// Tempo máximo de uma chamada ao modelo, em segundos.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Máximo de retentativas por agente antes de marcar o job como falho.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial (0 = imediato).
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Orçamento total de tokens por job.
    #[serde(default = "default_job_token_budget")]
    pub job_token_budget: u64,

    /// Tetos de tokens por agente.
    #[serde(default)]
    pub per_agent_token_caps: AgentTokenCaps,

    /// Requisições admitidas por usuário por minuto.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Tokens consumidos por usuário por hora.
    #[serde(default = "default_tokens_per_hour")]
    pub tokens_per_hour: u64,

    /// Suspende o job para revisão humana quando o scan de risco encontra algo.
    #[serde(default)]
    pub require_human_review: bool,

    /// Preços por modelo em USD por 1M tokens. Entradas do arquivo
    /// sobrepõem a tabela padrão em vez de substituí-la.
    #[serde(default, deserialize_with = "merge_pricing")]
    pub model_pricing: PricingTable,

    /// Consulta o oráculo de roteamento entre etapas.
    #[serde(default)]
    pub model_routing: bool,

    /// Cadeia de modelos percorrida a cada retentativa.
    #[serde(default = "default_model_chain")]
    pub model_chain: Vec<String>,

    /// Força um único modelo para todas as chamadas.
    #[serde(default)]
    pub model_override: Option<String>,

    /// Limite de tokens de saída por chamada.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Diretório raiz dos artefatos gerados.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Diretório da fila durável.
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,

    /// Diretório das decisões de revisão.
    #[serde(default = "default_review_dir")]
    pub review_dir: PathBuf,

    /// Tempo de invisibilidade de uma mensagem recebida, em segundos.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Recebimentos antes de a fila mover a mensagem para dead-letter.
    #[serde(default = "default_max_receives")]
    pub max_receives: u32,

    /// Espera do long-poll, em segundos.
    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,

    /// Espera máxima, em segundos, por uma janela de rate limit antes de
    /// retentar. Deve ficar abaixo de `visibility_timeout_secs`.
    #[serde(default = "default_rate_limit_max_wait_secs")]
    pub rate_limit_max_wait_secs: u64,

    /// Porta do endpoint Prometheus `/metrics` do worker (0 desabilita).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Ferramentas permitidas.
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,

    /// Padrões (regex) de código arriscado.
    #[serde(default = "default_risky_patterns")]
    pub risky_patterns: Vec<String>,

    /// Padrões (regex, sem distinção de caixa) de injeção de prompt.
    #[serde(default = "default_injection_patterns")]
    pub injection_patterns: Vec<String>,
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_job_token_budget() -> u64 {
    200_000
}

fn default_requests_per_minute() -> u32 {
    10
}

fn default_tokens_per_hour() -> u64 {
    500_000
}

fn default_model_chain() -> Vec<String> {
    vec![
        "claude-haiku-4-5".to_string(),
        "claude-sonnet-4-5".to_string(),
        "claude-opus-4-1".to_string(),
    ]
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_output_root() -> PathBuf {
    PathBuf::from("output")
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from(".forja/queue")
}

fn default_review_dir() -> PathBuf {
    PathBuf::from(".forja/reviews")
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_max_receives() -> u32 {
    5
}

fn default_poll_wait_secs() -> u64 {
    2
}

fn default_rate_limit_max_wait_secs() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

fn merge_pricing<'de, D>(deserializer: D) -> std::result::Result<PricingTable, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BTreeMap::<String, ModelPrice>::deserialize(deserializer)?;
    let mut table = PricingTable::default();
    table.0.extend(overrides);
    Ok(table)
}

fn default_allowed_tools() -> Vec<String> {
    vec!["file_writer".to_string()]
}

fn default_risky_patterns() -> Vec<String> {
    DEFAULT_RISKY_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn default_injection_patterns() -> Vec<String> {
    DEFAULT_INJECTION_PATTERNS.iter().map(|s| s.to_string()).collect()
}

impl Default for ForjaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: 0,
            job_token_budget: default_job_token_budget(),
            per_agent_token_caps: AgentTokenCaps::default(),
            requests_per_minute: default_requests_per_minute(),
            tokens_per_hour: default_tokens_per_hour(),
            require_human_review: false,
            model_pricing: PricingTable::default(),
            model_routing: false,
            model_chain: default_model_chain(),
            model_override: None,
            max_output_tokens: default_max_output_tokens(),
            output_root: default_output_root(),
            queue_dir: default_queue_dir(),
            review_dir: default_review_dir(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receives: default_max_receives(),
            poll_wait_secs: default_poll_wait_secs(),
            rate_limit_max_wait_secs: default_rate_limit_max_wait_secs(),
            metrics_port: default_metrics_port(),
            allowed_tools: default_allowed_tools(),
            risky_patterns: default_risky_patterns(),
            injection_patterns: default_injection_patterns(),
        }
    }
}

impl ForjaConfig {
    /// Carrega a configuração de `path`, ou de `forja.toml` no diretório atual.
    /// Usa valores padrão se o arquivo padrão não existir; um caminho explícito
    /// inexistente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        toml::from_str::<ForjaConfig>(&contents)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    /// Variáveis de ambiente têm precedência sobre o arquivo de configuração.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            self.api_key = key;
        }
        if let Some(flag) = var("FORJA_REQUIRE_HUMAN_REVIEW") {
            self.require_human_review = matches!(flag.trim(), "1" | "true" | "yes");
        }
        if let Some(model) = var("FORJA_MODEL_OVERRIDE")
            && !model.trim().is_empty()
        {
            self.model_override = Some(model.trim().to_string());
        }
    }

    /// Rejeita combinações que tornariam a orquestração inválida.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        if self.job_token_budget == 0 {
            bail!("job_token_budget must be positive");
        }
        for agent in AgentKind::ALL {
            if self.per_agent_token_caps.cap_for(agent) == 0 {
                bail!("per_agent_token_caps.{agent} must be positive");
            }
        }
        if self.requests_per_minute == 0 || self.tokens_per_hour == 0 {
            bail!("rate limits must be positive");
        }
        if self.model_pricing.0.is_empty() {
            bail!("model_pricing must list at least one model");
        }
        if self.model_chain.is_empty() && self.model_override.is_none() {
            bail!("model_chain must not be empty");
        }
        for model in self.model_chain.iter().chain(self.model_override.iter()) {
            if self.model_pricing.get(model).is_none() {
                bail!("model_pricing has no entry for {model}");
            }
        }
        if self.call_timeout_secs == 0 {
            bail!("call_timeout_secs must be positive");
        }
        if self.max_receives == 0 {
            bail!("max_receives must be at least 1");
        }
        if self.rate_limit_max_wait_secs >= self.visibility_timeout_secs {
            bail!("rate_limit_max_wait_secs must be shorter than visibility_timeout_secs");
        }
        Ok(())
    }

    pub fn job_limits(&self) -> JobLimits {
        JobLimits {
            max_retries: self.max_retries,
            job_token_budget: self.job_token_budget,
            caps: self.per_agent_token_caps.clone(),
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_minute: self.requests_per_minute,
            tokens_per_hour: self.tokens_per_hour,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.retry_backoff_ms,
        }
    }

    pub fn guardrail_settings(&self) -> GuardrailSettings {
        GuardrailSettings {
            injection_patterns: self.injection_patterns.clone(),
            risky_patterns: self.risky_patterns.clone(),
            allowed_tools: self.allowed_tools.clone(),
            require_human_review: self.require_human_review,
            output_root: self.output_root.clone(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }

    pub fn rate_limit_max_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_max_wait_secs)
    }

    /// Porta do exportador Prometheus, se habilitado.
    pub fn metrics_port(&self) -> Option<u16> {
        (self.metrics_port != 0).then_some(self.metrics_port)
    }
}
