//! Per-job token and cost accounting.
//!
//! The [`TokenLedger`] lives inside the serialized `AgentState`, so each job
//! carries its own totals and concurrent jobs never share one. Updates are
//! all-or-nothing: [`TokenLedger::record`] computes the new totals first and
//! only commits them when the job budget still holds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::AgentKind;

/// USD price per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Per-model pricing table, keyed by model identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable(pub BTreeMap<String, ModelPrice>);

impl Default for PricingTable {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert("claude-haiku-4-5".to_string(), ModelPrice::new(1.0, 5.0));
        table.insert("claude-sonnet-4-5".to_string(), ModelPrice::new(3.0, 15.0));
        table.insert("claude-opus-4-1".to_string(), ModelPrice::new(15.0, 75.0));
        Self(table)
    }
}

impl PricingTable {
    pub fn get(&self, model: &str) -> Option<&ModelPrice> {
        self.0.get(model)
    }

    /// Cost of one call in USD, rounded to six decimals.
    ///
    /// Unknown models are priced at zero and logged.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let Some(price) = self.get(model) else {
            tracing::warn!(model, "no pricing entry for model, recording zero cost");
            return 0.0;
        };
        let raw = (input_tokens as f64 * price.input_per_million
            + output_tokens as f64 * price.output_per_million)
            / 1_000_000.0;
        (raw * 1_000_000.0).round() / 1_000_000.0
    }
}

/// Token usage reported for one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl CallUsage {
    pub fn new(model: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            model: model.into(),
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Cumulative usage of a single agent within one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub calls: u32,
}

impl TokenUsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("recording {attempted} tokens would bring the job to {would_be} of {budget}")]
    BudgetExceeded {
        attempted: u64,
        would_be: u64,
        budget: u64,
    },
}

/// Result of a committed ledger update.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub tokens: u64,
    pub cost_usd: f64,
    pub job_total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenLedger {
    per_agent: BTreeMap<AgentKind, TokenUsageRecord>,
    total_tokens: u64,
    total_cost_usd: f64,
}

impl TokenLedger {
    /// Add one call's usage for `agent`.
    ///
    /// Rejected as a whole when the job total would exceed `budget`.
    pub fn record(
        &mut self,
        agent: AgentKind,
        usage: &CallUsage,
        pricing: &PricingTable,
        budget: u64,
    ) -> Result<LedgerEntry, LedgerError> {
        let tokens = usage.total();
        let would_be = self.total_tokens.saturating_add(tokens);
        if would_be > budget {
            return Err(LedgerError::BudgetExceeded {
                attempted: tokens,
                would_be,
                budget,
            });
        }

        let cost = pricing.cost(&usage.model, usage.input_tokens, usage.output_tokens);
        let mut record = self.per_agent.get(&agent).cloned().unwrap_or_default();
        record.input_tokens += usage.input_tokens;
        record.output_tokens += usage.output_tokens;
        record.cost_usd += cost;
        record.calls += 1;

        self.per_agent.insert(agent, record);
        self.total_tokens = would_be;
        self.total_cost_usd += cost;

        Ok(LedgerEntry {
            tokens,
            cost_usd: cost,
            job_total_tokens: would_be,
        })
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_usd
    }

    pub fn agent_tokens(&self, agent: AgentKind) -> u64 {
        self.per_agent
            .get(&agent)
            .map(TokenUsageRecord::total_tokens)
            .unwrap_or(0)
    }

    pub fn agent(&self, agent: AgentKind) -> Option<&TokenUsageRecord> {
        self.per_agent.get(&agent)
    }

    /// Final per-agent breakdown, in pipeline order.
    pub fn breakdown(&self) -> Vec<(AgentKind, TokenUsageRecord)> {
        self.per_agent
            .iter()
            .map(|(agent, record)| (*agent, record.clone()))
            .collect()
    }
}
