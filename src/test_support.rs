//! Scripted provider and fixtures shared by the orchestration tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use parking_lot::Mutex;

use crate::anthropic::{AnthropicError, ContentBlock, MessageSender, MessagesRequest, MessagesResponse, Usage};
use crate::config::AgentTokenCaps;
use crate::guardrails::{Guardrails, tests::settings};
use crate::invoker::{AgentInvoker, CallContext};
use crate::ledger::PricingTable;
use crate::prompts::Prompts;
use crate::rate_limiter::{RateLimiter, RateLimits};
use crate::router::ModelSelector;
use crate::state_machine::{AgentKind, JobLimits};

pub(crate) enum Reply {
    Text {
        text: String,
        input_tokens: u32,
        output_tokens: u32,
    },
    Error(AnthropicError),
    Hang,
}

impl Reply {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self::sized(text, 100, 200)
    }

    pub(crate) fn sized(text: impl Into<String>, input_tokens: u32, output_tokens: u32) -> Self {
        Reply::Text {
            text: text.into(),
            input_tokens,
            output_tokens,
        }
    }
}

pub(crate) fn plan() -> Reply {
    Reply::text(
        r##"{"spec": "# Todo app", "pages": ["index"], "endpoints": ["GET /todos", "POST /todos"], "data_models": ["Todo"]}"##,
    )
}

pub(crate) fn frontend() -> Reply {
    Reply::text(r#"{"pages/index.tsx": "export default function Home() { return null }"}"#)
}

pub(crate) fn backend() -> Reply {
    Reply::text(r#"{"main.py": "from fastapi import FastAPI\napp = FastAPI()"}"#)
}

pub(crate) fn passed() -> Reply {
    Reply::text(r#"{"passed": true, "report": "All endpoints covered.", "target": ""}"#)
}

pub(crate) fn failed(target: AgentKind) -> Reply {
    Reply::text(format!(
        r#"{{"passed": false, "report": "Missing DELETE /todos.", "target": "{target}"}}"#
    ))
}

/// Provider that answers from a fixed script, in order.
pub(crate) struct ScriptedClient {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<MessagesRequest>>,
}

impl ScriptedClient {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn requests(&self) -> Vec<MessagesRequest> {
        self.requests.lock().clone()
    }
}

impl MessageSender for ScriptedClient {
    async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, AnthropicError> {
        self.requests.lock().push(req.clone());
        let next = self.replies.lock().pop_front();
        match next {
            Some(Reply::Text {
                text,
                input_tokens,
                output_tokens,
            }) => Ok(MessagesResponse {
                id: "msg_mock".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text,
                }],
                model: req.model.clone(),
                stop_reason: Some("end_turn".into()),
                usage: Usage {
                    input_tokens,
                    output_tokens,
                },
            }),
            Some(Reply::Error(e)) => Err(e),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AnthropicError::EmptyResponse)
            }
            None => Err(AnthropicError::ApiError {
                status: 500,
                message: "script exhausted".into(),
            }),
        }
    }
}

/// Owned collaborators for one test run.
pub(crate) struct Harness {
    pub dir: tempfile::TempDir,
    pub guardrails: Guardrails,
    pub limiter: RateLimiter,
    pub pricing: PricingTable,
    pub limits: JobLimits,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_review(false)
    }

    pub(crate) fn with_review(review: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let guardrails =
            Guardrails::new(&settings(&dir.path().join("output"), review), &Prompts::default()).unwrap();
        Self {
            dir,
            guardrails,
            limiter: RateLimiter::new(RateLimits {
                requests_per_minute: 60,
                tokens_per_hour: 1_000_000,
            }),
            pricing: PricingTable::default(),
            limits: JobLimits {
                max_retries: 3,
                job_token_budget: 200_000,
                caps: AgentTokenCaps::default(),
            },
        }
    }

    pub(crate) fn ctx(&self) -> CallContext<'_> {
        CallContext {
            limiter: &self.limiter,
            guardrails: &self.guardrails,
            pricing: &self.pricing,
            limits: &self.limits,
        }
    }
}

pub(crate) fn invoker(replies: Vec<Reply>) -> AgentInvoker<ScriptedClient> {
    AgentInvoker::new(
        ScriptedClient::new(replies),
        Prompts::default(),
        ModelSelector::new(vec!["claude-haiku-4-5".into(), "claude-sonnet-4-5".into()], None),
    )
}

/// Counter values keyed by `(metric name, agent label)`.
pub(crate) type Counters = HashMap<(String, String), u64>;

/// Drive `fut` on a current-thread runtime with a thread-local recorder
/// installed, returning its output and every counter it touched.
pub(crate) fn with_counters<F: Future>(fut: F) -> (F::Output, Counters) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let output = metrics::with_local_recorder(&recorder, || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    });

    let counters = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(key, _, _, value)| match value {
            DebugValue::Counter(n) => {
                let key = key.key();
                let agent = key
                    .labels()
                    .find(|label| label.key() == "agent")
                    .map(|label| label.value().to_string())
                    .unwrap_or_default();
                Some(((key.name().to_string(), agent), n))
            }
            _ => None,
        })
        .collect();
    (output, counters)
}

pub(crate) fn counter(counters: &Counters, name: &str, agent: AgentKind) -> u64 {
    counters
        .get(&(name.to_string(), agent.as_str().to_string()))
        .copied()
        .unwrap_or(0)
}
