//! LLM client seam.
//!
//! Real providers live outside the execution core; the runner only
//! knows this trait. Tests and local runs use the scripted client.

use async_trait::async_trait;
use capstan_core::{Error, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Clone, Debug, Default)]
pub struct LlmRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct LlmResponse {
    pub text: String,
    /// Provider-reported cost in arbitrary gas units; feeds the
    /// governance gas-fee guardrail.
    pub cost: f64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// Scripted responses popped in order — the runner's test double. A
/// `Err` entry simulates a provider failure on that call.
#[derive(Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    /// Prompts received, for assertions on advice injection.
    prompts: Mutex<Vec<String>>,
    pub cost_per_call: f64,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
            cost_per_call: 0.1,
        }
    }

    pub fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(LlmResponse {
                text,
                cost: self.cost_per_call,
            }),
            Some(Err(message)) => Err(Error::llm("scripted", message)),
            None => Err(Error::llm("scripted", "script exhausted")),
        }
    }
}
