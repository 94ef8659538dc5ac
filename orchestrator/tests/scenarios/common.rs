//! Scripted agent invoker shared by the scenario tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use orchestrator::invoker::{AgentInvoker, AgentResponse, InvokeOptions};

/// What an agent does on one call
#[derive(Clone)]
pub enum Reply {
    /// Return the input unchanged
    Echo,
    Ok(String),
    Fail(String),
    /// Wait for a permit on the gate, then reply
    Gated(Arc<Semaphore>, Box<Reply>),
    /// Sleep, then reply
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn ok(text: impl Into<String>) -> Self {
        Reply::Ok(text.into())
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Reply::Fail(error.into())
    }

    pub fn gated(gate: &Arc<Semaphore>, reply: Reply) -> Self {
        Reply::Gated(gate.clone(), Box::new(reply))
    }
}

/// One recorded agent call
#[derive(Debug, Clone)]
pub struct Call {
    pub agent: String,
    pub input: String,
    pub system_prompt: Option<String>,
    pub at: Instant,
}

/// Invoker replying from per-agent scripts. Scripted replies are consumed
/// in order; afterwards the agent's default applies (echo when unset).
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply used once the agent's script is exhausted
    pub fn set_default(&self, agent: &str, reply: Reply) {
        self.defaults.lock().unwrap().insert(agent.to_string(), reply);
    }

    /// Replies for the next calls to `agent`, in order
    pub fn script(&self, agent: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, agent: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.agent == agent).collect()
    }

    pub fn call_count(&self, agent: &str) -> usize {
        self.calls_to(agent).len()
    }

    /// Agents in call order
    pub fn agents_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.agent).collect()
    }

    fn next_reply(&self, agent: &str) -> Reply {
        if let Some(reply) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(agent)
            .and_then(|queue| queue.pop_front())
        {
            return reply;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(agent)
            .cloned()
            .unwrap_or(Reply::Echo)
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn execute(&self, agent: &str, input: &str, options: &InvokeOptions) -> AgentResponse {
        self.calls.lock().unwrap().push(Call {
            agent: agent.to_string(),
            input: input.to_string(),
            system_prompt: options.system_prompt.clone(),
            at: Instant::now(),
        });

        let mut reply = self.next_reply(agent);
        loop {
            reply = match reply {
                Reply::Echo => return AgentResponse::ok(input, 1),
                Reply::Ok(text) => return AgentResponse::ok(text, 1),
                Reply::Fail(error) => return AgentResponse::failed(error, 1),
                Reply::Gated(gate, next) => {
                    gate.acquire().await.expect("gate closed").forget();
                    *next
                }
                Reply::Delayed(delay, next) => {
                    tokio::time::sleep(delay).await;
                    *next
                }
            };
        }
    }
}

/// Poll `check` until it holds, panicking after two seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
