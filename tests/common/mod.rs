//! Shared stubs for the integration tests: a scripted model and a scripted shell.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use worker_swarm::Swarm;
use worker_swarm::config::SwarmConfig;
use worker_swarm::error::{LlmError, ShellError};
use worker_swarm::llm::{ChatMessage, LlmProvider};
use worker_swarm::tools::{CommandResult, CommandRunner};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("test timed out")
}

/// Replies from a queue; once the queue runs dry the last reply repeats.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    fail: bool,
    gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
    pub conversations: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self::build(replies, false, None))
    }

    pub fn repeating(reply: &str) -> Arc<Self> {
        Self::new([reply])
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::build(Vec::<String>::new(), true, None))
    }

    /// Each reply waits for `gate` to be notified.
    pub fn gated(reply: &str, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self::build([reply], false, Some(gate)))
    }

    fn build<I, S>(replies: I, fail: bool, gate: Option<Arc<Notify>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new(String::new()),
            fail,
            gate,
            calls: AtomicUsize::new(0),
            conversations: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn conversation(&self, call: usize) -> Vec<ChatMessage> {
        self.conversations.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }

    async fn invoke(&self, _system_prompt: &str, turns: &[ChatMessage]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.conversations.lock().unwrap().push(turns.to_vec());

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(LlmError::RequestFailed {
                provider: "scripted".to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(reply) = next {
            *last = reply;
        }
        Ok(last.clone())
    }
}

type Script = Box<dyn Fn(&str) -> CommandResult + Send + Sync>;

/// Shell stand-in: answers from a closure and records every command.
pub struct ScriptedRunner {
    script: Script,
    pub ran: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&str) -> CommandResult + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            ran: Mutex::new(Vec::new()),
        })
    }

    /// Every command exits 0 with `output`.
    pub fn succeeding(output: &'static str) -> Arc<Self> {
        Self::new(move |_| CommandResult::exited(0, output))
    }

    pub fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.ran().iter().filter(|c| c.as_str() == command).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> Result<CommandResult, ShellError> {
        self.ran.lock().unwrap().push(command.to_string());
        Ok((self.script)(command))
    }
}

pub fn config(root: &Path) -> SwarmConfig {
    SwarmConfig::default().with_project_root(root)
}

/// A swarm rooted in a fresh temp dir using the given shell stand-in.
pub fn swarm_with(runner: Arc<ScriptedRunner>) -> (TempDir, Arc<Swarm>) {
    let dir = TempDir::new().unwrap();
    let swarm = Swarm::builder(config(dir.path())).with_runner(runner).build();
    (dir, Arc::new(swarm))
}
