//! Common test utilities for integration tests.
//!
//! - proptest configuration preset
//! - scripted fakes for the agent and for outbound channels
//! - a throwaway workspace with a matching config
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use synward::agent::{AgentInvoker, AgentReply, InvocationContext, InvocationMetrics};
use synward::bus::Messenger;
use synward::config::Config;
use tempfile::TempDir;

/// Standard proptest configuration with 100 cases.
pub fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    }
}

/// One path segment: never `.`/`..`, never empty.
pub fn path_segment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-][a-zA-Z0-9_.-]{0,15}".prop_filter("dot segment", |s| s != "." && s != "..")
}

/// A fresh workspace directory and a config pointing at it.
pub fn workspace() -> (TempDir, Config) {
    let dir = TempDir::new().expect("tempdir");
    let cfg = Config {
        workspace: dir.path().display().to_string(),
        ..Config::default()
    };
    (dir, cfg)
}

/// Agent fake: replies with a fixed text (or fails), optionally after a delay,
/// and remembers every call.
pub struct ScriptedInvoker {
    reply: String,
    fail_with: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    contexts: Mutex<Vec<InvocationContext>>,
}

impl ScriptedInvoker {
    pub fn replying(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.into(),
            fail_with: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(error.into()),
            ..Self::plain()
        })
    }

    pub fn slow(reply: impl Into<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.into(),
            delay,
            ..Self::plain()
        })
    }

    fn plain() -> Self {
        Self {
            reply: String::new(),
            fail_with: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn contexts(&self) -> Vec<InvocationContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, ctx: &InvocationContext, prompt: &str) -> anyhow::Result<AgentReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.contexts.lock().unwrap().push(ctx.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = &self.fail_with {
            anyhow::bail!("{err}");
        }
        Ok(AgentReply {
            text: self.reply.clone(),
            metrics: InvocationMetrics {
                input_tokens: 120,
                output_tokens: 30,
            },
            tools_used: Vec::new(),
        })
    }
}

/// Channel fake that records what it was asked to send.
pub struct RecordingMessenger {
    channel: String,
    available: bool,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMessenger {
    pub fn new(channel: &str) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            available: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn unavailable(channel: &str) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            available: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// `(session_key, text)` pairs, in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Messenger for RecordingMessenger {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn send(&self, session_key: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((session_key.to_string(), text.to_string()));
        Ok(())
    }
}
