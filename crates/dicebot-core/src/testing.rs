//! Shared fixtures for unit tests.

use crate::context::{Dice, EndPoint, MsgContext};
use crate::eval::VarEvaluator;
use crate::format::TemplateTable;
use crate::image::ImageSandbox;
use crate::loader::NoopVarLoader;
use crate::session::Session;
use crate::transport::Transport;
use anyhow::{anyhow, Result};
use dicebot_policy::PacingPolicy;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub to_group: bool,
    pub recipient: String,
    pub text: String,
    pub flag: String,
}

impl Sent {
    pub fn group(recipient: &str, text: &str, flag: &str) -> Self {
        Self {
            to_group: true,
            recipient: recipient.to_string(),
            text: text.to_string(),
            flag: flag.to_string(),
        }
    }

    pub fn person(recipient: &str, text: &str, flag: &str) -> Self {
        Self {
            to_group: false,
            ..Self::group(recipient, text, flag)
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<Sent>>>,
    fail_on: Option<String>,
    hang_on: Option<String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(text: &str) -> Self {
        Self {
            fail_on: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn hanging_on(text: &str) -> Self {
        Self {
            hang_on: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    async fn record(&self, sent: Sent) -> Result<()> {
        if self.hang_on.as_deref() == Some(sent.text.as_str()) {
            std::future::pending::<()>().await;
        }
        if self.fail_on.as_deref() == Some(sent.text.as_str()) {
            return Err(anyhow!("transport rejected {}", sent.text));
        }
        self.sent.lock().push(sent);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send_to_group(&self, group_id: &str, text: &str, flag: &str) -> Result<()> {
        self.record(Sent::group(group_id, text, flag)).await
    }

    async fn send_to_person(&self, user_id: &str, text: &str, flag: &str) -> Result<()> {
        self.record(Sent::person(user_id, text, flag)).await
    }
}

fn build_context(
    transport: RecordingTransport,
    platform: &str,
    templates: TemplateTable,
    sandbox: ImageSandbox,
    pacing: PacingPolicy,
) -> MsgContext {
    let dice = Dice {
        templates,
        evaluator: Arc::new(VarEvaluator),
        sandbox,
        pacing,
        var_loader: Arc::new(NoopVarLoader),
    };
    let endpoint = EndPoint::new(&format!("{}:10000", platform), platform, Arc::new(transport));
    MsgContext::new(
        Arc::new(dice),
        Arc::new(Session::new(Vec::new(), 0)),
        Arc::new(endpoint),
    )
}

fn scratch_sandbox() -> ImageSandbox {
    ImageSandbox::new(std::env::temp_dir()).expect("sandbox")
}

pub fn test_context(transport: RecordingTransport, platform: &str) -> MsgContext {
    build_context(
        transport,
        platform,
        TemplateTable::new(),
        scratch_sandbox(),
        PacingPolicy::disabled(),
    )
}

pub fn test_context_with_pacing(
    transport: RecordingTransport,
    platform: &str,
    pacing: PacingPolicy,
) -> MsgContext {
    build_context(transport, platform, TemplateTable::new(), scratch_sandbox(), pacing)
}

/// Context whose sandbox root is a fresh temp dir, returned alongside it.
pub fn test_context_with(
    transport: RecordingTransport,
    platform: &str,
    templates: TemplateTable,
) -> (tempfile::TempDir, MsgContext) {
    let dir = tempfile::tempdir().expect("tempdir");
    let sandbox = ImageSandbox::new(dir.path().to_path_buf()).expect("sandbox");
    let ctx = build_context(transport, platform, templates, sandbox, PacingPolicy::disabled());
    (dir, ctx)
}
