use crate::eval::{Evaluator, VarEvaluator};
use crate::format::TemplateTable;
use crate::image::ImageSandbox;
use crate::loader::VarLoader;
use crate::player::GroupPlayerInfo;
use crate::session::{GroupInfo, Session};
use crate::transport::Transport;
use anyhow::Result;
use dicebot_config::Config;
use dicebot_policy::PacingPolicy;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared, read-mostly services used while handling any message.
pub struct Dice {
    pub templates: TemplateTable,
    pub evaluator: Arc<dyn Evaluator>,
    pub sandbox: ImageSandbox,
    pub pacing: PacingPolicy,
    pub var_loader: Arc<dyn VarLoader>,
}

impl Dice {
    pub fn from_config(config: &Config, var_loader: Arc<dyn VarLoader>) -> Result<Self> {
        let sandbox = match config.core.sandbox_root.as_deref().map(str::trim) {
            Some(root) if !root.is_empty() => ImageSandbox::new(PathBuf::from(root))?,
            _ => ImageSandbox::from_current_dir()?,
        };

        Ok(Self {
            templates: TemplateTable::from_config(&config.templates),
            evaluator: Arc::new(VarEvaluator),
            sandbox,
            pacing: PacingPolicy::new(Some(&config.pacing)),
            var_loader,
        })
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
}

/// One connected bot account on one platform.
pub struct EndPoint {
    /// Bot instance id, e.g. `QQ:12345`.
    pub user_id: String,
    pub platform: String,
    pub transport: Arc<dyn Transport>,
}

impl EndPoint {
    pub fn new(user_id: &str, platform: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            transport,
        }
    }
}

#[derive(Clone)]
pub struct MsgContext {
    pub dice: Arc<Dice>,
    pub session: Arc<Session>,
    pub endpoint: Arc<EndPoint>,
    pub group: Option<Arc<GroupInfo>>,
    pub player: Option<Arc<GroupPlayerInfo>>,
    /// Whether this bot instance listens in the message's context.
    pub engaged: bool,
}

impl MsgContext {
    pub fn new(dice: Arc<Dice>, session: Arc<Session>, endpoint: Arc<EndPoint>) -> Self {
        Self {
            dice,
            session,
            endpoint,
            group: None,
            player: None,
            engaged: false,
        }
    }
}

pub fn format_dice_id(platform: &str, id: impl Display, is_group: bool) -> String {
    if is_group {
        format!("{}-Group:{}", platform, id)
    } else {
        format!("{}:{}", platform, id)
    }
}
