//! Dicebot Core
//!
//! Group activation, player registry, reply formatting and outbound dispatch

pub mod context;
pub mod cq;
pub mod dispatch;
pub mod eval;
pub mod ext;
pub mod format;
pub mod image;
pub mod loader;
pub mod player;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use context::{format_dice_id, Dice, EndPoint, MsgContext};
pub use ext::{ExtInfo, ExtRegistry};
pub use loader::{NoopVarLoader, StorageVarLoader, VarLoader};
pub use session::{GroupInfo, Session};
pub use transport::{BusTransport, Transport};

use anyhow::Result;
use dicebot_config::Config;
use dicebot_ipc::{EventBus, Message};
use player::get_player_info_by_sender;
use session::private_group_id;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{error, info, warn};

const MAX_INBOUND_CONCURRENCY: usize = 8;

/// What a command handler wants sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Template key resolved through the template table.
    Template(String),
    /// Raw text, still formatted and sandboxed.
    Text(String),
}

#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// `ctx.group`/`ctx.player` are `None` for group messages in contexts
    /// that were never activated.
    async fn handle(&self, ctx: &MsgContext, msg: &Message) -> Result<Option<Reply>>;
}

pub struct DiceRuntime {
    dice: Arc<Dice>,
    session: Arc<Session>,
    endpoint: Arc<EndPoint>,
    handler: Arc<dyn CommandHandler>,
    event_bus: EventBus,
}

impl DiceRuntime {
    pub fn new(
        config: &Config,
        registry: &ExtRegistry,
        endpoint: EndPoint,
        handler: Arc<dyn CommandHandler>,
        var_loader: Arc<dyn VarLoader>,
    ) -> Result<Self> {
        Ok(Self {
            dice: Arc::new(Dice::from_config(config, var_loader)?),
            session: Arc::new(Session::from_config(config, registry)),
            endpoint: Arc::new(endpoint),
            handler,
            event_bus: EventBus::new(),
        })
    }

    pub fn with_dice(mut self, dice: Dice) -> Self {
        self.dice = Arc::new(dice);
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn dice(&self) -> &Arc<Dice> {
        &self.dice
    }

    pub fn context(&self) -> MsgContext {
        MsgContext::new(
            Arc::clone(&self.dice),
            Arc::clone(&self.session),
            Arc::clone(&self.endpoint),
        )
    }

    fn scope_key(msg: &Message) -> String {
        if msg.is_group() {
            msg.group_id.clone()
        } else {
            private_group_id(&msg.sender.user_id)
        }
    }

    /// Resolve context and player, run the handler and render its reply.
    /// Player vars are saved before returning; nothing is sent yet.
    pub async fn prepare_reply(&self, msg: Message) -> Result<Option<PreparedReply>> {
        let mut ctx = self.context();
        ctx.engaged = !msg.is_group()
            || self
                .session
                .is_engaged(&msg.group_id, &self.endpoint.user_id, msg.message_type);

        if let Some((group, player)) = get_player_info_by_sender(&ctx, &msg).await {
            ctx.group = Some(group);
            ctx.player = Some(player);
        }

        let text = match self.handler.handle(&ctx, &msg).await? {
            Some(Reply::Template(key)) => format::render_template(&ctx, &key),
            Some(Reply::Text(text)) => format::render_text(&ctx, &text),
            None => return Ok(None),
        };

        if let (Some(group), Some(player)) = (&ctx.group, &ctx.player) {
            if let Err(e) = self
                .dice
                .var_loader
                .save_player_group_vars(group, player)
                .await
            {
                warn!(
                    "Failed to save vars for {} in {}: {}",
                    player.user_id(),
                    group.group_id(),
                    e
                );
            }
        }
        Ok(Some(PreparedReply { ctx, msg, text }))
    }

    pub async fn handle_message(&self, msg: Message) -> Result<()> {
        if let Some(reply) = self.prepare_reply(msg).await? {
            reply.send().await;
        }
        Ok(())
    }

    /// Consume inbound messages from the event bus until it closes.
    ///
    /// Preparing a reply holds the context's lock and an inbound permit;
    /// sending (and its pacing delay) runs after both are released.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "Dice runtime starting as {} on {}",
            self.endpoint.user_id, self.endpoint.platform
        );

        let mut inbound_rx = self.event_bus.subscribe();
        let semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY));
        let scope_locks = Arc::new(ScopeLocks::default());

        loop {
            match inbound_rx.recv().await {
                Ok(msg) => {
                    let runtime = Arc::clone(&self);
                    let semaphore = Arc::clone(&semaphore);
                    let scope_locks = Arc::clone(&scope_locks);
                    let scope_key = Self::scope_key(&msg);
                    let trace_id = msg.trace_id.clone();

                    tokio::spawn(async move {
                        let scope_lock = scope_locks.acquire(&scope_key).await;
                        let prepared = {
                            let _scope_guard = scope_lock.lock().await;
                            match semaphore.acquire().await {
                                Ok(_permit) => runtime.prepare_reply(msg).await,
                                Err(err) => Err(anyhow::anyhow!(
                                    "inbound worker semaphore closed: {}",
                                    err
                                )),
                            }
                        };
                        scope_locks.release(&scope_key, scope_lock).await;

                        match prepared {
                            Ok(Some(reply)) => reply.send().await,
                            Ok(None) => {}
                            Err(e) => error!(
                                "Error processing inbound message (trace_id={}): {}",
                                trace_id, e
                            ),
                        }
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping message processor");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} messages", n);
                }
            }
        }
        Ok(())
    }
}

/// A rendered reply bound to the context it answers.
pub struct PreparedReply {
    ctx: MsgContext,
    msg: Message,
    text: String,
}

impl PreparedReply {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub async fn send(self) {
        dispatch::reply_to_sender(&self.ctx, &self.msg, &self.text).await;
    }
}

/// Per-context locks, dropped once no task holds or waits on them.
#[derive(Default)]
struct ScopeLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    async fn acquire(&self, scope_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(scope_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn release(&self, scope_key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks
            .get(scope_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(scope_key);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
