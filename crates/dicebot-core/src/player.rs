//! Per-context player records.

use crate::context::MsgContext;
use crate::session::{private_group_id, GroupInfo};
use dashmap::DashMap;
use dicebot_ipc::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug)]
pub struct GroupPlayerInfo {
    name: String,
    user_id: String,
    in_group: AtomicBool,
    value_map_temp: DashMap<String, serde_json::Value>,
    vars_loaded: AtomicBool,
}

impl GroupPlayerInfo {
    pub fn new(user_id: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            user_id: user_id.to_string(),
            in_group: AtomicBool::new(true),
            value_map_temp: DashMap::new(),
            vars_loaded: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn in_group(&self) -> bool {
        self.in_group.load(Ordering::Acquire)
    }

    pub fn set_in_group(&self, in_group: bool) {
        self.in_group.store(in_group, Ordering::Release);
    }

    /// Transient variables for this player in its context.
    pub fn value_map_temp(&self) -> &DashMap<String, serde_json::Value> {
        &self.value_map_temp
    }

    pub fn vars_loaded(&self) -> bool {
        self.vars_loaded.load(Ordering::Acquire)
    }

    pub fn mark_vars_loaded(&self) {
        self.vars_loaded.store(true, Ordering::Release);
    }
}

impl GroupInfo {
    pub fn player(&self, user_id: &str) -> Option<Arc<GroupPlayerInfo>> {
        self.state.lock().players.get(user_id).cloned()
    }

    pub fn player_count(&self) -> usize {
        self.state.lock().players.len()
    }

    /// Look up the player, creating it on first sight; membership is forced on.
    pub fn get_or_insert_player(&self, user_id: &str, nickname: &str) -> Arc<GroupPlayerInfo> {
        let player = {
            let mut state = self.state.lock();
            Arc::clone(
                state
                    .players
                    .entry(user_id.to_string())
                    .or_insert_with(|| Arc::new(GroupPlayerInfo::new(user_id, nickname))),
            )
        };
        player.set_in_group(true);
        player
    }
}

/// Resolve the context and player for `msg`.
///
/// Private messages auto-activate their synthetic context. Group messages
/// never create a context, so an unactivated group yields `None`.
pub async fn get_player_info_by_sender(
    ctx: &MsgContext,
    msg: &Message,
) -> Option<(Arc<GroupInfo>, Arc<GroupPlayerInfo>)> {
    let group = if msg.is_group() {
        ctx.session.group(&msg.group_id)?
    } else {
        let group_id = private_group_id(&msg.sender.user_id);
        ctx.session.activate(&group_id, &ctx.endpoint.user_id)
    };

    let player = group.get_or_insert_player(&msg.sender.user_id, &msg.sender.nickname);

    if let Err(e) = ctx
        .dice
        .var_loader
        .load_player_group_vars(&group, &player)
        .await
    {
        warn!(
            "Failed to load vars for {} in {}: {}",
            player.user_id(),
            group.group_id(),
            e
        );
    }

    Some((group, player))
}
