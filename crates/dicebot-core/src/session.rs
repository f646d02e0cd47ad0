//! Group/session activation state.
//!
//! A context is `Absent` until the first [`Session::activate`] for its key,
//! then flips between inactive and active as bot instances join or leave.
//! `active` always equals `!active_dice_ids.is_empty()`.

use crate::ext::{initial_extensions, ExtDefaultSetting, ExtInfo, ExtRegistry};
use crate::player::GroupPlayerInfo;
use dashmap::DashMap;
use dicebot_config::Config;
use dicebot_ipc::MessageType;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Key prefix of the synthetic context backing a one-to-one conversation.
pub const PRIVATE_GROUP_PREFIX: &str = "PG-";

pub fn private_group_id(user_id: &str) -> String {
    format!("{}{}", PRIVATE_GROUP_PREFIX, user_id)
}

pub fn is_private_group_id(group_id: &str) -> bool {
    group_id.starts_with(PRIVATE_GROUP_PREFIX)
}

#[derive(Debug, Default)]
pub(crate) struct GroupState {
    pub(crate) active: bool,
    pub(crate) active_dice_ids: HashSet<String>,
    pub(crate) players: HashMap<String, Arc<GroupPlayerInfo>>,
    pub(crate) activated_ext_list: Vec<Arc<ExtInfo>>,
    pub(crate) bot_list: HashSet<String>,
    pub(crate) not_in_group: bool,
    pub(crate) coc_rule_index: i64,
}

#[derive(Debug)]
pub struct GroupInfo {
    group_id: String,
    pub(crate) state: Mutex<GroupState>,
    value_map: DashMap<String, serde_json::Value>,
    vars_loaded: AtomicBool,
}

impl GroupInfo {
    fn new(group_id: &str, extensions: Vec<Arc<ExtInfo>>, coc_rule_index: i64) -> Self {
        Self {
            group_id: group_id.to_string(),
            state: Mutex::new(GroupState {
                active: true,
                activated_ext_list: extensions,
                coc_rule_index,
                ..GroupState::default()
            }),
            value_map: DashMap::new(),
            vars_loaded: AtomicBool::new(false),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn is_private(&self) -> bool {
        is_private_group_id(&self.group_id)
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn is_dice_active(&self, dice_id: &str) -> bool {
        self.state.lock().active_dice_ids.contains(dice_id)
    }

    pub fn active_dice_ids(&self) -> HashSet<String> {
        self.state.lock().active_dice_ids.clone()
    }

    pub fn activated_extensions(&self) -> Vec<Arc<ExtInfo>> {
        self.state.lock().activated_ext_list.clone()
    }

    pub fn is_ext_active(&self, name: &str) -> bool {
        self.state
            .lock()
            .activated_ext_list
            .iter()
            .any(|e| e.name == name)
    }

    pub fn not_in_group(&self) -> bool {
        self.state.lock().not_in_group
    }

    /// Set when the platform reports the bot was removed from the group.
    pub fn mark_not_in_group(&self) {
        self.state.lock().not_in_group = true;
    }

    pub fn add_bot(&self, bot_id: &str) {
        self.state.lock().bot_list.insert(bot_id.to_string());
    }

    pub fn is_bot(&self, user_id: &str) -> bool {
        self.state.lock().bot_list.contains(user_id)
    }

    pub fn coc_rule_index(&self) -> i64 {
        self.state.lock().coc_rule_index
    }

    pub fn set_coc_rule_index(&self, index: i64) {
        self.state.lock().coc_rule_index = index;
    }

    pub fn value_map(&self) -> &DashMap<String, serde_json::Value> {
        &self.value_map
    }

    pub fn vars_loaded(&self) -> bool {
        self.vars_loaded.load(Ordering::Acquire)
    }

    pub fn mark_vars_loaded(&self) {
        self.vars_loaded.store(true, Ordering::Release);
    }
}

/// Process-wide registry of contexts for one running bot.
#[derive(Debug)]
pub struct Session {
    groups: DashMap<String, Arc<GroupInfo>>,
    ext_defaults: Vec<ExtDefaultSetting>,
    default_coc_rule_index: i64,
}

impl Session {
    pub fn new(ext_defaults: Vec<ExtDefaultSetting>, default_coc_rule_index: i64) -> Self {
        Self {
            groups: DashMap::new(),
            ext_defaults,
            default_coc_rule_index,
        }
    }

    pub fn from_config(config: &Config, registry: &ExtRegistry) -> Self {
        Self::new(
            registry.default_settings(&config.extensions),
            config.session.default_coc_rule_index,
        )
    }

    pub fn group(&self, group_id: &str) -> Option<Arc<GroupInfo>> {
        self.groups.get(group_id).map(|g| Arc::clone(g.value()))
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Engage `dice_id` in `group_id`, creating the context on first use.
    pub fn activate(&self, group_id: &str, dice_id: &str) -> Arc<GroupInfo> {
        let group = Arc::clone(
            self.groups
                .entry(group_id.to_string())
                .or_insert_with(|| {
                    let extensions = initial_extensions(&self.ext_defaults);
                    debug!(
                        "Creating context {} with {} extension(s)",
                        group_id,
                        extensions.len()
                    );
                    Arc::new(GroupInfo::new(
                        group_id,
                        extensions,
                        self.default_coc_rule_index,
                    ))
                })
                .value(),
        );

        {
            let mut state = group.state.lock();
            state.active_dice_ids.insert(dice_id.to_string());
            state.active = true;
            state.not_in_group = false;
        }
        debug!("Bot {} on at {}", dice_id, group_id);
        group
    }

    /// Disengage `dice_id`. The record is kept even when nobody is left.
    pub fn deactivate(&self, group_id: &str, dice_id: &str) {
        let Some(group) = self.group(group_id) else {
            return;
        };
        let mut state = group.state.lock();
        state.active_dice_ids.remove(dice_id);
        if state.active_dice_ids.is_empty() {
            state.active = false;
        }
        debug!(
            "Bot {} off at {} ({} remaining)",
            dice_id,
            group_id,
            state.active_dice_ids.len()
        );
    }

    /// Only meaningful for group messages; private messages are never gated here.
    pub fn is_engaged(&self, group_id: &str, dice_id: &str, message_type: MessageType) -> bool {
        message_type == MessageType::Group
            && self
                .group(group_id)
                .is_some_and(|group| group.is_dice_active(dice_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_exts() -> Session {
        let ext = |name: &str, priority: i64, auto_active: bool| ExtDefaultSetting {
            name: name.to_string(),
            auto_active,
            priority,
            ext_item: Some(Arc::new(ExtInfo::new(name, "1.0.0", "test"))),
        };
        Session::new(
            vec![ext("story", 2, true), ext("coc7", 1, true), ext("deck", 0, false)],
            3,
        )
    }

    fn assert_invariant(group: &GroupInfo) {
        let state = group.state.lock();
        assert_eq!(state.active, !state.active_dice_ids.is_empty());
    }

    #[test]
    fn activate_creates_context_with_sorted_auto_extensions() {
        let session = session_with_exts();
        let group = session.activate("1001", "QQ:10");
        assert!(group.is_active());
        assert!(group.is_dice_active("QQ:10"));
        assert_eq!(group.coc_rule_index(), 3);
        let names: Vec<String> = group
            .activated_extensions()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, vec!["coc7", "story"]);
    }

    #[test]
    fn activate_is_idempotent_and_clears_not_in_group() {
        let session = session_with_exts();
        let group = session.activate("1001", "QQ:10");
        group.mark_not_in_group();
        let again = session.activate("1001", "QQ:10");
        assert!(Arc::ptr_eq(&group, &again));
        assert_eq!(again.active_dice_ids().len(), 1);
        assert!(!again.not_in_group());
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn deactivate_last_instance_keeps_record_and_players() {
        let session = session_with_exts();
        let group = session.activate("1001", "QQ:10");
        group.get_or_insert_player("u1", "alice");
        session.deactivate("1001", "QQ:10");

        let group = session.group("1001").expect("record retained");
        assert!(!group.is_active());
        assert!(group.active_dice_ids().is_empty());
        assert!(group.player("u1").is_some());
        assert_invariant(&group);
    }

    #[test]
    fn deactivate_one_of_two_keeps_active() {
        let session = session_with_exts();
        session.activate("1001", "QQ:10");
        session.activate("1001", "QQ:11");
        session.deactivate("1001", "QQ:10");
        let group = session.group("1001").expect("group");
        assert!(group.is_active());
        assert!(group.is_dice_active("QQ:11"));
        assert!(!group.is_dice_active("QQ:10"));
    }

    #[test]
    fn deactivate_absent_context_is_noop() {
        let session = session_with_exts();
        session.deactivate("nope", "QQ:10");
        assert!(session.is_empty());
    }

    #[test]
    fn invariant_holds_over_mixed_sequence() {
        let session = session_with_exts();
        let ops: [(bool, &str); 8] = [
            (true, "a"),
            (true, "b"),
            (false, "a"),
            (false, "c"),
            (false, "b"),
            (true, "c"),
            (false, "c"),
            (false, "c"),
        ];
        for (on, id) in ops {
            if on {
                session.activate("g", id);
            } else {
                session.deactivate("g", id);
            }
            assert_invariant(&session.group("g").expect("group"));
        }
        assert!(!session.group("g").expect("group").is_active());
    }

    #[test]
    fn is_engaged_requires_group_message_and_membership() {
        let session = session_with_exts();
        session.activate("1001", "QQ:10");
        assert!(session.is_engaged("1001", "QQ:10", MessageType::Group));
        assert!(!session.is_engaged("1001", "QQ:11", MessageType::Group));
        assert!(!session.is_engaged("1001", "QQ:10", MessageType::Private));
        assert!(!session.is_engaged("2002", "QQ:10", MessageType::Group));
        session.deactivate("1001", "QQ:10");
        assert!(!session.is_engaged("1001", "QQ:10", MessageType::Group));
    }

    #[test]
    fn private_group_ids_use_reserved_prefix() {
        assert_eq!(private_group_id("42"), "PG-42");
        assert!(is_private_group_id("PG-42"));
        assert!(!is_private_group_id("42"));
    }

    #[test]
    fn concurrent_activate_with_distinct_ids_loses_no_updates() {
        let session = Arc::new(session_with_exts());
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || {
                    session.activate("shared", &format!("bot-{}", i));
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        let group = session.group("shared").expect("group");
        assert_eq!(group.active_dice_ids().len(), 32);
        assert_eq!(session.len(), 1);
        assert_invariant(&group);
    }
}
