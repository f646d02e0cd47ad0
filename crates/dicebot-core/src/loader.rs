//! Variable loader capability: fills transient per-player/per-group views
//! from persistent storage.

use crate::player::GroupPlayerInfo;
use crate::session::GroupInfo;
use anyhow::Result;
use dicebot_storage::Storage;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait::async_trait]
pub trait VarLoader: Send + Sync {
    /// Must be idempotent; called on every observation of a player.
    async fn load_player_group_vars(&self, group: &GroupInfo, player: &GroupPlayerInfo)
        -> Result<()>;

    async fn save_player_group_vars(
        &self,
        _group: &GroupInfo,
        _player: &GroupPlayerInfo,
    ) -> Result<()> {
        Ok(())
    }
}

pub struct NoopVarLoader;

#[async_trait::async_trait]
impl VarLoader for NoopVarLoader {
    async fn load_player_group_vars(
        &self,
        _group: &GroupInfo,
        _player: &GroupPlayerInfo,
    ) -> Result<()> {
        Ok(())
    }
}

pub struct StorageVarLoader {
    storage: Arc<Mutex<Storage>>,
}

impl StorageVarLoader {
    pub fn new(storage: Arc<Mutex<Storage>>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl VarLoader for StorageVarLoader {
    async fn load_player_group_vars(
        &self,
        group: &GroupInfo,
        player: &GroupPlayerInfo,
    ) -> Result<()> {
        if group.vars_loaded() && player.vars_loaded() {
            return Ok(());
        }
        let storage = self.storage.lock().await;

        // Persisted values never clobber ones already set in memory.
        if !group.vars_loaded() {
            for (key, value) in storage.get_group_vars(group.group_id())? {
                group.value_map().entry(key).or_insert(value);
            }
            group.mark_vars_loaded();
        }
        if !player.vars_loaded() {
            for (key, value) in storage.get_player_vars(group.group_id(), player.user_id())? {
                player.value_map_temp().entry(key).or_insert(value);
            }
            player.mark_vars_loaded();
        }
        Ok(())
    }

    async fn save_player_group_vars(
        &self,
        group: &GroupInfo,
        player: &GroupPlayerInfo,
    ) -> Result<()> {
        let group_vars: Vec<(String, serde_json::Value)> = group
            .value_map()
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();
        let player_vars: Vec<(String, serde_json::Value)> = player
            .value_map_temp()
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();

        let storage = self.storage.lock().await;
        for (key, value) in &group_vars {
            storage.set_group_var(group.group_id(), key, value)?;
        }
        for (key, value) in &player_vars {
            storage.set_player_var(group.group_id(), player.user_id(), key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use serde_json::json;

    #[tokio::test]
    async fn storage_loader_populates_and_persists_vars() {
        let storage = Storage::in_memory().expect("storage");
        storage.set_group_var("1001", "mode", &json!("coc")).expect("set");
        storage
            .set_player_var("1001", "42", "hp", &json!(12))
            .expect("set");
        let loader = StorageVarLoader::new(Arc::new(Mutex::new(storage)));

        let session = Session::new(Vec::new(), 0);
        let group = session.activate("1001", "bot");
        let player = group.get_or_insert_player("42", "alice");
        player
            .value_map_temp()
            .insert("hp".to_string(), json!(3));

        loader
            .load_player_group_vars(&group, &player)
            .await
            .expect("load");
        assert_eq!(group.value_map().get("mode").map(|v| v.value().clone()), Some(json!("coc")));
        assert_eq!(player.value_map_temp().get("hp").map(|v| v.value().clone()), Some(json!(3)));

        player
            .value_map_temp()
            .insert("san".to_string(), json!(60));
        loader
            .save_player_group_vars(&group, &player)
            .await
            .expect("save");

        let storage = loader.storage.lock().await;
        let saved = storage.get_player_vars("1001", "42").expect("get");
        assert_eq!(saved["san"], json!(60));
        assert_eq!(saved["hp"], json!(3));
    }

    #[tokio::test]
    async fn storage_loader_is_idempotent() {
        let storage = Storage::in_memory().expect("storage");
        storage.set_group_var("g", "k", &json!(1)).expect("set");
        let loader = StorageVarLoader::new(Arc::new(Mutex::new(storage)));

        let session = Session::new(Vec::new(), 0);
        let group = session.activate("g", "bot");
        let player = group.get_or_insert_player("u", "n");
        loader.load_player_group_vars(&group, &player).await.expect("load");
        group.value_map().insert("k".to_string(), json!(2));
        loader.load_player_group_vars(&group, &player).await.expect("reload");
        assert_eq!(group.value_map().get("k").map(|v| v.value().clone()), Some(json!(2)));
    }
}
