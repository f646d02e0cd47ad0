//! Dicebot Storage
//!
//! SQLite persistence for per-group and per-player variables

use anyhow::Result;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::path::Path;

pub type VarMap = HashMap<String, serde_json::Value>;

pub struct Storage {
    conn: rusqlite::Connection,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS group_vars (
                group_id TEXT NOT NULL,
                var_key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (group_id, var_key)
            );

            CREATE TABLE IF NOT EXISTS player_vars (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                var_key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (group_id, user_id, var_key)
            );
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn set_group_var(&self, group_id: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO group_vars (group_id, var_key, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id, var_key)
             DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            (group_id, key, serde_json::to_string(value)?),
        )?;
        Ok(())
    }

    pub fn get_group_var(&self, group_id: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM group_vars WHERE group_id = ?1 AND var_key = ?2")?;
        let raw: Option<String> = stmt
            .query_row([group_id, key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn get_group_vars(&self, group_id: &str) -> Result<VarMap> {
        let mut stmt = self
            .conn
            .prepare("SELECT var_key, value FROM group_vars WHERE group_id = ?1")?;
        let rows = stmt.query_map([group_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Self::collect_vars(rows)
    }

    pub fn set_player_var(
        &self,
        group_id: &str,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO player_vars (group_id, user_id, var_key, value)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id, user_id, var_key)
             DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            (group_id, user_id, key, serde_json::to_string(value)?),
        )?;
        Ok(())
    }

    pub fn get_player_vars(&self, group_id: &str, user_id: &str) -> Result<VarMap> {
        let mut stmt = self.conn.prepare(
            "SELECT var_key, value FROM player_vars WHERE group_id = ?1 AND user_id = ?2",
        )?;
        let rows = stmt.query_map([group_id, user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Self::collect_vars(rows)
    }

    pub fn delete_player_var(&self, group_id: &str, user_id: &str, key: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM player_vars WHERE group_id = ?1 AND user_id = ?2 AND var_key = ?3",
            (group_id, user_id, key),
        )?;
        Ok(changed > 0)
    }

    fn collect_vars<I>(rows: I) -> Result<VarMap>
    where
        I: Iterator<Item = rusqlite::Result<(String, String)>>,
    {
        let mut vars = VarMap::new();
        for row in rows {
            let (key, raw) = row?;
            vars.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(vars)
    }
}
