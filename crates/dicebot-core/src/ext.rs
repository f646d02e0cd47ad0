//! Extension handles and the default activation set for new contexts.

use dicebot_config::ExtensionConfig;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtInfo {
    pub name: String,
    pub version: String,
    pub author: String,
}

impl ExtInfo {
    pub fn new(name: &str, version: &str, author: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            author: author.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtDefaultSetting {
    pub name: String,
    pub auto_active: bool,
    pub priority: i64,
    /// `None` when the configured name has no registered extension.
    pub ext_item: Option<Arc<ExtInfo>>,
}

/// Extensions attached to a freshly created context: auto-active ones with a
/// registered handle, stable-sorted by priority.
pub fn initial_extensions(settings: &[ExtDefaultSetting]) -> Vec<Arc<ExtInfo>> {
    let mut ordered: Vec<&ExtDefaultSetting> = settings.iter().collect();
    ordered.sort_by_key(|s| s.priority);
    ordered
        .into_iter()
        .filter(|s| s.auto_active)
        .filter_map(|s| s.ext_item.clone())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ExtRegistry {
    exts: Vec<Arc<ExtInfo>>,
}

impl ExtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ext: ExtInfo) -> Arc<ExtInfo> {
        if let Some(existing) = self.get(&ext.name) {
            warn!("Extension '{}' registered twice, keeping the first", ext.name);
            return existing;
        }
        let ext = Arc::new(ext);
        self.exts.push(Arc::clone(&ext));
        ext
    }

    pub fn get(&self, name: &str) -> Option<Arc<ExtInfo>> {
        self.exts.iter().find(|e| e.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.exts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exts.is_empty()
    }

    /// Configured entries first, then every registered extension the config
    /// does not mention, auto-active and ordered after the configured ones.
    pub fn default_settings(&self, configured: &[ExtensionConfig]) -> Vec<ExtDefaultSetting> {
        let mut settings = Vec::with_capacity(configured.len() + self.exts.len());
        let mut seen = HashSet::new();

        for cfg in configured {
            let name = cfg.name.trim();
            let ext_item = self.get(name);
            if ext_item.is_none() {
                warn!("Configured extension '{}' is not registered", name);
            }
            seen.insert(name.to_string());
            settings.push(ExtDefaultSetting {
                name: name.to_string(),
                auto_active: cfg.auto_active,
                priority: cfg.priority,
                ext_item,
            });
        }

        let mut next_priority = configured.iter().map(|c| c.priority).max().unwrap_or(0);
        for ext in &self.exts {
            if seen.contains(&ext.name) {
                continue;
            }
            next_priority = next_priority.saturating_add(1);
            settings.push(ExtDefaultSetting {
                name: ext.name.clone(),
                auto_active: true,
                priority: next_priority,
                ext_item: Some(Arc::clone(ext)),
            });
        }

        settings
    }
}
