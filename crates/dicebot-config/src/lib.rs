//! Dicebot Configuration
//!
//! TOML configuration loading for sessions, pacing, extensions and reply templates

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
    #[serde(default)]
    pub templates: TemplatesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
    /// Directory local image references must stay inside. Process cwd when unset.
    pub sandbox_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub default_coc_rule_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_pacing_platforms")]
    pub platforms: Vec<String>,
    #[serde(default = "default_delay_min_secs")]
    pub delay_min_secs: f64,
    #[serde(default = "default_delay_max_secs")]
    pub delay_max_secs: f64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            platforms: default_pacing_platforms(),
            delay_min_secs: default_delay_min_secs(),
            delay_max_secs: default_delay_max_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub auto_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplatesConfig {
    /// Extra TOML file holding `key = [variants]` pairs, merged under `entries`.
    pub file: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<TemplateVariant>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TemplateVariant {
    Plain(String),
    Weighted {
        text: String,
        #[serde(default = "default_weight")]
        weight: u32,
    },
}

impl TemplateVariant {
    pub fn text(&self) -> &str {
        match self {
            Self::Plain(text) => text,
            Self::Weighted { text, .. } => text,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            Self::Plain(_) => default_weight(),
            Self::Weighted { weight, .. } => *weight,
        }
    }
}

/// Upper bound for pacing delays, in seconds.
pub const MAX_PACING_DELAY_SECS: f64 = 3600.0;

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_pacing_platforms() -> Vec<String> {
    vec!["QQ".to_string()]
}

fn default_delay_min_secs() -> f64 {
    0.4
}

fn default_delay_max_secs() -> f64 {
    0.9
}

fn default_send_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.merge_template_file(path.parent())?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dicebot").join("config.toml"))
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        match self.core.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
            _ => dirs::data_dir().map(|dir| dir.join("dicebot")),
        }
    }

    /// Entries declared inline win over the ones coming from `templates.file`.
    fn merge_template_file(&mut self, base_dir: Option<&Path>) -> anyhow::Result<()> {
        let Some(file) = self.templates.file.as_deref() else {
            return Ok(());
        };
        let mut path = PathBuf::from(file);
        if path.is_relative() {
            if let Some(base) = base_dir {
                path = base.join(path);
            }
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read templates file {}: {}", path.display(), e))?;
        let extra: BTreeMap<String, Vec<TemplateVariant>> = toml::from_str(&content)?;
        for (key, variants) in extra {
            self.templates.entries.entry(key).or_insert(variants);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut ext_names = HashSet::new();
        for ext in &self.extensions {
            let name = ext.name.trim();
            if name.is_empty() {
                anyhow::bail!("Extension name cannot be empty");
            }
            if !ext_names.insert(name.to_string()) {
                anyhow::bail!("Duplicate extension '{}'", name);
            }
        }

        let pacing = &self.pacing;
        if !pacing.delay_min_secs.is_finite() || pacing.delay_min_secs < 0.0 {
            anyhow::bail!("pacing.delay_min_secs must be >= 0");
        }
        if !pacing.delay_max_secs.is_finite() || pacing.delay_max_secs < pacing.delay_min_secs {
            anyhow::bail!("pacing.delay_max_secs must be >= pacing.delay_min_secs");
        }
        if pacing.delay_max_secs > MAX_PACING_DELAY_SECS {
            anyhow::bail!(
                "pacing.delay_max_secs must be <= {}",
                MAX_PACING_DELAY_SECS
            );
        }
        if pacing.send_timeout_secs == 0 {
            anyhow::bail!("pacing.send_timeout_secs must be > 0");
        }
        if pacing.platforms.iter().any(|p| p.trim().is_empty()) {
            anyhow::bail!("pacing.platforms contains an empty platform name");
        }

        for (key, variants) in &self.templates.entries {
            if key.trim().is_empty() {
                anyhow::bail!("Template key cannot be empty");
            }
            if variants.is_empty() {
                anyhow::bail!("Template '{}' has no variants", key);
            }
            if variants.iter().any(|v| v.weight() == 0) {
                anyhow::bail!("Template '{}' has a variant with weight 0", key);
            }
        }

        Ok(())
    }
}
