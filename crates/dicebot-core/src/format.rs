//! Template resolution and outbound text formatting.

use crate::context::MsgContext;
use crate::cq::{rewrite_bracket_images, rewrite_cq_images};
use dicebot_config::TemplatesConfig;
use rand::distributions::{Distribution, WeightedIndex};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

/// Canonical marker splitting one reply into several physical messages.
pub const SPLIT_SENTINEL: &str = "###SPLIT###";

static FORM_FEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\{formfeed\}").expect("valid form feed regex"));

pub fn unknown_template_placeholder(key: &str) -> String {
    format!("<%未知项-{}%>", key)
}

/// Weighted variants of one template entry.
#[derive(Debug, Clone)]
pub struct VariantPicker {
    variants: Vec<String>,
    weights: Option<WeightedIndex<u32>>,
}

impl VariantPicker {
    pub fn new(variants: Vec<(String, u32)>) -> Self {
        let weights = if variants.len() > 1 {
            WeightedIndex::new(variants.iter().map(|(_, w)| *w)).ok()
        } else {
            None
        };
        Self {
            variants: variants.into_iter().map(|(text, _)| text).collect(),
            weights,
        }
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn pick(&self) -> &str {
        let index = match &self.weights {
            Some(dist) => dist.sample(&mut rand::thread_rng()),
            None => 0,
        };
        self.variants.get(index).map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemplateTable {
    entries: HashMap<String, VariantPicker>,
}

impl TemplateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &TemplatesConfig) -> Self {
        let mut table = Self::new();
        for (key, variants) in &config.entries {
            table.insert(
                key,
                variants
                    .iter()
                    .map(|v| (v.text().to_string(), v.weight()))
                    .collect(),
            );
        }
        table
    }

    pub fn insert(&mut self, key: &str, variants: Vec<(String, u32)>) {
        if variants.is_empty() {
            return;
        }
        self.entries
            .insert(key.to_string(), VariantPicker::new(variants));
    }

    pub fn lookup(&self, key: &str) -> Option<&VariantPicker> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rewrite every known split alias to [`SPLIT_SENTINEL`].
pub fn normalize_split(text: &str) -> String {
    let text = text.replace("#{SPLIT}", SPLIT_SENTINEL);
    FORM_FEED_RE.replace_all(&text, SPLIT_SENTINEL).into_owned()
}

/// Resolve `key` in the template table and format the chosen variant.
pub fn render_template(ctx: &MsgContext, key: &str) -> String {
    let text = match ctx.dice.templates.lookup(key) {
        Some(picker) => picker.pick().to_string(),
        None => {
            debug!("Unknown template key {}", key);
            unknown_template_placeholder(key)
        }
    };
    render_text(ctx, &text)
}

/// Normalize split aliases, expand expressions, unescape `\n`, then run the
/// image and CQ sandboxing passes.
pub fn render_text(ctx: &MsgContext, text: &str) -> String {
    let text = normalize_split(text);
    let evaluated = ctx.dice.evaluator.evaluate(&text, ctx);
    for diagnostic in &evaluated.diagnostics {
        debug!("Expression diagnostic: {}", diagnostic);
    }
    let text = evaluated.text.replace("\\n", "\n");
    let text = rewrite_bracket_images(&text, &ctx.dice.sandbox);
    rewrite_cq_images(&text, &ctx.dice.sandbox)
}
