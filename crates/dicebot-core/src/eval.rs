//! Expression evaluator capability.

use crate::context::MsgContext;
use regex::{Captures, Regex};
use std::sync::LazyLock;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalOutput {
    pub text: String,
    pub diagnostics: Vec<String>,
}

/// Expands embedded expressions. Best effort: always returns text, problems
/// go into `diagnostics`.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, text: &str, ctx: &MsgContext) -> EvalOutput;
}

static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}\s]+)\}").expect("valid variable regex"));

/// Replaces `{name}` with player variables, then context variables.
/// `{$tName}` is the sender's display name. Unknown names stay as written.
pub struct VarEvaluator;

impl Evaluator for VarEvaluator {
    fn evaluate(&self, text: &str, ctx: &MsgContext) -> EvalOutput {
        let mut diagnostics = Vec::new();
        let out = VAR_RE.replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            if name == "$tName" {
                if let Some(player) = &ctx.player {
                    return player.name().to_string();
                }
            }
            let value = ctx
                .player
                .as_ref()
                .and_then(|p| p.value_map_temp().get(name).map(|v| v.value().clone()))
                .or_else(|| {
                    ctx.group
                        .as_ref()
                        .and_then(|g| g.value_map().get(name).map(|v| v.value().clone()))
                });
            match value {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => {
                    diagnostics.push(format!("unknown variable: {}", name));
                    caps[0].to_string()
                }
            }
        });
        EvalOutput {
            text: out.into_owned(),
            diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, RecordingTransport};
    use serde_json::json;

    #[test]
    fn expands_player_then_group_vars() {
        let mut ctx = test_context(RecordingTransport::new(), "QQ");
        let group = ctx.session.activate("1001", "bot");
        let player = group.get_or_insert_player("42", "alice");
        group.value_map().insert("hp".to_string(), json!(99));
        group.value_map().insert("rule".to_string(), json!("coc7"));
        player.value_map_temp().insert("hp".to_string(), json!(12));
        ctx.group = Some(group);
        ctx.player = Some(player);

        let out = VarEvaluator.evaluate("{$tName}: hp={hp} rule={rule} {nope}", &ctx);
        assert_eq!(out.text, "alice: hp=12 rule=coc7 {nope}");
        assert_eq!(out.diagnostics, vec!["unknown variable: nope".to_string()]);
    }

    #[test]
    fn leaves_text_without_context_untouched() {
        let ctx = test_context(RecordingTransport::new(), "QQ");
        let out = VarEvaluator.evaluate("plain {x} text", &ctx);
        assert_eq!(out.text, "plain {x} text");
    }
}
