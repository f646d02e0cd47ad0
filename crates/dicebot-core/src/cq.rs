//! CQ command model and the two image rewrite passes.

use crate::image::{
    ImageSandbox, SandboxOutcome, CQ_IMAGE_FORBIDDEN, IMAGE_FORBIDDEN, IMAGE_NOT_FOUND,
};
use regex::{Captures, Regex};
use std::sync::LazyLock;
use thiserror::Error;
use url::Url;

static CQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[CQ:[^\]]*\]").expect("valid CQ regex"));

static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(img|图):(.+?)\]").expect("valid image regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CqParseError {
    #[error("not a CQ directive")]
    NotCq,
    #[error("CQ directive has no type")]
    MissingType,
    #[error("CQ argument '{0}' has no value")]
    MalformedArg(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqCommand {
    pub kind: String,
    /// Arguments in source order.
    pub args: Vec<(String, String)>,
    /// When set, replaces the whole rendered directive.
    pub overwrite: Option<String>,
}

fn escape_arg(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('[', "&#91;")
        .replace(']', "&#93;")
        .replace(',', "&#44;")
}

fn unescape_arg(value: &str) -> String {
    value
        .replace("&#44;", ",")
        .replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&amp;", "&")
}

impl CqCommand {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            args: Vec::new(),
            overwrite: None,
        }
    }

    pub fn image(file: &str) -> Self {
        Self::new("image").with_arg("file", file)
    }

    pub fn with_arg(mut self, key: &str, value: &str) -> Self {
        self.set_arg(key, value);
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_arg(&mut self, key: &str, value: &str) {
        match self.args.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.args.push((key.to_string(), value.to_string())),
        }
    }

    /// Parse one `[CQ:type,key=value,...]` directive.
    pub fn parse(text: &str) -> Result<Self, CqParseError> {
        let inner = text
            .strip_prefix("[CQ:")
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or(CqParseError::NotCq)?;

        let mut parts = inner.split(',');
        let kind = parts.next().map(str::trim).unwrap_or_default();
        if kind.is_empty() {
            return Err(CqParseError::MissingType);
        }

        let mut cmd = Self::new(kind);
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CqParseError::MalformedArg(part.to_string()))?;
            // A repeated key overrides the earlier value.
            cmd.set_arg(key.trim(), &unescape_arg(value));
        }
        Ok(cmd)
    }

    pub fn compile(&self) -> String {
        if let Some(overwrite) = &self.overwrite {
            return overwrite.clone();
        }
        let mut out = format!("[CQ:{}", self.kind);
        for (key, value) in &self.args {
            out.push(',');
            out.push_str(key);
            out.push('=');
            out.push_str(&escape_arg(value));
        }
        out.push(']');
        out
    }
}

/// Apply `solve` to every parseable CQ directive in `text`. Directives that
/// fail to parse, or that `solve` leaves unchanged, keep their original text
/// unless repeated keys were collapsed while parsing.
pub fn cq_rewrite<F>(text: &str, mut solve: F) -> String
where
    F: FnMut(&mut CqCommand),
{
    CQ_RE
        .replace_all(text, |caps: &Captures| {
            let original = &caps[0];
            match CqCommand::parse(original) {
                Ok(mut cmd) => {
                    let collapsed = cmd.args.len() != original.matches(',').count();
                    let before = cmd.clone();
                    solve(&mut cmd);
                    if cmd == before && !collapsed {
                        original.to_string()
                    } else {
                        cmd.compile()
                    }
                }
                Err(_) => original.to_string(),
            }
        })
        .into_owned()
}

/// Apply `solve` to the reference of every `[img:REF]` / `[图:REF]` directive.
/// `solve` returns the replacement text, or `None` to keep the directive.
pub fn image_rewrite<F>(text: &str, mut solve: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    IMAGE_RE
        .replace_all(text, |caps: &Captures| {
            solve(&caps[2]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Bracket syntax: `[img:REF]` becomes an image CQ command or a token.
pub fn rewrite_bracket_images(text: &str, sandbox: &ImageSandbox) -> String {
    image_rewrite(text, |reference| match sandbox.check(reference) {
        SandboxOutcome::PassThrough => {
            Url::parse(reference).ok()?;
            Some(CqCommand::image(reference).compile())
        }
        SandboxOutcome::Unresolvable => None,
        SandboxOutcome::Forbidden => Some(IMAGE_FORBIDDEN.to_string()),
        SandboxOutcome::NotFound => Some(IMAGE_NOT_FOUND.to_string()),
        SandboxOutcome::Rewritten(uri) => Some(CqCommand::image(&uri).compile()),
    })
}

/// Command syntax: `[CQ:image,file=REF]` gets its `file` rewritten or an
/// overwrite token.
pub fn rewrite_cq_images(text: &str, sandbox: &ImageSandbox) -> String {
    cq_rewrite(text, |cmd| {
        if cmd.kind != "image" {
            return;
        }
        let Some(file) = cmd.arg("file").map(str::to_string) else {
            return;
        };
        match sandbox.check(&file) {
            SandboxOutcome::PassThrough | SandboxOutcome::Unresolvable => {}
            SandboxOutcome::Forbidden => cmd.overwrite = Some(CQ_IMAGE_FORBIDDEN.to_string()),
            SandboxOutcome::NotFound => cmd.overwrite = Some(IMAGE_NOT_FOUND.to_string()),
            SandboxOutcome::Rewritten(uri) => cmd.set_arg("file", &uri),
        }
    })
}
