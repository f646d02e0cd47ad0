//! Sandbox policy for image references in outbound text.
//!
//! Local references must resolve inside the sandbox root (the working
//! directory in production). Both the `[img:...]` bracket syntax and
//! pre-built `[CQ:image,file=...]` commands go through [`ImageSandbox::check`].

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use url::Url;

pub const REMOTE_PREFIXES: [&str; 3] = ["file://", "http://", "https://"];

pub const IMAGE_NOT_FOUND: &str = "[找不到图片]";
pub const IMAGE_FORBIDDEN: &str = "[图片指向非当前程序目录，已禁止]";
pub const CQ_IMAGE_FORBIDDEN: &str = "[CQ码读取非当前目录图片，可能是恶意行为，已禁止]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("empty image reference")]
    Empty,
    #[error("image reference contains a NUL byte")]
    NulByte,
    #[error("cannot determine sandbox root: {0}")]
    NoRoot(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOutcome {
    /// Remote or already-encoded reference, left as is.
    PassThrough,
    /// Path could not be resolved; the directive stays untouched.
    Unresolvable,
    Forbidden,
    NotFound,
    /// Local file inside the sandbox, as a `file://` URI.
    Rewritten(String),
}

pub fn is_remote_reference(reference: &str) -> bool {
    REMOTE_PREFIXES.iter().any(|p| reference.starts_with(p))
}

/// Lexical normalization: drops `.` and folds `..` without touching the
/// filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ImageSandbox {
    root: PathBuf,
}

impl ImageSandbox {
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Self {
            root: clean_path(&root),
        })
    }

    pub fn from_current_dir() -> anyhow::Result<Self> {
        Self::new(std::env::current_dir()?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute, normalized form of `reference`; relative paths are taken
    /// against the sandbox root.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf, ResolveError> {
        if reference.is_empty() {
            return Err(ResolveError::Empty);
        }
        if reference.contains('\0') {
            return Err(ResolveError::NulByte);
        }
        let path = Path::new(reference);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        if !joined.is_absolute() {
            return Err(ResolveError::NoRoot(self.root.display().to_string()));
        }
        Ok(clean_path(&joined))
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    pub fn check(&self, reference: &str) -> SandboxOutcome {
        if is_remote_reference(reference) {
            return SandboxOutcome::PassThrough;
        }

        let path = match self.resolve(reference) {
            Ok(path) => path,
            Err(_) => return SandboxOutcome::Unresolvable,
        };

        if !self.contains(&path) {
            tracing::warn!("Blocked image reference outside sandbox: {}", reference);
            return SandboxOutcome::Forbidden;
        }

        match std::fs::metadata(&path) {
            Err(e) if e.kind() == ErrorKind::NotFound => SandboxOutcome::NotFound,
            _ => match local_file_uri(&path) {
                Some(uri) => SandboxOutcome::Rewritten(uri),
                None => SandboxOutcome::Unresolvable,
            },
        }
    }
}

/// `file://` URI for an absolute path. On Windows one extra leading slash is
/// added because the downstream CQ consumer strips one.
pub fn local_file_uri(path: &Path) -> Option<String> {
    let mut raw = path.to_string_lossy().into_owned();
    if cfg!(windows) {
        raw = format!("/{}", raw);
    }
    let mut url = Url::parse("file:///").ok()?;
    url.set_path(&raw);
    Some(url.to_string())
}
