//! Project configuration (`.dagwork.toml`, §3 `ProjectConfig`).
//!
//! Parsed from `.dagwork.toml` at the repository root. Missing fields use
//! sensible defaults; a missing file means all defaults, not an error.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::scheduler::Policy;

/// Top-level project configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// Repository-level settings: the base branch and the branch-name prefix
/// used for run and item branches.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            branch: default_branch(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

fn default_branch() -> String {
    "main".to_owned()
}

fn default_branch_prefix() -> String {
    "dagwork".to_owned()
}

/// Run-level defaults: concurrency and failure policy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub on_error: Policy,
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            on_error: Policy::default(),
            agent_command: default_agent_command(),
        }
    }
}

const fn default_concurrency() -> u32 {
    4
}

fn default_agent_command() -> String {
    "claude".to_owned()
}

/// Where the run store lives, and which dirty files the preflight check
/// tolerates.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default = "default_dir_name")]
    pub dir_name: String,
    #[serde(default)]
    pub allowed_dirty: Vec<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir_name: default_dir_name(),
            allowed_dirty: Vec::new(),
        }
    }
}

fn default_dir_name() -> String {
    ".dagwork".to_owned()
}

/// Tracker-mode settings: which tracker, and which environment variable
/// holds its auth token.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_kind")]
    pub kind: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kind: default_tracker_kind(),
            token_env: default_token_env(),
        }
    }
}

fn default_tracker_kind() -> String {
    "github".to_owned()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_owned()
}

/// A `.dagwork.toml` could not be loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "{}: {}", path.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ProjectConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields all defaults, not an error.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on I/O errors (other than not-found) or
    /// parse errors, including unknown fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start].chars().filter(|&c| c == '\n').count() + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError { path: None, message }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_all_fields() {
        let cfg = ProjectConfig::default();
        assert_eq!(cfg.repo.branch, "main");
        assert_eq!(cfg.repo.branch_prefix, "dagwork");
        assert_eq!(cfg.run.concurrency, 4);
        assert_eq!(cfg.run.on_error, Policy::ContinueOnError);
        assert_eq!(cfg.state.dir_name, ".dagwork");
        assert!(cfg.state.allowed_dirty.is_empty());
        assert_eq!(cfg.tracker.kind, "github");
        assert_eq!(cfg.tracker.token_env, "GITHUB_TOKEN");
    }

    #[test]
    fn missing_file_returns_defaults() {
        let cfg = ProjectConfig::load(Path::new("/nonexistent/.dagwork.toml")).unwrap();
        assert_eq!(cfg, ProjectConfig::default());
    }

    #[test]
    fn parse_overrides_some_fields() {
        let toml_str = r#"
            [repo]
            branch = "trunk"

            [run]
            concurrency = 8
            on_error = "stop-on-error"

            [state]
            allowed_dirty = ["*.generated.md"]
        "#;
        let cfg = ProjectConfig::parse(toml_str).unwrap();
        assert_eq!(cfg.repo.branch, "trunk");
        assert_eq!(cfg.repo.branch_prefix, "dagwork");
        assert_eq!(cfg.run.concurrency, 8);
        assert_eq!(cfg.run.on_error, Policy::StopOnError);
        assert_eq!(cfg.state.allowed_dirty, vec!["*.generated.md".to_owned()]);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = ProjectConfig::parse("bogus = true").unwrap_err();
        assert!(err.message.contains("bogus") || err.message.contains("unknown"));
    }

    #[test]
    fn unknown_nested_field_is_rejected() {
        let err = ProjectConfig::parse("[repo]\nbogus = 1").unwrap_err();
        assert!(!err.message.is_empty());
    }
}
