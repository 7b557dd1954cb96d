//! Tracker (§4.8): the issue-tracker client used in tracker mode.
//!
//! The reference implementation shells out to the `gh` CLI, matching the
//! teacher's preference for wrapping an external CLI over embedding an
//! HTTP client. Other trackers are out of scope (§1).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::process::Command;

use regex::Regex;
use serde::Deserialize;

use crate::ids::ItemId;
use crate::model::item::WorkItem;

/// Status labels the orchestrator writes back as a task's status changes
/// (§4.5, §6).
pub const STATUS_LABELS: &[&str] = &["queued", "in-progress", "blocked", "failed", "done"];

/// The issue-tracker client used in tracker mode.
pub trait Tracker {
    /// # Errors
    /// Returns [`TrackerError`] if the tracker CLI fails or returns
    /// unparseable output.
    fn fetch_open_issues(&self) -> Result<Vec<WorkItem>, TrackerError>;

    /// # Errors
    /// Returns [`TrackerError`] if the tracker CLI fails.
    fn set_label(&self, issue: u64, label: &str) -> Result<(), TrackerError>;

    /// # Errors
    /// Returns [`TrackerError`] if the tracker CLI fails.
    fn post_comment(&self, issue: u64, body: &str) -> Result<(), TrackerError>;
}

/// A tracker operation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerError(pub String);

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tracker error: {}", self.0)
    }
}

impl std::error::Error for TrackerError {}

#[derive(Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
}

/// A `gh`-CLI-backed [`Tracker`] for GitHub issues.
pub struct GhCliTracker {
    root: std::path::PathBuf,
    repo_slug: Option<String>,
    token_env: String,
    dep_token: Regex,
}

impl GhCliTracker {
    /// Build a tracker rooted at `root`, reading the repo slug from
    /// `git remote get-url origin` and an auth token from `token_env`.
    #[must_use]
    pub fn new(root: std::path::PathBuf, token_env: impl Into<String>) -> Self {
        let repo_slug = discover_repo_slug(&root);
        Self {
            root,
            repo_slug,
            token_env: token_env.into(),
            dep_token: Regex::new(r"(?mi)^Depends-on:\s*(.*)$").expect("static pattern is valid"),
        }
    }

    fn run_gh(&self, args: &[&str]) -> Result<String, TrackerError> {
        let mut full_args: Vec<&str> = Vec::with_capacity(args.len() + 2);
        full_args.extend(args);
        if let Some(slug) = &self.repo_slug {
            full_args.push("--repo");
            full_args.push(slug);
        }

        let mut command = Command::new("gh");
        command.args(&full_args).current_dir(&self.root);
        if let Ok(token) = std::env::var(&self.token_env) {
            command.env("GH_TOKEN", token);
        }

        let output = command.output().map_err(|e| TrackerError(format!("failed to run gh: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(TrackerError(format!(
                "gh {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn dependency_numbers(&self, body: &str) -> Vec<u64> {
        self.dep_token
            .captures(body)
            .map(|c| Regex::new(r"#(\d+)").expect("static pattern is valid").captures_iter(&c[1]).filter_map(|m| m[1].parse().ok()).collect())
            .unwrap_or_default()
    }
}

impl Tracker for GhCliTracker {
    fn fetch_open_issues(&self) -> Result<Vec<WorkItem>, TrackerError> {
        let output =
            self.run_gh(&["issue", "list", "--state", "open", "--json", "number,title,body", "--limit", "200"])?;
        let mut raw: Vec<RawIssue> = serde_json::from_str(&output)
            .map_err(|e| TrackerError(format!("could not parse `gh issue list` output: {e}")))?;
        raw.sort_by_key(|i| i.number);

        let number_to_id: BTreeMap<u64, ItemId> = raw
            .iter()
            .enumerate()
            .map(|(idx, issue)| {
                let id = ItemId::new(u32::try_from(idx + 1).unwrap_or(u32::MAX))
                    .map_err(|e| TrackerError(e.to_string()))?;
                Ok((issue.number, id))
            })
            .collect::<Result<_, TrackerError>>()?;
        let known_ids: BTreeSet<ItemId> = number_to_id.values().copied().collect();

        raw.into_iter()
            .map(|issue| {
                let id = number_to_id[&issue.number];
                let body = issue.body.unwrap_or_default();
                let deps: Vec<ItemId> = self
                    .dependency_numbers(&body)
                    .into_iter()
                    .filter_map(|n| number_to_id.get(&n).copied())
                    .collect();
                Ok(WorkItem::new(id, issue.title, body, deps, [], false, Some(issue.number), &known_ids))
            })
            .collect()
    }

    fn set_label(&self, issue: u64, label: &str) -> Result<(), TrackerError> {
        let issue_str = issue.to_string();
        let mut args: Vec<&str> = vec!["issue", "edit", &issue_str];
        for other in STATUS_LABELS.iter().filter(|l| **l != label) {
            args.push("--remove-label");
            args.push(other);
        }
        args.push("--add-label");
        args.push(label);
        self.run_gh(&args)?;
        Ok(())
    }

    fn post_comment(&self, issue: u64, body: &str) -> Result<(), TrackerError> {
        let issue_str = issue.to_string();
        self.run_gh(&["issue", "comment", &issue_str, "--body", body])?;
        Ok(())
    }
}

fn discover_repo_slug(root: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    parse_repo_slug(&url)
}

fn parse_repo_slug(url: &str) -> Option<String> {
    let stripped = url.strip_suffix(".git").unwrap_or(url);
    let tail = stripped.rsplit_once(':').map_or(stripped, |(_, t)| t);
    let tail = tail.rsplit_once("github.com/").map_or(tail, |(_, t)| t);
    let parts: Vec<&str> = tail.trim_matches('/').rsplitn(2, '/').collect();
    if parts.len() == 2 {
        Some(format!("{}/{}", parts[1], parts[0]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_remote_url() {
        assert_eq!(
            parse_repo_slug("git@github.com:acme/widgets.git"),
            Some("acme/widgets".to_owned())
        );
    }

    #[test]
    fn parses_https_remote_url() {
        assert_eq!(
            parse_repo_slug("https://github.com/acme/widgets.git"),
            Some("acme/widgets".to_owned())
        );
    }

    #[test]
    fn parses_https_url_without_git_suffix() {
        assert_eq!(parse_repo_slug("https://github.com/acme/widgets"), Some("acme/widgets".to_owned()));
    }

    #[test]
    fn rejects_malformed_url() {
        assert_eq!(parse_repo_slug("not-a-url"), None);
    }

    #[test]
    fn status_labels_cover_every_task_state() {
        assert_eq!(STATUS_LABELS.len(), 5);
        assert!(STATUS_LABELS.contains(&"in-progress"));
    }
}
