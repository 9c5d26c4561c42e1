//! GitHub API payloads and the tool-layer rows extracted from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tributary_core::{Error, Result};

pub const RAW_ISSUES_SUFFIX: &str = "_api_issues";
pub const RAW_RUNS_SUFFIX: &str = "_api_runs";
pub const RAW_REPOS_SUFFIX: &str = "_api_repos";
pub const RAW_ISSUES_TABLE: &str = "_raw_github_api_issues";
pub const RAW_RUNS_TABLE: &str = "_raw_github_api_runs";
pub const TOOL_ISSUES_TABLE: &str = "_tool_github_issues";
pub const TOOL_RUNS_TABLE: &str = "_tool_github_runs";

/// Task options, as generated by the plan maker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubOptions {
    pub connection_id: u64,
    /// `owner/repo`.
    pub name: String,
    #[serde(default)]
    pub scope_config: GithubScopeConfig,
}

impl GithubOptions {
    pub fn validate(&self) -> Result<()> {
        if self.connection_id == 0 {
            return Err(Error::InvalidInput("connectionId is required".to_string()));
        }
        validate_repo_name(&self.name)
    }
}

pub fn validate_repo_name(name: &str) -> Result<()> {
    match name.split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => Ok(()),
        _ => Err(Error::InvalidInput(format!("github repo must be owner/repo: {name:?}"))),
    }
}

/// `settings` of a github scope config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GithubScopeConfig {
    /// Runs on this branch are tagged as production.
    pub production_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiIssue {
    pub id: u64,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub state_reason: Option<String>,
    pub html_url: String,
    #[serde(default)]
    pub user: Option<ApiUser>,
    #[serde(default)]
    pub assignee: Option<ApiUser>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Present when the issue is a pull request.
    #[serde(default)]
    pub pull_request: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub run_number: u64,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub run_started_at: Option<DateTime<Utc>>,
}

/// `GET /repos/{owner}/{repo}/actions/runs` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRunsPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub workflow_runs: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubIssue {
    pub connection_id: u64,
    pub github_id: u64,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub state_reason: Option<String>,
    pub url: String,
    pub author: Option<String>,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl GithubIssue {
    pub fn from_api(connection_id: u64, repo: &str, i: ApiIssue) -> Self {
        Self {
            connection_id,
            github_id: i.id,
            repo: repo.to_string(),
            number: i.number,
            title: i.title,
            body: i.body,
            state: i.state,
            state_reason: i.state_reason,
            url: i.html_url,
            author: i.user.map(|u| u.login),
            assignee: i.assignee.map(|u| u.login),
            created_at: i.created_at,
            updated_at: i.updated_at,
            closed_at: i.closed_at,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.connection_id, self.github_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubRun {
    pub connection_id: u64,
    pub id: u64,
    pub repo: String,
    pub name: String,
    pub head_branch: Option<String>,
    pub status: String,
    pub conclusion: Option<String>,
    pub run_number: u64,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub run_started_at: Option<DateTime<Utc>>,
}

impl GithubRun {
    pub fn from_api(connection_id: u64, repo: &str, r: ApiRun) -> Self {
        Self {
            connection_id,
            id: r.id,
            repo: repo.to_string(),
            name: r.name.unwrap_or_else(|| format!("run {}", r.run_number)),
            head_branch: r.head_branch,
            status: r.status,
            conclusion: r.conclusion,
            run_number: r.run_number,
            url: r.html_url,
            created_at: r.created_at,
            updated_at: r.updated_at,
            run_started_at: r.run_started_at,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.connection_id, self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.status == "completed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_require_owner_and_repo() {
        let ok: GithubOptions = serde_json::from_value(json!({"connectionId": 1, "name": "octo/hello"})).unwrap();
        assert!(ok.validate().is_ok());
        assert_eq!(ok.scope_config, GithubScopeConfig::default());
        for bad in ["octo", "octo/", "/hello", "a/b/c"] {
            assert!(validate_repo_name(bad).is_err(), "{bad}");
        }
        let no_conn = GithubOptions {
            connection_id: 0,
            ..ok
        };
        assert!(no_conn.validate().is_err());
    }
}
