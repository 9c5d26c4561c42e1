//! Source-agnostic domain tables written by converters.

use crate::domain::status::{CicdResult, CicdStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ISSUES_TABLE: &str = "issues";
pub const CICD_PIPELINES_TABLE: &str = "cicd_pipelines";
pub const REPOS_TABLE: &str = "repos";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub url: String,
    pub issue_key: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub status: IssueStatus,
    pub original_status: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
    pub resolution_date: Option<DateTime<Utc>>,
    /// Minutes from creation to resolution.
    pub lead_time_minutes: Option<i64>,
    pub creator_name: Option<String>,
    pub assignee_name: Option<String>,
    /// Domain id of the repo or board the issue belongs to.
    pub scope_id: String,
}

impl Issue {
    pub fn lead_time(created: DateTime<Utc>, resolved: Option<DateTime<Utc>>) -> Option<i64> {
        resolved.map(|r| (r - created).num_minutes()).filter(|m| *m >= 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CicdPipeline {
    pub id: String,
    pub name: String,
    pub result: CicdResult,
    pub status: CicdStatus,
    pub original_result: String,
    pub original_status: String,
    pub created_date: DateTime<Utc>,
    pub finished_date: Option<DateTime<Utc>>,
    pub duration_sec: Option<i64>,
    pub cicd_scope_id: String,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repo {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn lead_time_ignores_clock_skew() {
        let created = Utc::now();
        assert_eq!(Issue::lead_time(created, Some(created + Duration::hours(2))), Some(120));
        assert_eq!(Issue::lead_time(created, Some(created - Duration::hours(1))), None);
        assert_eq!(Issue::lead_time(created, None), None);
    }
}
