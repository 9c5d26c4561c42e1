//! Mapping of upstream CI/CD states onto domain result and status values.

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CicdResult {
    Success,
    Failure,
    #[default]
    Default,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CicdStatus {
    Done,
    InProgress,
    #[default]
    Other,
}

/// Upstream values that count as success or failure. Matching ignores ASCII case.
#[derive(Debug, Clone, Copy)]
pub struct ResultRule<'a> {
    pub success: &'a [&'a str],
    pub failure: &'a [&'a str],
    pub default: CicdResult,
}

impl ResultRule<'static> {
    /// Table for plugins without source-specific values.
    pub const COMMON: ResultRule<'static> = ResultRule {
        success: &["success", "succeeded", "successful", "done", "passed", "completed", "ok"],
        failure: &["failure", "failed", "error", "errored", "aborted", "timed_out", "startup_failure"],
        default: CicdResult::Default,
    };
}

pub fn classify_result(rule: &ResultRule<'_>, upstream: &str) -> CicdResult {
    let v = upstream.trim();
    if rule.success.iter().any(|s| s.eq_ignore_ascii_case(v)) {
        CicdResult::Success
    } else if rule.failure.iter().any(|s| s.eq_ignore_ascii_case(v)) {
        CicdResult::Failure
    } else {
        rule.default
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusRule<'a> {
    pub done: &'a [&'a str],
    pub in_progress: &'a [&'a str],
    pub default: CicdStatus,
}

pub fn classify_status(rule: &StatusRule<'_>, upstream: &str) -> CicdStatus {
    let v = upstream.trim();
    if rule.done.iter().any(|s| s.eq_ignore_ascii_case(v)) {
        CicdStatus::Done
    } else if rule.in_progress.iter().any(|s| s.eq_ignore_ascii_case(v)) {
        CicdStatus::InProgress
    } else {
        rule.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_is_a_success() {
        assert_eq!(classify_result(&ResultRule::COMMON, "done"), CicdResult::Success);
        assert_eq!(classify_result(&ResultRule::COMMON, "Succeeded"), CicdResult::Success);
        assert_eq!(classify_result(&ResultRule::COMMON, "FAILED"), CicdResult::Failure);
        assert_eq!(classify_result(&ResultRule::COMMON, "skipped"), CicdResult::Default);
    }

    #[test]
    fn custom_rules_take_precedence() {
        let rule = ResultRule {
            success: &["green"],
            failure: &["red"],
            default: CicdResult::Failure,
        };
        assert_eq!(classify_result(&rule, "green"), CicdResult::Success);
        assert_eq!(classify_result(&rule, "amber"), CicdResult::Failure);

        let status = StatusRule {
            done: &["completed"],
            in_progress: &["queued", "in_progress"],
            default: CicdStatus::Other,
        };
        assert_eq!(classify_status(&status, "queued"), CicdStatus::InProgress);
        assert_eq!(classify_status(&status, "completed"), CicdStatus::Done);
        assert_eq!(classify_status(&status, "waiting"), CicdStatus::Other);
    }
}
