use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid id: {0}")]
    InvalidId(String),
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let id = s
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| IdParseError::InvalidId(s.to_string()))?;
                if id == 0 {
                    return Err(IdParseError::InvalidId(s.to_string()));
                }
                Ok(Self(id))
            }
        }
    };
}

numeric_id!(
    /// Pipeline identifier. Monotonic; dequeue order follows it.
    PipelineId
);
numeric_id!(
    /// Task identifier. A rerun row gets a fresh, larger id at the same (row, col).
    TaskId
);
numeric_id!(
    /// Blueprint identifier.
    BlueprintId
);
numeric_id!(
    /// Connection identifier, unique per plugin.
    ConnectionId
);
numeric_id!(
    /// Scope config identifier, unique per plugin.
    ScopeConfigId
);

/// Lifecycle status shared by pipelines and tasks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Created,
    Rerun,
    Running,
    Completed,
    Failed,
    Cancelled,
    Partial,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "CREATED",
            Status::Rerun => "RERUN",
            Status::Running => "RUNNING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Cancelled => "CANCELLED",
            Status::Partial => "PARTIAL",
        }
    }

    /// Terminal states are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Cancelled | Status::Partial
        )
    }

    /// Waiting in the queue.
    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Created | Status::Rerun)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Status::Created),
            "RERUN" => Ok(Status::Rerun),
            "RUNNING" => Ok(Status::Running),
            "COMPLETED" => Ok(Status::Completed),
            "FAILED" => Ok(Status::Failed),
            "CANCELLED" => Ok(Status::Cancelled),
            "PARTIAL" => Ok(Status::Partial),
            other => Err(IdParseError::InvalidId(format!("unknown status {other}"))),
        }
    }
}

/// Execution policy travelling with pipelines, tasks and blueprints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncPolicy {
    pub skip_on_fail: bool,
    pub full_sync: bool,
    pub skip_collectors: bool,
    pub time_after: Option<DateTime<Utc>>,
}

/// 1-based page request used by list operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pagination {
    pub page: u64,
    pub page_size: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

impl Pagination {
    pub const MAX_PAGE_SIZE: u64 = 1000;

    pub fn new(page: Option<u64>, page_size: Option<u64>) -> Self {
        let d = Self::default();
        Self {
            page: page.filter(|p| *p > 0).unwrap_or(d.page),
            page_size: page_size
                .filter(|s| *s > 0)
                .unwrap_or(d.page_size)
                .min(Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_and_reject_zero() {
        assert_eq!("42".parse::<PipelineId>().unwrap(), PipelineId(42));
        assert!("0".parse::<TaskId>().is_err());
        assert!("abc".parse::<BlueprintId>().is_err());
    }

    #[test]
    fn status_serializes_screaming() {
        let s = serde_json::to_string(&Status::Cancelled).unwrap();
        assert_eq!(s, "\"CANCELLED\"");
        assert_eq!("partial".parse::<Status>().unwrap(), Status::Partial);
        assert!(Status::Partial.is_terminal());
        assert!(Status::Rerun.is_pending());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn pagination_defaults_and_offset() {
        let p = Pagination::new(Some(3), Some(20));
        assert_eq!(p.offset(), 40);
        let d = Pagination::new(Some(0), None);
        assert_eq!(d.page, 1);
        assert_eq!(d.page_size, 50);
        assert_eq!(Pagination::new(None, Some(50_000)).page_size, 1000);
    }

    #[test]
    fn sync_policy_accepts_partial_json() {
        let p: SyncPolicy = serde_json::from_str(r#"{"fullSync":true}"#).unwrap();
        assert!(p.full_sync);
        assert!(!p.skip_on_fail);
        assert!(p.time_after.is_none());
    }
}
