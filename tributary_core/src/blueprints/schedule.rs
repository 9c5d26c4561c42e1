use crate::blueprints::models::{Blueprint, BlueprintQuery, MANUAL_CRON};
use crate::blueprints::service::BlueprintService;
use crate::models::Pagination;
use crate::{Error, Result};
use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Five-field cron expression, `min hour dom month dow`, plus the
/// `@hourly`, `@daily`, `@weekly` and `@monthly` descriptors.
///
/// Day of week counts from Sunday = 0. Day of month and day of week must both match.
#[derive(Debug, Clone)]
pub struct CronExpr {
    schedule: Schedule,
}

/// `cron` numbers weekdays 1-7 from Sunday; classic crontab uses 0-6 (7 is Sunday too).
fn shift_day_of_week(field: &str) -> Result<String> {
    let bad = || Error::InvalidInput(format!("invalid cron day-of-week field {field:?}"));
    let shift = |v: &str| -> Result<String> {
        if v == "*" || v.chars().all(|c| c.is_ascii_alphabetic()) {
            return Ok(v.to_string());
        }
        let n: u32 = v.parse().map_err(|_| bad())?;
        match n {
            0..=6 => Ok((n + 1).to_string()),
            7 => Ok("1".to_string()),
            _ => Err(bad()),
        }
    };
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (part, None),
        };
        let range = match range.split_once('-') {
            Some((a, b)) => format!("{}-{}", shift(a)?, shift(b)?),
            None => shift(range)?,
        };
        parts.push(match step {
            Some(s) => format!("{range}/{s}"),
            None => range,
        });
    }
    Ok(parts.join(","))
}

impl CronExpr {
    #[tracing::instrument(level = "debug")]
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let expanded = match expr {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            other => other,
        };
        let parts: Vec<&str> = expanded.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = parts.as_slice() else {
            return Err(Error::InvalidInput(format!(
                "cron expression {expr:?} must have 5 fields: min hour dom month dow"
            )));
        };
        let dow = shift_day_of_week(dow)?;
        let schedule = Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}"))
            .map_err(|e| Error::InvalidInput(format!("invalid cron expression '{expr}': {e}")))?;
        Ok(Self { schedule })
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.schedule.includes(t.with_second(0).unwrap_or(t))
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .next()
            .ok_or_else(|| Error::InvalidInput("cron expression never fires".to_string()))
    }
}

/// Validate a blueprint `cronConfig`; returns `None` for manual blueprints.
pub fn parse_cron_config(cron_config: &str) -> Result<Option<CronExpr>> {
    let c = cron_config.trim();
    if c.is_empty() || c.eq_ignore_ascii_case(MANUAL_CRON) {
        return Ok(None);
    }
    CronExpr::parse(c).map(Some)
}

/// Next fire time of a blueprint, or `None` when it is not scheduled.
pub fn next_run(bp: &Blueprint, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if !bp.is_scheduled() {
        return Ok(None);
    }
    match parse_cron_config(&bp.cron_config)? {
        Some(cron) => cron.next_after(after).map(Some),
        None => Ok(None),
    }
}

/// Fires enabled, non-manual blueprints when their cron time is due.
pub struct BlueprintScheduler {
    service: Arc<BlueprintService>,
    poll_interval: Duration,
}

impl BlueprintScheduler {
    #[tracing::instrument(level = "debug", skip(service))]
    pub fn new(service: Arc<BlueprintService>, poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        Ok(Self {
            service,
            poll_interval,
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!(error = %e, "blueprint scheduler tick failed");
            }
        }
    }

    /// Fire every due blueprint. A failing fire is logged and skipped.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u64> {
        let meta = self.service.meta();
        let mut fired = 0;
        let mut page = 1;
        loop {
            let (batch, _) = meta
                .list_blueprints(&BlueprintQuery {
                    enable: Some(true),
                    is_manual: Some(false),
                    pagination: Pagination {
                        page,
                        page_size: 200,
                    },
                    ..Default::default()
                })
                .await?;
            if batch.is_empty() {
                break;
            }
            for mut bp in batch {
                let due = match bp.next_run_at {
                    Some(at) => at <= now,
                    None => false,
                };
                let next = match next_run(&bp, now) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, blueprint_id = %bp.id, "invalid cron config");
                        continue;
                    }
                };
                if !due && bp.next_run_at.is_some() {
                    continue;
                }
                // persist the next fire time first so a crash cannot fire twice
                bp.next_run_at = next;
                meta.update_blueprint(&bp).await?;
                if !due {
                    continue;
                }
                match self.service.trigger_blueprint(&bp).await {
                    Ok(p) => {
                        fired += 1;
                        tracing::info!(blueprint_id = %bp.id, pipeline_id = %p.id, "scheduled blueprint fired");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, blueprint_id = %bp.id, "scheduled blueprint skipped");
                    }
                }
            }
            page += 1;
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn descriptors_and_fields() {
        let t = at("2024-03-04T00:00:00Z");
        assert_eq!(
            CronExpr::parse("@daily").unwrap().next_after(t).unwrap(),
            CronExpr::parse("0 0 * * *").unwrap().next_after(t).unwrap()
        );
        assert!(CronExpr::parse("* * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("0 0 * * 9").is_err());
        let weekdays = CronExpr::parse("0-10/5,30 1-3 * 3,6 1-5").unwrap();
        // 2024-03-04 is a Monday, 2024-03-03 a Sunday
        assert!(weekdays.matches(at("2024-03-04T02:05:00Z")));
        assert!(!weekdays.matches(at("2024-03-03T02:05:00Z")));
        assert!(parse_cron_config("manual").unwrap().is_none());
    }

    #[test]
    fn next_after_skips_ahead() {
        let hourly = CronExpr::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(at("2024-03-01T10:00:00Z")).unwrap(),
            at("2024-03-01T11:00:00Z")
        );
        let weekly = CronExpr::parse("@weekly").unwrap();
        // 2024-03-01 is a Friday
        assert_eq!(
            weekly.next_after(at("2024-03-01T10:17:42Z")).unwrap(),
            at("2024-03-03T00:00:00Z")
        );
        let monthly = CronExpr::parse("@monthly").unwrap();
        assert_eq!(
            monthly.next_after(at("2024-12-15T08:00:00Z")).unwrap(),
            at("2025-01-01T00:00:00Z")
        );
        let quarter = CronExpr::parse("*/15 9 * * *").unwrap();
        assert_eq!(
            quarter.next_after(at("2024-03-01T09:44:59Z")).unwrap(),
            at("2024-03-01T09:45:00Z")
        );
        assert_eq!(
            quarter.next_after(at("2024-03-01T09:45:00Z")).unwrap(),
            at("2024-03-02T09:00:00Z")
        );
        assert!(CronExpr::parse("0 0 31 2 *").unwrap().next_after(at("2024-01-01T00:00:00Z")).is_err());
    }

    #[tokio::test]
    async fn tick_fires_due_blueprints_once() {
        use crate::blueprints::models::NewBlueprint;
        use crate::pipelines::models::PipelineTask;
        use crate::storage::memory::MemoryStore;
        use serde_json::json;

        let store = MemoryStore::new();
        let service = Arc::new(BlueprintService::new(crate::test_support::orchestrator(&store)));
        let bp = service
            .create(NewBlueprint {
                name: "hourly".into(),
                mode: crate::blueprints::models::BlueprintMode::Advanced,
                plan: vec![vec![PipelineTask::new("fixture", json!({}))]],
                cron_config: Some("@hourly".into()),
                enable: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let scheduler = BlueprintScheduler::new(service.clone(), Duration::from_secs(1)).unwrap();

        let due = bp.next_run_at.unwrap();
        assert_eq!(scheduler.tick(due - ChronoDuration::seconds(1)).await.unwrap(), 0);
        assert_eq!(scheduler.tick(due).await.unwrap(), 1);
        let after = service.get(bp.id).await.unwrap();
        assert_eq!(after.next_run_at, Some(due + ChronoDuration::hours(1)));
        // the next fire is an hour away
        assert_eq!(scheduler.tick(due + ChronoDuration::minutes(5)).await.unwrap(), 0);
        assert!(BlueprintScheduler::new(service, Duration::ZERO).is_err());
    }
}
