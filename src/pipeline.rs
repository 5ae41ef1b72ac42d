use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, TimeZone, Utc};
use log::{error, info, warn};
use tokio::time::sleep;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::{enrichment, loader, scraper, transform};

/// State scoped to a single pipeline run.
pub struct RunContext {
    pub settings: Settings,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(settings: Settings) -> Self {
        let started_at = Utc::now();
        RunContext {
            settings,
            run_id: started_at.format("%Y%m%dT%H%M%SZ").to_string(),
            started_at,
        }
    }
}

/// One gate of the pipeline. `Ok` carries a one-line summary.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &RunContext) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Not run because an earlier stage failed.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: &'static str,
    pub status: StageStatus,
    pub detail: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: String,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.status == StageStatus::Succeeded)
    }

    pub fn failed_stage(&self) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.status == StageStatus::Failed)
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pipeline run {}:", self.run_id)?;
        for stage in &self.stages {
            writeln!(
                f,
                "  {:<10} {:?} ({:.1}s) {}",
                stage.name,
                stage.status,
                stage.elapsed.as_secs_f64(),
                stage.detail
            )?;
        }
        Ok(())
    }
}

/// Run stages in order. The first failure stops the run; later stages are
/// reported as skipped.
pub async fn run_pipeline(ctx: &RunContext, stages: &[Box<dyn Stage>]) -> PipelineReport {
    let mut reports = Vec::with_capacity(stages.len());
    let mut halted = false;
    info!(
        "[{}] Pipeline run started at {} with {} stages",
        ctx.run_id,
        ctx.started_at,
        stages.len()
    );

    for stage in stages {
        if halted {
            warn!("Skipping {} because an earlier stage failed.", stage.name());
            reports.push(StageReport {
                name: stage.name(),
                status: StageStatus::Skipped,
                detail: "upstream stage failed".into(),
                elapsed: Duration::ZERO,
            });
            continue;
        }

        info!("[{}] Starting stage {}", ctx.run_id, stage.name());
        let started = Instant::now();
        let (status, detail) = match stage.run(ctx).await {
            Ok(summary) => {
                info!("[{}] {} completed: {}", ctx.run_id, stage.name(), summary);
                (StageStatus::Succeeded, summary)
            }
            Err(e) => {
                error!("[{}] {} failed: {}", ctx.run_id, stage.name(), e);
                halted = true;
                (StageStatus::Failed, e.to_string())
            }
        };
        reports.push(StageReport {
            name: stage.name(),
            status,
            detail,
            elapsed: started.elapsed(),
        });
    }

    PipelineReport {
        run_id: ctx.run_id.clone(),
        stages: reports,
    }
}

pub struct ScrapeStage;
pub struct LoadStage;
pub struct TransformStage;
pub struct EnrichStage;

#[async_trait]
impl Stage for ScrapeStage {
    fn name(&self) -> &'static str {
        "scrape"
    }

    async fn run(&self, ctx: &RunContext) -> Result<String> {
        let reports = scraper::scrape_channels(&ctx.settings).await?;
        let new_messages: usize = reports.iter().map(|(_, r)| r.inserted).sum();
        Ok(format!(
            "{} channels, {} new messages",
            reports.len(),
            new_messages
        ))
    }
}

#[async_trait]
impl Stage for LoadStage {
    fn name(&self) -> &'static str {
        "load"
    }

    async fn run(&self, ctx: &RunContext) -> Result<String> {
        Ok(loader::load_raw_messages(&ctx.settings).await?.to_string())
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn run(&self, ctx: &RunContext) -> Result<String> {
        transform::run_dbt(&ctx.settings).await
    }
}

#[async_trait]
impl Stage for EnrichStage {
    fn name(&self) -> &'static str {
        "enrich"
    }

    async fn run(&self, ctx: &RunContext) -> Result<String> {
        Ok(enrichment::run_enrichment(&ctx.settings).await?.to_string())
    }
}

/// Scrape, load, transform, enrich.
pub fn default_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(ScrapeStage),
        Box::new(LoadStage),
        Box::new(TransformStage),
        Box::new(EnrichStage),
    ]
}

/// Run the four stages once with a fresh context.
pub async fn run_once(settings: &Settings) -> PipelineReport {
    let ctx = RunContext::new(settings.clone());
    let report = run_pipeline(&ctx, &default_stages()).await;
    info!("{}", report);
    report
}

/// Next time strictly after `now` at which the local wall clock (at `offset`) reads `at`.
pub fn next_run_after(now: DateTime<Utc>, at: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local_date = now.with_timezone(&offset).date_naive();
    let utc_wall =
        local_date.and_time(at) - ChronoDuration::seconds(offset.local_minus_utc() as i64);
    let candidate = Utc.from_utc_datetime(&utc_wall);
    if candidate > now {
        candidate
    } else {
        candidate + ChronoDuration::days(1)
    }
}

/// Run the pipeline once a day at the configured local time, forever.
pub async fn run_daily(settings: &Settings) -> Result<()> {
    let offset = FixedOffset::east_opt(settings.schedule.utc_offset_hours * 3600)
        .ok_or_else(|| Error::Config("invalid SCHEDULE_UTC_OFFSET_HOURS".into()))?;
    loop {
        let now = Utc::now();
        let next = next_run_after(now, settings.schedule.at, offset);
        info!(
            "Next pipeline run at {} ({}).",
            next.with_timezone(&offset),
            next
        );
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        sleep(wait).await;

        let report = run_once(settings).await;
        match report.failed_stage() {
            None => info!("Daily pipeline run {} succeeded.", report.run_id),
            Some(stage) => error!(
                "Daily pipeline run {} failed at {}; remaining stages skipped until tomorrow.",
                report.run_id, stage.name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeStage {
        name: &'static str,
        fail: bool,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for FakeStage {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: &RunContext) -> Result<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Transform {
                    code: Some(2),
                    stderr: "model failed".into(),
                })
            } else {
                Ok(format!("{} ok", self.name))
            }
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(Settings::from_lookup(|_| None).unwrap())
    }

    fn stages(fail_at: Option<usize>, runs: &Arc<AtomicUsize>) -> Vec<Box<dyn Stage>> {
        ["scrape", "load", "transform", "enrich"]
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                Box::new(FakeStage {
                    name,
                    fail: fail_at == Some(i),
                    runs: runs.clone(),
                }) as Box<dyn Stage>
            })
            .collect()
    }

    #[tokio::test]
    async fn all_stages_run_when_each_succeeds() {
        let runs = Arc::new(AtomicUsize::new(0));
        let report = run_pipeline(&ctx(), &stages(None, &runs)).await;
        assert!(report.succeeded());
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(report.stages[3].detail, "enrich ok");
    }

    #[tokio::test]
    async fn failure_halts_downstream_stages() {
        let runs = Arc::new(AtomicUsize::new(0));
        let report = run_pipeline(&ctx(), &stages(Some(2), &runs)).await;
        assert!(!report.succeeded());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let statuses: Vec<StageStatus> = report.stages.iter().map(|s| s.status.clone()).collect();
        assert_eq!(
            statuses,
            vec![
                StageStatus::Succeeded,
                StageStatus::Succeeded,
                StageStatus::Failed,
                StageStatus::Skipped
            ]
        );
        let failed = report.failed_stage().unwrap();
        assert_eq!(failed.name, "transform");
        assert!(failed.detail.contains("model failed"));
    }

    #[test]
    fn next_run_is_later_today_when_time_not_reached() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let at = NaiveTime::from_hms_opt(5, 0, 0).unwrap();
        // 00:30 UTC is 03:30 in UTC+3
        let now = Utc.with_ymd_and_hms(2025, 7, 14, 0, 30, 0).unwrap();
        assert_eq!(
            next_run_after(now, at, offset),
            Utc.with_ymd_and_hms(2025, 7, 14, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_run_rolls_to_tomorrow_once_passed() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let at = NaiveTime::from_hms_opt(5, 0, 0).unwrap();
        let exactly = Utc.with_ymd_and_hms(2025, 7, 14, 2, 0, 0).unwrap();
        assert_eq!(
            next_run_after(exactly, at, offset),
            Utc.with_ymd_and_hms(2025, 7, 15, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn local_date_is_used_across_midnight() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let at = NaiveTime::from_hms_opt(1, 0, 0).unwrap();
        // 22:30 UTC on the 14th is already 01:30 on the 15th locally
        let now = Utc.with_ymd_and_hms(2025, 7, 14, 22, 30, 0).unwrap();
        assert_eq!(
            next_run_after(now, at, offset),
            Utc.with_ymd_and_hms(2025, 7, 15, 22, 0, 0).unwrap()
        );
    }
}
