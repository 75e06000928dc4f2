//! Single-threaded recurring job scheduler.
//!
//! Jobs are registered once at setup with a cadence (hourly, daily at a time,
//! weekly at a weekday and time) and a boxed async body. One tick loop polls
//! wall-clock time on a fixed interval and runs due jobs synchronously in
//! registration order; a job failure is recorded and never aborts the tick.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{
    DateTime, Datelike, IsoWeek, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc,
    Weekday,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

pub const CRATE_NAME: &str = "vcr-sched";

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("job {0:?} is already registered")]
    DuplicateJob(String),
    #[error("unknown cadence {0:?} (expected hourly, daily or weekly)")]
    UnknownCadence(String),
    #[error("cadence {0} requires a time of day")]
    MissingTimeOfDay(&'static str),
    #[error("invalid time of day {0:?}: {1}")]
    InvalidTimeOfDay(String, String),
}

/// Failure raised by a job body; caught at the runner boundary.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Recurrence pattern governing when a job becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Hourly,
    Daily(NaiveTime),
    Weekly(Weekday, NaiveTime),
}

impl Cadence {
    /// Parse the configuration surface: `hourly` (time ignored), `daily` with
    /// "HH:MM", `weekly` with "<Weekday> HH:MM".
    pub fn parse(cadence: &str, time_of_day: Option<&str>) -> Result<Self, ScheduleError> {
        match cadence.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Cadence::Hourly),
            "daily" => {
                let raw = time_of_day.ok_or(ScheduleError::MissingTimeOfDay("daily"))?;
                Ok(Cadence::Daily(parse_time(raw)?))
            }
            "weekly" => {
                let raw = time_of_day.ok_or(ScheduleError::MissingTimeOfDay("weekly"))?;
                let mut parts = raw.split_whitespace();
                let (weekday, time) = match (parts.next(), parts.next(), parts.next()) {
                    (Some(weekday), Some(time), None) => (weekday, time),
                    _ => {
                        return Err(ScheduleError::InvalidTimeOfDay(
                            raw.to_string(),
                            "expected \"<Weekday> HH:MM\"".to_string(),
                        ))
                    }
                };
                let weekday: Weekday = weekday.parse().map_err(|_| {
                    ScheduleError::InvalidTimeOfDay(
                        raw.to_string(),
                        format!("unknown weekday {weekday:?}"),
                    )
                })?;
                Ok(Cadence::Weekly(weekday, parse_time(time)?))
            }
            other => Err(ScheduleError::UnknownCadence(other.to_string())),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Hourly => write!(f, "hourly"),
            Cadence::Daily(time) => write!(f, "daily @ {}", time.format("%H:%M")),
            Cadence::Weekly(weekday, time) => {
                write!(f, "weekly @ {} {}", weekday, time.format("%H:%M"))
            }
        }
    }
}

fn parse_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|err| ScheduleError::InvalidTimeOfDay(raw.to_string(), err.to_string()))
}

/// One cadence period. A job fires at most once per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodKey {
    Hour(NaiveDate, u32),
    Day(NaiveDate),
    Week(IsoWeek),
}

/// The period key when the cadence condition is satisfied at `now`, else None.
fn due_period(cadence: &Cadence, now: NaiveDateTime) -> Option<PeriodKey> {
    match cadence {
        Cadence::Hourly => Some(PeriodKey::Hour(now.date(), now.hour())),
        Cadence::Daily(at) => (now.time() >= *at).then(|| PeriodKey::Day(now.date())),
        Cadence::Weekly(weekday, at) => {
            let reached = (
                now.weekday().num_days_from_monday(),
                now.time(),
            ) >= (weekday.num_days_from_monday(), *at);
            reached.then(|| PeriodKey::Week(now.iso_week()))
        }
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>>;
pub type JobBody = Box<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failed,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "success"),
            JobOutcome::Failed => write!(f, "failed"),
        }
    }
}

struct ScheduledJob {
    name: String,
    cadence: Cadence,
    body: JobBody,
    last_period: Option<PeriodKey>,
    last_run: Option<DateTime<Utc>>,
    last_outcome: Option<JobOutcome>,
}

/// Point-in-time view of one registered job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub name: String,
    pub cadence: String,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
}

/// Registry + tick loop. Jobs must be registered before [`Scheduler::run`]
/// starts; the loop polls on its own fixed interval, independent of any job's
/// cadence.
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            tick,
        }
    }

    /// Register a job. Setup-time only; a duplicate name fails fast and
    /// leaves the registry unchanged.
    pub fn schedule(
        &mut self,
        name: &str,
        cadence: Cadence,
        body: JobBody,
    ) -> Result<(), ScheduleError> {
        if self.jobs.iter().any(|job| job.name == name) {
            return Err(ScheduleError::DuplicateJob(name.to_string()));
        }
        info!(job = name, cadence = %cadence, "job scheduled");
        self.jobs.push(ScheduledJob {
            name: name.to_string(),
            cadence,
            body,
            last_period: None,
            last_run: None,
            last_outcome: None,
        });
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs
            .iter()
            .map(|job| JobStatus {
                name: job.name.clone(),
                cadence: job.cadence.to_string(),
                last_run: job.last_run,
                last_outcome: job.last_outcome,
            })
            .collect()
    }

    /// Consume cadence periods whose trigger instant already passed, so the
    /// loop never retro-fires for times that elapsed before it started.
    fn prime(&mut self, now: NaiveDateTime) {
        for job in &mut self.jobs {
            job.last_period = due_period(&job.cadence, now);
        }
    }

    /// Evaluate every job against `now` and run the due ones synchronously,
    /// in registration order.
    pub async fn tick_once(&mut self, now: NaiveDateTime) {
        for job in &mut self.jobs {
            let Some(period) = due_period(&job.cadence, now) else {
                continue;
            };
            if job.last_period == Some(period) {
                continue;
            }
            job.last_period = Some(period);
            run_job(job).await;
        }
    }

    /// Drive the tick loop until the stop signal flips or its sender drops.
    /// The signal is observed only between ticks; a running job always
    /// completes first.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.prime(Local::now().naive_local());
        info!(
            jobs = self.jobs.len(),
            tick_secs = self.tick.as_secs(),
            "scheduler loop started"
        );

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once(Local::now().naive_local()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler loop stopped");
                        return;
                    }
                }
            }
        }
    }
}

/// Execute one job body with failure isolation: an error or panic is logged
/// and recorded, never propagated past the loop.
async fn run_job(job: &mut ScheduledJob) {
    info!(job = %job.name, "job started");
    let outcome = match tokio::spawn((job.body)()).await {
        Ok(Ok(())) => {
            job.last_run = Some(Utc::now());
            info!(job = %job.name, "job completed");
            JobOutcome::Success
        }
        Ok(Err(err)) => {
            error!(job = %job.name, error = %err, "job failed");
            JobOutcome::Failed
        }
        Err(join_err) => {
            error!(job = %job.name, error = %join_err, "job panicked");
            JobOutcome::Failed
        }
    };
    job.last_outcome = Some(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn counting_body(counter: Arc<AtomicUsize>) -> JobBody {
        Box::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[test]
    fn cadence_parse_covers_the_config_surface() {
        assert_eq!(Cadence::parse("hourly", None).unwrap(), Cadence::Hourly);
        // time_of_day is ignored for hourly
        assert_eq!(
            Cadence::parse("hourly", Some("09:00")).unwrap(),
            Cadence::Hourly
        );
        assert_eq!(
            Cadence::parse("daily", Some("02:00")).unwrap(),
            Cadence::Daily(NaiveTime::from_hms_opt(2, 0, 0).unwrap())
        );
        assert_eq!(
            Cadence::parse("weekly", Some("Sunday 03:00")).unwrap(),
            Cadence::Weekly(Weekday::Sun, NaiveTime::from_hms_opt(3, 0, 0).unwrap())
        );

        assert!(matches!(
            Cadence::parse("daily", None),
            Err(ScheduleError::MissingTimeOfDay("daily"))
        ));
        assert!(matches!(
            Cadence::parse("weekly", Some("03:00")),
            Err(ScheduleError::InvalidTimeOfDay(..))
        ));
        assert!(matches!(
            Cadence::parse("daily", Some("25:99")),
            Err(ScheduleError::InvalidTimeOfDay(..))
        ));
        assert!(matches!(
            Cadence::parse("fortnightly", None),
            Err(ScheduleError::UnknownCadence(_))
        ));
    }

    #[test]
    fn daily_period_opens_at_its_minute_and_lasts_the_day() {
        let cadence = Cadence::Daily(NaiveTime::from_hms_opt(2, 0, 0).unwrap());

        assert_eq!(due_period(&cadence, at(2026, 3, 2, 1, 59)), None);
        let fired = due_period(&cadence, at(2026, 3, 2, 2, 0)).expect("due at 02:00");
        // Later ticks the same day stay within the same period.
        assert_eq!(due_period(&cadence, at(2026, 3, 2, 2, 1)), Some(fired));
        assert_eq!(due_period(&cadence, at(2026, 3, 2, 23, 59)), Some(fired));
        // Next day is a new period.
        assert_ne!(due_period(&cadence, at(2026, 3, 3, 2, 0)), Some(fired));
    }

    #[test]
    fn hourly_period_changes_at_the_hour_boundary() {
        let cadence = Cadence::Hourly;
        let p1 = due_period(&cadence, at(2026, 3, 2, 9, 0)).unwrap();
        assert_eq!(due_period(&cadence, at(2026, 3, 2, 9, 59)), Some(p1));
        assert_ne!(due_period(&cadence, at(2026, 3, 2, 10, 0)), Some(p1));
    }

    #[test]
    fn weekly_period_opens_at_weekday_and_time() {
        // 2026-03-01 is a Sunday.
        let cadence = Cadence::Weekly(Weekday::Sun, NaiveTime::from_hms_opt(3, 0, 0).unwrap());

        // Tuesday: the week's Sunday has not been reached yet.
        assert_eq!(due_period(&cadence, at(2026, 3, 3, 12, 0)), None);
        // Sunday before 03:00 is still outside the window.
        assert_eq!(due_period(&cadence, at(2026, 3, 1, 2, 59)), None);

        let fired = due_period(&cadence, at(2026, 3, 1, 3, 0)).expect("due Sunday 03:00");
        assert_eq!(due_period(&cadence, at(2026, 3, 1, 22, 0)), Some(fired));
        // The following Sunday is a new ISO week.
        assert_ne!(due_period(&cadence, at(2026, 3, 8, 3, 0)), Some(fired));
    }

    #[test]
    fn duplicate_registration_fails_fast_and_keeps_one_job() {
        let mut sched = Scheduler::new(DEFAULT_TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        let cadence = Cadence::parse("weekly", Some("Sunday 03:00")).unwrap();

        sched
            .schedule("cleanup", cadence, counting_body(counter.clone()))
            .expect("first registration");
        let err = sched
            .schedule("cleanup", cadence, counting_body(counter))
            .expect_err("second registration must fail");
        assert!(matches!(err, ScheduleError::DuplicateJob(name) if name == "cleanup"));
        assert_eq!(sched.job_count(), 1);
    }

    #[tokio::test]
    async fn due_job_fires_once_per_period_across_ticks() {
        let mut sched = Scheduler::new(DEFAULT_TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        sched
            .schedule(
                "refresh",
                Cadence::Daily(NaiveTime::from_hms_opt(2, 0, 0).unwrap()),
                counting_body(counter.clone()),
            )
            .unwrap();

        sched.tick_once(at(2026, 3, 2, 1, 59)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sched.tick_once(at(2026, 3, 2, 2, 0)).await;
        sched.tick_once(at(2026, 3, 2, 2, 1)).await;
        sched.tick_once(at(2026, 3, 2, 14, 30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        sched.tick_once(at(2026, 3, 3, 2, 0)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn priming_consumes_periods_that_already_elapsed() {
        let mut sched = Scheduler::new(DEFAULT_TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        sched
            .schedule(
                "refresh",
                Cadence::Daily(NaiveTime::from_hms_opt(2, 0, 0).unwrap()),
                counting_body(counter.clone()),
            )
            .unwrap();

        // Loop starts at 14:00; today's 02:00 must not retro-fire.
        sched.prime(at(2026, 3, 2, 14, 0));
        sched.tick_once(at(2026, 3, 2, 14, 1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sched.tick_once(at(2026, 3, 3, 2, 0)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_job_does_not_block_later_jobs_in_the_same_tick() {
        let mut sched = Scheduler::new(DEFAULT_TICK);
        let counter = Arc::new(AtomicUsize::new(0));

        sched
            .schedule(
                "always-fails",
                Cadence::Hourly,
                Box::new(|| {
                    Box::pin(async { Err(JobError::Message("platform unreachable".into())) })
                }),
            )
            .unwrap();
        sched
            .schedule("still-runs", Cadence::Hourly, counting_body(counter.clone()))
            .unwrap();

        sched.tick_once(at(2026, 3, 2, 9, 0)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let status = sched.status();
        assert_eq!(status[0].name, "always-fails");
        assert_eq!(status[0].last_outcome, Some(JobOutcome::Failed));
        assert_eq!(status[0].last_run, None);
        assert_eq!(status[1].last_outcome, Some(JobOutcome::Success));
        assert!(status[1].last_run.is_some());
    }

    #[tokio::test]
    async fn panicking_job_is_contained() {
        let mut sched = Scheduler::new(DEFAULT_TICK);
        let counter = Arc::new(AtomicUsize::new(0));

        sched
            .schedule(
                "panics",
                Cadence::Hourly,
                Box::new(|| Box::pin(async { panic!("boom") })),
            )
            .unwrap();
        sched
            .schedule("survivor", Cadence::Hourly, counting_body(counter.clone()))
            .unwrap();

        sched.tick_once(at(2026, 3, 2, 9, 0)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(sched.status()[0].last_outcome, Some(JobOutcome::Failed));
    }

    #[tokio::test]
    async fn stop_signal_ends_the_loop_between_ticks() {
        let mut sched = Scheduler::new(Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });

        tokio::time::timeout(Duration::from_secs(2), sched.run(rx))
            .await
            .expect("loop must stop after the signal");
        stopper.await.unwrap();
    }
}
