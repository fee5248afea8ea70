//! Background timers for the periodic jobs.
//!
//! One process at a time runs the jobs: the scheduler holds a session-level
//! Postgres advisory lock on a dedicated connection for as long as it leads.
//! Each job runs on its own task with a timeout, and a tick that finds the
//! previous run of the same job still going is skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, Offset, Utc};
use futures_util::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::AppState;
use crate::error::AppResult;
use crate::notify::digest::send_daily_digest;

/// Advisory lock key shared by every instance competing for leadership.
pub const LEADER_LOCK_KEY: i64 = 0x4641_4d49_4c59;
const TICK: Duration = Duration::from_secs(15);
const LEADER_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    /// Wall-clock time in a fixed UTC offset.
    DailyAt { time: NaiveTime, utc_offset_hours: i32 },
}

impl Cadence {
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Every(interval) => {
                now + ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::minutes(5))
            }
            Cadence::DailyAt {
                time,
                utc_offset_hours,
            } => next_daily_run(now, time, utc_offset_hours),
        }
    }
}

/// First instant strictly after `now` at which the local clock in the given
/// offset reads `time`.
pub fn next_daily_run(now: DateTime<Utc>, time: NaiveTime, utc_offset_hours: i32) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(utc_offset_hours.clamp(-23, 23) * 3600)
        .unwrap_or_else(|| Utc.fix());
    let local_now = now.with_timezone(&offset);
    let mut candidate = local_now.date_naive().and_time(time);
    if candidate <= local_now.naive_local() {
        candidate += ChronoDuration::days(1);
    }
    (candidate - ChronoDuration::seconds(offset.local_minus_utc() as i64)).and_utc()
}

pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

#[derive(Clone)]
pub struct Job {
    pub name: &'static str,
    pub cadence: Cadence,
    pub timeout: Duration,
    run: JobFn,
    running: Arc<AtomicBool>,
}

impl Job {
    pub fn new<F, Fut>(name: &'static str, cadence: Cadence, timeout: Duration, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = AppResult<()>> + Send + 'static,
    {
        Self {
            name,
            cadence,
            timeout,
            run: Arc::new(move || Box::pin(run())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the job on its own task. Returns `None` when the previous run
    /// has not finished yet.
    pub fn launch(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(job = self.name, "previous run still in progress, skipping tick");
            return None;
        }

        let job = self.clone();
        Some(tokio::spawn(async move {
            let started = std::time::Instant::now();
            match tokio::time::timeout(job.timeout, (job.run)()).await {
                Ok(Ok(())) => info!(job = job.name, elapsed_ms = started.elapsed().as_millis() as u64, "job finished"),
                Ok(Err(err)) => warn!(job = job.name, error = %err, "job failed"),
                Err(_) => warn!(job = job.name, timeout_secs = job.timeout.as_secs(), "job timed out"),
            }
            job.running.store(false, Ordering::Release);
        }))
    }
}

pub struct Scheduler {
    pool: PgPool,
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new(pool: PgPool, jobs: Vec<Job>) -> Self {
        Self { pool, jobs }
    }

    /// The standard job set: geofence scan every 5 minutes, renewal and
    /// retention at 03:00 UTC, the digest at 09:00 family-local time.
    pub fn for_app(state: &AppState) -> Self {
        let mut jobs = Vec::new();

        let geofences = state.geofences.clone();
        let notifications = state.notifications.clone();
        jobs.push(Job::new(
            "geofence_scan",
            Cadence::Every(Duration::from_secs(5 * 60)),
            Duration::from_secs(120),
            move || {
                let geofences = geofences.clone();
                let notifications = notifications.clone();
                async move {
                    geofences.scan_and_notify(&notifications).await?;
                    Ok(())
                }
            },
        ));

        let nightly = Cadence::DailyAt {
            time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default(),
            utc_offset_hours: 0,
        };

        if let Some(renewer) = state.renewer.clone() {
            let clock = state.clock.clone();
            jobs.push(Job::new(
                "subscription_renewal",
                nightly,
                Duration::from_secs(15 * 60),
                move || {
                    let renewer = renewer.clone();
                    let today = clock.now().date_naive();
                    async move {
                        renewer.run(today).await?;
                        Ok(())
                    }
                },
            ));
        }

        let reaper = state.reaper.clone();
        jobs.push(Job::new(
            "retention",
            nightly,
            Duration::from_secs(15 * 60),
            move || {
                let reaper = reaper.clone();
                async move {
                    reaper.reap().await?;
                    Ok(())
                }
            },
        ));

        let pool = state.pool.clone();
        let notifications = state.notifications.clone();
        let clock = state.clock.clone();
        let offset = state.config.family_utc_offset_hours;
        jobs.push(Job::new(
            "daily_digest",
            Cadence::DailyAt {
                time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
                utc_offset_hours: offset,
            },
            Duration::from_secs(10 * 60),
            move || {
                let pool = pool.clone();
                let notifications = notifications.clone();
                let today = (clock.now() + ChronoDuration::hours(offset as i64)).date_naive();
                async move {
                    send_daily_digest(&pool, &notifications, today).await?;
                    Ok(())
                }
            },
        ));

        Self::new(state.pool.clone(), jobs)
    }

    async fn acquire_leadership(&self) -> Option<PoolConnection<Postgres>> {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "scheduler could not get a connection");
                return None;
            }
        };
        match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(LEADER_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(true) => Some(conn),
            Ok(false) => None,
            Err(err) => {
                warn!(error = %err, "scheduler leader lock query failed");
                None
            }
        }
    }

    /// Whether the session behind `conn` is alive and still holds the lease.
    async fn still_leading(conn: &mut PoolConnection<Postgres>) -> bool {
        let held = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND pid = pg_backend_pid()
                  AND granted
                  AND objsubid = 1
                  AND ((classid::bigint << 32) | objid::bigint) = $1
            )
            "#,
        )
        .bind(LEADER_LOCK_KEY)
        .fetch_one(&mut **conn)
        .await;
        match held {
            Ok(held) => held,
            Err(err) => {
                warn!(error = %err, "scheduler lease check failed");
                false
            }
        }
    }

    /// Waits for the lease; `None` once shutdown is requested.
    async fn wait_for_leadership(&self, shutdown: &CancellationToken) -> Option<PoolConnection<Postgres>> {
        loop {
            if let Some(conn) = self.acquire_leadership().await {
                info!("scheduler lease acquired");
                return Some(conn);
            }
            info!("another instance holds the scheduler lease, waiting");
            tokio::select! {
                _ = tokio::time::sleep(LEADER_RETRY) => {},
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Runs until `shutdown` is cancelled. Losing the lease (for example when
    /// the leader connection drops) stops job launches until it is won back.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(jobs = self.jobs.len(), "scheduler starting");

        let now = Utc::now();
        let mut next_runs: Vec<DateTime<Utc>> = self
            .jobs
            .iter()
            .map(|job| match job.cadence {
                // interval jobs fire once right after start
                Cadence::Every(_) => now,
                cadence => cadence.next_after(now),
            })
            .collect();

        'lease: while let Some(mut leader_conn) = self.wait_for_leadership(&shutdown).await {
            let mut ticker = tokio::time::interval(TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = shutdown.cancelled() => {
                        // closing the session releases the lease at once
                        if let Err(err) = leader_conn.detach().close().await {
                            warn!(error = %err, "scheduler leader connection did not close cleanly");
                        }
                        break 'lease;
                    }
                }

                if !Self::still_leading(&mut leader_conn).await {
                    warn!("scheduler lease lost");
                    // a broken connection must not go back to the pool
                    drop(leader_conn.detach());
                    continue 'lease;
                }

                let now = Utc::now();
                for (job, next_run) in self.jobs.iter().zip(next_runs.iter_mut()) {
                    if now >= *next_run {
                        job.launch();
                        *next_run = job.cadence.next_after(now);
                    }
                }
            }
        }

        info!("scheduler shutting down");
    }
}
