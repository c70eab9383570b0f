//! Lease-guarded periodic jobs.
//!
//! Every tick takes the job's cluster-wide lease first; a tick that misses
//! the lease returns silently because another replica is running it. A tick
//! is never cancelled halfway: shutdown is only observed between ticks.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::PoolContext;
use crate::error::PoolResult;
use crate::locker::Locker;
use crate::notifier::Notifier;

#[derive(Debug, Clone, Copy)]
pub struct CronJob {
    pub name: &'static str,
    pub lease: &'static str,
    pub period: Duration,
    pub ttl: Duration,
}

impl CronJob {
    pub const fn new(name: &'static str, lease: &'static str, period_secs: u64, ttl_secs: u64) -> Self {
        CronJob {
            name,
            lease,
            period: Duration::from_secs(period_secs),
            ttl: Duration::from_secs(ttl_secs),
        }
    }
}

pub const ROUND_UNLOCK: CronJob = CronJob::new("round unlock", "blkunlock", 60, 300);
pub const ROUND_CREDIT: CronJob = CronJob::new("round credit", "blkunlock", 60, 300);
pub const EXCHANGE_BATCH: CronJob = CronJob::new("exchange batch", "trade", 60, 300);
pub const BANK: CronJob = CronJob::new("bank", "bank", 60, 300);
pub const PAYOUTS: CronJob = CronJob::new("payouts", "payout", 300, 600);
pub const AUDIT: CronJob = CronJob::new("audit", "audit", 900, 600);
pub const BLOCK_ROLLUP: CronJob = CronJob::new("block rollup", "chrtblk", 60, 300);
pub const ROUND_ROLLUP: CronJob = CronJob::new("round rollup", "chrtrnd", 60, 300);
pub const SHARE_ROLLUP: CronJob = CronJob::new("share rollup", "chrtshr", 60, 300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    LeaseHeld,
    Failed,
    Panicked,
}

/// Runs one tick of `job` under its lease. Errors and panics are logged and
/// notified; the lease is released on every path.
pub async fn run_tick<Fut>(locker: &Locker, notifier: &Notifier, job: &CronJob, run_id: Uuid, tick: Fut) -> TickOutcome
where
    Fut: Future<Output = PoolResult<()>>,
{
    let lease = match locker.obtain(job.lease, job.ttl).await {
        Ok(Some(lease)) => lease,
        Ok(None) => return TickOutcome::LeaseHeld,
        Err(e) => {
            warn!(target: "cron_log", "[{}] {}: failed to obtain lease {}: {:?}", run_id, job.name, job.lease, e);
            return TickOutcome::Failed;
        }
    };

    let instant = Instant::now();
    let outcome = match AssertUnwindSafe(tick).catch_unwind().await {
        Ok(Ok(())) => TickOutcome::Ran,
        Ok(Err(e)) => {
            error!(target: "cron_log", "[{}] {} failed: {:?}", run_id, job.name, e);
            if e.is_business_rule() {
                notifier.alert(format!("{} failed: {}", job.name, e));
            }
            TickOutcome::Failed
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(target: "cron_log", "[{}] {} panicked: {}", run_id, job.name, message);
            notifier.alert(format!("{} panicked: {}", job.name, message));
            TickOutcome::Panicked
        }
    };

    let elapsed = instant.elapsed().as_millis();
    if elapsed > job.period.as_millis() {
        warn!(target: "cron_log", "[{}] {} took {}ms, longer than its period", run_id, job.name, elapsed);
    }
    locker.release(lease).await;
    outcome
}

/// Ticks `job` every period until `cancel` fires.
pub async fn run_cron<F, Fut>(ctx: Arc<PoolContext>, job: CronJob, cancel: CancellationToken, tick: F)
where
    F: Fn(Arc<PoolContext>, Uuid) -> Fut,
    Fut: Future<Output = PoolResult<()>>,
{
    info!(target: "cron_log", "{}: every {}s under lease {}", job.name, job.period.as_secs(), job.lease);
    let mut interval = tokio::time::interval(job.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let run_id = Uuid::new_v4();
        run_tick(&ctx.locker, &ctx.notifier, &job, run_id, tick(ctx.clone(), run_id)).await;
    }
    info!(target: "cron_log", "{}: stopped", job.name);
}
