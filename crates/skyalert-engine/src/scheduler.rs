//! Wake-time computation and the scheduler loop handle.
//!
//! The next wake instant is re-derived from scratch every cycle out of
//! `{first-alert time, interval}` and the current clock — no accumulated
//! state, so settings changes take effect without a restart and drift
//! cannot build up.
//!
//! The loop itself runs as one spawned task owned by a [`Scheduler`]
//! handle. At most one loop instance can be active: starting while running
//! is rejected, and `stop` waits (bounded) for the old loop to observe the
//! stop flag before the handle frees up.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{Duration, Local, NaiveDateTime, NaiveTime};
use skyalert_core::error::{Result, SkyAlertError};
use tokio::task::JoinHandle;

/// How long `stop` waits for the loop to exit.
pub const STOP_WAIT: StdDuration = StdDuration::from_secs(10);
/// Stop-flag poll granularity during sleeps.
pub const POLL_TICK: StdDuration = StdDuration::from_millis(500);
/// Backoff after a failed cycle before the loop tries again.
pub const CYCLE_ERROR_BACKOFF: StdDuration = StdDuration::from_secs(60);

/// Compute the next wake instant strictly after `now`.
///
/// `T0` is today at the configured hour:minute. Before `T0` the answer is
/// `T0` itself; afterwards it is the next interval boundary, with a final
/// guard for landing exactly on a boundary.
pub fn next_wake(now: NaiveDateTime, first_alert: (u32, u32), interval_hours: u32) -> NaiveDateTime {
    let (hour, minute) = first_alert;
    let t0 = now.date().and_time(
        NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0)
            .unwrap_or(NaiveTime::MIN),
    );
    if now < t0 {
        return t0;
    }
    let interval = Duration::hours(interval_hours.max(1) as i64);
    let intervals_passed = (now - t0).num_seconds() / interval.num_seconds();
    let mut next = t0 + interval * (intervals_passed as i32 + 1);
    if next <= now {
        next += interval;
    }
    next
}

/// Owned handle around the background loop: start/stop/is_running.
pub struct Scheduler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the loop. The closure receives the shared stop flag and must
    /// poll it cooperatively. Fails if a loop is already active.
    pub fn launch<F, Fut>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(Arc<AtomicBool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            return Err(SkyAlertError::Scheduler(
                "alert loop is already running".into(),
            ));
        }
        self.stop.store(false, Ordering::SeqCst);
        let flag = Arc::clone(&self.stop);
        self.handle = Some(tokio::spawn(f(flag)));
        tracing::info!("⏰ Alert loop started");
        Ok(())
    }

    /// Signal the loop to stop and wait for it, bounded by [`STOP_WAIT`].
    /// On timeout the handle is kept so `is_running` stays truthful and a
    /// new loop cannot be started alongside the draining one.
    pub async fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        match tokio::time::timeout(STOP_WAIT, &mut *handle).await {
            Ok(join) => {
                self.handle = None;
                if let Err(e) = join
                    && !e.is_cancelled()
                {
                    tracing::error!("alert loop terminated abnormally: {e}");
                }
                tracing::info!("⏹️ Alert loop stopped");
                Ok(())
            }
            Err(_) => Err(SkyAlertError::Scheduler(format!(
                "alert loop did not stop within {}s",
                STOP_WAIT.as_secs()
            ))),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep until `wake`, polling the stop flag at [`POLL_TICK`] granularity.
/// Returns `false` when stopped early.
pub async fn sleep_until_or_stop(stop: &AtomicBool, wake: NaiveDateTime) -> bool {
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Local::now().naive_local();
        if now >= wake {
            return true;
        }
        let remaining = (wake - now)
            .to_std()
            .unwrap_or(POLL_TICK)
            .min(POLL_TICK);
        tokio::time::sleep(remaining).await;
    }
}

/// Sleep for a fixed duration with the same stop semantics.
pub async fn sleep_for_or_stop(stop: &AtomicBool, duration: StdDuration) -> bool {
    let wake = Local::now().naive_local()
        + Duration::from_std(duration).unwrap_or(Duration::seconds(60));
    sleep_until_or_stop(stop, wake).await
}
