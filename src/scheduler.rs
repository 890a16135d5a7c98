// =============================================================================
// Scheduler — wall-clock-aligned triggers, single-flight, lifecycle
// =============================================================================
//
// Fires each timeframe at its local wall-clock boundary (configurable zone):
//   1h  every hour at :00
//   4h  at 01, 05, 09, 13, 17, 21 local
//   1d  daily at 01:00 local
//   15m every quarter hour (off by default)
//
// Hand-rolled sleep-until-boundary, no cron dependency. One in-flight flag
// per timeframe: a boundary reached while the previous run is still going is
// dropped with a warning, never queued. A missed boundary (process pause)
// fires exactly once on wake. After a successful automatic 4h analysis the
// combined (`final`) pass is enqueued under its own flag.
//
// Lifecycle: Stopped -> Running -> Draining -> Stopped.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::PipelineRunner;
use crate::types::{Timeframe, TriggerKind};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Running,
    Draining,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
        }
    }
}

// ---------------------------------------------------------------------------
// Boundary math
// ---------------------------------------------------------------------------

/// Resolve a local wall-clock time, stepping over a DST gap if it lands in
/// one.
fn local_at(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Tz> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .expect("valid wall-clock time");
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => dt,
        None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .expect("DST gaps are shorter than two hours"),
    }
}

/// The next firing instant strictly after `now` for a sampled timeframe:
/// truncate down to the period (4h and 1d are anchored at 01:00 local) and
/// add one period. `None` for `Final`, which is never clock-driven.
pub fn next_fire_after(now: DateTime<Tz>, timeframe: Timeframe) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    match timeframe {
        Timeframe::M15 => {
            let block = now.minute() / 15 * 15;
            Some(local_at(tz, now.date_naive(), now.hour(), block) + Duration::minutes(15))
        }
        Timeframe::H1 => {
            Some(local_at(tz, now.date_naive(), now.hour(), 0) + Duration::hours(1))
        }
        Timeframe::H4 => {
            // The 01/05/.../21 grid is plain 4h truncation shifted by 1h.
            let shifted = now - Duration::hours(1);
            let block = shifted.hour() / 4 * 4;
            Some(
                local_at(tz, shifted.date_naive(), block, 0)
                    + Duration::hours(1)
                    + Duration::hours(4),
            )
        }
        Timeframe::D1 => {
            let today = local_at(tz, now.date_naive(), 1, 0);
            if now < today {
                Some(today)
            } else {
                Some(local_at(tz, now.date_naive() + Duration::days(1), 1, 0))
            }
        }
        Timeframe::Final => None,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    runner: Arc<dyn PipelineRunner>,
    tz: Tz,
    lifecycle: RwLock<Lifecycle>,
    in_flight: HashMap<Timeframe, AtomicBool>,
    last_fired_at: RwLock<HashMap<Timeframe, DateTime<Tz>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn PipelineRunner>, tz: Tz) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = Timeframe::ALL
            .into_iter()
            .map(|tf| (tf, AtomicBool::new(false)))
            .collect();
        Self {
            runner,
            tz,
            lifecycle: RwLock::new(Lifecycle::Stopped),
            in_flight,
            last_fired_at: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    pub fn last_fired(&self, timeframe: Timeframe) -> Option<DateTime<Tz>> {
        self.last_fired_at.read().get(&timeframe).copied()
    }

    // -------------------------------------------------------------------------
    // Start / stop
    // -------------------------------------------------------------------------

    /// Spawn one boundary loop per scheduled timeframe.
    pub fn start(self: &Arc<Self>, enable_15m: bool) {
        {
            let mut lifecycle = self.lifecycle.write();
            if *lifecycle != Lifecycle::Stopped {
                warn!(state = %lifecycle, "scheduler start ignored");
                return;
            }
            *lifecycle = Lifecycle::Running;
        }

        let mut timeframes = vec![Timeframe::H1, Timeframe::H4, Timeframe::D1];
        if enable_15m {
            timeframes.insert(0, Timeframe::M15);
        }

        let mut loops = self.loops.lock();
        for tf in timeframes {
            let scheduler = self.clone();
            loops.push(tokio::spawn(scheduler.timeframe_loop(tf)));
        }
        info!(tz = %self.tz, enable_15m, "scheduler running");
    }

    /// Stop firing; in-flight work keeps going until `drain`.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.write();
        if *lifecycle == Lifecycle::Running {
            *lifecycle = Lifecycle::Draining;
            let _ = self.shutdown_tx.send(true);
            info!("scheduler draining");
        }
    }

    /// Wait for in-flight analyses to finish (up to `grace`), then stop.
    pub async fn drain(&self, grace: StdDuration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.any_in_flight() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(StdDuration::from_millis(200)).await;
        }
        if self.any_in_flight() {
            warn!("drain grace elapsed with analyses still in flight");
        }
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
        *self.lifecycle.write() = Lifecycle::Stopped;
        info!("scheduler stopped");
    }

    fn any_in_flight(&self) -> bool {
        self.in_flight.values().any(|f| f.load(Ordering::SeqCst))
    }

    // -------------------------------------------------------------------------
    // Manual triggers (operator commands)
    // -------------------------------------------------------------------------

    /// `/analyze <tf>`: run one analysis now, bypassing the clock. Never
    /// trades, and never chains into the combined pass.
    pub fn trigger_analysis(self: &Arc<Self>, timeframe: Timeframe) -> Result<(), String> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(format!("scheduler is {}", self.lifecycle()));
        }
        if timeframe == Timeframe::Final {
            return Err("use /trade for the combined pipeline".into());
        }
        if !self.try_acquire(timeframe) {
            return Err(format!("{timeframe} analysis already in flight"));
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler
                .run_pipeline(timeframe, TriggerKind::Manual, false)
                .await;
        });
        Ok(())
    }

    /// `/trade`: run the combined pipeline now and execute if admissible.
    pub fn trigger_trade(self: &Arc<Self>) -> Result<(), String> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(format!("scheduler is {}", self.lifecycle()));
        }
        if !self.try_acquire(Timeframe::Final) {
            return Err("combined pipeline already in flight".into());
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_final_locked(TriggerKind::Manual).await;
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Boundary loop
    // -------------------------------------------------------------------------

    async fn timeframe_loop(self: Arc<Self>, timeframe: Timeframe) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now().with_timezone(&self.tz);
            let next = match next_fire_after(now, timeframe) {
                Some(next) => next,
                None => break,
            };
            let sleep_for = (next - now).to_std().unwrap_or(StdDuration::ZERO);
            debug!(%timeframe, next = %next, "sleeping until next boundary");

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    self.fire_auto(timeframe, next);
                }
                result = shutdown.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(%timeframe, "boundary loop exited");
    }

    /// One automatic fire. Records the *scheduled* instant (not wall-clock
    /// receipt) so catch-ups after a pause stay aligned.
    fn fire_auto(self: &Arc<Self>, timeframe: Timeframe, scheduled: DateTime<Tz>) {
        self.last_fired_at.write().insert(timeframe, scheduled);

        if !self.try_acquire(timeframe) {
            warn!(%timeframe, %scheduled, "previous run still in flight, trigger dropped");
            return;
        }

        info!(%timeframe, %scheduled, "scheduled trigger fired");
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler
                .run_pipeline(timeframe, TriggerKind::Auto, true)
                .await;
        });
    }

    /// Run one timeframe pipeline, releasing the flag afterwards. A
    /// successful automatic 4h run chains into the combined pass.
    async fn run_pipeline(
        self: Arc<Self>,
        timeframe: Timeframe,
        trigger: TriggerKind,
        follow_with_final: bool,
    ) {
        let result = self.runner.run_timeframe(timeframe, trigger).await;
        self.release(timeframe);

        if let Err(e) = &result {
            warn!(%timeframe, error = %e, "analysis run failed");
        }

        if follow_with_final && timeframe == Timeframe::H4 && result.is_ok() {
            if !self.try_acquire(Timeframe::Final) {
                warn!("combined pass already in flight, enqueue dropped");
                return;
            }
            self.run_final_locked(trigger).await;
        }
    }

    /// Run the combined pass; the caller must hold the Final flag.
    async fn run_final_locked(self: &Arc<Self>, trigger: TriggerKind) {
        if let Err(e) = self.runner.run_final(trigger).await {
            warn!(error = %e, "combined pipeline failed");
        }
        self.release(Timeframe::Final);
    }

    // -------------------------------------------------------------------------
    // Single-flight flags
    // -------------------------------------------------------------------------

    fn try_acquire(&self, timeframe: Timeframe) -> bool {
        self.in_flight[&timeframe]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self, timeframe: Timeframe) {
        self.in_flight[&timeframe].store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tz", &self.tz)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BotResult;
    use async_trait::async_trait;
    use chrono_tz::Asia::Seoul;
    use std::sync::atomic::AtomicU32;

    fn seoul(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Tz> {
        Seoul.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    // ---- boundary math ---------------------------------------------------

    #[test]
    fn hourly_fires_at_top_of_hour() {
        let next = next_fire_after(seoul(2024, 3, 5, 10, 59, 59), Timeframe::H1).unwrap();
        assert_eq!(next, seoul(2024, 3, 5, 11, 0, 0));
        // Exactly on the boundary: strictly after.
        let next = next_fire_after(seoul(2024, 3, 5, 11, 0, 0), Timeframe::H1).unwrap();
        assert_eq!(next, seoul(2024, 3, 5, 12, 0, 0));
    }

    #[test]
    fn quarter_hour_grid() {
        let next = next_fire_after(seoul(2024, 3, 5, 10, 7, 3), Timeframe::M15).unwrap();
        assert_eq!(next, seoul(2024, 3, 5, 10, 15, 0));
        let next = next_fire_after(seoul(2024, 3, 5, 10, 45, 0), Timeframe::M15).unwrap();
        assert_eq!(next, seoul(2024, 3, 5, 11, 0, 0));
    }

    #[test]
    fn four_hour_grid_is_anchored_at_one() {
        let next = next_fire_after(seoul(2024, 3, 5, 3, 30, 0), Timeframe::H4).unwrap();
        assert_eq!(next, seoul(2024, 3, 5, 5, 0, 0));
        let next = next_fire_after(seoul(2024, 3, 5, 1, 0, 0), Timeframe::H4).unwrap();
        assert_eq!(next, seoul(2024, 3, 5, 5, 0, 0));
        // Just after midnight the next slot is 01:00, carried from yesterday's grid.
        let next = next_fire_after(seoul(2024, 3, 5, 0, 30, 0), Timeframe::H4).unwrap();
        assert_eq!(next, seoul(2024, 3, 5, 1, 0, 0));
        let next = next_fire_after(seoul(2024, 3, 5, 22, 0, 0), Timeframe::H4).unwrap();
        assert_eq!(next, seoul(2024, 3, 6, 1, 0, 0));
    }

    #[test]
    fn daily_fires_at_one_am_local() {
        let next = next_fire_after(seoul(2024, 3, 5, 0, 30, 0), Timeframe::D1).unwrap();
        assert_eq!(next, seoul(2024, 3, 5, 1, 0, 0));
        let next = next_fire_after(seoul(2024, 3, 5, 1, 0, 0), Timeframe::D1).unwrap();
        assert_eq!(next, seoul(2024, 3, 6, 1, 0, 0));
        let next = next_fire_after(seoul(2024, 3, 5, 13, 0, 0), Timeframe::D1).unwrap();
        assert_eq!(next, seoul(2024, 3, 6, 1, 0, 0));
    }

    #[test]
    fn final_is_never_clock_driven() {
        assert!(next_fire_after(seoul(2024, 3, 5, 12, 0, 0), Timeframe::Final).is_none());
    }

    #[test]
    fn all_fires_are_aligned_and_strictly_future() {
        // Alignment property over a sweep of instants.
        let mut now = seoul(2024, 3, 1, 0, 0, 0);
        let end = seoul(2024, 3, 3, 0, 0, 0);
        while now < end {
            for tf in [Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1] {
                let next = next_fire_after(now, tf).unwrap();
                assert!(next > now, "{tf}: {next} not after {now}");
                assert_eq!(next.minute() % 15, 0);
                assert_eq!(next.second(), 0);
                match tf {
                    Timeframe::M15 => {}
                    Timeframe::H1 => assert_eq!(next.minute(), 0),
                    Timeframe::H4 => {
                        assert_eq!(next.minute(), 0);
                        assert_eq!((next.hour() + 24 - 1) % 4, 0, "hour {}", next.hour());
                    }
                    Timeframe::D1 => {
                        assert_eq!((next.hour(), next.minute()), (1, 0));
                    }
                    Timeframe::Final => unreachable!(),
                }
            }
            now += Duration::minutes(37); // coprime step to cover odd offsets
        }
    }

    // ---- runner-driven behaviour -----------------------------------------

    struct CountingRunner {
        timeframe_runs: AtomicU32,
        final_runs: AtomicU32,
        delay: StdDuration,
        fail_timeframes: bool,
    }

    impl CountingRunner {
        fn new(delay: StdDuration) -> Arc<Self> {
            Arc::new(Self {
                timeframe_runs: AtomicU32::new(0),
                final_runs: AtomicU32::new(0),
                delay,
                fail_timeframes: false,
            })
        }
    }

    #[async_trait]
    impl PipelineRunner for CountingRunner {
        async fn run_timeframe(&self, _tf: Timeframe, _trigger: TriggerKind) -> BotResult<()> {
            self.timeframe_runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_timeframes {
                return Err(crate::error::BotError::MarketDataUnavailable("scripted".into()));
            }
            Ok(())
        }

        async fn run_final(&self, _trigger: TriggerKind) -> BotResult<()> {
            self.final_runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn running_scheduler(runner: Arc<CountingRunner>) -> Arc<Scheduler> {
        let scheduler = Arc::new(Scheduler::new(runner, Seoul));
        // Boundary loops sleep for minutes; they will not fire during tests.
        scheduler.start(false);
        scheduler
    }

    #[tokio::test]
    async fn manual_trigger_is_single_flight() {
        let runner = CountingRunner::new(StdDuration::from_millis(200));
        let scheduler = running_scheduler(runner.clone());

        assert!(scheduler.trigger_analysis(Timeframe::H1).is_ok());
        let rejected = scheduler.trigger_analysis(Timeframe::H1);
        assert!(rejected.is_err(), "second trigger must be dropped");
        // A different timeframe is independent.
        assert!(scheduler.trigger_analysis(Timeframe::D1).is_ok());

        tokio::time::sleep(StdDuration::from_millis(400)).await;
        assert_eq!(runner.timeframe_runs.load(Ordering::SeqCst), 2);
        // After completion the flag is released.
        assert!(scheduler.trigger_analysis(Timeframe::H1).is_ok());
        scheduler.stop();
        scheduler.drain(StdDuration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn auto_four_hour_run_chains_into_final() {
        let runner = CountingRunner::new(StdDuration::ZERO);
        let scheduler = running_scheduler(runner.clone());

        // Drive the internal path the boundary loop takes.
        assert!(scheduler.try_acquire(Timeframe::H4));
        scheduler
            .clone()
            .run_pipeline(Timeframe::H4, TriggerKind::Auto, true)
            .await;
        assert_eq!(runner.final_runs.load(Ordering::SeqCst), 1);

        // A manual 4h analysis must NOT chain.
        assert!(scheduler.trigger_analysis(Timeframe::H4).is_ok());
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(runner.final_runs.load(Ordering::SeqCst), 1);
        scheduler.stop();
        scheduler.drain(StdDuration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_four_hour_run_does_not_chain() {
        let runner = Arc::new(CountingRunner {
            timeframe_runs: AtomicU32::new(0),
            final_runs: AtomicU32::new(0),
            delay: StdDuration::ZERO,
            fail_timeframes: true,
        });
        let scheduler = running_scheduler(runner.clone());

        assert!(scheduler.try_acquire(Timeframe::H4));
        scheduler
            .clone()
            .run_pipeline(Timeframe::H4, TriggerKind::Auto, true)
            .await;
        assert_eq!(runner.final_runs.load(Ordering::SeqCst), 0);
        scheduler.stop();
        scheduler.drain(StdDuration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn lifecycle_blocks_triggers_when_not_running() {
        let runner = CountingRunner::new(StdDuration::ZERO);
        let scheduler = Arc::new(Scheduler::new(runner, Seoul));

        // Stopped: nothing runs.
        assert!(scheduler.trigger_analysis(Timeframe::H1).is_err());
        assert!(scheduler.trigger_trade().is_err());

        scheduler.start(false);
        assert_eq!(scheduler.lifecycle(), Lifecycle::Running);
        scheduler.stop();
        assert_eq!(scheduler.lifecycle(), Lifecycle::Draining);
        assert!(scheduler.trigger_analysis(Timeframe::H1).is_err());

        scheduler.drain(StdDuration::from_millis(100)).await;
        assert_eq!(scheduler.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn trade_trigger_runs_final_once() {
        let runner = CountingRunner::new(StdDuration::ZERO);
        let scheduler = running_scheduler(runner.clone());

        assert!(scheduler.trigger_trade().is_ok());
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(runner.final_runs.load(Ordering::SeqCst), 1);
        scheduler.stop();
        scheduler.drain(StdDuration::from_secs(1)).await;
    }
}
