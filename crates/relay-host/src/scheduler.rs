//! Periodic eligibility scans and batched dispatch.
//!
//! Every configured request kind gets its own fixed-interval timer. A tick
//! spawns `process_kind` as a separate task, so stopping the timers never
//! cancels a run that is already dispatching. Overlapping ticks for one kind
//! are dropped by the per-kind in-flight flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use relay_store::{RequestKind, Session, Timestamp};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

use crate::clock::millis;
use crate::config::SchedulerConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::monitor::ConfirmationMonitor;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// The run was dropped because another one for the same kind was in flight.
    pub skipped: bool,
    pub eligible: usize,
    pub batches: usize,
    pub approved: usize,
    pub rejected: usize,
}

impl RunReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Clears the in-flight flag when the run ends, however it ends.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<ConfirmationMonitor>,
    config: SchedulerConfig,
    in_flight: Mutex<HashMap<RequestKind, Arc<AtomicBool>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<Dispatcher>,
        monitor: Arc<ConfirmationMonitor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            monitor,
            config,
            in_flight: Mutex::new(HashMap::new()),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether `session` is due for a new request of `kind` at `now`.
    pub fn is_eligible(&self, session: &Session, kind: &RequestKind, now: Timestamp) -> bool {
        session.active
            && !session.is_approved(kind)
            && session.attempts < self.config.max_attempts
            && session
                .last_dispatch(kind)
                .is_none_or(|last| now.saturating_sub(last) >= millis(self.config.min_interval))
    }

    /// Eligible session ids for `kind`, oldest connection first.
    pub fn eligible(&self, kind: &RequestKind) -> Vec<String> {
        let now = self.registry.clock().now_ms();
        let mut due: Vec<Session> = self
            .registry
            .all()
            .into_iter()
            .filter(|s| self.is_eligible(s, kind, now))
            .collect();
        due.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        due.into_iter().map(|s| s.id().to_string()).collect()
    }

    fn flag_for(&self, kind: &RequestKind) -> Arc<AtomicBool> {
        let mut flags = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        flags.entry(kind.clone()).or_default().clone()
    }

    pub fn any_in_flight(&self) -> bool {
        let flags = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        flags.values().any(|f| f.load(Ordering::Acquire))
    }

    /// One scan-and-dispatch pass for `kind`. A no-op while another pass for
    /// the same kind is still running.
    pub async fn process_kind(&self, kind: &RequestKind) -> RunReport {
        let flag = self.flag_for(kind);
        let Some(_guard) = InFlight::acquire(&flag) else {
            debug!(%kind, "previous run still in flight; skipping tick");
            return RunReport::skipped();
        };

        let ids = self.eligible(kind);
        let mut report = RunReport {
            eligible: ids.len(),
            ..RunReport::default()
        };
        if ids.is_empty() {
            return report;
        }

        for (index, batch) in ids.chunks(self.config.batch_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_pause).await;
            }
            let outcomes = join_all(batch.iter().map(|id| self.dispatcher.dispatch(id, kind))).await;
            for outcome in outcomes {
                match outcome {
                    DispatchOutcome::Approved { .. } => report.approved += 1,
                    DispatchOutcome::Rejected(_) => report.rejected += 1,
                    DispatchOutcome::Missing => {}
                }
            }
            report.batches += 1;
        }

        info!(
            %kind,
            eligible = report.eligible,
            batches = report.batches,
            approved = report.approved,
            rejected = report.rejected,
            "dispatch run finished"
        );
        report
    }

    /// Cleanup sweep followed by ledger trimming.
    pub fn run_maintenance(&self) -> (usize, usize) {
        let removed = self
            .registry
            .cleanup_inactive(self.config.inactivity_threshold);
        let trimmed = self.registry.trim_ledgers(self.config.ledger_cap);
        (removed, trimmed)
    }

    /// Spawns every timer. Calling it while timers run does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if !timers.is_empty() {
            return;
        }

        for schedule in &self.config.kinds {
            let kind = schedule.kind.clone();
            timers.push(spawn_ticker(self, schedule.tick, move |scheduler| {
                let kind = kind.clone();
                tokio::spawn(async move {
                    scheduler.process_kind(&kind).await;
                });
            }));
        }
        timers.push(spawn_ticker(
            self,
            self.config.maintenance_interval,
            |scheduler| {
                scheduler.run_maintenance();
            },
        ));
        timers.push(spawn_ticker(
            self,
            self.config.confirmation_interval,
            |scheduler| {
                tokio::spawn(async move {
                    scheduler.monitor.sweep().await;
                });
            },
        ));
        info!(timers = timers.len(), "scheduler started");
    }

    /// Stops every timer. In-flight runs finish and apply their outcomes.
    pub fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
            timers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        for handle in &handles {
            handle.abort();
        }
        info!(timers = handles.len(), "scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.active_timers() > 0
    }

    pub fn active_timers(&self) -> usize {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_ticker<F>(scheduler: &Arc<Scheduler>, period: Duration, on_tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<Scheduler>) + Send + 'static,
{
    let weak: Weak<Scheduler> = Arc::downgrade(scheduler);
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(scheduler) = weak.upgrade() else { break };
            on_tick(scheduler);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticPayloads;
    use crate::adapters::mock::MockApproval;
    use crate::clock::ManualClock;
    use crate::config::{ConfirmationConfig, DispatchConfig, KindSchedule, PersistenceConfig};
    use crate::identity::IdentifierPolicy;
    use crate::oracle::SimulatedOracle;
    use relay_store::{ChunkedRepository, MemKv};

    fn id(n: usize) -> String {
        format!("EQ{:0>46}", n)
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            kinds: vec![KindSchedule::new("renewal", Duration::from_secs(8))],
            batch_size: 2,
            batch_pause: Duration::from_millis(500),
            min_interval: Duration::from_secs(30),
            max_attempts: 3,
            maintenance_interval: Duration::from_secs(3_600),
            inactivity_threshold: Duration::from_secs(86_400),
            ledger_cap: 20,
            confirmation_interval: Duration::from_secs(3_600),
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<SessionRegistry>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture(mock: Arc<MockApproval>, sessions: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(ChunkedRepository::new(MemKv::new())),
            IdentifierPolicy::default(),
            clock.clone(),
            &PersistenceConfig::default(),
        ));
        for n in 0..sessions {
            registry.upsert(&id(n)).expect("valid id");
        }
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            mock,
            Arc::new(StaticPayloads::new()),
            DispatchConfig::default(),
        ));
        let monitor = Arc::new(ConfirmationMonitor::new(
            registry.clone(),
            Arc::new(SimulatedOracle::from_config(&ConfirmationConfig::default())),
        ));
        let scheduler = Arc::new(Scheduler::new(registry.clone(), dispatcher, monitor, config()));
        Fixture {
            clock,
            registry,
            scheduler,
        }
    }

    fn kind() -> RequestKind {
        RequestKind::new("renewal")
    }

    #[test]
    fn eligibility_predicate() {
        let f = fixture(Arc::new(MockApproval::approving()), 0);
        let now = 100_000;
        let mut session = Session::new(id(1), 0);
        assert!(f.scheduler.is_eligible(&session, &kind(), now));

        session.last_dispatch.insert(kind(), now - 29_999);
        assert!(!f.scheduler.is_eligible(&session, &kind(), now));
        session.last_dispatch.insert(kind(), now - 30_000);
        assert!(f.scheduler.is_eligible(&session, &kind(), now));

        session.attempts = 3;
        assert!(!f.scheduler.is_eligible(&session, &kind(), now));
        session.attempts = 0;

        session.active = false;
        assert!(!f.scheduler.is_eligible(&session, &kind(), now));
        session.active = true;

        session.mark_approved(&kind());
        assert!(!f.scheduler.is_eligible(&session, &kind(), now));
        assert!(f.scheduler.is_eligible(&session, &RequestKind::new("other"), now));
    }

    #[tokio::test(start_paused = true)]
    async fn batches_run_sequentially_with_bounded_concurrency() {
        let mock = Arc::new(MockApproval::approving().with_delay(Duration::from_millis(50)));
        let f = fixture(mock.clone(), 5);

        let started = Instant::now();
        let report = f.scheduler.process_kind(&kind()).await;
        assert_eq!(report.eligible, 5);
        assert_eq!(report.batches, 3);
        assert_eq!(report.approved, 5);
        assert_eq!(mock.calls(), 5);
        assert_eq!(mock.max_in_flight(), 2);
        // three batches of 50ms plus two pauses of 500ms
        assert!(started.elapsed() >= Duration::from_millis(1_150));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_run_for_same_kind_is_skipped() {
        let mock = Arc::new(MockApproval::approving().with_delay(Duration::from_secs(2)));
        let f = fixture(mock.clone(), 2);

        let first = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.process_kind(&kind()).await })
        };
        // let the first run reach the approval await
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(f.scheduler.any_in_flight());

        let second = f.scheduler.process_kind(&kind()).await;
        assert!(second.skipped);

        let first = first.await.expect("join");
        assert!(!first.skipped);
        assert_eq!(first.approved, 2);
        assert_eq!(mock.calls(), 2);
        assert!(!f.scheduler.any_in_flight());
    }

    #[tokio::test]
    async fn rejected_sessions_drop_out_after_max_attempts() {
        let mock = Arc::new(MockApproval::rejecting());
        let f = fixture(mock.clone(), 1);

        for _ in 0..3 {
            let report = f.scheduler.process_kind(&kind()).await;
            assert_eq!(report.rejected, 1);
            // inside min_interval nothing is due
            assert_eq!(f.scheduler.process_kind(&kind()).await.eligible, 0);
            f.clock.advance(Duration::from_secs(30));
        }
        for _ in 0..3 {
            assert_eq!(f.scheduler.process_kind(&kind()).await.eligible, 0);
            f.clock.advance(Duration::from_secs(30));
        }

        let session = f.registry.get(&id(0)).expect("session");
        assert_eq!(session.attempts, 3);
        assert!(!session.is_approved(&kind()));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let f = fixture(Arc::new(MockApproval::approving()), 1);
        f.scheduler.start();
        f.scheduler.start();
        assert_eq!(f.scheduler.active_timers(), 3);
        f.scheduler.stop();
        f.scheduler.stop();
        assert!(!f.scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_ticks_dispatch_eligible_sessions() {
        let mock = Arc::new(MockApproval::approving());
        let f = fixture(mock.clone(), 3);
        f.scheduler.start();

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(mock.calls(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.calls(), 3);
        f.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_lets_in_flight_dispatch_finish() {
        let mock = Arc::new(MockApproval::approving().with_delay(Duration::from_secs(5)));
        let f = fixture(mock.clone(), 1);
        f.scheduler.start();

        tokio::time::sleep(Duration::from_millis(8_100)).await;
        assert_eq!(mock.calls(), 1);
        f.scheduler.stop();
        assert!(!f.registry.get(&id(0)).expect("session").is_approved(&kind()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(f.registry.get(&id(0)).expect("session").is_approved(&kind()));
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn maintenance_trims_ledgers_to_cap() {
        let f = fixture(Arc::new(MockApproval::approving()), 1);
        f.registry.update(&id(0), |s| {
            for ts in 0..30u64 {
                s.record_failure(relay_store::Attempt::failed(kind(), String::new(), ts), ts);
            }
        });
        let (removed, trimmed) = f.scheduler.run_maintenance();
        assert_eq!(removed, 0);
        assert_eq!(trimmed, 10);

        let ledger = f.registry.get(&id(0)).expect("session").ledger;
        assert_eq!(ledger.len(), 20);
        let stamps: Vec<u64> = ledger.iter().map(|a| a.created_at).collect();
        assert_eq!(stamps, (10..30).rev().collect::<Vec<u64>>());
    }
}
