use super::schedule::{backoff_delay, near_poll_boundary, next_interval};
use super::{PollerState, PollingOptions, SnapshotSource};
use crate::discovery::{DiscoveryEngine, EventBus, SourceEvent, SweepReport};
use crate::error::SourceError;
use crate::model::SourceIdentity;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

struct Shared {
    source: Arc<dyn SnapshotSource>,
    identity: SourceIdentity,
    engine: Arc<Mutex<DiscoveryEngine>>,
    options: PollingOptions,
    events: EventBus,
    state: watch::Sender<PollerState>,
    should_poll: AtomicBool,
    stop_requested: AtomicBool,
    auth_blocked: AtomicBool,
    retries: AtomicU32,
    span: Span,
}

/// Handle to one source's polling loop. Clones share the same loop.
#[derive(Clone)]
pub struct Poller {
    shared: Arc<Shared>,
}

impl Poller {
    pub fn new(source: Arc<dyn SnapshotSource>, engine: DiscoveryEngine, options: PollingOptions, span: Span) -> Self {
        let identity = source.identity();
        let events = engine.events().clone();
        let (state, _) = watch::channel(PollerState::Idle);
        Self {
            shared: Arc::new(Shared {
                source,
                identity,
                engine: Arc::new(Mutex::new(engine)),
                options,
                events,
                state,
                should_poll: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                auth_blocked: AtomicBool::new(false),
                retries: AtomicU32::new(0),
                span,
            }),
        }
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.shared.identity
    }

    pub fn state(&self) -> PollerState {
        *self.shared.state.borrow()
    }

    pub fn is_polling(&self) -> bool {
        self.state() != PollerState::Idle
    }

    /// Wants to be polling (started and not explicitly stopped)
    pub fn should_poll(&self) -> bool {
        self.shared.should_poll.load(Ordering::SeqCst)
    }

    pub fn auth_blocked(&self) -> bool {
        self.shared.auth_blocked.load(Ordering::SeqCst)
    }

    /// Consecutive failed fetches in the current run
    pub fn retries(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    /// The engine behind this source. Lock it to inspect trackers; the poll loop
    /// and the sweeper take the same lock.
    pub fn engine(&self) -> Arc<Mutex<DiscoveryEngine>> {
        self.shared.engine.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PollerState> {
        self.shared.state.subscribe()
    }

    /// Spawns the polling loop. Returns None if it is already running.
    ///
    /// Starting explicitly counts as re-authentication, so an auth block is lifted.
    pub fn start_polling(&self) -> Option<JoinHandle<()>> {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == PollerState::Idle {
                *state = PollerState::Polling;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(parent: &self.shared.span, "already polling, ignoring start");
            return None;
        }

        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.should_poll.store(true, Ordering::SeqCst);
        self.shared.auth_blocked.store(false, Ordering::SeqCst);
        self.shared.retries.store(0, Ordering::SeqCst);
        self.shared.announce(PollerState::Polling);

        let shared = self.shared.clone();
        let span = self.shared.span.clone();
        Some(tokio::spawn(async move { shared.run().await }.instrument(span)))
    }

    /// Asks the loop to stop. With `wait`, blocks (bounded by `stop_wait`) until it has.
    /// Returns whether the loop is known to be stopped.
    pub async fn stop_polling(&self, wait: bool) -> bool {
        self.shared.should_poll.store(false, Ordering::SeqCst);
        if !self.is_polling() {
            return true;
        }

        info!(parent: &self.shared.span, "stop requested");
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if !wait {
            return false;
        }

        let acknowledged = self.wait_until_idle(self.shared.options.stop_wait).await;
        if !acknowledged {
            warn!(parent: &self.shared.span, "poll loop did not stop within {:?}", self.shared.options.stop_wait);
        }
        acknowledged
    }

    pub async fn wait_until_idle(&self, limit: Duration) -> bool {
        let mut rx = self.shared.state.subscribe();
        let reached = tokio::time::timeout(limit, async move {
            rx.wait_for(|state| *state == PollerState::Idle).await.is_ok()
        })
        .await;
        matches!(reached, Ok(true))
    }

    /// One health pass over the trackers, serialized with the poll loop
    pub async fn sweep(&self) -> SweepReport {
        let mut engine = self.shared.engine.lock().await;
        engine.sweep_players_at(Utc::now())
    }

    /// Background task running [`Poller::sweep`] on a fixed cadence
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let poller = self.clone();
        let span = self.shared.span.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let report = poller.sweep().await;
                    if !report.removed.is_empty() {
                        debug!("sweep removed {} players", report.removed.len());
                    }
                }
            }
            .instrument(span),
        )
    }
}

impl Shared {
    fn announce(&self, state: PollerState) {
        self.events.emit(SourceEvent::PollerStateChanged {
            source: self.identity.name.clone(),
            state,
        });
    }

    fn set_state(&self, next: PollerState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("poller now {}", next);
            self.announce(next);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Sleeps in `stop_check` slices. False if a stop came in meanwhile.
    async fn sleep_cooperatively(&self, total: Duration) -> bool {
        let step = self.options.stop_check.max(Duration::from_millis(10));
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.stop_requested() {
                return false;
            }
            let slice = remaining.min(step);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
        !self.stop_requested()
    }

    async fn run(&self) {
        info!("polling started");
        if self.process_backlog().await {
            self.poll_loop().await;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.set_state(PollerState::Idle);
        info!("polling stopped");
    }

    /// False when the source needs re-auth and polling can't go on
    async fn process_backlog(&self) -> bool {
        match self.source.fetch_backlog().await {
            Ok(plays) if plays.is_empty() => true,
            Ok(plays) => {
                let mut engine = self.engine.lock().await;
                let accepted = engine.process_backlog(plays);
                engine.publish_discoveries(&accepted);
                true
            }
            Err(e) if e.is_auth() => {
                self.block_on_auth(&e);
                false
            }
            Err(e) => {
                warn!("backlog fetch failed, carrying on with live polling: {}", e);
                true
            }
        }
    }

    fn block_on_auth(&self, e: &SourceError) {
        error!("{} - source stays idle until re-authenticated", e);
        self.auth_blocked.store(true, Ordering::SeqCst);
    }

    async fn poll_loop(&self) {
        let mut retries: u32 = 0;
        let mut idle_cycles: u32 = 0;

        while !self.stop_requested() {
            let snapshots = match self.source.fetch().await {
                Ok(snapshots) => {
                    if retries > 0 {
                        info!("fetch recovered after {} retries", retries);
                    }
                    retries = 0;
                    self.retries.store(0, Ordering::SeqCst);
                    self.set_state(PollerState::Polling);
                    snapshots
                }
                Err(e) if e.is_auth() => {
                    self.block_on_auth(&e);
                    return;
                }
                Err(e) => {
                    if retries >= self.options.max_poll_retries {
                        let exhausted = SourceError::Exhausted {
                            attempts: retries + 1,
                            last: e.to_string(),
                        };
                        error!("{}", exhausted);
                        return;
                    }

                    retries += 1;
                    self.retries.store(retries, Ordering::SeqCst);
                    let delay = backoff_delay(&self.options, retries);
                    warn!("fetch failed ({}), retry {} of {} in {:?}", e, retries, self.options.max_poll_retries, delay);
                    self.set_state(PollerState::Retrying);
                    self.events.emit(SourceEvent::PollRetry {
                        source: self.identity.name.clone(),
                        attempt: retries,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    if !self.sleep_cooperatively(delay).await {
                        return;
                    }
                    continue;
                }
            };

            let polled_at = Utc::now();
            let (discovered, interval) = {
                let mut engine = self.engine.lock().await;
                let discovered = engine.process_recent_plays_at(snapshots, polled_at);
                if engine.any_playing() {
                    idle_cycles = 0;
                } else {
                    idle_cycles = idle_cycles.saturating_add(1);
                }
                let remaining = engine.min_remaining_at(polled_at);
                (discovered, next_interval(&self.options, remaining, idle_cycles))
            };

            if !discovered.is_empty() {
                if near_poll_boundary(&discovered, polled_at, self.options.boundary_window) {
                    debug!("discoveries right at the poll boundary, holding for {:?}", self.options.boundary_delay);
                    if !self.sleep_cooperatively(self.options.boundary_delay).await {
                        // still hand them over, they are already in the history
                        self.engine.lock().await.publish_discoveries(&discovered);
                        return;
                    }
                }
                self.engine.lock().await.publish_discoveries(&discovered);
            }

            if !self.sleep_cooperatively(interval).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryOptions;
    use crate::model::{PlatformId, Play, ReportedStatus, Snapshot};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` fetches with the given error, then serves `batches`
    struct ScriptedSource {
        failures: u32,
        auth: bool,
        calls: AtomicUsize,
        batches: Vec<Vec<Snapshot>>,
        backlog: Vec<Play>,
    }

    impl ScriptedSource {
        fn failing(failures: u32) -> Self {
            Self {
                failures,
                auth: false,
                calls: AtomicUsize::new(0),
                batches: Vec::new(),
                backlog: Vec::new(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        fn identity(&self) -> SourceIdentity {
            SourceIdentity::new("scripted", "test")
        }

        async fn fetch(&self) -> Result<Vec<Snapshot>, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if (call as u32) < self.failures {
                return Err(if self.auth {
                    SourceError::Auth("token revoked".into())
                } else {
                    SourceError::Transient("connection reset".into())
                });
            }
            let served = call - self.failures as usize;
            Ok(self.batches.get(served).cloned().unwrap_or_default())
        }

        async fn fetch_backlog(&self) -> Result<Vec<Play>, SourceError> {
            Ok(self.backlog.clone())
        }
    }

    fn poller_for(source: Arc<ScriptedSource>, options: PollingOptions) -> (Poller, tokio::sync::broadcast::Receiver<SourceEvent>) {
        let bus = EventBus::new(64);
        let rx = bus.subscribe();
        let engine = DiscoveryEngine::new(source.identity(), DiscoveryOptions::default(), bus, Span::none());
        (Poller::new(source, engine, options, Span::none()), rx)
    }

    fn retry_options(max_poll_retries: u32) -> PollingOptions {
        PollingOptions {
            max_poll_retries,
            retry_base: Duration::from_secs(1),
            retry_multiplier: 2.0,
            ..PollingOptions::default()
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<SourceEvent>) -> Vec<SourceEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_then_idle() {
        let source = Arc::new(ScriptedSource::failing(3));
        let (poller, mut rx) = poller_for(source.clone(), retry_options(2));

        assert!(poller.start_polling().is_some());
        assert!(poller.wait_until_idle(Duration::from_secs(120)).await);

        assert_eq!(source.calls(), 3);
        assert_eq!(poller.state(), PollerState::Idle);
        assert!(!poller.auth_blocked());
        assert!(poller.should_poll());

        let retries: Vec<(u32, u64)> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                SourceEvent::PollRetry { attempt, delay_ms, .. } => Some((attempt, delay_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(1, 2000), (2, 4000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_before_retries_run_out() {
        let source = Arc::new(ScriptedSource::failing(1));
        let (poller, _rx) = poller_for(source.clone(), retry_options(2));

        poller.start_polling();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(poller.state(), PollerState::Polling);
        assert_eq!(poller.retries(), 0);
        assert!(source.calls() >= 2);

        assert!(poller.stop_polling(true).await);
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_blocks_source() {
        let mut scripted = ScriptedSource::failing(1);
        scripted.auth = true;
        let source = Arc::new(scripted);
        let (poller, mut rx) = poller_for(source.clone(), retry_options(5));

        poller.start_polling();
        assert!(poller.wait_until_idle(Duration::from_secs(10)).await);
        assert!(poller.auth_blocked());
        assert_eq!(source.calls(), 1);
        assert!(!drain(&mut rx).iter().any(|e| matches!(e, SourceEvent::PollRetry { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop() {
        let source = Arc::new(ScriptedSource::failing(0));
        let (poller, _rx) = poller_for(source, PollingOptions::default());
        assert!(poller.start_polling().is_some());
        assert!(poller.start_polling().is_none());
        assert!(poller.stop_polling(true).await);
        assert!(!poller.should_poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_announced() {
        let source = Arc::new(ScriptedSource::failing(0));
        let (poller, mut rx) = poller_for(source, PollingOptions::default());
        poller.start_polling();
        tokio::time::sleep(Duration::from_secs(1)).await;
        poller.stop_polling(true).await;

        let states: Vec<PollerState> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                SourceEvent::PollerStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![PollerState::Polling, PollerState::Idle]);
    }

    fn at(play: &Play, when: DateTime<Utc>) -> Snapshot {
        Snapshot::new(PlatformId::new("desk", "alice"))
            .with_play(play.clone())
            .with_status(ReportedStatus::Playing)
            .at(when)
    }

    #[tokio::test(start_paused = true)]
    async fn test_discoveries_and_backlog_are_published() {
        let now = Utc::now();
        let one = Play::new("One More Time", vec!["Daft Punk".into()]).with_duration(200.0);
        let two = Play::new("Aerodynamic", vec!["Daft Punk".into()]).with_duration(200.0);
        let mut old = Play::new("Digital Love", vec!["Daft Punk".into()])
            .with_play_date(now - ChronoDuration::hours(2))
            .with_listened_for(240.0);
        old.set_platform(&PlatformId::new("desk", "alice"));

        let mut scripted = ScriptedSource::failing(0);
        scripted.batches = vec![vec![
            at(&one, now - ChronoDuration::seconds(200)),
            at(&one, now - ChronoDuration::seconds(100)),
            at(&two, now - ChronoDuration::seconds(60)),
        ]];
        scripted.backlog = vec![old];
        let source = Arc::new(scripted);
        let (poller, mut rx) = poller_for(source, PollingOptions::default());

        poller.start_polling();
        tokio::time::sleep(Duration::from_secs(1)).await;
        poller.stop_polling(true).await;

        let discovered: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                SourceEvent::Discovered { plays, .. } => Some(plays),
                _ => None,
            })
            .flatten()
            .map(|play| play.data.track)
            .collect();
        assert_eq!(discovered, vec!["Digital Love".to_string(), "One More Time".to_string()]);
        assert_eq!(poller.engine().lock().await.discovered_count(), 2);
    }
}
