//! Actor Election
//!
//! Every participating process runs the same two duties:
//! - Election: race for the actor token; the winner clears the vacancy flag,
//!   arms its exit hook, runs the caller's action and starts heartbeating
//! - Monitoring: while a candidate, race again as soon as a vacancy is
//!   announced, and poll the heartbeat so a silent (crashed) actor is replaced
//!   through the reset race
//!
//! A process becomes the actor at most once and never steps back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ElectionConfig;
use crate::error::{ElectionError, Result};
use crate::heartbeat::{evaluate_heartbeat, HeartbeatStatus};
use crate::race::RacePrimitive;
use crate::store::{SharedStore, Subscription};

const INITIAL_RESUBSCRIBE_BACKOFF_MS: u64 = 1000;
const MAX_RESUBSCRIBE_BACKOFF_MS: u64 = 30_000;

/// Callback run once when this process becomes the actor
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Role of this process. Moves from `Candidate` to `Acting` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Candidate,
    Acting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TakeoverPath {
    /// Won the actor race
    Election,
    /// Won the reset race after the heartbeat went stale
    Recovery,
}

/// Why a vacancy relay stopped
enum FeedState {
    /// This process is acting, or the role channel is gone
    Done,
    /// The change feed ended underneath the listener
    Closed,
}

impl TakeoverPath {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Election => "election",
            Self::Recovery => "recovery",
        }
    }
}

/// Election coordinator and heartbeat/recovery monitor for one process
pub struct ActorElection {
    config: ElectionConfig,
    store: Arc<dyn SharedStore>,
    race: Arc<dyn RacePrimitive>,
    clock: Arc<dyn Clock>,
    role_tx: watch::Sender<Role>,
    action: Mutex<Option<Action>>,
    joined: AtomicBool,
    holds_actor_token: AtomicBool,
    holds_reset_token: AtomicBool,
    exit_hook_armed: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ActorElection {
    /// Create an election for this process. Nothing happens until `join`.
    pub fn new(
        config: ElectionConfig,
        store: Arc<dyn SharedStore>,
        race: Arc<dyn RacePrimitive>,
    ) -> Result<Self> {
        config.validate()?;
        let (role_tx, _) = watch::channel(Role::Candidate);

        Ok(Self {
            config,
            store,
            race,
            clock: Arc::new(SystemClock),
            role_tx,
            action: Mutex::new(None),
            joined: AtomicBool::new(false),
            holds_actor_token: AtomicBool::new(false),
            holds_reset_token: AtomicBool::new(false),
            exit_hook_armed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Replace the wall-clock source used for heartbeat timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Join the election.
    ///
    /// Opens the change feed, then races for the actor token. When the race
    /// is lost the process stays a candidate with a notification listener and
    /// a heartbeat poller running in the background.
    ///
    /// Errors from opening the feed or from the first race are returned: they
    /// mean the store or the race primitive is unavailable.
    pub async fn join<F>(self: &Arc<Self>, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.joined.swap(true, Ordering::SeqCst) {
            return Err(ElectionError::AlreadyJoined);
        }
        *self.action.lock() = Some(Box::new(action));

        info!(
            instance_id = %self.config.instance_id,
            actor_race_id = %self.config.actor_race_id,
            "Joining actor election"
        );

        // Subscribe before racing so a vacancy announced in between is buffered
        let subscription = match self.store.subscribe().await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.joined.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        match self.try_become_actor().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                self.joined.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        info!(instance_id = %self.config.instance_id, "Standing by as candidate");
        let listener = tokio::spawn(Arc::clone(self).listen(subscription));
        let monitor = tokio::spawn(Arc::clone(self).monitor());
        self.track(listener);
        self.track(monitor);

        Ok(())
    }

    /// Race for the actor token and take over on a win.
    ///
    /// Returns `true` only for the call that performed the takeover. Once this
    /// process is acting every call is a no-op returning `false`.
    ///
    /// A token won while another actor still heartbeats and no vacancy was
    /// announced is an orphan freed after a recovery; it is handed back.
    pub async fn try_become_actor(self: &Arc<Self>) -> Result<bool> {
        if self.is_acting() {
            debug!(instance_id = %self.config.instance_id, "Already acting; ignoring election trigger");
            return Ok(false);
        }

        if !self.race.race(&self.config.actor_race_id).await? {
            debug!(
                instance_id = %self.config.instance_id,
                race_id = %self.config.actor_race_id,
                "Actor race lost"
            );
            return Ok(false);
        }

        if self.another_actor_is_live().await {
            info!(
                instance_id = %self.config.instance_id,
                race_id = %self.config.actor_race_id,
                "Won a freed actor token while another actor is heartbeating; handing it back"
            );
            self.race.end_race(&self.config.actor_race_id);
            return Ok(false);
        }
        self.holds_actor_token.store(true, Ordering::SeqCst);

        Ok(self.take_over(TakeoverPath::Election).await)
    }

    /// Fresh heartbeat and no vacancy flag: some process is acting right now
    async fn another_actor_is_live(&self) -> bool {
        match self.store.get(&self.config.vacant_key).await {
            Ok(Some(_)) => return false,
            Ok(None) => {}
            Err(e) => {
                warn!(instance_id = %self.config.instance_id, error = %e, "Failed to read vacancy flag");
                return false;
            }
        }

        match self.store.get(&self.config.heartbeat_key).await {
            Ok(raw) => matches!(
                evaluate_heartbeat(raw.as_deref(), self.clock.now_millis(), self.config.heartbeat_timeout()),
                HeartbeatStatus::Fresh { .. }
            ),
            Err(e) => {
                warn!(instance_id = %self.config.instance_id, error = %e, "Failed to read heartbeat");
                false
            }
        }
    }

    /// Take-over sequence. Runs at most once per process.
    async fn take_over(self: &Arc<Self>, path: TakeoverPath) -> bool {
        let promoted = self.role_tx.send_if_modified(|role| match role {
            Role::Candidate => {
                *role = Role::Acting;
                true
            }
            Role::Acting => false,
        });
        if !promoted {
            debug!(
                instance_id = %self.config.instance_id,
                path = path.as_str(),
                "Take-over already happened"
            );
            return false;
        }

        info!(instance_id = %self.config.instance_id, path = path.as_str(), "Became actor");
        metrics::counter!("baton_takeovers_total", "path" => path.as_str()).increment(1);

        // Reset the fast-path signal for the next handoff
        if let Err(e) = self.store.remove(&self.config.vacant_key).await {
            warn!(instance_id = %self.config.instance_id, error = %e, "Failed to clear vacancy flag");
        }

        self.exit_hook_armed.store(true, Ordering::SeqCst);

        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }

        self.start_heartbeat().await;
        true
    }

    /// Write the first heartbeat now, then keep refreshing it in the background.
    /// Each tick also picks up the actor token if this process does not hold it.
    async fn start_heartbeat(self: &Arc<Self>) {
        let period = self.config.heartbeat_interval;
        self.beat().await;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                this.beat().await;
                this.claim_actor_token().await;
            }
        });
        self.track(handle);
    }

    async fn beat(&self) {
        beat(
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.config.heartbeat_key,
            &self.config.instance_id,
        )
        .await;
    }

    /// After a recovery the crashed actor's token stays held until the race
    /// primitive frees it; take it as soon as that happens.
    async fn claim_actor_token(&self) {
        if self.holds_actor_token.load(Ordering::SeqCst) {
            return;
        }

        match self.race.race(&self.config.actor_race_id).await {
            Ok(true) => {
                self.holds_actor_token.store(true, Ordering::SeqCst);
                info!(
                    instance_id = %self.config.instance_id,
                    race_id = %self.config.actor_race_id,
                    "Claimed freed actor race token"
                );
            }
            Ok(false) => {}
            Err(e) => {
                debug!(instance_id = %self.config.instance_id, error = %e, "Actor token claim failed");
            }
        }
    }

    /// Fast path: race as soon as another process announces a vacancy
    async fn listen(self: Arc<Self>, mut subscription: Subscription) {
        let mut role_rx = self.role_tx.subscribe();

        loop {
            match self.relay_vacancies(&mut subscription, &mut role_rx).await {
                FeedState::Done => break,
                FeedState::Closed => {
                    warn!(instance_id = %self.config.instance_id, "Change feed closed; reopening");
                    match self.reopen_feed(&mut role_rx).await {
                        Some(reopened) => subscription = reopened,
                        None => break,
                    }
                }
            }
        }

        drop(subscription);
        debug!(instance_id = %self.config.instance_id, "Vacancy listener stopped");
    }

    async fn relay_vacancies(
        self: &Arc<Self>,
        subscription: &mut Subscription,
        role_rx: &mut watch::Receiver<Role>,
    ) -> FeedState {
        loop {
            if self.is_acting() {
                return FeedState::Done;
            }

            tokio::select! {
                changed = role_rx.changed() => {
                    if changed.is_err() {
                        return FeedState::Done;
                    }
                }
                event = subscription.recv() => {
                    match event {
                        Some(event) if event.is_set_of(&self.config.vacant_key) => {
                            info!(instance_id = %self.config.instance_id, "Vacancy announced; racing for actor");
                            self.trigger_election().await;
                        }
                        Some(_) => {}
                        None => return FeedState::Closed,
                    }
                }
            }
        }
    }

    /// Resubscribe with exponential backoff. A vacancy announced while the
    /// feed was down is still in the store, so it is checked once reopened.
    async fn reopen_feed(
        self: &Arc<Self>,
        role_rx: &mut watch::Receiver<Role>,
    ) -> Option<Subscription> {
        let mut backoff_ms = INITIAL_RESUBSCRIBE_BACKOFF_MS;

        loop {
            if self.is_acting() {
                return None;
            }

            tokio::select! {
                _ = sleep(Duration::from_millis(backoff_ms)) => {}
                changed = role_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
            }

            match self.store.subscribe().await {
                Ok(subscription) => {
                    info!(instance_id = %self.config.instance_id, "Change feed reopened");
                    if let Ok(Some(_)) = self.store.get(&self.config.vacant_key).await {
                        self.trigger_election().await;
                    }
                    return Some(subscription);
                }
                Err(e) => {
                    warn!(
                        instance_id = %self.config.instance_id,
                        error = %e,
                        retry_in_ms = backoff_ms,
                        "Failed to reopen change feed"
                    );
                    backoff_ms = (backoff_ms * 2).min(MAX_RESUBSCRIBE_BACKOFF_MS);
                }
            }
        }
    }

    async fn trigger_election(self: &Arc<Self>) {
        if let Err(e) = self.try_become_actor().await {
            warn!(instance_id = %self.config.instance_id, error = %e, "Election attempt failed");
        }
    }

    /// Slow path: poll the heartbeat and recover from a silent actor
    async fn monitor(self: Arc<Self>) {
        let mut role_rx = self.role_tx.subscribe();
        let period = self.config.poll_interval;

        // First check one period in, so a freshly elected actor's heartbeat is visible
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.is_acting() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.check_heartbeat().await;
                }
                changed = role_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(instance_id = %self.config.instance_id, "Heartbeat monitor stopped");
    }

    async fn check_heartbeat(self: &Arc<Self>) {
        let raw = match self.store.get(&self.config.heartbeat_key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(instance_id = %self.config.instance_id, error = %e, "Failed to read heartbeat");
                return;
            }
        };

        let timeout = self.config.heartbeat_timeout();
        let status = evaluate_heartbeat(raw.as_deref(), self.clock.now_millis(), timeout);

        match status {
            HeartbeatStatus::Absent => {
                debug!(instance_id = %self.config.instance_id, "No heartbeat recorded yet");
            }
            HeartbeatStatus::Fresh { age_ms } => {
                debug!(instance_id = %self.config.instance_id, age_ms, "Actor heartbeat is fresh");
            }
            HeartbeatStatus::Stale { age_ms } => {
                warn!(
                    instance_id = %self.config.instance_id,
                    age_ms,
                    timeout_ms = timeout.as_millis() as u64,
                    "Actor heartbeat is stale; presuming actor crashed"
                );
                metrics::counter!("baton_stale_heartbeats_total").increment(1);
                self.recover().await;
            }
            HeartbeatStatus::Malformed => {
                warn!(
                    instance_id = %self.config.instance_id,
                    raw = raw.as_deref().unwrap_or_default(),
                    "Heartbeat is not a timestamp; treating actor as crashed"
                );
                metrics::counter!("baton_stale_heartbeats_total").increment(1);
                self.recover().await;
            }
        }
    }

    /// Take over through the reset race, bypassing a possibly orphaned actor token
    async fn recover(self: &Arc<Self>) {
        match self.race.race(&self.config.reset_race_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(instance_id = %self.config.instance_id, "Reset race lost; another candidate is recovering");
                return;
            }
            Err(e) => {
                warn!(instance_id = %self.config.instance_id, error = %e, "Reset race failed");
                return;
            }
        }
        self.holds_reset_token.store(true, Ordering::SeqCst);
        info!(instance_id = %self.config.instance_id, "Won reset race; taking over from silent actor");

        self.take_over(TakeoverPath::Recovery).await;

        // Keep the token until our heartbeat is visible to the other pollers
        let this = Arc::clone(self);
        let settle = self.config.settle_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            this.release_reset_token();
        });
        self.track(handle);
    }

    fn release_reset_token(&self) {
        if self.holds_reset_token.swap(false, Ordering::SeqCst) {
            self.race.end_race(&self.config.reset_race_id);
            debug!(instance_id = %self.config.instance_id, "Released reset race token");
        }
    }

    /// Run the exit hook: hand off the actor role and stop all background work.
    ///
    /// Call this from the host's shutdown path. It is best effort by nature: a
    /// process killed outright never runs it, and survivors then recover
    /// through heartbeat staleness instead. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!(instance_id = %self.config.instance_id, role = ?self.role(), "Leaving actor election");
        self.stop_tasks();

        if self.holds_actor_token.swap(false, Ordering::SeqCst) {
            self.race.end_race(&self.config.actor_race_id);
            info!(instance_id = %self.config.instance_id, "Released actor race token");
        }

        if self.exit_hook_armed.swap(false, Ordering::SeqCst) {
            let now = self.clock.now_millis().to_string();
            match self.store.set(&self.config.vacant_key, &now).await {
                Ok(()) => info!(instance_id = %self.config.instance_id, "Announced vacancy"),
                Err(e) => {
                    warn!(instance_id = %self.config.instance_id, error = %e, "Failed to announce vacancy")
                }
            }
        }

        self.release_reset_token();
    }

    /// Stop all background work without the exit hook.
    ///
    /// Tokens stay held and no vacancy is announced, so to every other process
    /// this looks exactly like a crash.
    pub fn halt(&self) {
        warn!(instance_id = %self.config.instance_id, "Halting without handoff");
        self.stop_tasks();
    }

    fn stop_tasks(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        if self.stopped.load(Ordering::SeqCst) {
            handle.abort();
        } else {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    pub fn is_acting(&self) -> bool {
        self.role() == Role::Acting
    }

    /// Subscribe to role changes
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    /// Wait until this process becomes the actor
    pub async fn wait_until_acting(&self) {
        let mut rx = self.subscribe_role();

        while *rx.borrow_and_update() != Role::Acting {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }
}

/// One heartbeat write. Failures heal on the next interval.
async fn beat(store: &dyn SharedStore, clock: &dyn Clock, key: &str, instance_id: &str) {
    let now = clock.now_millis();
    match store.set(key, &now.to_string()).await {
        Ok(()) => {
            metrics::counter!("baton_heartbeats_total").increment(1);
            debug!(instance_id = %instance_id, at = now, "Heartbeat written");
        }
        Err(e) => {
            warn!(instance_id = %instance_id, error = %e, "Heartbeat write failed; retrying next interval");
        }
    }
}
