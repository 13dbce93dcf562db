//! Actor Election Tests
//!
//! Multi-process scenarios on a shared `MemoryHub`, under paused tokio time:
//! - Single actor after concurrent cold starts
//! - Clean handoff through the vacancy notification
//! - Crash recovery through heartbeat staleness and the reset race
//! - Exactly-once action execution
//! - A recovered actor taking over the crashed actor's freed token
//! - Reopening a change feed that closed underneath a candidate

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use baton_election::{
    ActorElection, ElectionConfig, MemoryHub, MemoryStore, RacePrimitive, Role, SharedStore,
    Subscription, TokioClock,
};
use tokio::time::{sleep, sleep_until, Instant};

const ACTOR: &str = "baton:actor";
const RESET: &str = "baton:reset";
const HEARTBEAT: &str = "baton:heartbeat";
const VACANT: &str = "baton:vacant";

struct Node {
    name: String,
    election: Arc<ActorElection>,
    fired: Arc<AtomicUsize>,
}

impl Node {
    fn new(hub: &MemoryHub, clock: TokioClock, name: &str) -> Self {
        Self::with_store(hub, clock, name, Arc::new(hub.store(name)))
    }

    fn with_store(hub: &MemoryHub, clock: TokioClock, name: &str, store: Arc<dyn SharedStore>) -> Self {
        let config = ElectionConfig::new(name)
            .with_heartbeat_interval(Duration::from_millis(1000))
            .with_missed_heartbeats(3)
            .with_poll_interval(Duration::from_millis(500))
            .with_settle_delay(Duration::from_millis(1000));

        let election = ActorElection::new(config, store, Arc::new(hub.race(name)))
            .unwrap()
            .with_clock(Arc::new(clock));

        Self {
            name: name.to_string(),
            election: Arc::new(election),
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn join(&self) {
        let fired = self.fired.clone();
        self.election
            .join(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
    }

    fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    fn is_acting(&self) -> bool {
        self.election.is_acting()
    }
}

async fn start(hub: &MemoryHub, clock: TokioClock, name: &str) -> Node {
    let node = Node::new(hub, clock, name);
    node.join().await;
    node
}

fn acting<'a>(nodes: &[&'a Node]) -> Vec<&'a str> {
    nodes
        .iter()
        .filter(|node| node.is_acting())
        .map(|node| node.name.as_str())
        .collect()
}

fn total_fired(nodes: &[&Node]) -> usize {
    nodes.iter().map(|node| node.fired()).sum()
}

/// Store whose first change feed ends at once, like a dropped pub/sub connection
struct DroppedFeedStore {
    inner: MemoryStore,
    subscriptions: AtomicUsize,
}

impl DroppedFeedStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            subscriptions: AtomicUsize::new(0),
        }
    }

    fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedStore for DroppedFeedStore {
    async fn get(&self, key: &str) -> baton_election::Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> baton_election::Result<()> {
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> baton_election::Result<()> {
        self.inner.remove(key).await
    }

    async fn subscribe(&self) -> baton_election::Result<Subscription> {
        if self.subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
            let (_, events) = tokio::sync::mpsc::unbounded_channel();
            return Ok(Subscription::from_receiver(events));
        }
        self.inner.subscribe().await
    }
}

/// A: acting, heartbeat written at t=0; B and C: candidates
async fn three_nodes(hub: &MemoryHub, clock: TokioClock) -> (Node, Node, Node) {
    let a = start(hub, clock, "a").await;
    let b = start(hub, clock, "b").await;
    let c = start(hub, clock, "c").await;
    assert!(a.is_acting());
    assert!(!b.is_acting());
    assert!(!c.is_acting());
    (a, b, c)
}

#[tokio::test(start_paused = true)]
async fn test_lone_process_becomes_actor() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();

    let a = start(&hub, clock, "a").await;

    assert_eq!(a.election.role(), Role::Acting);
    assert_eq!(a.fired(), 1);
    assert_eq!(hub.holder(ACTOR).as_deref(), Some("a"));
    assert_eq!(hub.store("observer").get(HEARTBEAT).await.unwrap().as_deref(), Some("0"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_cold_start_elects_one_actor() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let nodes: Vec<Node> = (0..5)
        .map(|i| Node::new(&hub, clock, &format!("p{}", i)))
        .collect();

    futures::future::join_all(nodes.iter().map(|node| node.join())).await;

    let refs: Vec<&Node> = nodes.iter().collect();
    let first = acting(&refs);
    assert_eq!(first.len(), 1);
    assert_eq!(total_fired(&refs), 1);

    // Candidates keep polling; nobody mistakes the cold start for a crash
    sleep(Duration::from_secs(10)).await;
    assert_eq!(acting(&refs), first);
    assert_eq!(total_fired(&refs), 1);
    assert_eq!(hub.holder(RESET), None);
    assert_eq!(hub.holder(ACTOR).as_deref(), Some(first[0]));
}

#[tokio::test(start_paused = true)]
async fn test_clean_exit_hands_off_through_vacancy() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let (a, b, c) = three_nodes(&hub, clock).await;
    let started = Instant::now();

    a.election.shutdown().await;
    sleep(Duration::from_millis(1)).await;

    let successors = acting(&[&b, &c]);
    assert_eq!(successors.len(), 1, "exactly one survivor takes over");
    assert!(started.elapsed() < Duration::from_millis(500), "handoff must not wait for polling");
    assert_eq!(hub.holder(ACTOR).as_deref(), Some(successors[0]));
    assert_eq!(hub.holder(RESET), None);

    // The new actor cleared the flag for the next handoff
    assert_eq!(hub.store("observer").get(VACANT).await.unwrap(), None);
    assert_eq!(b.fired() + c.fired(), 1);
    assert_eq!(a.fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_candidate_waits_until_acting() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let a = start(&hub, clock, "a").await;
    let b = start(&hub, clock, "b").await;

    let mut roles = b.election.subscribe_role();
    assert_eq!(*roles.borrow(), Role::Candidate);

    let waiter = {
        let election = b.election.clone();
        tokio::spawn(async move { election.wait_until_acting().await })
    };

    a.election.shutdown().await;
    tokio::time::timeout(Duration::from_millis(100), waiter)
        .await
        .expect("b should take over promptly")
        .unwrap();

    roles.changed().await.unwrap();
    assert_eq!(*roles.borrow(), Role::Acting);
    assert_eq!(b.fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_crash_recovery_through_reset_race() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let t0 = Instant::now();
    let (a, b, c) = three_nodes(&hub, clock).await;

    // A dies at t=0 without its exit hook; its actor token stays orphaned
    a.election.halt();

    // At t=3000 the heartbeat is exactly at the timeout, not past it
    sleep_until(t0 + Duration::from_millis(3400)).await;
    assert!(acting(&[&b, &c]).is_empty());

    // Both poll at t=3500, see 3500 > 3000, and race the reset token
    sleep_until(t0 + Duration::from_millis(3600)).await;
    let winners = acting(&[&b, &c]);
    assert_eq!(winners.len(), 1);
    let winner = winners[0];
    assert_eq!(hub.holder(RESET).as_deref(), Some(winner));
    assert_eq!(hub.holder(ACTOR).as_deref(), Some("a"));

    // Reset token is held for the settling delay, until t=4500
    sleep_until(t0 + Duration::from_millis(4400)).await;
    assert_eq!(hub.holder(RESET).as_deref(), Some(winner));
    sleep_until(t0 + Duration::from_millis(4600)).await;
    assert_eq!(hub.holder(RESET), None);

    // The loser keeps seeing a fresh heartbeat and stays a candidate
    sleep_until(t0 + Duration::from_millis(15_000)).await;
    assert_eq!(acting(&[&b, &c]), vec![winner]);
    assert_eq!(b.fired() + c.fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_bound_after_crash() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let (a, b, c) = three_nodes(&hub, clock).await;
    let bound = a.election.config().recovery_bound();

    // Let A heartbeat for a while, then kill it right after a beat
    sleep(Duration::from_millis(2500)).await;
    let last_beat = Instant::now() - Duration::from_millis(500);
    a.election.halt();

    sleep_until(last_beat + bound).await;
    assert_eq!(acting(&[&b, &c]).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handoff_while_token_stays_orphaned_falls_back_to_polling() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let (a, b, c) = three_nodes(&hub, clock).await;
    a.election.halt();

    sleep(Duration::from_millis(5000)).await;
    let (recovered, other) = if b.is_acting() { (&b, &c) } else { (&c, &b) };
    assert!(recovered.is_acting());

    // The dead actor's token was never freed, so the recovered actor never got it
    recovered.election.shutdown().await;
    let exited = Instant::now();
    assert_eq!(hub.holder(ACTOR).as_deref(), Some("a"));

    // The vacancy race is lost to the orphan; polling still recovers
    sleep(Duration::from_millis(1)).await;
    assert!(!other.is_acting());

    sleep_until(exited + other.election.config().recovery_bound()).await;
    assert!(other.is_acting());
    assert_eq!(other.fired(), 1);
    assert_eq!(recovered.fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_in_settle_window_releases_reset_token() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let t0 = Instant::now();
    let (a, b, c) = three_nodes(&hub, clock).await;
    a.election.halt();

    sleep_until(t0 + Duration::from_millis(3600)).await;
    let (winner, other) = if b.is_acting() { (&b, &c) } else { (&c, &b) };
    assert_eq!(hub.holder(RESET).as_deref(), Some(winner.name.as_str()));

    winner.election.shutdown().await;
    assert_eq!(hub.holder(RESET), None);
    assert!(hub.store("observer").get(VACANT).await.unwrap().is_some());

    sleep_until(Instant::now() + other.election.config().recovery_bound()).await;
    assert!(other.is_acting());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_triggers_run_action_once() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let a = start(&hub, clock, "a").await;
    let b = start(&hub, clock, "b").await;

    // Freed token plus a vacancy flag b's own listener does not hear
    a.election.halt();
    assert_eq!(hub.reclaim("a"), 1);
    hub.store("b").set(VACANT, "0").await.unwrap();

    let (first, second) = tokio::join!(b.election.try_become_actor(), b.election.try_become_actor());
    assert!(first.unwrap() ^ second.unwrap(), "exactly one call performs the takeover");
    assert!(b.is_acting());

    // Later triggers from either path are no-ops
    assert!(!b.election.try_become_actor().await.unwrap());
    hub.store("a").set(VACANT, "1").await.unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(b.fired(), 1);
    assert_eq!(a.fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_absent_heartbeat_never_triggers_reset() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();

    // Token held by a process that never got as far as heartbeating
    assert!(hub.race("ghost").race(ACTOR).await.unwrap());
    let b = start(&hub, clock, "b").await;

    sleep(Duration::from_secs(60)).await;
    assert!(!b.is_acting());
    assert_eq!(hub.holder(RESET), None);
    assert_eq!(b.fired(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_heartbeat_is_recovered() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();

    assert!(hub.race("ghost").race(ACTOR).await.unwrap());
    hub.store("ghost").set(HEARTBEAT, "garbage").await.unwrap();
    let b = start(&hub, clock, "b").await;

    sleep(Duration::from_millis(600)).await;
    assert!(b.is_acting());
    assert_eq!(b.fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_heartbeat_from_previous_run_does_not_duplicate() {
    let hub = MemoryHub::new();
    let clock = TokioClock::starting_at(100_000);

    // Left behind by a deployment that exited long ago
    hub.store("old").set(HEARTBEAT, "1000").await.unwrap();

    let nodes: Vec<Node> = (0..4)
        .map(|i| Node::new(&hub, clock, &format!("p{}", i)))
        .collect();
    futures::future::join_all(nodes.iter().map(|node| node.join())).await;

    sleep(Duration::from_secs(10)).await;
    let refs: Vec<&Node> = nodes.iter().collect();
    assert_eq!(acting(&refs).len(), 1);
    assert_eq!(total_fired(&refs), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovered_actor_claims_freed_token() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let t0 = Instant::now();
    let (a, b, c) = three_nodes(&hub, clock).await;
    a.election.halt();

    // Recovery at t=3500 while A's token is still held
    sleep_until(t0 + Duration::from_millis(5000)).await;
    let (recovered, other) = if b.is_acting() { (&b, &c) } else { (&c, &b) };
    assert_eq!(hub.holder(ACTOR).as_deref(), Some("a"));

    // The primitive notices A died and frees its token
    assert_eq!(hub.reclaim("a"), 1);

    // A late joiner wins the freed token before the actor's next beat, sees
    // the live heartbeat, and hands it back
    let d = start(&hub, clock, "d").await;
    assert!(!d.is_acting());
    assert_eq!(d.fired(), 0);

    // The recovered actor takes the token on its t=5500 beat
    sleep_until(t0 + Duration::from_millis(5600)).await;
    assert_eq!(hub.holder(ACTOR).as_deref(), Some(recovered.name.as_str()));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(acting(&[&b, &c, &d]), vec![recovered.name.as_str()]);

    // Holding the token again, its clean exit hands off on the fast path
    recovered.election.shutdown().await;
    sleep(Duration::from_millis(1)).await;
    let successors = acting(&[other, &d]);
    assert_eq!(successors.len(), 1);
    assert_eq!(hub.holder(ACTOR).as_deref(), Some(successors[0]));
    assert_eq!(total_fired(&[&b, &c, &d]), 2);
}

#[tokio::test(start_paused = true)]
async fn test_closed_feed_is_reopened_and_catches_up_on_vacancy() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let t0 = Instant::now();
    let a = start(&hub, clock, "a").await;

    let store = Arc::new(DroppedFeedStore::new(hub.store("b")));
    let b = Node::with_store(&hub, clock, "b", store.clone());
    b.join().await;
    assert!(!b.is_acting());

    // A leaves while B's feed is down; the announcement is missed
    sleep_until(t0 + Duration::from_millis(500)).await;
    a.election.shutdown().await;
    assert!(!b.is_acting());

    // Reopened after the first backoff, the flag is still set
    sleep_until(t0 + Duration::from_millis(1100)).await;
    assert_eq!(store.subscriptions(), 2);
    assert!(b.is_acting(), "must not wait for the heartbeat to go stale");
    assert_eq!(b.fired(), 1);
    assert_eq!(hub.store("observer").get(VACANT).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_reopened_feed_delivers_later_vacancies() {
    let hub = MemoryHub::new();
    let clock = TokioClock::new();
    let a = start(&hub, clock, "a").await;

    let store = Arc::new(DroppedFeedStore::new(hub.store("b")));
    let b = Node::with_store(&hub, clock, "b", store.clone());
    b.join().await;

    sleep(Duration::from_millis(2000)).await;
    assert_eq!(store.subscriptions(), 2);
    assert!(!b.is_acting());

    let exited = Instant::now();
    a.election.shutdown().await;
    sleep(Duration::from_millis(1)).await;
    assert!(b.is_acting());
    assert!(exited.elapsed() < Duration::from_millis(500));
}
