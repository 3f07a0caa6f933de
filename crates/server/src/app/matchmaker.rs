use crate::metrics::Metrics;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::select;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
pub enum MatchError {
    QueueFull,
}

impl Display for MatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "matchmaking queue full"),
        }
    }
}

impl Error for MatchError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Waiting,
    Matched(Uuid),
    Idle,
}

struct MatchState {
    waiters: HashMap<Uuid, DateTime<Utc>>,
    pairs: HashMap<Uuid, Uuid>,
    queue: VecDeque<Uuid>,
}

/// FIFO matchmaker. Callers enqueue from request handlers; a single
/// worker tick owns every pairing transition. One mutex guards the whole
/// state and is never held across I/O.
pub struct Matchmaker {
    state: Mutex<MatchState>,
    queue_capacity: usize,
    waiter_max_age: Duration,
    tick: StdDuration,
    metrics: Arc<Metrics>,
}

impl Matchmaker {
    pub fn new(
        queue_capacity: usize,
        waiter_max_age: Duration,
        tick: StdDuration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Matchmaker {
            state: Mutex::new(MatchState {
                waiters: HashMap::new(),
                pairs: HashMap::new(),
                queue: VecDeque::new(),
            }),
            queue_capacity,
            waiter_max_age,
            tick,
            metrics,
        }
    }

    /// Admits a waiter without blocking. A user already waiting has its
    /// admission time refreshed instead of occupying a second queue slot;
    /// a user already paired is a no-op.
    pub async fn enqueue(&self, user_id: Uuid) -> Result<(), MatchError> {
        let mut state = self.state.lock().await;
        if state.pairs.contains_key(&user_id) {
            return Ok(());
        }
        if state.waiters.contains_key(&user_id) {
            state.waiters.insert(user_id, Utc::now());
            return Ok(());
        }
        if state.queue.len() >= self.queue_capacity {
            return Err(MatchError::QueueFull);
        }
        state.queue.push_back(user_id);
        state.waiters.insert(user_id, Utc::now());
        Ok(())
    }

    pub async fn status(&self, user_id: Uuid) -> MatchStatus {
        let state = self.state.lock().await;
        if let Some(peer) = state.pairs.get(&user_id) {
            return MatchStatus::Matched(*peer);
        }
        if state.waiters.contains_key(&user_id) {
            return MatchStatus::Waiting;
        }
        MatchStatus::Idle
    }

    /// Dissolves a pairing from either side. Idempotent.
    pub async fn remove_pair(&self, user_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(peer) = state.pairs.remove(&user_id) {
            state.pairs.remove(&peer);
            info!(user = %user_id, peer = %peer, "pairing removed");
        }
    }

    /// Runs the worker on its tick until the shutdown signal fires.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.tick);
            loop {
                select! {
                    _ = ticker.tick() => {
                        self.run_tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("matchmaker worker stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One worker tick: pair the first two live waiters at the head of
    /// the queue, then reap stale waiters. Queue entries whose waiter is
    /// gone (reaped or never refreshed) are orphans and get dropped on
    /// the way past.
    async fn run_tick(&self) -> Option<(Uuid, Uuid)> {
        let mut state = self.state.lock().await;
        let mut first = None;
        let mut matched = None;
        while let Some(candidate) = state.queue.pop_front() {
            if !state.waiters.contains_key(&candidate) {
                continue;
            }
            match first {
                None => first = Some(candidate),
                Some(head) => {
                    if head == candidate {
                        continue;
                    }
                    state.pairs.insert(head, candidate);
                    state.pairs.insert(candidate, head);
                    state.waiters.remove(&head);
                    state.waiters.remove(&candidate);
                    info!(first = %head, second = %candidate, "waiters paired");
                    self.metrics.mark_match();
                    matched = Some((head, candidate));
                    first = None;
                    break;
                }
            }
        }
        if let Some(lone) = first {
            // A lone waiter goes back to the tail so it cannot starve the
            // queue while the next tick looks for a partner.
            state.queue.push_back(lone);
        }
        let cutoff = Utc::now() - self.waiter_max_age;
        let expired: Vec<Uuid> = state
            .waiters
            .iter()
            .filter(|(_, enqueued)| **enqueued <= cutoff)
            .map(|(user, _)| *user)
            .collect();
        for user in expired {
            state.waiters.remove(&user);
            debug!(user = %user, "stale waiter reaped");
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matchmaker(capacity: usize) -> Matchmaker {
        Matchmaker::new(
            capacity,
            Duration::minutes(5),
            StdDuration::from_millis(100),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn pairs_in_fifo_order() {
        let mm = matchmaker(10);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        mm.enqueue(a).await.unwrap();
        mm.enqueue(b).await.unwrap();
        mm.enqueue(c).await.unwrap();
        assert_eq!(mm.run_tick().await, Some((a, b)));
        assert_eq!(mm.status(a).await, MatchStatus::Matched(b));
        assert_eq!(mm.status(b).await, MatchStatus::Matched(a));
        assert_eq!(mm.status(c).await, MatchStatus::Waiting);
        assert_eq!(mm.run_tick().await, None);
        assert_eq!(mm.status(c).await, MatchStatus::Waiting);
    }

    #[tokio::test]
    async fn pairing_is_symmetric_across_rounds() {
        let mm = matchmaker(10);
        let users: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
        for user in &users {
            mm.enqueue(*user).await.unwrap();
        }
        for _ in 0..3 {
            mm.run_tick().await;
        }
        for user in &users {
            match mm.status(*user).await {
                MatchStatus::Matched(peer) => {
                    assert_eq!(mm.status(peer).await, MatchStatus::Matched(*user));
                }
                other => panic!("expected pairing, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn queue_full_at_capacity_boundary() {
        let mm = matchmaker(2);
        assert!(mm.enqueue(Uuid::new_v4()).await.is_ok());
        assert!(mm.enqueue(Uuid::new_v4()).await.is_ok());
        assert_eq!(
            mm.enqueue(Uuid::new_v4()).await.unwrap_err(),
            MatchError::QueueFull
        );
    }

    #[tokio::test]
    async fn re_enqueue_does_not_consume_capacity() {
        let mm = matchmaker(2);
        let user = Uuid::new_v4();
        assert!(mm.enqueue(user).await.is_ok());
        assert!(mm.enqueue(user).await.is_ok());
        assert!(mm.enqueue(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn stale_waiter_is_reaped_to_idle() {
        let mm = Matchmaker::new(
            10,
            Duration::zero(),
            StdDuration::from_millis(100),
            Arc::new(Metrics::new()),
        );
        let user = Uuid::new_v4();
        mm.enqueue(user).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        mm.run_tick().await;
        assert_eq!(mm.status(user).await, MatchStatus::Idle);
        // The orphaned queue entry cannot pair the reaped user later.
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        mm.enqueue(a).await.unwrap();
        mm.enqueue(b).await.unwrap();
        assert_eq!(mm.run_tick().await, Some((a, b)));
    }

    #[tokio::test]
    async fn remove_pair_is_idempotent_and_two_sided() {
        let mm = matchmaker(10);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        mm.enqueue(a).await.unwrap();
        mm.enqueue(b).await.unwrap();
        mm.run_tick().await;
        mm.remove_pair(a).await;
        assert_eq!(mm.status(a).await, MatchStatus::Idle);
        assert_eq!(mm.status(b).await, MatchStatus::Idle);
        mm.remove_pair(a).await;
        mm.remove_pair(b).await;
        assert_eq!(mm.status(b).await, MatchStatus::Idle);
    }

    #[tokio::test]
    async fn lone_waiter_survives_at_queue_tail() {
        let mm = matchmaker(10);
        let user = Uuid::new_v4();
        mm.enqueue(user).await.unwrap();
        mm.run_tick().await;
        assert_eq!(mm.status(user).await, MatchStatus::Waiting);
        let other = Uuid::new_v4();
        mm.enqueue(other).await.unwrap();
        assert_eq!(mm.run_tick().await, Some((user, other)));
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let mm = Arc::new(matchmaker(10));
        let (tx, rx) = watch::channel(false);
        let handle = mm.clone().spawn(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
