use crate::{
    error::RegistryError, instrument::InstrumentKey, session::ConnectionId,
    upstream::UpstreamSource,
};
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Progress of the upstream subscription backing a registry entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UpstreamStatus {
    Pending,
    Subscribed,
    Failed,
}

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SubscribeOutcome {
    pub subscriber_count: usize,
    pub is_first_subscriber: bool,
    /// Whether the upstream is streaming the instrument.
    pub stream_subscribed: bool,
}

/// Result of [`SubscriptionRegistry::unsubscribe`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnsubscribeOutcome {
    pub subscriber_count: usize,
    pub is_last_subscriber: bool,
    /// Whether this call released the upstream subscription successfully.
    pub stream_unsubscribed: bool,
}

/// Snapshot of registry occupancy.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RegistryStats {
    pub total_instruments: usize,
    pub total_memberships: usize,
    /// Every instrument with its member count, most watched first.
    pub instruments: Vec<(InstrumentKey, usize)>,
}

/// Reference counts which connections want which instruments, so the upstream is subscribed
/// once per instrument no matter how many viewers share it.
///
/// All bookkeeping happens under one mutex. Upstream calls happen outside it on spawned tasks
/// that are chained per instrument, so a subscribe and the unsubscribe that follows it always
/// reach the upstream in that order, even if the connection that triggered them goes away.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    upstream: Arc<dyn UpstreamSource>,
    state: Arc<Mutex<RegistryState>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: FnvHashMap<InstrumentKey, Entry>,
    by_connection: FnvHashMap<ConnectionId, BTreeSet<InstrumentKey>>,
    lanes: FnvHashMap<InstrumentKey, Lane>,
    next_generation: u64,
}

#[derive(Debug)]
struct Entry {
    members: BTreeSet<ConnectionId>,
    status: watch::Receiver<UpstreamStatus>,
}

/// Completion signal of the most recent upstream call for an instrument.
#[derive(Debug)]
struct Lane {
    generation: u64,
    done: oneshot::Receiver<()>,
}

/// Upstream edge scheduled while the lock was held.
enum Edge {
    Subscribe(watch::Sender<UpstreamStatus>),
    Unsubscribe(oneshot::Sender<bool>),
}

impl SubscriptionRegistry {
    pub fn new(upstream: Arc<dyn UpstreamSource>) -> Self {
        Self {
            upstream,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    /// Add `connection` to the members of `key`, subscribing upstream on the 0 -> 1 transition.
    ///
    /// Bookkeeping completes before the upstream call; the returned outcome reports whether the
    /// upstream is streaming once that call resolves.
    pub async fn subscribe(&self, connection: ConnectionId, key: InstrumentKey) -> SubscribeOutcome {
        let (mut status, subscriber_count, is_first_subscriber) = {
            let mut state = self.state.lock();

            // Entries never persist with zero members, so an empty set means it was just created
            let (status_tx, status_rx) = watch::channel(UpstreamStatus::Pending);
            let entry = state.entries.entry(key.clone()).or_insert_with(|| Entry {
                members: BTreeSet::new(),
                status: status_rx,
            });
            let is_first_subscriber = entry.members.is_empty();
            entry.members.insert(connection);
            let status = entry.status.clone();
            let subscriber_count = entry.members.len();

            state
                .by_connection
                .entry(connection)
                .or_default()
                .insert(key.clone());

            if is_first_subscriber {
                self.schedule_locked(&mut state, key.clone(), Edge::Subscribe(status_tx));
            }

            (status, subscriber_count, is_first_subscriber)
        };

        debug!(
            %connection,
            instrument = %key,
            subscriber_count,
            is_first_subscriber,
            "connection subscribed to instrument"
        );

        let stream_subscribed = match status
            .wait_for(|status| *status != UpstreamStatus::Pending)
            .await
        {
            Ok(status) => *status == UpstreamStatus::Subscribed,
            Err(_) => false,
        };

        SubscribeOutcome {
            subscriber_count,
            is_first_subscriber,
            stream_subscribed,
        }
    }

    /// Remove `connection` from the members of `key`, unsubscribing upstream on the 1 -> 0
    /// transition.
    pub async fn unsubscribe(
        &self,
        connection: ConnectionId,
        key: &InstrumentKey,
    ) -> Result<UnsubscribeOutcome, RegistryError> {
        let pending = {
            let mut state = self.state.lock();
            self.remove_member_locked(&mut state, connection, key)?
        };
        Ok(resolve(pending).await)
    }

    /// Release every membership `connection` holds. Used during session teardown.
    ///
    /// All memberships are removed under a single lock acquisition before any upstream call is
    /// awaited.
    pub async fn release_all(
        &self,
        connection: ConnectionId,
    ) -> Vec<(InstrumentKey, UnsubscribeOutcome)> {
        let pending = {
            let mut state = self.state.lock();
            let keys = state
                .by_connection
                .get(&connection)
                .map(|keys| keys.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default();

            keys.into_iter()
                .filter_map(|key| {
                    self.remove_member_locked(&mut state, connection, &key)
                        .ok()
                        .map(|pending| (key, pending))
                })
                .collect::<Vec<_>>()
        };

        if !pending.is_empty() {
            info!(
                %connection,
                released = pending.len(),
                "released connection subscriptions"
            );
        }

        let mut released = Vec::with_capacity(pending.len());
        for (key, pending) in pending {
            released.push((key, resolve(pending).await));
        }
        released
    }

    pub fn is_member(&self, connection: ConnectionId, key: &InstrumentKey) -> bool {
        self.state
            .lock()
            .by_connection
            .get(&connection)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Whether `connection` holds any instrument whose root (or ticker) is `root`.
    pub fn has_root(&self, connection: ConnectionId, root: &str) -> bool {
        self.state
            .lock()
            .by_connection
            .get(&connection)
            .is_some_and(|keys| keys.iter().any(|key| key.root() == root))
    }

    pub fn keys_for(&self, connection: ConnectionId) -> Vec<InstrumentKey> {
        self.state
            .lock()
            .by_connection
            .get(&connection)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, key: &InstrumentKey) -> usize {
        self.state
            .lock()
            .entries
            .get(key)
            .map_or(0, |entry| entry.members.len())
    }

    pub fn contains(&self, key: &InstrumentKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        let instruments = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.members.len()))
            .sorted_by(|(a_key, a_count), (b_key, b_count)| {
                b_count.cmp(a_count).then_with(|| a_key.cmp(b_key))
            })
            .collect::<Vec<_>>();

        RegistryStats {
            total_instruments: instruments.len(),
            total_memberships: instruments.iter().map(|(_, count)| count).sum(),
            instruments,
        }
    }

    fn remove_member_locked(
        &self,
        state: &mut RegistryState,
        connection: ConnectionId,
        key: &InstrumentKey,
    ) -> Result<Pending, RegistryError> {
        let entry = state
            .entries
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownInstrument(key.clone()))?;

        if !entry.members.remove(&connection) {
            return Err(RegistryError::NotSubscribed(key.clone()));
        }

        let remaining = entry.members.len();

        if let Some(keys) = state.by_connection.get_mut(&connection) {
            keys.remove(key);
            if keys.is_empty() {
                state.by_connection.remove(&connection);
            }
        }

        debug!(
            %connection,
            instrument = %key,
            remaining,
            "connection unsubscribed from instrument"
        );

        if remaining > 0 {
            return Ok(Pending::Remaining(remaining));
        }

        state.entries.remove(key);
        let (result_tx, result_rx) = oneshot::channel();
        self.schedule_locked(state, key.clone(), Edge::Unsubscribe(result_tx));
        Ok(Pending::LastSubscriber(result_rx))
    }

    /// Chain an upstream call behind any in-flight call for the same instrument.
    fn schedule_locked(
        &self,
        state: &mut RegistryState,
        key: InstrumentKey,
        edge: Edge,
    ) {
        let previous = state.lanes.remove(&key).map(|lane| lane.done);
        let generation = state.next_generation;
        state.next_generation += 1;

        let (done_tx, done_rx) = oneshot::channel();
        state.lanes.insert(
            key.clone(),
            Lane {
                generation,
                done: done_rx,
            },
        );

        let upstream = Arc::clone(&self.upstream);
        let shared = Arc::clone(&self.state);

        tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            match edge {
                Edge::Subscribe(status_tx) => {
                    let status = match upstream.subscribe_instrument(&key).await {
                        Ok(()) => {
                            info!(instrument = %key, "upstream subscribed");
                            UpstreamStatus::Subscribed
                        }
                        Err(error) => {
                            warn!(instrument = %key, %error, "upstream subscribe failed");
                            UpstreamStatus::Failed
                        }
                    };
                    let _ = status_tx.send(status);
                }
                Edge::Unsubscribe(result_tx) => {
                    let success = match upstream.unsubscribe_instrument(&key).await {
                        Ok(()) => {
                            info!(instrument = %key, "upstream unsubscribed");
                            true
                        }
                        Err(error) => {
                            warn!(instrument = %key, %error, "upstream unsubscribe failed");
                            false
                        }
                    };
                    let _ = result_tx.send(success);
                }
            }

            let _ = done_tx.send(());

            let mut state = shared.lock();
            if state
                .lanes
                .get(&key)
                .is_some_and(|lane| lane.generation == generation)
            {
                state.lanes.remove(&key);
            }
        });
    }
}

/// Outcome of a member removal whose upstream side may still be in flight.
enum Pending {
    Remaining(usize),
    LastSubscriber(oneshot::Receiver<bool>),
}

async fn resolve(pending: Pending) -> UnsubscribeOutcome {
    match pending {
        Pending::Remaining(subscriber_count) => UnsubscribeOutcome {
            subscriber_count,
            is_last_subscriber: false,
            stream_unsubscribed: false,
        },
        Pending::LastSubscriber(result) => UnsubscribeOutcome {
            subscriber_count: 0,
            is_last_subscriber: true,
            stream_unsubscribed: result.await.unwrap_or(false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::QuoteBus, upstream::simulated::SimulatedUpstream};

    fn key(raw: &str) -> InstrumentKey {
        raw.parse().unwrap()
    }

    fn registry() -> (Arc<SimulatedUpstream>, SubscriptionRegistry) {
        let upstream = Arc::new(SimulatedUpstream::new(QuoteBus::new(16)));
        let registry = SubscriptionRegistry::new(upstream.clone());
        (upstream, registry)
    }

    #[tokio::test]
    async fn test_first_and_last_subscriber_touch_upstream_once() {
        let (upstream, registry) = registry();
        let spy = key("SPY:20250620:450:C");
        let (a, b) = (ConnectionId(1), ConnectionId(2));

        let first = registry.subscribe(a, spy.clone()).await;
        assert_eq!(
            first,
            SubscribeOutcome {
                subscriber_count: 1,
                is_first_subscriber: true,
                stream_subscribed: true,
            }
        );

        let second = registry.subscribe(b, spy.clone()).await;
        assert_eq!(second.subscriber_count, 2);
        assert!(!second.is_first_subscriber);
        assert!(second.stream_subscribed);
        assert_eq!(upstream.subscribe_calls(&spy), 1);

        let out_a = registry.unsubscribe(a, &spy).await.unwrap();
        assert_eq!(
            out_a,
            UnsubscribeOutcome {
                subscriber_count: 1,
                is_last_subscriber: false,
                stream_unsubscribed: false,
            }
        );
        assert_eq!(upstream.unsubscribe_calls(&spy), 0);

        let out_b = registry.unsubscribe(b, &spy).await.unwrap();
        assert_eq!(
            out_b,
            UnsubscribeOutcome {
                subscriber_count: 0,
                is_last_subscriber: true,
                stream_unsubscribed: true,
            }
        );
        assert_eq!(upstream.unsubscribe_calls(&spy), 1);
        assert!(!registry.contains(&spy));
    }

    #[tokio::test]
    async fn test_unsubscribe_errors() {
        let (_upstream, registry) = registry();
        let spy = key("SPY:20250620:450:C");

        assert_eq!(
            registry.unsubscribe(ConnectionId(1), &spy).await,
            Err(RegistryError::UnknownInstrument(spy.clone()))
        );

        registry.subscribe(ConnectionId(1), spy.clone()).await;
        assert_eq!(
            registry.unsubscribe(ConnectionId(2), &spy).await,
            Err(RegistryError::NotSubscribed(spy.clone()))
        );
        assert_eq!(registry.subscriber_count(&spy), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_same_connection_is_idempotent() {
        let (upstream, registry) = registry();
        let spy = key("SPY:20250620:450:C");

        registry.subscribe(ConnectionId(1), spy.clone()).await;
        let again = registry.subscribe(ConnectionId(1), spy.clone()).await;

        assert_eq!(again.subscriber_count, 1);
        assert!(!again.is_first_subscriber);
        assert_eq!(upstream.subscribe_calls(&spy), 1);
    }

    #[tokio::test]
    async fn test_release_all_only_drops_own_memberships() {
        let (upstream, registry) = registry();
        let (a, b) = (ConnectionId(1), ConnectionId(2));
        let keys = [
            key("SPY:20250620:450:C"),
            key("SPY:20250620:455:P"),
            key("QQQ"),
        ];

        for key in &keys {
            registry.subscribe(a, key.clone()).await;
        }
        registry.subscribe(b, keys[0].clone()).await;

        let released = registry.release_all(a).await;
        assert_eq!(released.len(), 3);

        assert_eq!(registry.subscriber_count(&keys[0]), 1);
        assert!(registry.is_member(b, &keys[0]));
        assert!(!registry.contains(&keys[1]));
        assert!(!registry.contains(&keys[2]));
        assert!(registry.keys_for(a).is_empty());

        assert_eq!(upstream.unsubscribe_calls(&keys[0]), 0);
        assert_eq!(upstream.unsubscribe_calls(&keys[1]), 1);
        assert_eq!(upstream.unsubscribe_calls(&keys[2]), 1);
    }

    #[tokio::test]
    async fn test_failed_upstream_subscribe_keeps_bookkeeping() {
        let (upstream, registry) = registry();
        let spy = key("SPY:20250620:450:C");
        upstream.set_fail_subscribe(true);

        let outcome = registry.subscribe(ConnectionId(1), spy.clone()).await;

        assert!(outcome.is_first_subscriber);
        assert!(!outcome.stream_subscribed);
        assert!(registry.is_member(ConnectionId(1), &spy));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_balances_upstream_edges() {
        let (upstream, registry) = registry();
        let spy = key("SPY:20250620:450:C");

        let tasks = (0..16u64)
            .map(|id| {
                let registry = registry.clone();
                let spy = spy.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        registry.subscribe(ConnectionId(id), spy.clone()).await;
                        tokio::task::yield_now().await;
                        registry
                            .unsubscribe(ConnectionId(id), &spy)
                            .await
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        // Every 0 -> 1 edge was matched by exactly one 1 -> 0 edge
        assert!(!registry.contains(&spy));
        assert!(upstream.subscribe_calls(&spy) >= 1);
        assert_eq!(
            upstream.subscribe_calls(&spy),
            upstream.unsubscribe_calls(&spy)
        );
    }

    #[tokio::test]
    async fn test_stats_orders_by_members() {
        let (_upstream, registry) = registry();
        let spy = key("SPY:20250620:450:C");
        let qqq = key("QQQ:20250620:380:P");

        registry.subscribe(ConnectionId(1), qqq.clone()).await;
        registry.subscribe(ConnectionId(1), spy.clone()).await;
        registry.subscribe(ConnectionId(2), spy.clone()).await;

        let stats = registry.stats();
        assert_eq!(stats.total_instruments, 2);
        assert_eq!(stats.total_memberships, 3);
        assert_eq!(stats.instruments[0], (spy, 2));
        assert_eq!(stats.instruments[1], (qqq, 1));
    }
}
