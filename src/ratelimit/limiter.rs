//! Core sliding window limiter implementation.

use std::borrow::Borrow;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::history::{History, OutOfOrder};
use super::timestamp::Timestamp;
use crate::error::{OutOfOrderTimestamp, Result, SlidewinError};

/// Per-entity sliding window admission control.
///
/// Each entity keeps the timestamps of its last `capacity` accepted requests.
/// A request at time `t` is admissible when the oldest of those is at or
/// before `t - window`, so at most `capacity` requests fall inside any window.
///
/// [`allow`](Self::allow) and [`record`](Self::record) are independent: two
/// threads can both see `allow == true` and both record. Use
/// [`try_acquire`](Self::try_acquire) when check and record must be atomic.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct SlidingWindowLimiter<K>
where
    K: Eq + Hash,
{
    window: Duration,
    capacity: usize,
    /// Request histories indexed by entity
    histories: DashMap<K, History>,
}

impl<K> SlidingWindowLimiter<K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create a new limiter admitting `capacity` requests per `window`.
    ///
    /// The window must be a whole, non-zero number of seconds.
    ///
    /// # Example
    /// ```rust
    /// use slidewin::SlidingWindowLimiter;
    /// use std::time::Duration;
    ///
    /// let limiter = SlidingWindowLimiter::<u64>::new(Duration::from_secs(30), 3).unwrap();
    /// ```
    pub fn new(window: Duration, capacity: usize) -> Result<Self> {
        if window.as_secs() == 0 || window.subsec_nanos() != 0 {
            return Err(SlidewinError::InvalidLimit(format!(
                "window must be a whole, non-zero number of seconds, got {:?}",
                window
            )));
        }
        if capacity == 0 {
            return Err(SlidewinError::InvalidLimit(
                "capacity must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            window,
            capacity,
            histories: DashMap::new(),
        })
    }

    /// The window duration.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The maximum number of requests counted per window.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check whether a request at `timestamp` would currently be admitted.
    ///
    /// Read-only: never creates a history and never consumes capacity.
    pub fn allow<Q>(&self, timestamp: Timestamp, entity: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        let start_of_window = timestamp.window_start(self.window);
        let oldest = self
            .histories
            .get(entity)
            .map(|history| history.oldest())
            .unwrap_or(Timestamp::BEGINNING_OF_TIME);

        let allowed = oldest <= start_of_window;

        trace!(
            entity = ?entity,
            timestamp = %timestamp,
            oldest = %oldest,
            allowed,
            "Checking admission"
        );

        allowed
    }

    /// Record an accepted request at `timestamp`.
    ///
    /// Records unconditionally; whether the request should have been admitted
    /// is the caller's decision. Fails without modifying anything when
    /// `timestamp` is older than the entity's newest recorded request.
    pub fn record(
        &self,
        timestamp: Timestamp,
        entity: K,
    ) -> std::result::Result<Timestamp, OutOfOrderTimestamp<K>> {
        let mut history = self.history_mut(entity);
        let (entity, history) = history.pair_mut();

        history
            .push(timestamp)
            .map_err(|OutOfOrder { latest }| time_travel(entity, timestamp, latest))
    }

    /// Check admission and, if admitted, record the request, as one atomic step.
    ///
    /// Returns `Ok(false)` without recording when the entity is over its limit.
    /// The ordering check runs first, so an out-of-order timestamp is an error
    /// whether or not it would have been admitted.
    pub fn try_acquire(
        &self,
        timestamp: Timestamp,
        entity: K,
    ) -> std::result::Result<bool, OutOfOrderTimestamp<K>> {
        let mut history = self.history_mut(entity);
        let (entity, history) = history.pair_mut();

        let latest = history.newest();
        if timestamp < latest {
            return Err(time_travel(entity, timestamp, latest));
        }

        if history.oldest() > timestamp.window_start(self.window) {
            debug!(
                entity = ?entity,
                timestamp = %timestamp,
                oldest = %history.oldest(),
                "Rate limit exceeded"
            );
            return Ok(false);
        }

        history
            .push(timestamp)
            .map(|_| true)
            .map_err(|OutOfOrder { latest }| time_travel(entity, timestamp, latest))
    }

    /// Snapshot of an entity's history, oldest first, sentinels included.
    ///
    /// Returns `None` if no request was ever recorded for the entity.
    pub fn history<Q>(&self, entity: &Q) -> Option<Vec<Timestamp>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.histories.get(entity).map(|history| history.to_vec())
    }

    /// Newest recorded timestamp for an entity.
    pub fn newest<Q>(&self, entity: &Q) -> Option<Timestamp>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.histories.get(entity).map(|history| history.newest())
    }

    /// Oldest retained timestamp for an entity.
    pub fn oldest<Q>(&self, entity: &Q) -> Option<Timestamp>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.histories.get(entity).map(|history| history.oldest())
    }

    /// Get the number of entities with a history.
    pub fn entity_count(&self) -> usize {
        self.histories.len()
    }

    /// Drop histories whose newest request is strictly before `cutoff`.
    ///
    /// Nothing is ever evicted unless this is called. An evicted entity starts
    /// over as new, including its out-of-order floor.
    pub fn evict_idle(&self, cutoff: Timestamp) -> usize {
        let mut removed = 0;
        self.histories.retain(|_, history| {
            let keep = history.newest() >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });

        debug!(cutoff = %cutoff, removed, "Evicted idle histories");
        removed
    }

    /// Clear all histories.
    pub fn clear(&self) {
        self.histories.clear();
    }

    /// Lock the entity's history, creating it if absent.
    fn history_mut(&self, entity: K) -> RefMut<'_, K, History> {
        match self.histories.entry(entity) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                debug!(
                    entity = ?entry.key(),
                    capacity = self.capacity,
                    "Creating request history"
                );
                entry.insert(History::new(self.capacity))
            }
        }
    }
}

fn time_travel<K: Clone + Debug>(
    entity: &K,
    timestamp: Timestamp,
    latest: Timestamp,
) -> OutOfOrderTimestamp<K> {
    warn!(
        entity = ?entity,
        timestamp = %timestamp,
        latest = %latest,
        "Rejected out-of-order timestamp"
    );
    OutOfOrderTimestamp {
        entity: entity.clone(),
        timestamp,
        latest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(30);
    const CAPACITY: usize = 3;
    const USER: u64 = 44832;
    const OTHER_USER: u64 = 54584;
    /// 2010-03-12T10:30:00Z
    const RECENT: i64 = 1_268_389_800;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    fn create_test_limiter() -> SlidingWindowLimiter<u64> {
        SlidingWindowLimiter::new(WINDOW, CAPACITY).unwrap()
    }

    fn record_all(limiter: &SlidingWindowLimiter<u64>, entity: u64, times: &[i64]) {
        for &secs in times {
            limiter.record(ts(secs), entity).unwrap();
        }
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = create_test_limiter();
        assert_eq!(limiter.window(), WINDOW);
        assert_eq!(limiter.capacity(), CAPACITY);
        assert_eq!(limiter.entity_count(), 0);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let err = SlidingWindowLimiter::<u64>::new(Duration::ZERO, 3).unwrap_err();
        assert!(matches!(err, SlidewinError::InvalidLimit(_)));

        let err = SlidingWindowLimiter::<u64>::new(Duration::from_millis(999), 3).unwrap_err();
        assert!(matches!(err, SlidewinError::InvalidLimit(_)));

        let err = SlidingWindowLimiter::<u64>::new(WINDOW, 0).unwrap_err();
        assert!(matches!(err, SlidewinError::InvalidLimit(_)));
    }

    #[test]
    fn test_fractional_window_rejected() {
        let err = SlidingWindowLimiter::<u64>::new(Duration::from_millis(1_900), 1).unwrap_err();
        assert!(matches!(err, SlidewinError::InvalidLimit(_)));

        let err = SlidingWindowLimiter::<u64>::new(Duration::new(30, 1), 1).unwrap_err();
        assert!(matches!(err, SlidewinError::InvalidLimit(_)));
    }

    #[test]
    fn test_new_user_allowed_at_any_time() {
        let limiter = create_test_limiter();
        assert!(limiter.allow(ts(946_684_801), &USER));
        assert!(limiter.allow(ts(0), &USER));
        assert!(limiter.allow(ts(-1_000_000), &USER));
        assert!(limiter.allow(Timestamp::BEGINNING_OF_TIME, &USER));
    }

    #[test]
    fn test_allow_does_not_create_history() {
        let limiter = create_test_limiter();
        limiter.allow(ts(RECENT), &USER);
        assert_eq!(limiter.entity_count(), 0);
        assert!(limiter.history(&USER).is_none());
    }

    #[test]
    fn test_allows_request_a_window_after_oldest() {
        let limiter = create_test_limiter();
        record_all(&limiter, USER, &[RECENT, RECENT + 5, RECENT + 10]);

        assert!(limiter.allow(ts(RECENT + 30), &USER));
    }

    #[test]
    fn test_denies_request_inside_window() {
        let limiter = create_test_limiter();
        record_all(&limiter, USER, &[RECENT, RECENT + 5, RECENT + 10]);

        assert!(!limiter.allow(ts(RECENT + 29), &USER));
    }

    #[test]
    fn test_old_requests_fall_out_of_window() {
        let limiter = create_test_limiter();
        record_all(&limiter, USER, &[RECENT - 5, RECENT, RECENT + 5, RECENT + 10]);

        assert!(!limiter.allow(ts(RECENT + 29), &USER));
        assert!(limiter.allow(ts(RECENT + 30), &USER));
        assert_eq!(
            limiter.history(&USER).unwrap(),
            vec![ts(RECENT), ts(RECENT + 5), ts(RECENT + 10)]
        );
    }

    #[test]
    fn test_users_tracked_separately() {
        let limiter = create_test_limiter();
        record_all(&limiter, USER, &[RECENT, RECENT + 5, RECENT + 10]);

        assert!(limiter.allow(ts(RECENT + 29), &OTHER_USER));
        assert!(limiter.history(&OTHER_USER).is_none());
    }

    #[test]
    fn test_time_travel_rejected() {
        let limiter = create_test_limiter();
        let first = ts(946_684_800);
        assert_eq!(limiter.record(first, USER), Ok(first));

        let err = limiter.record(ts(946_684_799), USER).unwrap_err();
        assert_eq!(err.entity, USER);
        assert_eq!(err.timestamp, ts(946_684_799));
        assert_eq!(err.latest, first);

        assert_eq!(limiter.newest(&USER), Some(first));
        assert_eq!(
            limiter.history(&USER).unwrap(),
            vec![Timestamp::BEGINNING_OF_TIME, Timestamp::BEGINNING_OF_TIME, first]
        );
    }

    #[test]
    fn test_first_record_creates_history() {
        let limiter = create_test_limiter();
        limiter.record(ts(RECENT), USER).unwrap();

        assert_eq!(limiter.entity_count(), 1);
        assert_eq!(limiter.oldest(&USER), Some(Timestamp::BEGINNING_OF_TIME));
        assert_eq!(limiter.newest(&USER), Some(ts(RECENT)));
    }

    #[test]
    fn test_fewer_than_capacity_always_allowed() {
        let limiter = create_test_limiter();
        record_all(&limiter, USER, &[RECENT, RECENT]);
        assert!(limiter.allow(ts(RECENT), &USER));
    }

    #[test]
    fn test_string_entities_with_borrowed_lookup() {
        let limiter = SlidingWindowLimiter::<String>::new(Duration::from_secs(10), 1).unwrap();
        limiter.record(ts(100), "api-key-1".to_string()).unwrap();

        assert!(!limiter.allow(ts(105), "api-key-1"));
        assert!(limiter.allow(ts(110), "api-key-1"));
        assert!(limiter.allow(ts(105), "api-key-2"));
    }

    #[test]
    fn test_try_acquire_records_only_when_allowed() {
        let limiter = create_test_limiter();

        for i in 0..3 {
            assert_eq!(limiter.try_acquire(ts(RECENT + i), USER), Ok(true));
        }
        assert_eq!(limiter.try_acquire(ts(RECENT + 3), USER), Ok(false));
        assert_eq!(limiter.newest(&USER), Some(ts(RECENT + 2)));

        assert_eq!(limiter.try_acquire(ts(RECENT + 30), USER), Ok(true));
        assert_eq!(
            limiter.history(&USER).unwrap(),
            vec![ts(RECENT + 1), ts(RECENT + 2), ts(RECENT + 30)]
        );
    }

    #[test]
    fn test_try_acquire_rejects_time_travel() {
        let limiter = create_test_limiter();
        limiter.record(ts(RECENT), USER).unwrap();

        let err = limiter.try_acquire(ts(RECENT - 1), USER).unwrap_err();
        assert_eq!(err.latest, ts(RECENT));
        assert_eq!(limiter.newest(&USER), Some(ts(RECENT)));
    }

    #[test]
    fn test_evict_idle() {
        let limiter = create_test_limiter();
        record_all(&limiter, USER, &[RECENT]);
        record_all(&limiter, OTHER_USER, &[RECENT + 100]);

        assert_eq!(limiter.evict_idle(ts(RECENT + 1)), 1);
        assert_eq!(limiter.entity_count(), 1);
        assert!(limiter.history(&USER).is_none());
        assert!(limiter.history(&OTHER_USER).is_some());

        assert_eq!(limiter.evict_idle(ts(RECENT + 100)), 0);
    }

    #[test]
    fn test_clear_histories() {
        let limiter = create_test_limiter();
        record_all(&limiter, USER, &[RECENT]);
        assert_eq!(limiter.entity_count(), 1);

        limiter.clear();
        assert_eq!(limiter.entity_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_try_acquire_never_exceeds_capacity() {
        let limiter = Arc::new(create_test_limiter());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire(ts(RECENT), USER).unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, CAPACITY);
        assert!(!limiter.allow(ts(RECENT + 29), &USER));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_for_different_entities() {
        let limiter = Arc::new(create_test_limiter());

        let mut handles = Vec::new();
        for entity in 0..32u64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    limiter.record(ts(RECENT + i), entity).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(limiter.entity_count(), 32);
        for entity in 0..32u64 {
            assert_eq!(
                limiter.history(&entity).unwrap(),
                vec![ts(RECENT + 7), ts(RECENT + 8), ts(RECENT + 9)]
            );
        }
    }
}
