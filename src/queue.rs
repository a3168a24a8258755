use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::*;

/// Decides how long an item has to wait before it is retried
pub trait RateLimiter<T>: Send + Sync {
    /// Returns the delay for the next retry of `item`, recording the attempt
    fn when(&self, item: &T) -> Duration;
    /// Stops tracking `item`, resetting its backoff
    fn forget(&self, item: &T);
    /// How many times `item` has been retried since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock();
        let exp = failures.entry(item.clone()).or_insert(0);
        let attempt = *exp;
        *exp = exp.saturating_add(1);

        // 2^31 * base overflows anything sensible long before the cap matters
        if attempt >= 31 {
            return self.max;
        }
        self.base
            .checked_mul(1u32 << attempt)
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket limiting the rate of retries across all items
pub struct BucketRateLimiter<C: Clock = DefaultClock> {
    bucket: governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>,
    clock: C,
}

impl BucketRateLimiter {
    pub fn new(quota: Quota) -> Self {
        Self::with_clock(quota, DefaultClock::default())
    }
}

impl<C: Clock> BucketRateLimiter<C> {
    pub fn with_clock(quota: Quota, clock: C) -> Self {
        Self {
            bucket: governor::RateLimiter::direct_with_clock(quota, &clock),
            clock,
        }
    }
}

impl<T, C> RateLimiter<T> for BucketRateLimiter<C>
where
    C: Clock + Send + Sync,
{
    fn when(&self, _item: &T) -> Duration {
        match self.bucket.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()),
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Waits for the longest delay of all its limiters
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item)
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

const OVERALL_QPS: NonZeroU32 = NonZeroU32::new(10).unwrap();
const OVERALL_BURST: NonZeroU32 = NonZeroU32::new(100).unwrap();

/// Exponential per-item backoff combined with an overall 10 qps / 100 burst bucket
pub fn default_controller_rate_limiter<T: Eq + Hash + Clone + Send + 'static>(
    base: Duration,
    max: Duration,
) -> MaxOfRateLimiter<T> {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(base, max)),
        Box::new(BucketRateLimiter::new(Quota::per_second(OVERALL_QPS).allow_burst(OVERALL_BURST))),
    ])
}

struct State<T> {
    /// items waiting to be handed out, in order
    queue: VecDeque<T>,
    /// items that need processing: queued, or added again while being processed
    dirty: HashSet<T>,
    /// items handed out by `get` and not yet marked `done`
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

/// A deduplicating, rate limited FIFO work queue.
///
/// An item is never handed to two callers of [`WorkQueue::get`] at the same time: adding an item that is
/// currently being processed only marks it dirty, and it is queued again once [`WorkQueue::done`] is called.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + std::fmt::Display + 'static,
{
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Marks an item as needing processing. Never blocks.
    pub fn add(&self, item: T) {
        let mut state = self.shared.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Adds an item once `delay` has passed
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            return self.add(item);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Adds an item after the delay its rate limiter asks for
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.rate_limiter.when(&item);
        trace!(queue = %self.shared.name, %item, ?delay, "Requeueing with backoff");
        self.add_after(item, delay)
    }

    /// Resets the backoff of an item
    pub fn forget(&self, item: &T) {
        self.shared.rate_limiter.forget(item)
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.rate_limiter.num_requeues(item)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down and drained.
    /// Every returned item must be passed to [`WorkQueue::done`] when processing finishes.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks processing of an item as finished, queueing it again if it was added in the meantime
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stops accepting new items. Items already queued are still handed out,
    /// after which [`WorkQueue::get`] returns `None`.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_adds_are_delivered_once() {
        let q = queue();
        for _ in 0..5 {
            q.add("root|a".to_string());
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("root|a"));
        assert!(tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn add_during_processing_is_delivered_after_done() {
        let q = queue();
        q.add("root|a".to_string());
        let item = q.get().await.unwrap();

        for _ in 0..5 {
            q.add(item.clone());
        }
        // not handed out while in flight
        assert_eq!(q.len(), 0);
        assert!(tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .is_err());

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(item.clone()));
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_fifo() {
        let q = queue();
        q.add("b".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_waits_for_add() {
        let q = queue();
        let getter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!getter.is_finished());
        q.add("a".to_string());
        assert_eq!(getter.await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_queued_items() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.shutdown();
        q.add("c".to_string());

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wakes_waiting_workers() {
        let q = queue();
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown();
        for worker in workers {
            assert_eq!(worker.await.unwrap(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_workers_never_share_a_key() {
        let q = queue();
        let in_flight: Arc<Mutex<HashMap<String, usize>>> = Default::default();
        let max_seen = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                let processed = processed.clone();
                tokio::spawn(async move {
                    while let Some(key) = q.get().await {
                        let count = {
                            let mut in_flight = in_flight.lock();
                            let count = in_flight.entry(key.clone()).or_insert(0);
                            *count += 1;
                            *count
                        };
                        max_seen.fetch_max(count, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        *in_flight.lock().get_mut(&key).unwrap() -= 1;
                        processed.fetch_add(1, Ordering::SeqCst);
                        q.done(&key);
                    }
                })
            })
            .collect();

        for round in 0..50 {
            for key in ["root|a", "root|b", "root|c"] {
                q.add(key.to_string());
            }
            if round % 3 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        q.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(processed.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn add_rate_limited_delays_the_item() {
        let q: WorkQueue<String> = WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_secs(1), Duration::from_secs(60)),
        );
        let start = Instant::now();
        q.add_rate_limited("a".to_string());
        assert!(q.is_empty());

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(1));
        q.done(&"a".to_string());

        let start = Instant::now();
        q.add_rate_limited("a".to_string());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let limiter = ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
        let item = "a".to_string();
        let delays: Vec<_> = (0..5).map(|_| limiter.when(&item)).collect();
        assert_eq!(
            delays,
            [5, 10, 20, 30, 30].map(Duration::from_millis).to_vec()
        );
        assert_eq!(limiter.num_requeues(&item), 5);
    }

    #[test]
    fn exponential_backoff_never_overflows() {
        let limiter = ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        let item = "a".to_string();
        for _ in 0..100 {
            assert!(limiter.when(&item) <= Duration::from_secs(1000));
        }
    }

    #[test]
    fn forget_resets_to_base_backoff() {
        let limiter = ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        let failing = "a".to_string();
        let other = "b".to_string();
        limiter.when(&failing);
        limiter.when(&failing);
        limiter.when(&other);

        limiter.forget(&failing);
        assert_eq!(limiter.num_requeues(&failing), 0);
        assert_eq!(limiter.when(&failing), Duration::from_millis(5));
        // other items keep their state
        assert_eq!(limiter.when(&other), Duration::from_millis(10));
    }

    fn quota(qps: u32, burst: u32) -> Quota {
        Quota::per_second(NonZeroU32::new(qps).unwrap()).allow_burst(NonZeroU32::new(burst).unwrap())
    }

    #[test]
    fn bucket_allows_burst_then_spaces_out() {
        let clock = FakeRelativeClock::default();
        let limiter = BucketRateLimiter::with_clock(quota(1, 2), clock.clone());
        let when = |l: &BucketRateLimiter<FakeRelativeClock>| RateLimiter::<()>::when(l, &());
        assert_eq!(when(&limiter), Duration::ZERO);
        assert_eq!(when(&limiter), Duration::ZERO);
        assert_eq!(when(&limiter), Duration::from_secs(1));

        clock.advance(Duration::from_secs(10));
        assert_eq!(when(&limiter), Duration::ZERO);
    }

    #[test]
    fn max_of_takes_longest_delay() {
        let limiter: MaxOfRateLimiter<String> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1),
            )),
            Box::new(BucketRateLimiter::with_clock(quota(1, 1), FakeRelativeClock::default())),
        ]);
        let item = "a".to_string();
        assert_eq!(limiter.when(&item), Duration::from_millis(5));
        assert_eq!(limiter.when(&item), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&item), 2);
        limiter.forget(&item);
        assert_eq!(limiter.num_requeues(&item), 0);
    }
}
