use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::AdmissionError;
use crate::deadline;
use crate::headers::RateLimitHeaders;
use crate::registry::RegistryInner;
use crate::route::BucketKey;
use crate::spawn;

/// Diff the reaction endpoint reports when it means a quarter second.
const ROUNDED_REACTION_RESET_MS: i64 = 1000;
const REACTION_RESET_MS: i64 = 250;

type Waiter = oneshot::Sender<BucketPermit>;

/// Rate-limit state and pending queue shared by every route with the same
/// [`BucketKey`].
///
/// At most one request per bucket is in flight at any time. The holder of
/// the [`BucketPermit`] is that request; everyone else waits in FIFO order.
#[derive(Debug)]
pub struct Bucket {
    key: BucketKey,
    state: Mutex<BucketState>,
    registry: Weak<RegistryInner>,
}

#[derive(Debug)]
struct BucketState {
    limit: i64,
    remaining: i64,
    reset_at: Option<i64>,
    /// `reset_at` translated onto the local monotonic clock.
    reset_deadline: Option<Instant>,
    locked_until: Option<Instant>,
    in_flight: bool,
    queue: VecDeque<Waiter>,
    last_used: Instant,
    unlock_armed: bool,
    eviction: Option<AbortHandle>,
}

/// Point-in-time copy of a bucket's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub key: BucketKey,
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: Option<i64>,
    pub locked_until: Option<Instant>,
    pub queued: usize,
    pub in_flight: bool,
    pub last_used: Instant,
}

/// Outcome of asking a bucket for admission.
#[derive(Debug)]
pub enum Admission {
    /// The bucket was free; the request may go now.
    Ready(BucketPermit),
    /// The request holds a place in the queue.
    Queued(oneshot::Receiver<BucketPermit>),
}

impl Admission {
    pub async fn wait(self) -> Result<BucketPermit, AdmissionError> {
        match self {
            Self::Ready(permit) => Ok(permit),
            Self::Queued(rx) => rx.await.map_err(|_| AdmissionError::Closed),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl BucketState {
    fn new(now: Instant) -> Self {
        Self {
            limit: -1,
            remaining: -1,
            reset_at: None,
            reset_deadline: None,
            locked_until: None,
            in_flight: false,
            queue: VecDeque::new(),
            last_used: now,
            unlock_armed: false,
            eviction: None,
        }
    }

    fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    fn extend_lock(&mut self, until: Instant) {
        // A shorter lock never cuts an existing longer one.
        self.locked_until = Some(self.locked_until.map_or(until, |current| current.max(until)));
    }

    /// Restore `remaining` once the reset deadline has passed.
    fn refresh(&mut self, now: Instant) {
        if self.reset_deadline.is_some_and(|deadline| deadline <= now) && self.limit >= 0 {
            self.remaining = self.limit;
            self.reset_deadline = None;
        }
        if self.locked_until.is_some_and(|until| until <= now) {
            self.locked_until = None;
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_used = now;
        if let Some(eviction) = self.eviction.take() {
            eviction.abort();
        }
    }

    fn drop_cancelled(&mut self) {
        while self.queue.front().is_some_and(|waiter| waiter.is_closed()) {
            self.queue.pop_front();
        }
    }
}

pub(crate) enum Idleness {
    Active,
    Until(Instant),
    Expired,
}

enum Next {
    Busy,
    Idle,
    Locked,
    Admit(Waiter),
}

impl Bucket {
    /// Create a bucket that is not tracked by any registry.
    pub fn new(key: BucketKey) -> Arc<Self> {
        Self::new_in(key, Weak::new())
    }

    pub(crate) fn new_in(key: BucketKey, registry: Weak<RegistryInner>) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(BucketState::new(Instant::now())),
            registry,
        })
    }

    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let state = self.state.lock();
        BucketSnapshot {
            key: self.key.clone(),
            limit: state.limit,
            remaining: state.remaining,
            reset_at: state.reset_at,
            locked_until: state.locked_until,
            queued: state.queue.iter().filter(|w| !w.is_closed()).count(),
            in_flight: state.in_flight,
            last_used: state.last_used,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().is_locked(Instant::now())
    }

    /// Hold every request in this bucket for at least `duration`.
    pub fn lock(self: &Arc<Self>, duration: Duration) {
        self.state.lock().extend_lock(deadline(Instant::now(), duration));
        self.dispatch();
    }

    /// Take a place in the queue. The returned admission is ready
    /// immediately when the bucket is free, unlocked and nobody is ahead.
    pub fn enqueue(self: &Arc<Self>) -> Admission {
        let rx = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.touch(now);
            state.refresh(now);
            state.drop_cancelled();
            if !state.in_flight && state.queue.is_empty() && !state.is_locked(now) {
                state.in_flight = true;
                return Admission::Ready(BucketPermit::new(Arc::clone(self)));
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            debug!(bucket = %self.key, queued = state.queue.len(), "request queued");
            rx
        };
        self.dispatch();
        Admission::Queued(rx)
    }

    /// Wait for this bucket's turn.
    pub async fn acquire(self: &Arc<Self>) -> Result<BucketPermit, AdmissionError> {
        self.enqueue().wait().await
    }

    pub(crate) fn set_eviction(&self, handle: AbortHandle) {
        if let Some(previous) = self.state.lock().eviction.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn touch(&self) {
        self.state.lock().touch(Instant::now());
    }

    /// How long until the bucket has been unused for `ttl` with nothing
    /// queued, in flight or locked.
    pub(crate) fn idleness(&self, ttl: Duration) -> Idleness {
        let state = self.state.lock();
        if state.in_flight || state.queue.iter().any(|w| !w.is_closed()) {
            return Idleness::Active;
        }
        let now = Instant::now();
        let until = (state.last_used + ttl).max(state.locked_until.unwrap_or(now));
        if until > now {
            Idleness::Until(until)
        } else {
            Idleness::Expired
        }
    }

    fn release(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.in_flight = false;
            state.last_used = Instant::now();
        }
        self.dispatch();
    }

    /// Hand the permit to the first live waiter if the bucket allows it.
    fn dispatch(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.drop_cancelled();
                if state.in_flight {
                    Next::Busy
                } else if state.queue.is_empty() {
                    Next::Idle
                } else if let Some(until) = state.locked_until.filter(|until| *until > now) {
                    if !state.unlock_armed {
                        state.unlock_armed = self.arm_unlock(until);
                    }
                    Next::Locked
                } else {
                    state.refresh(now);
                    match state.queue.pop_front() {
                        Some(waiter) => {
                            state.in_flight = true;
                            Next::Admit(waiter)
                        }
                        None => Next::Idle,
                    }
                }
            };

            match next {
                Next::Busy | Next::Locked => return,
                Next::Idle => {
                    if let Some(registry) = self.registry.upgrade() {
                        registry.schedule_eviction(self, registry.idle_ttl());
                    }
                    return;
                }
                Next::Admit(waiter) => match waiter.send(BucketPermit::new(Arc::clone(self))) {
                    Ok(()) => return,
                    Err(permit) => {
                        // The waiter went away between the check and the send.
                        permit.disarm();
                        self.state.lock().in_flight = false;
                    }
                },
            }
        }
    }

    /// Returns whether a timer task is now running.
    fn arm_unlock(self: &Arc<Self>, until: Instant) -> bool {
        trace!(bucket = %self.key, "arming unlock timer");
        let bucket = Arc::clone(self);
        spawn(async move {
            tokio::time::sleep_until(until).await;
            bucket.state.lock().unlock_armed = false;
            bucket.dispatch();
        })
        .is_some()
    }
}

/// Exclusive right to send the next request of a bucket.
///
/// Dropping the permit hands the bucket to the next waiter.
#[derive(Debug)]
pub struct BucketPermit {
    bucket: Arc<Bucket>,
    armed: bool,
}

impl BucketPermit {
    fn new(bucket: Arc<Bucket>) -> Self {
        Self {
            bucket,
            armed: true,
        }
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    /// Account for the request about to be sent.
    ///
    /// When this send takes the last known slot the bucket locks itself
    /// until its reset deadline, so the next request waits instead of
    /// drawing a guaranteed 429. Unknown buckets never pre-lock.
    pub fn begin_send(&self) {
        let mut state = self.bucket.state.lock();
        let now = Instant::now();
        state.refresh(now);
        if state.remaining == 1
            && let Some(deadline) = state.reset_deadline
        {
            debug!(bucket = %self.bucket.key, "last slot in use, pre-locking until reset");
            state.extend_lock(deadline);
        }
        if state.remaining > 0 {
            state.remaining -= 1;
        }
    }

    /// Fold a response's rate-limit headers into the bucket.
    ///
    /// `server_now` is the response `Date` in epoch milliseconds. When the
    /// response is not a 429 and reports nothing remaining, the bucket locks
    /// until the reset; the lock duration is returned.
    pub fn record(
        &self,
        headers: &RateLimitHeaders,
        server_now: i64,
        rate_limited: bool,
        own_reaction: bool,
    ) -> Option<Duration> {
        let mut state = self.bucket.state.lock();
        let now = Instant::now();
        state.limit = headers.limit;
        state.remaining = headers.remaining;

        let Some(reset_at) = headers.reset_at else {
            state.reset_at = None;
            state.reset_deadline = None;
            return None;
        };

        let mut diff = reset_at.saturating_sub(server_now).max(0);
        let mut reset_at = reset_at;
        if own_reaction && diff == ROUNDED_REACTION_RESET_MS {
            diff = REACTION_RESET_MS;
            reset_at = server_now + diff;
        }
        let wait = Duration::from_millis(diff as u64);
        let until = deadline(now, wait);
        state.reset_at = Some(reset_at);
        state.reset_deadline = Some(until);

        if state.remaining == 0 && !rate_limited {
            debug!(bucket = %self.bucket.key, wait_ms = diff, "bucket exhausted");
            state.extend_lock(until);
            return Some(wait);
        }
        None
    }

    /// Give the turn back after a 429 and wait to be first again.
    ///
    /// The bucket locks for `retry_after` and this request goes to the
    /// front of the queue, ahead of everything submitted after it.
    pub async fn requeue_front(mut self, retry_after: Duration) -> Result<Self, AdmissionError> {
        let bucket = Arc::clone(&self.bucket);
        let rx = {
            let mut state = bucket.state.lock();
            state.extend_lock(deadline(Instant::now(), retry_after));
            let (tx, rx) = oneshot::channel();
            state.queue.push_front(tx);
            state.in_flight = false;
            rx
        };
        self.armed = false;
        drop(self);
        debug!(bucket = %bucket.key, ?retry_after, "requeued at front");
        bucket.dispatch();
        rx.await.map_err(|_| AdmissionError::Closed)
    }
}

impl Drop for BucketPermit {
    fn drop(&mut self) {
        if self.armed {
            self.bucket.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_LOCK;
    use tokio::time::advance;
    use tokio::time::pause;

    fn bucket() -> Arc<Bucket> {
        Bucket::new(BucketKey::from("::1:/test"))
    }

    fn exhausted(reset_in_ms: i64) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: 5,
            remaining: 0,
            reset_at: Some(1_000_000 + reset_in_ms),
            ..RateLimitHeaders::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_bucket_admits_immediately() {
        let bucket = bucket();
        let snapshot = bucket.snapshot();
        assert_eq!((snapshot.limit, snapshot.remaining), (-1, -1));

        let permit = bucket.enqueue();
        assert!(permit.is_ready());
        let permit = permit.wait().await.unwrap();
        permit.begin_send();

        // Unknown buckets never pre-lock.
        assert!(!bucket.is_locked());
    }

    #[tokio::test]
    async fn test_waiters_are_admitted_in_order() {
        let bucket = bucket();
        let first = bucket.acquire().await.unwrap();

        let second = bucket.enqueue();
        let third = bucket.enqueue();
        assert!(!second.is_ready());
        assert_eq!(bucket.snapshot().queued, 2);

        let mut second = Box::pin(second.wait());
        let mut third = Box::pin(third.wait());
        assert!(futures::poll!(&mut second).is_pending());

        drop(first);
        let second = second.await.unwrap();
        assert!(futures::poll!(&mut third).is_pending());
        drop(second);
        third.await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_bucket_waits_for_reset() {
        pause();
        let bucket = bucket();
        let permit = bucket.acquire().await.unwrap();
        let wait = permit.record(&exhausted(5_000), 1_000_000, false, false);
        assert_eq!(wait, Some(Duration::from_secs(5)));
        drop(permit);

        let mut next = Box::pin(bucket.acquire());
        assert!(futures::poll!(&mut next).is_pending());

        advance(Duration::from_millis(4_990)).await;
        assert!(futures::poll!(&mut next).is_pending());

        advance(Duration::from_millis(20)).await;
        next.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limited_response_does_not_lock_from_headers() {
        let bucket = bucket();
        let permit = bucket.acquire().await.unwrap();
        assert_eq!(permit.record(&exhausted(5_000), 1_000_000, true, false), None);
        drop(permit);

        assert!(!bucket.is_locked());
    }

    #[tokio::test]
    async fn test_last_slot_pre_locks() {
        pause();
        let bucket = bucket();
        let permit = bucket.acquire().await.unwrap();
        let headers = RateLimitHeaders {
            limit: 5,
            remaining: 1,
            reset_at: Some(1_003_000),
            ..RateLimitHeaders::default()
        };
        assert_eq!(permit.record(&headers, 1_000_000, false, false), None);
        drop(permit);
        assert!(!bucket.is_locked());

        let permit = bucket.acquire().await.unwrap();
        permit.begin_send();
        // The response carries no rate-limit information at all.
        permit.record(&RateLimitHeaders::default(), 1_000_100, false, false);
        drop(permit);

        assert!(bucket.is_locked());
        let mut next = Box::pin(bucket.acquire());
        assert!(futures::poll!(&mut next).is_pending());
        advance(Duration::from_millis(3_001)).await;
        next.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_remaining_is_restored_after_reset() {
        pause();
        let bucket = bucket();
        let permit = bucket.acquire().await.unwrap();
        let headers = RateLimitHeaders {
            limit: 5,
            remaining: 1,
            reset_at: Some(1_001_000),
            ..RateLimitHeaders::default()
        };
        permit.record(&headers, 1_000_000, false, false);
        drop(permit);

        advance(Duration::from_secs(2)).await;
        let permit = bucket.acquire().await.unwrap();
        permit.begin_send();
        assert!(!bucket.is_locked());
        assert_eq!(bucket.snapshot().remaining, 4);
    }

    #[tokio::test]
    async fn test_reaction_reset_is_clamped() {
        let bucket = bucket();
        let permit = bucket.acquire().await.unwrap();

        let wait = permit.record(&exhausted(1_000), 1_000_000, false, true);
        assert_eq!(wait, Some(Duration::from_millis(250)));
        assert_eq!(bucket.snapshot().reset_at, Some(1_000_250));

        // Only an exact second is treated as rounding.
        let wait = permit.record(&exhausted(1_001), 1_000_000, false, true);
        assert_eq!(wait, Some(Duration::from_millis(1_001)));
    }

    #[tokio::test]
    async fn test_reset_in_the_past_does_not_lock() {
        let bucket = bucket();
        let permit = bucket.acquire().await.unwrap();
        let wait = permit.record(&exhausted(-500), 1_000_000, false, false);
        assert_eq!(wait, Some(Duration::ZERO));
        drop(permit);

        assert!(bucket.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_requeued_request_goes_first() {
        pause();
        let bucket = bucket();
        let first = bucket.acquire().await.unwrap();
        let mut second = Box::pin(bucket.acquire());
        assert!(futures::poll!(&mut second).is_pending());

        let mut retry = Box::pin(first.requeue_front(Duration::from_secs(1)));
        assert!(futures::poll!(&mut retry).is_pending());
        assert!(bucket.is_locked());

        advance(Duration::from_millis(1_001)).await;
        let first = retry.await.unwrap();
        assert!(futures::poll!(&mut second).is_pending());
        drop(first);
        second.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_waiters_are_skipped() {
        let bucket = bucket();
        let first = bucket.acquire().await.unwrap();

        let abandoned = bucket.enqueue();
        let kept = bucket.enqueue();
        drop(abandoned);
        assert_eq!(bucket.snapshot().queued, 1);

        drop(first);
        kept.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_waits_are_capped() {
        pause();
        let bucket = bucket();
        let start = Instant::now();
        bucket.lock(Duration::MAX);
        assert_eq!(bucket.snapshot().locked_until, Some(start + MAX_LOCK));

        let permit = bucket.acquire();
        let mut permit = Box::pin(permit);
        assert!(futures::poll!(&mut permit).is_pending());
        drop(permit);

        let other = Bucket::new(BucketKey::from("::2:/test"));
        let permit = other.acquire().await.unwrap();
        let headers = RateLimitHeaders {
            reset_at: Some(i64::MAX),
            ..exhausted(0)
        };
        let wait = permit.record(&headers, i64::MIN, false, false);
        assert_eq!(wait, Some(Duration::from_millis(i64::MAX as u64)));
        assert_eq!(other.snapshot().locked_until, Some(start + MAX_LOCK));

        let mut retry = Box::pin(permit.requeue_front(Duration::from_secs_f64(1.5e19)));
        assert!(futures::poll!(&mut retry).is_pending());
        assert!(other.is_locked());
    }

    #[test]
    fn test_unlock_timer_arms_once_a_runtime_exists() {
        let bucket = bucket();
        let held = bucket.enqueue();
        assert!(held.is_ready());
        bucket.lock(Duration::from_millis(10));
        let waiting = bucket.enqueue();
        drop(held);
        assert!(!bucket.state.lock().unlock_armed);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            bucket.lock(Duration::from_millis(10));
            waiting.wait().await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_longer_lock_wins() {
        pause();
        let bucket = bucket();
        bucket.lock(Duration::from_secs(5));
        bucket.lock(Duration::from_secs(1));

        advance(Duration::from_secs(2)).await;
        assert!(bucket.is_locked());
        advance(Duration::from_secs(4)).await;
        assert!(!bucket.is_locked());
    }
}
