use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Google Sheets read quota per user: 60 requests per minute.
pub const PER_USER_CAPACITY: f64 = 60.0;
pub const PER_USER_REFILL_PER_SEC: f64 = 1.0;
/// Google Sheets read quota per project: 300 requests per minute.
pub const PER_PROJECT_CAPACITY: f64 = 300.0;
pub const PER_PROJECT_REFILL_PER_SEC: f64 = 5.0;

/// Capacity and refill rate for a single bucket, in tokens and tokens/sec.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket with blocking, FIFO-fair `acquire`.
///
/// The bucket state sits behind a `tokio::sync::Mutex`, which queues
/// waiters in FIFO order; a caller that must wait for refill holds the
/// lock across its sleep, so later callers cannot jump the queue even when
/// they need fewer tokens.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.last_refill = Instant::now();
        state.tokens = self
            .capacity
            .min(state.tokens + elapsed * self.refill_per_sec);
    }

    /// Take `n` tokens, sleeping until the bucket has refilled enough.
    /// Never returns before the bucket held at least `n` tokens.
    pub async fn acquire(&self, n: f64) {
        let n = if n > self.capacity {
            warn!(
                "acquire({n}) exceeds bucket capacity {}; clamping",
                self.capacity
            );
            self.capacity
        } else {
            n
        };

        let mut state = self.state.lock().await;
        loop {
            self.refill(&mut state);
            if state.tokens >= n {
                state.tokens -= n;
                return;
            }
            let deficit = n - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
            debug!("bucket short {deficit:.2} tokens, waiting {wait:?}");
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token count after refill. Test/diagnostic hook.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

/// Two composed buckets modelling the sheet API's dual read quota
/// (per-user and per-project). `acquire(n)` observes both limits.
///
/// Not shared across processes: the safety factor scales both capacities
/// once at construction to absorb over-provisioning when several worker
/// processes run against the same quota.
pub struct RateLimiter {
    per_user: TokenBucket,
    per_project: TokenBucket,
}

impl RateLimiter {
    pub fn new(per_user: BucketConfig, per_project: BucketConfig, safety_factor: f64) -> Self {
        Self {
            per_user: TokenBucket::new(BucketConfig {
                capacity: per_user.capacity * safety_factor,
                refill_per_sec: per_user.refill_per_sec,
            }),
            per_project: TokenBucket::new(BucketConfig {
                capacity: per_project.capacity * safety_factor,
                refill_per_sec: per_project.refill_per_sec,
            }),
        }
    }

    /// Construct with the stock sheet API quotas scaled by `safety_factor`.
    pub fn with_defaults(safety_factor: f64) -> Self {
        Self::new(
            BucketConfig {
                capacity: PER_USER_CAPACITY,
                refill_per_sec: PER_USER_REFILL_PER_SEC,
            },
            BucketConfig {
                capacity: PER_PROJECT_CAPACITY,
                refill_per_sec: PER_PROJECT_REFILL_PER_SEC,
            },
            safety_factor,
        )
    }

    /// Acquire `n` tokens from both buckets. Returns only once both
    /// quotas have room; waiters are served in arrival order.
    pub async fn acquire(&self, n: f64) {
        self.per_user.acquire(n).await;
        self.per_project.acquire(n).await;
    }

    pub async fn available(&self) -> (f64, f64) {
        (
            self.per_user.available().await,
            self.per_project.available().await,
        )
    }
}
