use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket over an injected monotonic clock. The refill rate is passed
/// per acquisition so the admitter can scale it with the load level without
/// rebuilding the bucket.
pub struct TokenBucket {
    capacity: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    pub fn new(capacity: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: clock.now(),
            }),
            clock,
        }
    }

    /// Take one token without waiting. A non-positive rate disables limiting.
    pub fn try_acquire(&self, rate_per_sec: f64) -> bool {
        if rate_per_sec <= 0.0 {
            return true;
        }
        self.advance(rate_per_sec).is_none()
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self, rate_per_sec: f64) {
        if rate_per_sec <= 0.0 {
            return;
        }
        loop {
            match self.advance(rate_per_sec) {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Refill from elapsed time and either consume a token (`None`) or report
    /// how long until one accrues.
    fn advance(&self, rate_per_sec: f64) -> Option<Duration> {
        let mut state = self.state.lock().expect("token bucket poisoned");
        let now = self.clock.now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate_per_sec).min(self.capacity);
        state.refilled_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - state.tokens;
            Some(Duration::from_secs_f64(deficit / rate_per_sec))
        }
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
