use std::sync::Mutex;
use tokio::time::Instant;

/// Gateway-wide token bucket for auto-allowed dispatches.
///
/// Sized for a rolling minute: capacity equals the per-minute budget and
/// tokens refill continuously at budget/60 per second. Acquisition is a
/// short critical section.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_minute(max_per_minute: u32) -> Self {
        let capacity = f64::from(max_per_minute);
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, advance};

    #[tokio::test(start_paused = true)]
    async fn allows_exactly_the_budget_within_a_window() {
        let bucket = TokenBucket::per_minute(5);
        for i in 0..5 {
            assert!(bucket.try_acquire(), "request {} should pass", i);
        }
        assert!(!bucket.try_acquire(), "budget exhausted");
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let bucket = TokenBucket::per_minute(60);
        for _ in 0..60 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        // One token per second at 60/minute
        advance(Duration::from_secs(2)).await;
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_caps_at_capacity() {
        let bucket = TokenBucket::per_minute(2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());

        advance(Duration::from_secs(3600)).await;
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }
}
