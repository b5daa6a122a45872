//! Request budgeting for free public tile services.
//!
//! Two layers keep a job under a provider's per-IP limit: batches are sized
//! and spaced to 80% of the budget, and every dispatch additionally passes a
//! sliding-window limiter holding the hard limit.

use std::collections::VecDeque;
use std::time::Duration;

use tile_common::RequestBudget;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Fraction of the per-minute budget the batch pacing aims for.
const HEADROOM_NUMERATOR: u64 = 4;
const HEADROOM_DENOMINATOR: u64 = 5;

const WINDOW: Duration = Duration::from_secs(60);

/// `floor(per_minute * 0.8)`, never below one.
pub fn effective_per_minute(budget: &RequestBudget) -> u32 {
    let scaled = u64::from(budget.per_minute) * HEADROOM_NUMERATOR / HEADROOM_DENOMINATOR;
    u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
}

/// `min(max_in_flight, floor(per_minute * 0.8))`, never below one.
pub fn batch_size(budget: &RequestBudget) -> usize {
    budget
        .max_in_flight
        .min(effective_per_minute(budget) as usize)
        .max(1)
}

/// Pause between batches: `60 s * batch / floor(per_minute * 0.8)`.
pub fn batch_delay(budget: &RequestBudget) -> Duration {
    let batch = batch_size(budget) as u32;
    WINDOW * batch / effective_per_minute(budget)
}

/// Admits at most `limit` acquisitions in any 60 second window.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    dispatched: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            dispatched: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit as usize, WINDOW)
    }

    pub fn for_budget(budget: &RequestBudget) -> Self {
        Self::per_minute(budget.per_minute)
    }

    /// Wait until a dispatch is admitted and record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut dispatched = self.dispatched.lock().await;
                let now = Instant::now();
                while dispatched
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    dispatched.pop_front();
                }

                if dispatched.len() < self.limit {
                    dispatched.push_back(now);
                    return;
                }

                match dispatched.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            tokio::time::sleep(wait).await;
        }
    }
}
