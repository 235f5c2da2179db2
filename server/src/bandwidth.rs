//! Token buckets gating how many bytes are handed to clients.
//!
//! [`SharedBandwidthLimiter`] holds the global budget and splits whatever is
//! left among the active clients each tick. [`ClientTokenBucket`] layers a
//! short burst cap on top so one client cannot swallow a freshly refilled
//! share in a single tick.

use std::time::{Duration, Instant};

const MIN_REFILL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_REFILL_INTERVAL: Duration = Duration::from_secs(1);

fn refill_amount(elapsed: Duration, bytes_per_second: u64) -> i64 {
    let elapsed = elapsed.min(MAX_REFILL_INTERVAL);
    (elapsed.as_nanos() * bytes_per_second as u128 / 1_000_000_000) as i64
}

pub struct SharedBandwidthLimiter {
    max_bytes_per_second: u64,
    available: i64,
    last_refill: Instant,
}

impl SharedBandwidthLimiter {
    pub fn new(max_bytes_per_second: u64) -> Self { Self::new_at(max_bytes_per_second, Instant::now()) }

    pub fn new_at(max_bytes_per_second: u64, now: Instant) -> Self {
        Self {
            max_bytes_per_second,
            available: max_bytes_per_second as i64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed < MIN_REFILL_INTERVAL {
            return;
        }
        self.last_refill = now;
        let refilled = self.available + refill_amount(elapsed, self.max_bytes_per_second);
        self.available = refilled.min(self.max_bytes_per_second as i64);
    }

    /// Equal share of the tokens left right now.
    pub fn per_client_allocation(&mut self, active_clients: usize) -> u64 {
        self.per_client_allocation_at(Instant::now(), active_clients)
    }

    pub fn per_client_allocation_at(&mut self, now: Instant, active_clients: usize) -> u64 {
        self.refill(now);
        if self.available <= 0 || active_clients == 0 {
            return 0;
        }
        self.available as u64 / active_clients as u64
    }

    /// Debits sent bytes. The balance may go negative, which only delays
    /// the next allocation.
    pub fn record_send(&mut self, bytes: usize) { self.available -= bytes as i64; }

    pub fn bytes_sent_this_second(&mut self) -> u64 { self.bytes_sent_this_second_at(Instant::now()) }

    pub fn bytes_sent_this_second_at(&mut self, now: Instant) -> u64 {
        self.refill(now);
        (self.max_bytes_per_second as i64 - self.available).max(0) as u64
    }

    pub fn max_bytes_per_second(&self) -> u64 { self.max_bytes_per_second }
}

/// Per-client bucket refilled at the client's current allocation and capped
/// at a tenth of it (about two ticks).
#[derive(Debug, Default)]
pub struct ClientTokenBucket {
    available: i64,
    last_refill: Option<Instant>,
}

impl ClientTokenBucket {
    pub fn can_send(&mut self, allocation: u64) -> bool { self.can_send_at(Instant::now(), allocation) }

    pub fn can_send_at(&mut self, now: Instant, allocation: u64) -> bool {
        if allocation == 0 {
            return false;
        }
        // The first refill behaves as if a whole second had passed.
        let elapsed = self
            .last_refill
            .map_or(MAX_REFILL_INTERVAL, |last| now.saturating_duration_since(last));
        if elapsed >= MIN_REFILL_INTERVAL {
            self.last_refill = Some(now);
            let burst_cap = (allocation / 10) as i64;
            self.available = (self.available + refill_amount(elapsed, allocation)).min(burst_cap);
        }
        self.available > 0
    }

    pub fn record_send(&mut self, bytes: usize) { self.available -= bytes as i64; }

    pub fn reset(&mut self) { *self = Self::default(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: u64 = 10_000_000;

    #[test]
    fn single_client_gets_everything() {
        let now = Instant::now();
        let mut limiter = SharedBandwidthLimiter::new_at(BUDGET, now);
        assert_eq!(limiter.per_client_allocation_at(now, 1), BUDGET);
    }

    #[test]
    fn budget_is_split_evenly() {
        let now = Instant::now();
        let mut limiter = SharedBandwidthLimiter::new_at(BUDGET, now);
        assert_eq!(limiter.per_client_allocation_at(now, 4), 2_500_000);
    }

    #[test]
    fn no_clients_no_allocation() {
        let now = Instant::now();
        let mut limiter = SharedBandwidthLimiter::new_at(BUDGET, now);
        assert_eq!(limiter.per_client_allocation_at(now, 0), 0);
    }

    #[test]
    fn sends_reduce_allocation() {
        let now = Instant::now();
        let mut limiter = SharedBandwidthLimiter::new_at(BUDGET, now);
        limiter.record_send(3_000_000);
        assert_eq!(limiter.per_client_allocation_at(now, 1), 7_000_000);
        assert_eq!(limiter.bytes_sent_this_second_at(now), 3_000_000);
    }

    #[test]
    fn exhausted_and_overdrawn_give_zero() {
        let now = Instant::now();
        let mut limiter = SharedBandwidthLimiter::new_at(BUDGET, now);
        limiter.record_send(BUDGET as usize);
        assert_eq!(limiter.per_client_allocation_at(now, 1), 0);
        limiter.record_send(500_000);
        assert_eq!(limiter.per_client_allocation_at(now, 1), 0);
        // Sub-millisecond gaps never refill
        let soon = now + Duration::from_micros(500);
        assert_eq!(limiter.per_client_allocation_at(soon, 1), 0);
    }

    #[test]
    fn refill_is_proportional_and_capped() {
        let now = Instant::now();
        let mut limiter = SharedBandwidthLimiter::new_at(BUDGET, now);
        limiter.record_send(BUDGET as usize);

        let later = now + Duration::from_millis(100);
        assert_eq!(limiter.per_client_allocation_at(later, 1), 1_000_000);

        let much_later = later + Duration::from_secs(3600);
        assert_eq!(limiter.per_client_allocation_at(much_later, 1), BUDGET);
    }

    #[test]
    fn refill_after_real_sleep() {
        let mut limiter = SharedBandwidthLimiter::new(BUDGET);
        limiter.record_send(BUDGET as usize);
        std::thread::sleep(Duration::from_millis(20));
        let alloc = limiter.per_client_allocation(1);
        assert!(alloc > 0 && alloc <= BUDGET);
    }

    #[test]
    fn client_bucket_caps_burst() {
        let now = Instant::now();
        let mut bucket = ClientTokenBucket::default();
        assert!(!bucket.can_send_at(now, 0));
        assert!(bucket.can_send_at(now, 100_000));
        // Full first refill is clamped to the 10% burst cap
        bucket.record_send(10_000);
        assert!(!bucket.can_send_at(now, 100_000));

        let later = now + Duration::from_millis(50);
        assert!(bucket.can_send_at(later, 100_000));
        bucket.record_send(5_000);
        assert!(!bucket.can_send_at(later, 100_000));
    }
}
