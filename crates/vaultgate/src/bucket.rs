use std::num::NonZeroU32;
use std::time::{Duration, Instant};

/// Refill period for per-minute limits.
pub const MINUTE: Duration = Duration::from_secs(60);

/// Single-client token bucket with continuous ("greedy") refill.
///
/// Tokens trickle in proportionally to elapsed time rather than resetting once
/// per period, so a bucket of `capacity` refilled `refill_tokens` per `period`
/// regains one token every `period / refill_tokens`.
///
/// Token amounts are kept in fixed point: one token is `period` nanoseconds
/// worth of units, which makes `elapsed_nanos * refill_tokens` an exact refill.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_tokens: u32,
    period_nanos: u128,
    units: u128,
    last_refill: Instant,
}

/// Outcome of a [`TokenBucket::try_consume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeResult {
    pub allowed: bool,
    /// Whole tokens left after this call.
    pub remaining_tokens: u64,
    /// Zero when allowed. `u64::MAX` when the request can never be satisfied.
    pub nanos_until_next_token: u64,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// - `capacity`: max burst size (tokens)
    /// - `refill_tokens`: tokens regained per `period`
    pub fn new(
        capacity: NonZeroU32,
        refill_tokens: NonZeroU32,
        period: Duration,
        now: Instant,
    ) -> Self {
        let period_nanos = period.as_nanos().max(1);
        Self {
            capacity: capacity.get(),
            refill_tokens: refill_tokens.get(),
            period_nanos,
            units: u128::from(capacity.get()) * period_nanos,
            last_refill: now,
        }
    }

    /// A bucket holding `limit` tokens that regains `limit` tokens per minute.
    pub fn per_minute(limit: NonZeroU32, now: Instant) -> Self {
        Self::new(limit, limit, MINUTE, now)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill, then take `n` tokens if they are all available.
    pub fn try_consume(&mut self, n: NonZeroU32, now: Instant) -> ConsumeResult {
        self.refill(now);

        if n.get() > self.capacity {
            return ConsumeResult {
                allowed: false,
                remaining_tokens: self.whole_tokens(),
                nanos_until_next_token: u64::MAX,
            };
        }

        let needed = u128::from(n.get()) * self.period_nanos;
        if self.units >= needed {
            self.units -= needed;
            return ConsumeResult {
                allowed: true,
                remaining_tokens: self.whole_tokens(),
                nanos_until_next_token: 0,
            };
        }

        let deficit = needed - self.units;
        let wait = deficit.div_ceil(u128::from(self.refill_tokens));
        ConsumeResult {
            allowed: false,
            remaining_tokens: self.whole_tokens(),
            nanos_until_next_token: u64::try_from(wait).unwrap_or(u64::MAX),
        }
    }

    /// Whole tokens available at `now`, after refill.
    pub fn available_tokens(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.whole_tokens()
    }

    fn refill(&mut self, now: Instant) {
        // A caller that sampled the clock before a concurrent caller refilled
        // sees zero elapsed time; last_refill never moves backwards.
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_nanos();
        let max_units = u128::from(self.capacity) * self.period_nanos;
        let added = elapsed.saturating_mul(u128::from(self.refill_tokens));
        self.units = self.units.saturating_add(added).min(max_units);
        self.last_refill = now;
    }

    fn whole_tokens(&self) -> u64 {
        (self.units / self.period_nanos) as u64
    }
}
