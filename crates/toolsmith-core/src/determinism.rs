//! Deterministic workflow context.
//!
//! Workflow logic must not observe wall-clock time or true randomness; it
//! draws both from this context, whose outputs are pure functions of a
//! persisted `(seed, current_time, step_count)` triple. Re-executing a
//! workflow from its event log therefore yields identical values.
//!
//! The generator is a linear congruential generator with the classic
//! 32-bit constants a = 1664525, c = 1013904223, m = 2^32.

use serde::{Deserialize, Serialize};

const LCG_A: u64 = 1_664_525;
const LCG_C: u64 = 1_013_904_223;
const LCG_M: u64 = 1 << 32;

/// Replayable time and randomness for workflow activities.
///
/// Values are immutable; every operation returns the successor context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicContext {
    /// Logical current time in millisecond epoch
    pub current_time: i64,
    /// LCG state, always `< 2^32`
    pub seed: u64,
    /// Number of recorded deterministic activities
    pub step_count: u64,
}

impl DeterministicContext {
    pub fn new(seed: u64, start_time: i64) -> Self {
        Self {
            current_time: start_time,
            seed: seed % LCG_M,
            step_count: 0,
        }
    }

    /// Logical "now" - the context's current time, never the wall clock.
    pub fn now(&self) -> i64 {
        self.current_time
    }

    /// Advance the logical clock by `ms` milliseconds.
    pub fn advance_time(&self, ms: i64) -> Self {
        Self {
            current_time: self.current_time + ms,
            ..*self
        }
    }

    /// Next pseudo-random value in `[0, 1)` and the successor context.
    pub fn random(&self) -> (f64, Self) {
        let next_seed = (LCG_A.wrapping_mul(self.seed).wrapping_add(LCG_C)) % LCG_M;
        let value = next_seed as f64 / LCG_M as f64;
        (
            value,
            Self {
                seed: next_seed,
                ..*self
            },
        )
    }

    /// Pseudo-random integer in `[lo, hi]` (inclusive), derived from
    /// [`random`](Self::random).
    pub fn random_int(&self, lo: i64, hi: i64) -> (i64, Self) {
        let (value, next) = self.random();
        let span = (hi - lo + 1).max(1);
        let picked = lo + (value * span as f64) as i64;
        (picked.min(hi), next)
    }

    /// Record one deterministic activity, incrementing the step counter.
    pub fn record_activity(&self) -> Self {
        Self {
            step_count: self.step_count + 1,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_returns_logical_time() {
        let ctx = DeterministicContext::new(42, 1000);
        assert_eq!(ctx.now(), 1000);
        let ctx = ctx.advance_time(10);
        assert_eq!(ctx.now(), 1010);
    }

    #[test]
    fn test_random_is_deterministic() {
        let a = DeterministicContext::new(42, 0);
        let b = DeterministicContext::new(42, 0);
        let (va, a2) = a.random();
        let (vb, b2) = b.random();
        assert_eq!(va, vb);
        assert_eq!(a2, b2);
        assert!((0.0..1.0).contains(&va));
    }

    #[test]
    fn test_random_sequence_advances() {
        let ctx = DeterministicContext::new(7, 0);
        let (v1, ctx) = ctx.random();
        let (v2, _) = ctx.random();
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_random_int_bounds() {
        let mut ctx = DeterministicContext::new(99, 0);
        for _ in 0..100 {
            let (v, next) = ctx.random_int(3, 9);
            assert!((3..=9).contains(&v));
            ctx = next;
        }
    }

    #[test]
    fn test_replay_yields_identical_trajectory() {
        let run = |seed: u64, start: i64| {
            let mut ctx = DeterministicContext::new(seed, start);
            let mut outputs = Vec::new();
            for _ in 0..3 {
                ctx = ctx.advance_time(10);
                let (v, next) = ctx.random_int(0, 1000);
                ctx = next.record_activity();
                outputs.push(v);
            }
            (outputs, ctx)
        };

        let (first, end_a) = run(42, 1000);
        let (second, end_b) = run(42, 1000);
        assert_eq!(first, second);
        assert_eq!(end_a, end_b);
        assert_eq!(end_a.current_time, 1030);
        assert_eq!(end_a.step_count, 3);
    }

    #[test]
    fn test_serde_round_trip() {
        let ctx = DeterministicContext::new(42, 1000).advance_time(5).record_activity();
        let json = serde_json::to_value(ctx).unwrap();
        let back: DeterministicContext = serde_json::from_value(json).unwrap();
        assert_eq!(ctx, back);
    }
}
