//! Pure reconnection backoff logic
//!
//! Delays double from one second per failed attempt, with up to one second
//! of uniform jitter. Once the pending delay exceeds the ceiling the device
//! gives up instead of retrying.

use rand::Rng;
use std::time::Duration;

/// First backoff delay after a failure
pub const INITIAL_BACKOFF_SECS: u64 = 1;

/// Ceiling past which the device stops retrying
pub const MAX_BACKOFF_SECS: u64 = 32;

/// Decision result for a connect attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// No failure since the last confirmed connection: connect now
    Immediate,
    /// Sleep for `delay` (base plus jitter) before connecting
    Delay { delay: Duration, base_secs: u64 },
    /// Backoff ceiling exceeded
    GiveUp { min_backoff_secs: u64 },
}

/// Backoff bookkeeping for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffCounter {
    should_backoff: bool,
    min_backoff_secs: u64,
}

impl Default for BackoffCounter {
    fn default() -> Self {
        Self {
            should_backoff: false,
            min_backoff_secs: INITIAL_BACKOFF_SECS,
        }
    }
}

impl BackoffCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_backoff(&self) -> bool {
        self.should_backoff
    }

    pub fn min_backoff_secs(&self) -> u64 {
        self.min_backoff_secs
    }

    /// Decide how to proceed with the next connect attempt
    ///
    /// A `Delay` decision doubles the stored minimum so the following
    /// failure backs off twice as long. `GiveUp` leaves the counter as is,
    /// so asking again gives up again.
    pub fn next_attempt<R: Rng + ?Sized>(&mut self, rng: &mut R) -> ReconnectionDecision {
        if !self.should_backoff {
            return ReconnectionDecision::Immediate;
        }

        if self.min_backoff_secs > MAX_BACKOFF_SECS {
            return ReconnectionDecision::GiveUp {
                min_backoff_secs: self.min_backoff_secs,
            };
        }

        let base_secs = self.min_backoff_secs;
        let jitter: f64 = rng.gen_range(0.0..1.0);
        self.min_backoff_secs = self.min_backoff_secs.saturating_mul(2);

        ReconnectionDecision::Delay {
            delay: Duration::from_secs(base_secs) + Duration::from_secs_f64(jitter),
            base_secs,
        }
    }

    /// Confirmed connection: forget all previous failures
    pub fn on_connected(&mut self) {
        self.should_backoff = false;
        self.min_backoff_secs = INITIAL_BACKOFF_SECS;
    }

    /// Refused connection or lost session: back off before the next attempt
    pub fn on_disconnected(&mut self) {
        self.should_backoff = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    /// Fail repeatedly and collect the base delay of every attempt
    fn failing_sequence(counter: &mut BackoffCounter, rng: &mut StdRng) -> Vec<ReconnectionDecision> {
        let mut decisions = Vec::new();
        loop {
            counter.on_disconnected();
            let decision = counter.next_attempt(rng);
            let give_up = matches!(decision, ReconnectionDecision::GiveUp { .. });
            decisions.push(decision);
            if give_up {
                return decisions;
            }
        }
    }

    fn base(decision: &ReconnectionDecision) -> Option<u64> {
        match decision {
            ReconnectionDecision::Delay { base_secs, .. } => Some(*base_secs),
            _ => None,
        }
    }

    #[test]
    fn test_first_attempt_is_immediate() {
        let mut counter = BackoffCounter::new();
        assert!(!counter.should_backoff());
        assert_eq!(counter.next_attempt(&mut rng()), ReconnectionDecision::Immediate);
        assert_eq!(counter.min_backoff_secs(), INITIAL_BACKOFF_SECS);
    }

    #[test]
    fn test_doubling_until_give_up() {
        let mut counter = BackoffCounter::new();
        let decisions = failing_sequence(&mut counter, &mut rng());

        let bases: Vec<u64> = decisions.iter().filter_map(base).collect();
        assert_eq!(bases, vec![1, 2, 4, 8, 16, 32]);
        assert_eq!(
            decisions.last(),
            Some(&ReconnectionDecision::GiveUp {
                min_backoff_secs: 64
            })
        );

        // Still exhausted when asked again
        assert!(matches!(
            counter.next_attempt(&mut rng()),
            ReconnectionDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut counter = BackoffCounter::new();
        let mut rng = rng();

        // fail, fail, succeed, fail
        counter.on_disconnected();
        assert_eq!(base(&counter.next_attempt(&mut rng)), Some(1));
        counter.on_disconnected();
        assert_eq!(base(&counter.next_attempt(&mut rng)), Some(2));
        counter.on_connected();
        assert!(!counter.should_backoff());
        assert_eq!(counter.min_backoff_secs(), 1);
        counter.on_disconnected();

        assert_eq!(base(&counter.next_attempt(&mut rng)), Some(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut counter = BackoffCounter::new();
        let mut rng = rng();
        for _ in 0..6 {
            counter.on_disconnected();
            if let ReconnectionDecision::Delay { delay, base_secs } = counter.next_attempt(&mut rng) {
                assert!(delay >= Duration::from_secs(base_secs));
                assert!(delay < Duration::from_secs(base_secs + 1));
            }
        }
    }

    proptest! {
        #[test]
        fn prop_nth_delay_is_power_of_two(seed in any::<u64>(), successes in 0usize..4) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut counter = BackoffCounter::new();

            // Any number of earlier recoveries must not affect the sequence
            for _ in 0..successes {
                counter.on_disconnected();
                let _ = counter.next_attempt(&mut rng);
                counter.on_connected();
            }

            let decisions = failing_sequence(&mut counter, &mut rng);
            prop_assert_eq!(decisions.len(), 7);
            for (n, decision) in decisions.iter().take(6).enumerate() {
                prop_assert_eq!(base(decision), Some(1u64 << n));
            }
            let give_up = matches!(
                decisions.last(),
                Some(ReconnectionDecision::GiveUp { .. })
            );
            prop_assert!(give_up);
        }
    }
}
