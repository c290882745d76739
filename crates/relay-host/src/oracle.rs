//! Source of confirmation facts for pending attempts.
//!
//! [`SimulatedOracle`] does not query any network: it models confirmation
//! latency with a minimum age plus a random draw. A deployment that needs real
//! confirmations plugs in its own [`ChainOracle`].

use std::time::Duration;

use async_trait::async_trait;
use relay_store::Attempt;

use crate::clock::millis;
use crate::config::ConfirmationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Confirmed(u32),
    Failed,
}

#[async_trait]
pub trait ChainOracle: Send + Sync {
    async fn check(&self, attempt: &Attempt, age_ms: u64) -> Verdict;
}

#[derive(Debug, Clone)]
pub struct SimulatedOracle {
    min_age_ms: u64,
    probability: f64,
    plateau: u32,
}

impl SimulatedOracle {
    pub fn new(min_age: Duration, probability: f64, plateau: u32) -> Self {
        Self {
            min_age_ms: millis(min_age),
            probability: probability.clamp(0.0, 1.0),
            plateau,
        }
    }

    pub fn from_config(config: &ConfirmationConfig) -> Self {
        Self::new(config.min_age, config.probability, config.plateau)
    }
}

fn unit_draw() -> f64 {
    let mut buf = [0u8; 4];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u32::from_le_bytes(buf) as f64 / (u32::MAX as f64 + 1.0),
        // No entropy available: leave the attempt pending this round.
        Err(_) => 1.0,
    }
}

#[async_trait]
impl ChainOracle for SimulatedOracle {
    async fn check(&self, attempt: &Attempt, age_ms: u64) -> Verdict {
        if !attempt.is_pending() || age_ms < self.min_age_ms {
            return Verdict::Pending;
        }
        if unit_draw() < self.probability {
            Verdict::Confirmed(self.plateau)
        } else {
            Verdict::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::RequestKind;

    fn attempt() -> Attempt {
        Attempt::pending(RequestKind::new("renewal"), "1".into(), "ref".into(), 0)
    }

    #[tokio::test]
    async fn young_attempts_stay_pending() {
        let oracle = SimulatedOracle::new(Duration::from_secs(60), 1.0, 10);
        assert_eq!(oracle.check(&attempt(), 0).await, Verdict::Pending);
        assert_eq!(oracle.check(&attempt(), 59_999).await, Verdict::Pending);
    }

    #[tokio::test]
    async fn certain_probability_confirms_after_min_age() {
        let oracle = SimulatedOracle::new(Duration::from_secs(60), 1.0, 10);
        assert_eq!(oracle.check(&attempt(), 60_000).await, Verdict::Confirmed(10));
    }

    #[tokio::test]
    async fn zero_probability_never_confirms() {
        let oracle = SimulatedOracle::new(Duration::ZERO, 0.0, 10);
        for _ in 0..32 {
            assert_eq!(oracle.check(&attempt(), 1_000_000).await, Verdict::Pending);
        }
    }
}
