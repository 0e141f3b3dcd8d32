#![forbid(unsafe_code)]

// Pacing - synthetic think-time between scripted client actions

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Inclusive-exclusive delay bounds in milliseconds for one protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayBounds {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayBounds {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

/// How a simulated client paces itself between actions. Stateless; one
/// policy is shared by every session in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacingPolicy {
    /// Uniformly random delay in `[min, max)`.
    #[default]
    Human,
    /// Always the minimum delay.
    Fixed,
    /// No delay at all; hammers the server as fast as it responds.
    BruteForce,
}

impl PacingPolicy {
    pub fn think_time(&self, bounds: DelayBounds) -> Duration {
        let ms = match self {
            Self::Human if bounds.max_ms > bounds.min_ms => {
                rand::thread_rng().gen_range(bounds.min_ms..bounds.max_ms)
            }
            Self::Human | Self::Fixed => bounds.min_ms,
            Self::BruteForce => 0,
        };
        Duration::from_millis(ms)
    }
}

impl fmt::Display for PacingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Fixed => write!(f, "fixed"),
            Self::BruteForce => write!(f, "brute-force"),
        }
    }
}

impl FromStr for PacingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "fixed" => Ok(Self::Fixed),
            "brute-force" | "brute_force" | "bruteforce" => Ok(Self::BruteForce),
            other => Err(format!("unknown pacing policy '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_stays_within_bounds() {
        let bounds = DelayBounds::new(100, 500);
        for _ in 0..1000 {
            let d = PacingPolicy::Human.think_time(bounds).as_millis() as u64;
            assert!((100..500).contains(&d), "{d} out of [100, 500)");
        }
    }

    #[test]
    fn human_handles_degenerate_bounds() {
        assert_eq!(
            PacingPolicy::Human.think_time(DelayBounds::new(250, 250)),
            Duration::from_millis(250)
        );
        assert_eq!(
            PacingPolicy::Human.think_time(DelayBounds::new(0, 0)),
            Duration::ZERO
        );
    }

    #[test]
    fn fixed_returns_minimum() {
        assert_eq!(
            PacingPolicy::Fixed.think_time(DelayBounds::new(300, 9000)),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn brute_force_returns_zero() {
        assert_eq!(
            PacingPolicy::BruteForce.think_time(DelayBounds::new(300, 9000)),
            Duration::ZERO
        );
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("human".parse::<PacingPolicy>().unwrap(), PacingPolicy::Human);
        assert_eq!("FIXED".parse::<PacingPolicy>().unwrap(), PacingPolicy::Fixed);
        assert_eq!(
            "brute-force".parse::<PacingPolicy>().unwrap(),
            PacingPolicy::BruteForce
        );
        assert!("turbo".parse::<PacingPolicy>().is_err());
    }
}
