#![forbid(unsafe_code)]

// Load test configuration - defaults, environment overrides

use crate::pacing::{DelayBounds, PacingPolicy};
use tracing::warn;

/// Read-only inputs consumed at run start.
#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    pub host: String,
    pub port: u16,
    pub pacing: PacingPolicy,
    /// Target population size.
    pub clients: usize,
    pub duration_secs: u64,

    /// Time spent configuring the lobby before seating players.
    pub lobby: DelayBounds,
    /// Time spent idling between games.
    pub idle: DelayBounds,
    /// Time between game launch and the scripted match starting.
    pub game: DelayBounds,
    /// Time spent looking at the score screen.
    pub score_screen: DelayBounds,
    /// Time between lobby open and the option broadcast.
    pub game_startup: DelayBounds,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8001,
            pacing: PacingPolicy::Human,
            clients: 1000,
            duration_secs: 360,
            lobby: DelayBounds::new(5_000, 15 * 60_000),
            idle: DelayBounds::new(5_000, 60 * 60_000),
            game: DelayBounds::new(2 * 60_000, 60 * 60_000),
            score_screen: DelayBounds::new(3_000, 30 * 60_000),
            game_startup: DelayBounds::new(1_000, 15_000),
        }
    }
}

impl LoadTestConfig {
    /// Defaults overridden by `LOADTEST_*` environment variables. A value
    /// that fails to parse is logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("LOADTEST_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_env("LOADTEST_PORT") {
            config.port = port;
        }
        if let Some(clients) = parse_env("LOADTEST_CLIENTS") {
            config.clients = clients;
        }
        if let Some(duration) = parse_env("LOADTEST_DURATION_SECS") {
            config.duration_secs = duration;
        }
        if let Some(pacing) = parse_env("LOADTEST_PACING") {
            config.pacing = pacing;
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_phase_bounds() {
        let config = LoadTestConfig::default();
        assert_eq!(config.clients, 1000);
        assert_eq!(config.duration_secs, 360);
        assert_eq!(config.pacing, PacingPolicy::Human);
        assert_eq!(config.lobby, DelayBounds::new(5_000, 900_000));
        assert_eq!(config.idle, DelayBounds::new(5_000, 3_600_000));
        assert_eq!(config.game, DelayBounds::new(120_000, 3_600_000));
        assert_eq!(config.score_screen, DelayBounds::new(3_000, 1_800_000));
        assert_eq!(config.game_startup, DelayBounds::new(1_000, 15_000));
    }
}
