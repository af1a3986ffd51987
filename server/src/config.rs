use shared::{HEARTBEAT_INTERVAL_MS, TURN_WINDOW_MS, WATCHDOG_INTERVAL_MS};
use std::time::Duration;

/// Runtime settings for the coordinator.
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP address the coordinator listens on
    pub bind_addr: String,
    /// Time a team has to act before the watchdog bans for it
    pub turn_window: Duration,
    /// Watchdog scan and change-poll period
    pub watchdog_interval: Duration,
    /// Keepalive period for subscribed clients
    pub heartbeat_interval: Duration,
    pub rcon_timeout: Duration,
    /// Used when a lobby does not set its own connect password
    pub default_connect_password: String,
    pub max_clients: usize,
    pub subscriber_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            turn_window: Duration::from_millis(TURN_WINDOW_MS),
            watchdog_interval: Duration::from_millis(WATCHDOG_INTERVAL_MS),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            rcon_timeout: Duration::from_secs(5),
            default_connect_password: "scrim".to_string(),
            max_clients: 256,
            subscriber_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_observed_timings() {
        let config = Config::default();
        assert_eq!(config.turn_window, Duration::from_secs(40));
        assert_eq!(config.watchdog_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
    }
}
