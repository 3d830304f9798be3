//! Runtime configuration for the relay server

use shared::DEFAULT_PORT;
use std::time::Duration;

/// Settings the router and its group workers run with.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the listening socket to
    pub host: String,
    /// Listening port, 0 lets the OS choose
    pub port: u16,
    /// Upper bound on concurrently running group workers, `None` for no limit
    pub max_groups: Option<usize>,
    /// Bound on a single outgoing write before the recipient is evicted
    pub send_timeout: Duration,
    /// Bound on how long a fresh connection may take to send its join request
    pub join_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_groups: None,
            send_timeout: Duration::from_millis(2000),
            join_timeout: Duration::from_millis(5000),
        }
    }
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true when a worker for a new group may not be created
    pub fn at_group_capacity(&self, running: usize) -> bool {
        matches!(self.max_groups, Some(max) if running >= max)
    }
}
