//! Resumption tuning knobs and their environment overrides.

use std::collections::HashMap;
use std::time::Duration;

/// How long a resuming step waits for its work item to start before assuming the node is gone.
pub const DEFAULT_NODE_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Queue priority used when a resuming step has to submit a fresh work item.
pub const DEFAULT_QUEUE_PRIORITY: u32 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeConfig {
    pub node_wait_timeout: Duration,
    pub queue_priority: u32,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            node_wait_timeout: DEFAULT_NODE_WAIT_TIMEOUT,
            queue_priority: DEFAULT_QUEUE_PRIORITY,
        }
    }
}

impl ResumeConfig {
    pub fn with_node_wait_timeout(mut self, timeout: Duration) -> Self {
        self.node_wait_timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ["TETHER_NODE_WAIT_TIMEOUT_MS", "TETHER_QUEUE_PRIORITY"] {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, String> {
        let node_wait_timeout = match envs
            .get("TETHER_NODE_WAIT_TIMEOUT_MS")
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
        {
            Some(raw) => {
                let millis = raw.parse::<u64>().map_err(|_| {
                    format!(
                        "invalid TETHER_NODE_WAIT_TIMEOUT_MS='{}'. expected a number of milliseconds",
                        raw
                    )
                })?;
                if millis == 0 {
                    return Err("TETHER_NODE_WAIT_TIMEOUT_MS must be greater than zero".to_string());
                }
                Duration::from_millis(millis)
            }
            None => DEFAULT_NODE_WAIT_TIMEOUT,
        };
        let queue_priority = match envs
            .get("TETHER_QUEUE_PRIORITY")
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
        {
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                format!(
                    "invalid TETHER_QUEUE_PRIORITY='{}'. expected a non-negative integer",
                    raw
                )
            })?,
            None => DEFAULT_QUEUE_PRIORITY,
        };
        Ok(Self {
            node_wait_timeout,
            queue_priority,
        })
    }
}
