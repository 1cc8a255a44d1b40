use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// Tunables of the query engine. Missing fields take their default, so a
/// partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Per trace timeout when the request does not set one
    pub default_timeout_ms: u64,
    /// How often running traces are checked against their timeout
    pub check_interval_ms: u64,
    /// Time between cancelling a query and tearing it down
    pub cancel_grace_ms: u64,
    /// Bound of each query's command queue
    pub command_capacity: usize,
    pub max_relays_per_author: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            check_interval_ms: 500,
            cancel_grace_ms: 5_000,
            command_capacity: 256,
            max_relays_per_author: 2,
        }
    }
}

impl QueryConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        // tokio intervals panic on a zero period
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
