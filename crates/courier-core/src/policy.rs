use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Policy {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_ratio: f64,
    pub max_attempts: u32,
    pub pump_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub confirm_timeout_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            jitter_ratio: 0.25,
            max_attempts: 6,
            pump_interval_ms: 5_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            confirm_timeout_ms: 3_000,
        }
    }
}
