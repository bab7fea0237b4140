use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Protocol timestamps are whole seconds.
pub fn ms_to_secs(ms: u64) -> u64 {
    ms / 1000
}
