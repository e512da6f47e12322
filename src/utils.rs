use std::time::{SystemTime, UNIX_EPOCH};

/// Elapsed system time since the Unix epoch in milliseconds.
pub fn epoch_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
