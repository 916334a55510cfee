use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

use crate::throttler::ThrottleGate;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreStatus,
    pub rules: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreStatus {
    pub entries: usize,
    pub capacity: usize,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    gate: Arc<ThrottleGate>,
}

impl HealthChecker {
    pub fn new(gate: Arc<ThrottleGate>) -> Self {
        // Pin the start time when the checker is built rather than on first request.
        std::sync::LazyLock::force(&START_TIME);
        Self { gate }
    }

    pub fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();
        let store = self.gate.limiter().store();

        HealthStatus {
            status: "healthy".to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            store: StoreStatus {
                entries: store.len(),
                capacity: store.capacity(),
            },
            rules: self.gate.rules().len(),
        }
    }
}
