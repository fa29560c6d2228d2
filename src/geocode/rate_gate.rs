// src/geocode/rate_gate.rs
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::utils::constants::GEOCODE_MIN_INTERVAL_MS;

/// Process-wide gate for the public geocoder. Every client shares it.
pub static GEOCODER_GATE: Lazy<Arc<RateGate>> =
    Lazy::new(|| Arc::new(RateGate::new(Duration::from_millis(GEOCODE_MIN_INTERVAL_MS))));

/// Serializes callers so consecutive passes are at least `min_interval` apart.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Waits for the next slot. The lock is held while sleeping so concurrent
    /// callers queue behind each other.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
