//! Spaces fetch starts to a maximum rate.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub(crate) struct RateGate {
    interval: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    /// `per_second == 0` disables limiting.
    pub(crate) fn new(per_second: u32) -> Self {
        Self {
            interval: (per_second > 0).then(|| Duration::from_secs(1) / per_second),
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for the next free slot.
    pub(crate) async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot.map_or(now, |next| next.max(now));
            *next_slot = Some(slot + interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
