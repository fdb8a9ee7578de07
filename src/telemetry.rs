use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters for the signaling connection.
#[derive(Default)]
pub struct SignalingStats {
    frames_sent: AtomicU64,
    frames_recv: AtomicU64,
    frames_dropped: AtomicU64,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SignalingStats {
    pub fn on_send(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_recv(&self) {
        self.frames_recv.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> SignalingStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .unwrap_or_default();
        SignalingStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_recv: self.frames_recv.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignalingStatsSnapshot {
    pub frames_sent: u64,
    pub frames_recv: u64,
    pub frames_dropped: u64,
    pub reconnects: u64,
    pub last_error: String,
}
