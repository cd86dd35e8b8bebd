//! # Observers
//!
//! Single-slot, replaceable callback holders. A slot holds at most one
//! observer, and dispatch runs under the same lock as replacement: concurrent
//! dispatches serialize, and once `set` returns no callback reaches the
//! previous observer.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

// ─── Slot ───────────────────────────────────────────────────────────────────

/// Mutex-guarded optional observer.
pub struct ObserverSlot<T: ?Sized> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> ObserverSlot<T> {
    pub fn new() -> Self {
        ObserverSlot {
            inner: Mutex::new(None),
        }
    }

    /// Replace the held observer. `None` clears the slot. Blocks until an
    /// in-flight dispatch finishes.
    pub fn set(&self, observer: Option<Arc<T>>) {
        *self.inner.lock() = observer;
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Run `f` on the observer under the slot's lock. No-op when empty.
    ///
    /// The observer must not touch its own slot from inside the callback;
    /// the lock is not reentrant.
    pub fn with(&self, f: impl FnOnce(&T)) {
        if let Some(observer) = self.inner.lock().as_deref() {
            f(observer);
        }
    }
}

impl<T: ?Sized> Default for ObserverSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Packet Type Counter ────────────────────────────────────────────────────

/// Feedback packets received for one media SSRC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RtcpPacketTypeCounter {
    pub nack_packets: u32,
    pub fir_packets: u32,
    pub pli_packets: u32,
    /// Sequence numbers requested across all NACKs.
    pub nack_requests: u32,
    /// Sequence numbers requested for the first time.
    pub unique_nack_requests: u32,
}

impl RtcpPacketTypeCounter {
    /// Percentage of NACK requests that were repeats, 0 when none.
    pub fn repeated_nack_percent(&self) -> u32 {
        if self.nack_requests == 0 {
            return 0;
        }
        let repeated = self.nack_requests - self.unique_nack_requests.min(self.nack_requests);
        (repeated as u64 * 100 / self.nack_requests as u64) as u32
    }
}

// ─── Observer Traits ────────────────────────────────────────────────────────

pub trait RtcpPacketTypeCounterObserver: Send + Sync {
    fn rtcp_packet_types_counter_updated(&self, ssrc: u32, counter: &RtcpPacketTypeCounter);
}

/// Round-trip time samples derived from receiver reports.
pub trait RttObserver: Send + Sync {
    fn on_rtt_update(&self, avg_rtt_ms: i64, max_rtt_ms: i64);
}

/// Changes of the remote media source.
pub trait StreamObserver: Send + Sync {
    fn on_incoming_ssrc_changed(&self, ssrc: u32);
    fn on_incoming_csrcs_changed(&self, csrcs: &[u32]);
}
