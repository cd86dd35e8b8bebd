//! # Clocks
//!
//! [`WallClock`] provides NTP-epoch milliseconds from a `quanta` clock (mockable
//! in tests). [`ClockEstimator`] maps a stream's RTP timestamps onto that
//! time base using (RTP timestamp, NTP time) pairs from sender reports.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use quanta::{Clock, Instant, Mock};

use crate::error::ClockError;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET_SECS: i64 = 2_208_988_800;

// ─── NTP Conversions ────────────────────────────────────────────────────────

/// 64-bit NTP timestamp (seconds, fraction) to milliseconds.
pub fn ntp_to_ms(seconds: u32, fraction: u32) -> i64 {
    seconds as i64 * 1000 + ((fraction as u64 * 1000 + (1 << 31)) >> 32) as i64
}

/// Milliseconds to a 64-bit NTP timestamp (seconds, fraction).
pub fn ms_to_ntp(ms: i64) -> (u32, u32) {
    let ms = ms.max(0);
    let seconds = (ms / 1000) as u32;
    let fraction = (((ms % 1000) as u64) << 32) / 1000;
    (seconds, fraction as u32)
}

/// Middle 32 bits of the NTP timestamp (16.16 fixed point), as used in
/// receiver report LSR/DLSR fields.
pub fn ms_to_compact_ntp(ms: i64) -> u32 {
    let (seconds, fraction) = ms_to_ntp(ms);
    (seconds << 16) | (fraction >> 16)
}

/// Compact NTP interval to milliseconds.
pub fn compact_ntp_to_ms(compact: u32) -> i64 {
    let seconds = (compact >> 16) as i64;
    let fraction = (compact & 0xFFFF) as i64;
    seconds * 1000 + (fraction * 1000 + (1 << 15)) / (1 << 16)
}

// ─── Wall Clock ─────────────────────────────────────────────────────────────

/// Monotonic clock anchored to the NTP epoch at construction.
#[derive(Debug, Clone)]
pub struct WallClock {
    clock: Clock,
    origin: Instant,
    origin_ntp_ms: i64,
}

impl WallClock {
    /// Real time, anchored to the system clock.
    pub fn new() -> Self {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self::with_clock(Clock::new(), unix_ms + NTP_UNIX_OFFSET_SECS * 1000)
    }

    /// Mocked time starting at `start_ntp_ms`; advance it through the
    /// returned handle.
    pub fn mock(start_ntp_ms: i64) -> (Self, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        (Self::with_clock(clock, start_ntp_ms), mock)
    }

    fn with_clock(clock: Clock, origin_ntp_ms: i64) -> Self {
        let origin = clock.now();
        WallClock {
            clock,
            origin,
            origin_ntp_ms,
        }
    }

    /// Current time in NTP-epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        let elapsed = self.clock.now().duration_since(self.origin);
        self.origin_ntp_ms + elapsed.as_millis() as i64
    }

    pub fn now_compact_ntp(&self) -> u32 {
        ms_to_compact_ntp(self.now_ms())
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Clock Correlation ──────────────────────────────────────────────────────

/// One (RTP timestamp, NTP time) pair from a sender report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub rtp_timestamp: u32,
    pub ntp_ms: i64,
}

/// RTP → NTP extrapolation for one stream.
#[derive(Debug, Clone)]
pub struct ClockEstimator {
    clock_rate_hz: u32,
    latest: Option<ClockSample>,
}

impl ClockEstimator {
    pub fn new(clock_rate_hz: u32) -> Self {
        ClockEstimator {
            clock_rate_hz: clock_rate_hz.max(1),
            latest: None,
        }
    }

    pub fn clock_rate_hz(&self) -> u32 {
        self.clock_rate_hz
    }

    pub fn set_clock_rate(&mut self, clock_rate_hz: u32) {
        self.clock_rate_hz = clock_rate_hz.max(1);
    }

    /// Record a sample. Samples not newer than the current one are ignored;
    /// returns whether this one was taken.
    pub fn ingest(&mut self, rtp_timestamp: u32, ntp_ms: i64) -> bool {
        if let Some(latest) = self.latest {
            if ntp_ms <= latest.ntp_ms {
                return false;
            }
        }
        self.latest = Some(ClockSample {
            rtp_timestamp,
            ntp_ms,
        });
        true
    }

    pub fn latest(&self) -> Option<ClockSample> {
        self.latest
    }

    /// NTP milliseconds for `rtp_timestamp`, extrapolated from the latest
    /// sample at the nominal clock rate. The timestamp delta is taken
    /// wrap-aware, so it may lie on either side of the sample.
    pub fn estimate(&self, rtp_timestamp: u32) -> Result<i64, ClockError> {
        let sample = self.latest.ok_or(ClockError::Unavailable)?;
        let delta = rtp_timestamp.wrapping_sub(sample.rtp_timestamp) as i32 as i64;
        let rate = self.clock_rate_hz as i64;
        // Round to nearest, symmetric around zero.
        let offset_ms = (delta * 1000 + delta.signum() * rate / 2) / rate;
        Ok(sample.ntp_ms + offset_ms)
    }
}
