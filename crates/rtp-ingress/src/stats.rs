//! # Receive Statistics
//!
//! Per-SSRC receive counters updated from classifier verdicts, plus the
//! small helpers they are built from (windowed rate counter, EWMA,
//! opportunistic periodic-log gate). All snapshots are serializable for the
//! reporting side.

use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::ordering::{Classification, Verdict};

/// Window for the per-stream bitrate.
pub const BITRATE_WINDOW_MS: i64 = 1_000;

/// How far below `highest` missing sequence numbers are remembered.
const MISSING_HISTORY: i64 = 1_000;

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Read-only copy of one stream's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStatistics {
    pub ssrc: u32,
    /// Accepted packets of every verdict, recovered ones included.
    pub packets: u64,
    /// Bytes of accepted packets (header + payload).
    pub bytes: u64,
    pub retransmitted: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub recovered: u64,
    /// FEC blocks forwarded to the FEC receiver.
    pub fec_packets: u64,
    /// Sequence gaps not yet filled by a late, retransmitted or recovered packet.
    pub cumulative_lost: i64,
    /// Interarrival jitter in RTP timestamp units.
    pub jitter: u32,
    pub highest_ext_seq: i64,
    pub bitrate_bps: u64,
    pub last_packet_ms: i64,
}

impl StreamStatistics {
    /// Fraction of expected packets lost so far.
    pub fn loss_ratio(&self) -> f64 {
        let expected = self.packets as i64 - self.duplicates as i64 + self.cumulative_lost;
        if expected <= 0 {
            0.0
        } else {
            self.cumulative_lost.max(0) as f64 / expected as f64
        }
    }
}

/// One accepted packet as seen by the collector.
#[derive(Debug, Clone, Copy)]
pub struct PacketSample {
    pub classification: Classification,
    pub bytes: usize,
    pub rtp_timestamp: u32,
    pub arrival_ms: i64,
    pub clock_rate_hz: u32,
}

// ─── Per-Stream ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct StreamStatistician {
    stats: StreamStatistics,
    /// Extended seqs skipped by an in-order advance and not yet filled.
    missing: BTreeSet<i64>,
    bitrate: RateCounter,
    jitter_q4: i64,
    last_transit: Option<i128>,
    last_rtp_timestamp: Option<u32>,
}

impl StreamStatistician {
    fn new(ssrc: u32) -> Self {
        StreamStatistician {
            stats: StreamStatistics {
                ssrc,
                ..Default::default()
            },
            missing: BTreeSet::new(),
            bitrate: RateCounter::new(BITRATE_WINDOW_MS),
            jitter_q4: 0,
            last_transit: None,
            last_rtp_timestamp: None,
        }
    }

    fn count(&mut self, sample: &PacketSample) {
        self.stats.packets += 1;
        self.stats.bytes += sample.bytes as u64;
        self.stats.last_packet_ms = sample.arrival_ms;
        self.bitrate.record(sample.arrival_ms, sample.bytes as u64);
    }

    fn advance(&mut self, sample: &PacketSample) {
        let c = &sample.classification;
        let gap = c.gap();
        if gap > 0 {
            self.stats.cumulative_lost += gap as i64;
            let first_missing = (c.extended_seq - gap as i64).max(c.extended_seq - MISSING_HISTORY);
            self.missing.extend(first_missing..c.extended_seq);
        }
        self.stats.highest_ext_seq = c.extended_seq;
        let floor = c.extended_seq - MISSING_HISTORY;
        while let Some(&oldest) = self.missing.first() {
            if oldest >= floor {
                break;
            }
            self.missing.pop_first();
        }
        self.update_jitter(sample);
    }

    /// RFC 3550 A.8, kept in Q4 fixed point.
    fn update_jitter(&mut self, sample: &PacketSample) {
        if self.last_rtp_timestamp == Some(sample.rtp_timestamp) {
            return;
        }
        let rate = sample.clock_rate_hz.max(1) as i128;
        // NTP-epoch milliseconds times the clock rate exceeds i64.
        let arrival_rtp = sample.arrival_ms as i128 * rate / 1000;
        let transit = arrival_rtp - sample.rtp_timestamp as i128;
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs();
            // Timestamp wraps and stream resets show up as huge jumps.
            if d < 5 * rate {
                let d = d as i64;
                self.jitter_q4 += ((d << 4) - self.jitter_q4 + 8) >> 4;
            }
        }
        self.last_transit = Some(transit);
        self.last_rtp_timestamp = Some(sample.rtp_timestamp);
        self.stats.jitter = (self.jitter_q4 >> 4) as u32;
    }

    fn fill_gap(&mut self, extended_seq: i64) {
        if self.missing.remove(&extended_seq) {
            self.stats.cumulative_lost -= 1;
        }
    }

    fn snapshot(&self, now_ms: i64) -> StreamStatistics {
        let mut stats = self.stats.clone();
        stats.bitrate_bps = self.bitrate.rate_per_sec(now_ms) as u64 * 8;
        stats
    }
}

// ─── Collector ──────────────────────────────────────────────────────────────

/// Thread-safe receive statistics for every SSRC seen by one receiver.
#[derive(Debug, Default)]
pub struct ReceiveStatistics {
    streams: Mutex<HashMap<u32, StreamStatistician>>,
}

impl ReceiveStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one accepted packet under its verdict.
    pub fn record_accepted(&self, ssrc: u32, sample: &PacketSample) {
        let mut streams = self.streams.lock();
        let stream = streams
            .entry(ssrc)
            .or_insert_with(|| StreamStatistician::new(ssrc));
        stream.count(sample);
        let ext = sample.classification.extended_seq;
        match sample.classification.verdict {
            Verdict::InOrder => stream.advance(sample),
            Verdict::Retransmitted => {
                stream.stats.retransmitted += 1;
                stream.fill_gap(ext);
            }
            Verdict::Stale => {
                stream.stats.stale += 1;
                stream.fill_gap(ext);
            }
            Verdict::Duplicate => stream.stats.duplicates += 1,
            Verdict::Recovered => {
                stream.stats.recovered += 1;
                stream.fill_gap(ext);
            }
        }
    }

    /// Count a packet rebuilt by the FEC receiver. It fills a gap that was
    /// already counted instead of opening a new one.
    pub fn record_recovered(&self, ssrc: u32, sample: &PacketSample) {
        let sample = PacketSample {
            classification: Classification {
                verdict: Verdict::Recovered,
                ..sample.classification
            },
            ..*sample
        };
        self.record_accepted(ssrc, &sample);
    }

    /// Count one FEC block forwarded for `ssrc`.
    pub fn record_fec(&self, ssrc: u32) {
        let mut streams = self.streams.lock();
        streams
            .entry(ssrc)
            .or_insert_with(|| StreamStatistician::new(ssrc))
            .stats
            .fec_packets += 1;
    }

    pub fn snapshot(&self, ssrc: u32, now_ms: i64) -> Option<StreamStatistics> {
        self.streams.lock().get(&ssrc).map(|s| s.snapshot(now_ms))
    }

    /// Snapshots for every stream, ordered by SSRC.
    pub fn snapshot_all(&self, now_ms: i64) -> Vec<StreamStatistics> {
        let mut all: Vec<_> = self
            .streams
            .lock()
            .values()
            .map(|s| s.snapshot(now_ms))
            .collect();
        all.sort_by_key(|s| s.ssrc);
        all
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }
}

// ─── Periodic Log Gate ──────────────────────────────────────────────────────

/// "At most once per interval" gate, checked on the calling thread.
#[derive(Debug, Clone)]
pub struct PeriodicLog {
    interval_ms: i64,
    last_ms: Option<i64>,
}

impl PeriodicLog {
    pub fn new(interval_ms: i64) -> Self {
        PeriodicLog {
            interval_ms,
            last_ms: None,
        }
    }

    /// True (and re-armed) when the interval has elapsed since the last
    /// emission. The first call is always due.
    pub fn due(&mut self, now_ms: i64) -> bool {
        match self.last_ms {
            Some(last) if now_ms.saturating_sub(last) < self.interval_ms => false,
            _ => {
                self.last_ms = Some(now_ms);
                true
            }
        }
    }

    pub fn set_interval(&mut self, interval_ms: i64) {
        self.interval_ms = interval_ms;
    }
}

// ─── Rate Counter ───────────────────────────────────────────────────────────

/// Windowed rate counter driven by caller-supplied millisecond timestamps.
#[derive(Debug, Clone)]
pub struct RateCounter {
    /// Recent samples: (timestamp ms, value).
    samples: VecDeque<(i64, u64)>,
    window_ms: i64,
}

impl RateCounter {
    pub fn new(window_ms: i64) -> Self {
        RateCounter {
            samples: VecDeque::with_capacity(128),
            window_ms: window_ms.max(1),
        }
    }

    /// Record a sample.
    pub fn record(&mut self, now_ms: i64, value: u64) {
        self.samples.push_back((now_ms, value));
        self.cleanup(now_ms);
    }

    /// Sum of values in the window per second.
    pub fn rate_per_sec(&self, now_ms: i64) -> f64 {
        self.count_in_window(now_ms) as f64 * 1000.0 / self.window_ms as f64
    }

    /// Total of values within the window.
    pub fn count_in_window(&self, now_ms: i64) -> u64 {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        self.samples
            .iter()
            .filter(|(t, _)| *t > cutoff)
            .map(|(_, v)| v)
            .sum()
    }

    fn cleanup(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while matches!(self.samples.front(), Some((t, _)) if *t <= cutoff) {
            self.samples.pop_front();
        }
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
