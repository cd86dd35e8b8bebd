//! # Ordering & Retransmission Classifier
//!
//! Per-stream highest-sequence tracking on the extended (wrap-aware)
//! sequence space, with a reordering tolerance window.
//!
//! ## Verdicts
//!
//! - **InOrder**: extended seq above `highest`; `highest` advances.
//! - **Duplicate**: within `[highest − threshold, highest]` and already seen.
//! - **Retransmitted**: unseen within `[highest − threshold, highest)`, or
//!   any non-advancing packet that arrived in an RTX wrapper.
//! - **Stale**: older than the window and not wrapped.
//! - **Recovered**: non-advancing packet rebuilt by the FEC receiver.
//!
//! A threshold of 0 disables the window: every non-advancing, non-wrapped
//! packet is `Stale`.

use std::collections::BTreeSet;

use serde::Serialize;

/// Largest usable reordering window; beyond half the 16-bit space the
/// nearest-interpretation unwrap becomes ambiguous.
pub const MAX_REORDERING_THRESHOLD: u16 = i16::MAX as u16;

/// Outcome of classifying one packet against its stream's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    InOrder,
    Retransmitted,
    Duplicate,
    Stale,
    Recovered,
}

impl Verdict {
    pub fn is_in_order(self) -> bool {
        self == Verdict::InOrder
    }
}

/// Verdict plus the extended sequence number it was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub extended_seq: i64,
    /// `highest` before this packet; `None` for a stream's first packet.
    pub previous_highest: Option<i64>,
}

impl Classification {
    /// Sequence numbers skipped by an in-order advance.
    pub fn gap(&self) -> u64 {
        match (self.verdict, self.previous_highest) {
            (Verdict::InOrder, Some(prev)) => (self.extended_seq - prev - 1).max(0) as u64,
            _ => 0,
        }
    }
}

/// Extend `seq` to the value nearest `reference` in the extended space.
pub fn extend_sequence(seq: u16, reference: i64) -> i64 {
    let delta = seq.wrapping_sub(reference as u16) as i16;
    reference + delta as i64
}

// ─── Sequence Tracker ───────────────────────────────────────────────────────

/// Highest-sequence state for one SSRC.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    highest: Option<i64>,
    /// Extended seqs seen at or below `highest`, pruned to the last window.
    seen: BTreeSet<i64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest extended sequence number accepted so far.
    pub fn highest(&self) -> Option<i64> {
        self.highest
    }

    /// Extend a raw sequence number against the current state.
    pub fn extend(&self, seq: u16) -> i64 {
        match self.highest {
            Some(h) => extend_sequence(seq, h),
            None => seq as i64,
        }
    }

    /// Classify a media packet. `is_wrapper` marks packets restored from RTX.
    pub fn classify(&mut self, seq: u16, is_wrapper: bool, threshold: u16) -> Classification {
        let threshold = threshold.min(MAX_REORDERING_THRESHOLD) as i64;
        let ext = self.extend(seq);
        let previous_highest = self.highest;

        let verdict = match previous_highest {
            Some(h) if ext <= h => {
                let age = h - ext;
                let in_window = threshold > 0 && age <= threshold;
                if in_window && self.seen.contains(&ext) {
                    Verdict::Duplicate
                } else if is_wrapper || (1..=threshold).contains(&age) {
                    Verdict::Retransmitted
                } else {
                    Verdict::Stale
                }
            }
            _ => Verdict::InOrder,
        };

        self.record(ext, verdict, threshold);
        Classification {
            verdict,
            extended_seq: ext,
            previous_highest,
        }
    }

    /// Classify a packet rebuilt by the FEC receiver. Anything not advancing
    /// `highest` and not already seen is `Recovered`.
    pub fn classify_recovered(&mut self, seq: u16, threshold: u16) -> Classification {
        let threshold = threshold.min(MAX_REORDERING_THRESHOLD) as i64;
        let ext = self.extend(seq);
        let previous_highest = self.highest;

        let verdict = match previous_highest {
            Some(h) if ext <= h => {
                if self.seen.contains(&ext) {
                    Verdict::Duplicate
                } else {
                    Verdict::Recovered
                }
            }
            _ => Verdict::InOrder,
        };

        // Recovered packets are remembered even with the window disabled so
        // a second recovery of the same seq is caught.
        self.record(ext, verdict, threshold.max(1));
        Classification {
            verdict,
            extended_seq: ext,
            previous_highest,
        }
    }

    fn record(&mut self, ext: i64, verdict: Verdict, window: i64) {
        if verdict == Verdict::InOrder {
            self.highest = Some(ext);
        }
        let Some(h) = self.highest else { return };
        if verdict != Verdict::Stale {
            self.seen.insert(ext);
        }
        let floor = h - window.max(1);
        while let Some(&oldest) = self.seen.first() {
            if oldest >= floor {
                break;
            }
            self.seen.pop_first();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Unwrap ─────────────────────────────────────────────────────────

    #[test]
    fn extend_across_forward_wrap() {
        assert_eq!(extend_sequence(2, 65_534), 65_538);
        assert_eq!(extend_sequence(65_535, 65_536), 65_535);
    }

    #[test]
    fn extend_across_backward_wrap() {
        // From highest = 3 (after one wrap), 65_533 is just behind.
        assert_eq!(extend_sequence(65_533, 65_536 + 3), 65_533);
        assert_eq!(extend_sequence(65_533, 3), -3);
    }

    // ─── Classification ─────────────────────────────────────────────────

    #[test]
    fn first_packet_is_in_order() {
        let mut t = SequenceTracker::new();
        let c = t.classify(500, false, 50);
        assert_eq!(c.verdict, Verdict::InOrder);
        assert_eq!(c.previous_highest, None);
        assert_eq!(t.highest(), Some(500));
    }

    #[test]
    fn first_packet_wrapped_is_in_order() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.classify(9, true, 50).verdict, Verdict::InOrder);
    }

    #[test]
    fn increasing_sequence_advances() {
        let mut t = SequenceTracker::new();
        for seq in [65_530u16, 65_533, 65_535, 0, 4] {
            assert_eq!(t.classify(seq, false, 50).verdict, Verdict::InOrder);
        }
        assert_eq!(t.highest(), Some(65_536 + 4));
    }

    #[test]
    fn gap_counts_skipped_sequences() {
        let mut t = SequenceTracker::new();
        t.classify(10, false, 50);
        let c = t.classify(14, false, 50);
        assert_eq!(c.gap(), 3);
    }

    #[test]
    fn old_unseen_within_window_is_retransmitted() {
        let mut t = SequenceTracker::new();
        t.classify(100, false, 50);
        let c = t.classify(60, false, 50);
        assert_eq!(c.verdict, Verdict::Retransmitted);
        assert_eq!(t.highest(), Some(100));
    }

    #[test]
    fn older_than_window_is_stale() {
        let mut t = SequenceTracker::new();
        t.classify(100, false, 50);
        assert_eq!(t.classify(49, false, 50).verdict, Verdict::Stale);
        assert_eq!(t.classify(50, false, 50).verdict, Verdict::Retransmitted);
    }

    #[test]
    fn seen_within_window_is_duplicate() {
        let mut t = SequenceTracker::new();
        t.classify(100, false, 50);
        t.classify(101, false, 50);
        assert_eq!(t.classify(101, false, 50).verdict, Verdict::Duplicate);
        assert_eq!(t.classify(100, false, 50).verdict, Verdict::Duplicate);
        // A retransmission that arrived once is a duplicate the second time.
        assert_eq!(t.classify(90, false, 50).verdict, Verdict::Retransmitted);
        assert_eq!(t.classify(90, true, 50).verdict, Verdict::Duplicate);
    }

    #[test]
    fn wrapper_packets_always_retransmitted_when_old() {
        let mut t = SequenceTracker::new();
        t.classify(1000, false, 10);
        assert_eq!(t.classify(500, true, 10).verdict, Verdict::Retransmitted);
        assert_eq!(t.classify(990, true, 0).verdict, Verdict::Retransmitted);
    }

    #[test]
    fn zero_threshold_makes_everything_stale() {
        let mut t = SequenceTracker::new();
        t.classify(100, false, 0);
        assert_eq!(t.classify(99, false, 0).verdict, Verdict::Stale);
        assert_eq!(t.classify(100, false, 0).verdict, Verdict::Stale);
    }

    #[test]
    fn retransmission_across_wrap() {
        let mut t = SequenceTracker::new();
        t.classify(65_535, false, 50);
        t.classify(1, false, 50);
        let c = t.classify(0, false, 50);
        assert_eq!(c.verdict, Verdict::Retransmitted);
        assert_eq!(c.extended_seq, 65_536);
    }

    #[test]
    fn highest_never_moves_backward() {
        let mut t = SequenceTracker::new();
        t.classify(200, false, 50);
        for seq in [150u16, 199, 10, 200] {
            t.classify(seq, true, 50);
            assert_eq!(t.highest(), Some(200));
        }
    }

    // ─── Recovered ──────────────────────────────────────────────────────

    #[test]
    fn recovered_below_highest() {
        let mut t = SequenceTracker::new();
        t.classify(10, false, 0);
        t.classify(12, false, 0);
        assert_eq!(t.classify_recovered(11, 0).verdict, Verdict::Recovered);
        assert_eq!(t.classify_recovered(11, 0).verdict, Verdict::Duplicate);
    }

    #[test]
    fn recovered_above_highest_advances() {
        let mut t = SequenceTracker::new();
        t.classify(10, false, 50);
        assert_eq!(t.classify_recovered(11, 50).verdict, Verdict::InOrder);
        assert_eq!(t.highest(), Some(11));
    }

    #[test]
    fn seen_history_is_bounded() {
        let mut t = SequenceTracker::new();
        for seq in 0..5_000u16 {
            t.classify(seq, false, 100);
        }
        assert!(t.seen.len() <= 102);
    }
}
