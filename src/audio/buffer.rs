//! Jitter buffer for packet reordering
//!
//! Frames are keyed by sequence number extended to 64 bits, so the 32-bit
//! wire counter may wrap without disturbing ordering. Playback never goes
//! backwards: anything at or below the last played sequence is discarded.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::audio::{PcmChunk, StreamFormat};
use crate::config::PlaybackConfig;
use crate::protocol::AudioFrame;

/// Offset applied to the first sequence seen so that frames arriving before
/// it still extend to non-negative keys.
const EXTENDED_BASE: u64 = 1 << 32;

/// Buffered frame awaiting playout
#[derive(Debug, Clone)]
pub struct JitterBufferEntry {
    pub sequence: u32,
    pub chunk: PcmChunk,
    pub arrival: Instant,
}

/// Result of inserting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Buffered,
    /// First frame of a new sender session; previous state was discarded
    NewSession,
    /// At or behind the playout watermark, or from a superseded session
    Late,
    Duplicate,
    /// Sample rate or channel count differs from the stream format
    Rejected,
}

/// Decision taken by one playback cycle
#[derive(Debug, Clone)]
pub enum Playout {
    Play(JitterBufferEntry),
    /// Still filling up before the first frame
    Buffering,
    /// The expected frame is missing and later frames are waiting behind it
    Waiting { missing: u32 },
    Empty,
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default)]
pub struct JitterBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub received: u64,
    pub played: u64,
    pub lost: u64,
    pub late: u64,
    pub duplicate: u64,
    pub expired: u64,
    pub overflow: u64,
    pub underruns: u64,
    pub sessions: u64,
    pub rejected: u64,
}

impl JitterBufferStats {
    pub fn loss_rate(&self) -> f32 {
        let total = self.played + self.lost;
        if total == 0 {
            0.0
        } else {
            self.lost as f32 / total as f32
        }
    }
}

/// Reordering buffer between the network and the playback cadence
pub struct JitterBuffer {
    config: PlaybackConfig,
    format: Option<StreamFormat>,
    entries: BTreeMap<u64, JitterBufferEntry>,
    session: Option<u32>,
    /// Session replaced by `session`; its stragglers are late, not a new start
    previous_session: Option<u32>,
    /// Highest extended sequence seen, used to extend incoming numbers
    reference: Option<u64>,
    next_expected: Option<u64>,
    last_played: Option<u64>,
    /// Consecutive cycles spent waiting on a gap
    waited: u32,
    stats: JitterBufferStats,
}

impl JitterBuffer {
    pub fn new(config: PlaybackConfig) -> Self {
        let stats = JitterBufferStats {
            capacity: config.capacity,
            ..Default::default()
        };
        Self {
            config,
            format: None,
            entries: BTreeMap::new(),
            session: None,
            previous_session: None,
            reference: None,
            next_expected: None,
            last_played: None,
            waited: 0,
            stats,
        }
    }

    /// Only accept frames matching `format`'s sample rate and channel count
    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Insert a frame that arrived at `now`
    pub fn insert(&mut self, frame: &AudioFrame, now: Instant) -> InsertOutcome {
        if let Some(format) = &self.format {
            if frame.sample_rate() != format.sample_rate || frame.channels() != format.channels {
                self.stats.rejected += 1;
                return InsertOutcome::Rejected;
            }
        }

        let mut outcome = InsertOutcome::Buffered;
        if self.session != Some(frame.session_id()) {
            if self.previous_session == Some(frame.session_id()) {
                self.stats.late += 1;
                return InsertOutcome::Late;
            }
            if let Some(old) = self.session {
                self.reset();
                self.previous_session = Some(old);
                outcome = InsertOutcome::NewSession;
            }
            self.session = Some(frame.session_id());
            self.stats.sessions += 1;
        }

        let extended = self.extend(frame.sequence());
        if self.last_played.is_some_and(|played| extended <= played) {
            self.stats.late += 1;
            return InsertOutcome::Late;
        }
        if self.entries.contains_key(&extended) {
            self.stats.duplicate += 1;
            return InsertOutcome::Duplicate;
        }

        let chunk = PcmChunk::from_le_bytes(frame.sample_rate(), frame.channels(), frame.payload());
        self.entries.insert(
            extended,
            JitterBufferEntry {
                sequence: frame.sequence(),
                chunk,
                arrival: now,
            },
        );
        self.reference = Some(self.reference.map_or(extended, |r| r.max(extended)));
        self.stats.received += 1;

        while self.entries.len() > self.config.capacity.max(1) {
            self.entries.pop_first();
            self.stats.overflow += 1;
        }

        outcome
    }

    /// Run one playback cycle
    pub fn pop(&mut self, now: Instant) -> Playout {
        self.expire(now);

        let Some(&oldest) = self.entries.keys().next() else {
            if self.next_expected.is_some() {
                self.stats.underruns += 1;
            }
            return Playout::Empty;
        };

        let expected = match self.next_expected {
            Some(expected) => expected,
            None if self.entries.len() < self.config.prefill_frames.max(1) => return Playout::Buffering,
            None => oldest,
        };

        if let Some(entry) = self.entries.remove(&expected) {
            return self.play(expected, entry);
        }

        // Everything buffered is ahead of `expected`: a gap
        self.waited += 1;
        if self.waited <= self.config.jitter_tolerance {
            return Playout::Waiting {
                missing: expected as u32,
            };
        }

        tracing::debug!(
            "Skipping {} missing frame(s) from sequence {}",
            oldest - expected,
            expected as u32
        );
        self.stats.lost += oldest - expected;
        match self.entries.remove(&oldest) {
            Some(entry) => self.play(oldest, entry),
            None => Playout::Empty,
        }
    }

    fn play(&mut self, extended: u64, entry: JitterBufferEntry) -> Playout {
        self.last_played = Some(extended);
        self.next_expected = Some(extended + 1);
        self.waited = 0;
        self.stats.played += 1;
        Playout::Play(entry)
    }

    /// Evict frames held longer than the maximum buffering delay
    fn expire(&mut self, now: Instant) {
        let max_delay = self.config.max_delay();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.arrival) <= max_delay);
        self.stats.expired += (before - self.entries.len()) as u64;
    }

    /// Map a 32-bit wire sequence onto the 64-bit key space
    fn extend(&self, sequence: u32) -> u64 {
        match self.reference {
            None => EXTENDED_BASE + sequence as u64,
            Some(reference) => {
                let delta = sequence.wrapping_sub(reference as u32) as i32 as i64;
                (reference as i64 + delta) as u64
            }
        }
    }

    /// Drop all buffered frames and the playout watermark
    pub fn reset(&mut self) {
        self.entries.clear();
        self.reference = None;
        self.next_expected = None;
        self.last_played = None;
        self.waited = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire sequence of the last frame played
    pub fn last_played(&self) -> Option<u32> {
        self.last_played.map(|s| s as u32)
    }

    /// Get statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.entries.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::time::Duration;

    fn config(prefill: usize, tolerance: u32) -> PlaybackConfig {
        PlaybackConfig {
            prefill_frames: prefill,
            jitter_tolerance: tolerance,
            max_delay_ms: 200,
            capacity: 64,
        }
    }

    fn frame(session: u32, sequence: u32) -> AudioFrame {
        let payload = Bytes::from(vec![sequence as u8; 8]);
        AudioFrame::new(session, sequence, 0, 48000, 2, payload).unwrap()
    }

    /// Pop until `n` frames are played or `max_cycles` elapse, returning played sequences
    fn drain(jitter: &mut JitterBuffer, now: Instant, n: usize, max_cycles: usize) -> Vec<u32> {
        let mut played = Vec::new();
        for _ in 0..max_cycles {
            if played.len() == n {
                break;
            }
            if let Playout::Play(entry) = jitter.pop(now) {
                played.push(entry.sequence);
            }
        }
        played
    }

    #[test]
    fn test_in_order_playout() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(1, 3));
        for seq in 0..5 {
            assert_eq!(jitter.insert(&frame(1, seq), now), InsertOutcome::Buffered);
        }
        assert_eq!(drain(&mut jitter, now, 5, 5), vec![0, 1, 2, 3, 4]);
        assert!(matches!(jitter.pop(now), Playout::Empty));
    }

    #[test]
    fn test_prefill_holds_back_first_frame() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(3, 3));
        jitter.insert(&frame(1, 0), now);
        jitter.insert(&frame(1, 1), now);
        assert!(matches!(jitter.pop(now), Playout::Buffering));
        jitter.insert(&frame(1, 2), now);
        assert!(matches!(jitter.pop(now), Playout::Play(e) if e.sequence == 0));
    }

    #[test]
    fn test_jitter_buffer_reorders() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(3, 3));

        // Insert out of order
        jitter.insert(&frame(1, 2), now);
        jitter.insert(&frame(1, 0), now);
        jitter.insert(&frame(1, 1), now);

        assert_eq!(drain(&mut jitter, now, 3, 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_late_frame_inside_tolerance_is_played() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(1, 3));
        jitter.insert(&frame(1, 0), now);
        jitter.insert(&frame(1, 2), now);

        assert!(matches!(jitter.pop(now), Playout::Play(e) if e.sequence == 0));
        assert!(matches!(jitter.pop(now), Playout::Waiting { missing: 1 }));

        jitter.insert(&frame(1, 1), now);
        assert_eq!(drain(&mut jitter, now, 2, 2), vec![1, 2]);
        assert_eq!(jitter.stats().lost, 0);
    }

    #[test]
    fn test_loss_stalls_at_most_tolerance_cycles() {
        let now = Instant::now();
        let tolerance = 4;
        let mut jitter = JitterBuffer::new(config(1, tolerance));
        for seq in (0..8).filter(|&s| s != 3) {
            jitter.insert(&frame(1, seq), now);
        }

        assert_eq!(drain(&mut jitter, now, 3, 3), vec![0, 1, 2]);
        for _ in 0..tolerance {
            assert!(matches!(jitter.pop(now), Playout::Waiting { missing: 3 }));
        }
        assert!(matches!(jitter.pop(now), Playout::Play(e) if e.sequence == 4));
        assert_eq!(jitter.stats().lost, 1);

        // The lost frame showing up afterwards is never replayed
        assert_eq!(jitter.insert(&frame(1, 3), now), InsertOutcome::Late);
    }

    #[test]
    fn test_duplicates_and_replays_are_discarded() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(1, 3));
        jitter.insert(&frame(1, 0), now);
        assert_eq!(jitter.insert(&frame(1, 0), now), InsertOutcome::Duplicate);
        assert!(matches!(jitter.pop(now), Playout::Play(_)));
        assert_eq!(jitter.insert(&frame(1, 0), now), InsertOutcome::Late);
        let stats = jitter.stats();
        assert_eq!((stats.duplicate, stats.late), (1, 1));
    }

    #[test]
    fn test_stale_entries_expire() {
        let start = Instant::now();
        let mut jitter = JitterBuffer::new(config(1, 3));
        jitter.insert(&frame(1, 0), start);
        jitter.insert(&frame(1, 1), start);

        let later = start + Duration::from_millis(500);
        assert!(matches!(jitter.pop(later), Playout::Empty));
        assert_eq!(jitter.stats().expired, 2);
        assert!(jitter.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(PlaybackConfig {
            capacity: 4,
            ..config(8, 3)
        });
        for seq in 0..6 {
            jitter.insert(&frame(1, seq), now);
        }
        assert_eq!(jitter.len(), 4);
        assert_eq!(jitter.stats().overflow, 2);
    }

    #[test]
    fn test_new_session_resets_watermark() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(1, 3));
        for seq in 100..103 {
            jitter.insert(&frame(1, seq), now);
        }
        assert_eq!(drain(&mut jitter, now, 3, 3), vec![100, 101, 102]);

        // A restarted sender counts from zero again
        assert_eq!(jitter.insert(&frame(2, 0), now), InsertOutcome::NewSession);
        jitter.insert(&frame(2, 1), now);
        assert_eq!(drain(&mut jitter, now, 2, 2), vec![0, 1]);
    }

    #[test]
    fn test_straggler_from_previous_session_is_late() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(2, 3));
        jitter.insert(&frame(1, 50), now);
        jitter.insert(&frame(2, 0), now);
        jitter.insert(&frame(2, 1), now);

        // Reordered packet of the old session must not wipe the new one
        assert_eq!(jitter.insert(&frame(1, 51), now), InsertOutcome::Late);
        assert_eq!(jitter.len(), 2);
        assert_eq!(drain(&mut jitter, now, 2, 2), vec![0, 1]);

        let stats = jitter.stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.late, 1);
    }

    #[test]
    fn test_foreign_format_is_rejected() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(1, 3)).with_format(StreamFormat::default());
        let mono = AudioFrame::new(1, 0, 0, 1, 1, Bytes::from(vec![0u8; 1200])).unwrap();
        assert_eq!(jitter.insert(&mono, now), InsertOutcome::Rejected);
        assert!(jitter.is_empty());

        // Does not start a session either
        assert_eq!(jitter.insert(&frame(9, 0), now), InsertOutcome::Buffered);
        let stats = jitter.stats();
        assert_eq!((stats.rejected, stats.sessions), (1, 1));
    }

    #[test]
    fn test_sequence_wraparound() {
        let now = Instant::now();
        let mut jitter = JitterBuffer::new(config(1, 3));
        let sequences = [u32::MAX - 1, u32::MAX, 0, 1];
        // Deliver the post-wrap frames first
        for &seq in sequences.iter().rev() {
            jitter.insert(&frame(1, seq), now);
        }
        assert_eq!(drain(&mut jitter, now, 4, 4), sequences.to_vec());
    }

    #[test]
    fn test_loss_rate() {
        let stats = JitterBufferStats {
            played: 9,
            lost: 1,
            ..Default::default()
        };
        assert!((stats.loss_rate() - 0.1).abs() < f32::EPSILON);
        assert_eq!(JitterBufferStats::default().loss_rate(), 0.0);
    }

    proptest! {
        #[test]
        fn played_sequences_strictly_increase(
            order in Just((0u32..40).collect::<Vec<_>>()).prop_shuffle(),
            drops in proptest::collection::vec(any::<bool>(), 40),
            pops_between in 0usize..3,
        ) {
            let now = Instant::now();
            let mut jitter = JitterBuffer::new(config(2, 2));
            let mut played = Vec::new();

            for (i, seq) in order.iter().enumerate() {
                if drops[i] {
                    continue;
                }
                jitter.insert(&frame(7, *seq), now);
                for _ in 0..pops_between {
                    if let Playout::Play(entry) = jitter.pop(now) {
                        played.push(entry.sequence);
                    }
                }
            }
            played.extend(drain(&mut jitter, now, usize::MAX, 200));

            prop_assert!(played.windows(2).all(|w| w[0] < w[1]), "played {:?}", played);
        }

        #[test]
        fn burst_within_tolerance_plays_in_order(
            order in Just((0u32..16).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            // Whole burst arrives before the first playout cycle
            let now = Instant::now();
            let mut jitter = JitterBuffer::new(config(16, 2));
            for seq in &order {
                jitter.insert(&frame(3, *seq), now);
            }
            let played = drain(&mut jitter, now, 16, 16);
            prop_assert_eq!(played, (0u32..16).collect::<Vec<_>>());
        }
    }
}
