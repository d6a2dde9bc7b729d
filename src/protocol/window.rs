//! Sliding-window bookkeeping
//!
//! Both roles keep two rings of up to 31 slots: the input window tracks
//! packets accepted off the wire (so file bytes reach disk in sequence
//! order) and the output window keeps the raw bytes of sent packets for
//! verbatim retransmission. Stop-and-wait is just the size-1 case.
//!
//! Sequence numbers wrap modulo 64; the placement case analysis lives in
//! [`decide`] as a pure function so it can be tested exhaustively.

use std::collections::VecDeque;

use super::packet::PacketType;

/// The sequence following `s`, modulo 64.
#[inline]
pub fn seq_after(s: u8) -> u8 {
    (s + 1) & 0x3F
}

/// Forward distance from `from` to `to`, modulo 64.
#[inline]
pub fn seq_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) & 0x3F
}

/// One ring entry.
#[derive(Debug, Clone)]
pub struct WindowSlot {
    /// Wire sequence, `0..64`
    pub seq: u8,
    /// Packet type stored here; fabricated gap slots carry `Nak`
    pub ptype: PacketType,
    /// Input ring: decoded payload. Output ring: raw wire bytes.
    pub data: Vec<u8>,
    /// Acknowledged (input: received and acked; output: peer acked)
    pub acked: bool,
    /// Transmission attempts for this slot
    pub try_count: u32,
}

impl WindowSlot {
    /// A freshly received or sent slot.
    pub fn new(seq: u8, ptype: PacketType, data: Vec<u8>) -> Self {
        Self {
            seq,
            ptype,
            data,
            acked: false,
            try_count: 1,
        }
    }

    /// A placeholder for a sequence that was skipped on the wire.
    pub fn gap(seq: u8) -> Self {
        Self {
            seq,
            ptype: PacketType::Nak,
            data: Vec::new(),
            acked: false,
            try_count: 0,
        }
    }

    /// True for fabricated placeholders that were never filled.
    pub fn is_gap(&self) -> bool {
        self.ptype == PacketType::Nak
    }
}

/// Where an incoming sequence lands relative to the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotDecision {
    /// The next expected sequence; store it at the head
    Next,
    /// Sequences were skipped; `gaps` lists the missing ones in order
    Lost {
        /// The skipped sequence numbers, oldest first
        gaps: Vec<u8>,
    },
    /// A sequence already held, at the given slot index
    Duplicate(usize),
    /// Outside the window entirely; ignore it
    Outside,
}

/// Classify `seq` against the window per the protocol's case analysis.
pub fn decide(w: &Window, seq: u8) -> SlotDecision {
    let expected = w.next_expected();
    if seq == expected {
        return SlotDecision::Next;
    }
    if let Some(i) = w.find(seq) {
        return SlotDecision::Duplicate(i);
    }
    let d = usize::from(seq_distance(expected, seq));
    if d < w.size() {
        let mut gaps = Vec::with_capacity(d);
        let mut g = expected;
        for _ in 0..d {
            gaps.push(g);
            g = seq_after(g);
        }
        SlotDecision::Lost { gaps }
    } else {
        SlotDecision::Outside
    }
}

/// A ring of in-flight packets in arrival order.
#[derive(Debug)]
pub struct Window {
    slots: VecDeque<WindowSlot>,
    size: usize,
    last_seq: Option<u8>,
}

impl Window {
    /// Create a ring of the given size (clamped to 1..31).
    pub fn new(size: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(size.clamp(1, 31)),
            size: size.clamp(1, 31),
            last_seq: None,
        }
    }

    /// Drop all slots and adopt a new size, keeping the sequence
    /// expectation; rings are rebuilt on every negotiation result.
    pub fn resize(&mut self, size: usize) {
        self.slots.clear();
        self.size = size.clamp(1, 31);
    }

    /// Ring capacity.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Occupied slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// True when every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.size
    }

    /// The sequence the next new packet should carry.
    pub fn next_expected(&self) -> u8 {
        self.last_seq.map(seq_after).unwrap_or(0)
    }

    /// Locate a sequence among the occupied slots.
    pub fn find(&self, seq: u8) -> Option<usize> {
        self.slots.iter().position(|s| s.seq == seq)
    }

    /// Slot by index.
    pub fn get(&self, i: usize) -> Option<&WindowSlot> {
        self.slots.get(i)
    }

    /// Mutable slot by index.
    pub fn get_mut(&mut self, i: usize) -> Option<&mut WindowSlot> {
        self.slots.get_mut(i)
    }

    /// Oldest slot.
    pub fn front(&self) -> Option<&WindowSlot> {
        self.slots.front()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &WindowSlot> {
        self.slots.iter()
    }

    /// Append a slot, evicting the oldest when full. The evicted slot is
    /// returned so the caller can flush an acknowledged Data payload.
    pub fn push(&mut self, slot: WindowSlot) -> Option<WindowSlot> {
        let evicted = if self.is_full() {
            self.slots.pop_front()
        } else {
            None
        };
        self.last_seq = Some(slot.seq);
        self.slots.push_back(slot);
        evicted
    }

    /// Append a slot only if there is room; used while back-filling gaps,
    /// where nothing may be evicted.
    pub fn try_push(&mut self, slot: WindowSlot) -> bool {
        if self.is_full() {
            return false;
        }
        self.last_seq = Some(slot.seq);
        self.slots.push_back(slot);
        true
    }

    /// Mark a sequence acknowledged. Returns false for unknown sequences.
    pub fn mark_acked(&mut self, seq: u8) -> bool {
        match self.find(seq) {
            Some(i) => {
                self.slots[i].acked = true;
                true
            }
            None => false,
        }
    }

    /// Remove the oldest slot if it has been acknowledged.
    pub fn pop_front_acked(&mut self) -> Option<WindowSlot> {
        if self.slots.front()?.acked {
            self.slots.pop_front()
        } else {
            None
        }
    }

    /// Oldest slot that has not been acknowledged.
    pub fn oldest_unacked(&self) -> Option<&WindowSlot> {
        self.slots.iter().find(|s| !s.acked)
    }

    /// Number of unacknowledged slots.
    pub fn unacked_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.acked).count()
    }

    /// Drop every slot, keeping the sequence expectation.
    pub fn clear_slots(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_slot(seq: u8) -> WindowSlot {
        WindowSlot::new(seq, PacketType::Data, vec![seq])
    }

    fn window_with(size: usize, seqs: &[u8]) -> Window {
        let mut w = Window::new(size);
        for &s in seqs {
            let _ = w.push(data_slot(s));
        }
        w
    }

    #[test]
    fn test_next_expected_starts_at_zero() {
        let w = Window::new(4);
        assert_eq!(w.next_expected(), 0);
        assert_eq!(decide(&w, 0), SlotDecision::Next);
    }

    #[test]
    fn test_decide_exhaustive_over_sequence_space() {
        // several window states, all 64 candidate sequences each
        for (size, stored, expected) in [
            (4usize, vec![0u8, 1, 2], 3u8),
            (8, vec![60, 61, 62, 63, 0], 1),
            (1, vec![17], 18),
            (31, vec![5], 6),
        ] {
            let w = window_with(size, &stored);
            assert_eq!(w.next_expected(), expected);
            for s in 0..64u8 {
                let got = decide(&w, s);
                if s == expected {
                    assert_eq!(got, SlotDecision::Next, "seq {s}");
                } else if stored.contains(&s) {
                    assert!(
                        matches!(got, SlotDecision::Duplicate(_)),
                        "seq {s} should be a duplicate"
                    );
                } else {
                    let d = usize::from(seq_distance(expected, s));
                    if d < size {
                        match got {
                            SlotDecision::Lost { gaps } => {
                                assert_eq!(gaps.len(), d, "seq {s}");
                                assert_eq!(gaps[0], expected);
                            }
                            other => panic!("seq {s}: expected Lost, got {other:?}"),
                        }
                    } else {
                        assert_eq!(got, SlotDecision::Outside, "seq {s}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_lost_gap_list_wraps() {
        let w = window_with(8, &[61, 62]);
        match decide(&w, 2) {
            SlotDecision::Lost { gaps } => assert_eq!(gaps, vec![63, 0, 1]),
            other => panic!("expected Lost, got {other:?}"),
        }
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut w = window_with(3, &[1, 2, 3]);
        assert!(w.is_full());
        let evicted = w.push(data_slot(4)).expect("eviction");
        assert_eq!(evicted.seq, 1);
        assert_eq!(w.len(), 3);
        assert_eq!(w.next_expected(), 5);
    }

    #[test]
    fn test_try_push_refuses_when_full() {
        let mut w = window_with(2, &[1, 2]);
        assert!(!w.try_push(data_slot(3)));
        assert_eq!(w.len(), 2);
        assert_eq!(w.next_expected(), 3);
    }

    #[test]
    fn test_ack_and_rolloff() {
        let mut w = window_with(4, &[1, 2, 3]);
        assert!(w.mark_acked(2));
        assert!(!w.mark_acked(9));
        // front is unacked, nothing rolls off yet
        assert!(w.pop_front_acked().is_none());
        w.mark_acked(1);
        assert_eq!(w.pop_front_acked().unwrap().seq, 1);
        assert_eq!(w.pop_front_acked().unwrap().seq, 2);
        assert!(w.pop_front_acked().is_none());
        assert_eq!(w.oldest_unacked().unwrap().seq, 3);
    }

    #[test]
    fn test_gap_fill_scenario() {
        // receiver sees 1, 2, 4 with 3 lost
        let mut w = window_with(4, &[1, 2]);
        match decide(&w, 4) {
            SlotDecision::Lost { gaps } => {
                assert_eq!(gaps, vec![3]);
                for g in gaps {
                    assert!(w.try_push(WindowSlot::gap(g)));
                }
                assert!(w.try_push(data_slot(4)));
            }
            other => panic!("expected Lost, got {other:?}"),
        }
        // the retransmission comes back as a duplicate of the gap slot
        match decide(&w, 3) {
            SlotDecision::Duplicate(i) => {
                assert!(w.get(i).unwrap().is_gap());
                let slot = w.get_mut(i).unwrap();
                slot.ptype = PacketType::Data;
                slot.data = vec![3];
                slot.acked = true;
            }
            other => panic!("expected Duplicate, got {other:?}"),
        }
        assert_eq!(w.next_expected(), 5);
    }

    #[test]
    fn test_resize_keeps_expectation() {
        let mut w = window_with(1, &[0]);
        w.resize(4);
        assert!(w.is_empty());
        assert_eq!(w.next_expected(), 1);
        assert_eq!(w.size(), 4);
    }
}
