// utp/reliability.rs

#![forbid(unsafe_code)]

use crate::utp::packet::UtpPacket;

const MIN_RING_CAPACITY: usize = 2;
const MAX_RING_CAPACITY: usize = 1 << 15;

/// Fixed-capacity ring indexed by `seq mod capacity`.
///
/// Each slot keeps the sequence number it was filled with, so a lookup for a
/// sequence number that merely shares the slot misses instead of returning a
/// stale entry from a previous lap.
#[derive(Debug)]
pub struct SeqRing<T> {
    slots: Vec<Option<(u16, T)>>,
    mask: usize,
}

impl<T> SeqRing<T> {
    /// Capacity is rounded up to a power of two and clamped to 2..=32768, so
    /// it always divides 65536 and the slot of a sequence number survives wrap.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity
            .clamp(MIN_RING_CAPACITY, MAX_RING_CAPACITY)
            .next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            mask: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, seq: u16) -> usize {
        seq as usize & self.mask
    }

    /// Store `value` under `seq`, overwriting whatever shared the slot
    pub fn put(&mut self, seq: u16, value: T) {
        let idx = self.index(seq);
        self.slots[idx] = Some((seq, value));
    }

    pub fn get(&self, seq: u16) -> Option<&T> {
        match &self.slots[self.index(seq)] {
            Some((stored, value)) if *stored == seq => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, seq: u16) -> Option<&mut T> {
        let idx = self.index(seq);
        match &mut self.slots[idx] {
            Some((stored, value)) if *stored == seq => Some(value),
            _ => None,
        }
    }

    /// Remove and return the entry for `seq`
    pub fn del(&mut self, seq: u16) -> Option<T> {
        let idx = self.index(seq);
        match &self.slots[idx] {
            Some((stored, _)) if *stored == seq => self.slots[idx].take().map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.get(seq).is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet: UtpPacket,
    /// Connection clock at the last transmission
    pub sent_at_micros: u64,
    pub transmissions: u32,
}

/// Sent-but-unacked packets and the in-flight count.
///
/// The oldest unacked sequence number is derived as `next_seq - in_flight`,
/// where `next_seq` is the sender's next sequence number.
#[derive(Debug)]
pub struct OutgoingWindow {
    ring: SeqRing<SentPacket>,
    in_flight: usize,
}

impl OutgoingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: SeqRing::new(capacity),
            in_flight: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight == 0
    }

    /// Room for one more packet. One slot always stays free so that a single
    /// cumulative ack can clear the whole window without tripping the bound
    /// in [`process_ack`](Self::process_ack).
    pub fn has_room(&self) -> bool {
        self.in_flight < self.capacity() - 1
    }

    pub fn base(&self, next_seq: u16) -> u16 {
        next_seq.wrapping_sub(self.in_flight as u16)
    }

    pub fn push(&mut self, packet: UtpPacket, now_micros: u64) {
        let seq = packet.header.seq_nr;
        self.ring.put(
            seq,
            SentPacket {
                packet,
                sent_at_micros: now_micros,
                transmissions: 1,
            },
        );
        self.in_flight += 1;
    }

    /// Apply a cumulative ack.
    ///
    /// Returns `None` when the ack would clear `capacity` or more packets;
    /// such an ack is either ancient or garbage and is ignored. Otherwise
    /// returns how many in-flight packets were released.
    pub fn process_ack(&mut self, next_seq: u16, ack_nr: u16) -> Option<usize> {
        let base = self.base(next_seq);
        let acked = ack_nr.wrapping_sub(base) as usize + 1;
        if acked >= self.capacity() {
            return None;
        }

        for i in 0..acked {
            self.ring.del(base.wrapping_add(i as u16));
        }
        let released = acked.min(self.in_flight);
        self.in_flight -= released;
        Some(released)
    }

    pub fn oldest(&self, next_seq: u16) -> Option<&SentPacket> {
        if self.in_flight == 0 {
            return None;
        }
        self.ring.get(self.base(next_seq))
    }

    /// Sequence numbers to send again.
    ///
    /// Empty unless the oldest unacked packet is at least `threshold` old; in
    /// that case every in-flight packet that is itself that old is returned,
    /// oldest first.
    pub fn due_for_resend(&self, next_seq: u16, now_micros: u64, threshold: u64) -> Vec<u16> {
        let Some(first) = self.oldest(next_seq) else {
            return Vec::new();
        };
        if now_micros.saturating_sub(first.sent_at_micros) < threshold {
            return Vec::new();
        }

        let base = self.base(next_seq);
        (0..self.in_flight)
            .map(|i| base.wrapping_add(i as u16))
            .filter(|seq| {
                self.ring
                    .get(*seq)
                    .is_some_and(|sent| now_micros.saturating_sub(sent.sent_at_micros) >= threshold)
            })
            .collect()
    }

    pub fn get_mut(&mut self, seq: u16) -> Option<&mut SentPacket> {
        self.ring.get_mut(seq)
    }

    /// Every in-flight sequence number, oldest first
    pub fn in_flight_seqs(&self, next_seq: u16) -> impl Iterator<Item = u16> + use<> {
        let base = self.base(next_seq);
        (0..self.in_flight).map(move |i| base.wrapping_add(i as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u16) -> UtpPacket {
        UtpPacket::create_data(10, seq, 0, 0, vec![seq as u8])
    }

    #[test]
    fn test_ring_capacity_rounding() {
        assert_eq!(SeqRing::<u8>::new(0).capacity(), 2);
        assert_eq!(SeqRing::<u8>::new(500).capacity(), 512);
        assert_eq!(SeqRing::<u8>::new(512).capacity(), 512);
        assert_eq!(SeqRing::<u8>::new(100_000).capacity(), 32768);
    }

    #[test]
    fn test_ring_slot_remembers_seq() {
        let mut ring = SeqRing::new(4);
        ring.put(1, "a");
        assert_eq!(ring.get(1), Some(&"a"));
        // 5 shares the slot of 1
        assert_eq!(ring.get(5), None);
        assert_eq!(ring.del(5), None);
        assert_eq!(ring.del(1), Some("a"));
        assert!(!ring.contains(1));
    }

    #[test]
    fn test_ring_across_wrap() {
        let mut ring = SeqRing::new(8);
        ring.put(65535, 1);
        ring.put(0, 2);
        assert_eq!(ring.get(65535), Some(&1));
        assert_eq!(ring.get(0), Some(&2));
    }

    #[test]
    fn test_cumulative_ack_releases_prefix() {
        let mut window = OutgoingWindow::new(8);
        for seq in 100..104 {
            window.push(data(seq), 0);
        }
        let next_seq = 104;
        assert_eq!(window.base(next_seq), 100);

        assert_eq!(window.process_ack(next_seq, 101), Some(2));
        assert_eq!(window.in_flight(), 2);
        assert_eq!(window.base(next_seq), 102);
        assert!(window.oldest(next_seq).is_some());

        assert_eq!(window.process_ack(next_seq, 103), Some(2));
        assert!(window.is_empty());
        assert!(window.oldest(next_seq).is_none());
    }

    #[test]
    fn test_ack_sanity_bound() {
        let mut window = OutgoingWindow::new(8);
        for seq in 0..3 {
            window.push(data(seq), 0);
        }
        // acks for the packet before the base would clear 65536 entries
        assert_eq!(window.process_ack(3, 65535), None);
        // exactly capacity entries
        assert_eq!(window.process_ack(3, 7), None);
        assert_eq!(window.in_flight(), 3);
    }

    #[test]
    fn test_ack_beyond_in_flight_floors_at_zero() {
        let mut window = OutgoingWindow::new(16);
        window.push(data(0), 0);
        assert_eq!(window.process_ack(1, 5), Some(1));
        assert_eq!(window.in_flight(), 0);
    }

    #[test]
    fn test_has_room_keeps_one_slot_free() {
        let mut window = OutgoingWindow::new(4);
        for seq in 0..3 {
            assert!(window.has_room());
            window.push(data(seq), 0);
        }
        assert!(!window.has_room());
        // a single ack clears all capacity - 1 packets
        assert_eq!(window.process_ack(3, 2), Some(3));
    }

    #[test]
    fn test_due_for_resend_requires_aged_oldest() {
        let mut window = OutgoingWindow::new(8);
        window.push(data(0), 0);
        window.push(data(1), 400_000);
        window.push(data(2), 900_000);

        assert!(window.due_for_resend(3, 450_000, 500_000).is_empty());
        assert_eq!(window.due_for_resend(3, 950_000, 500_000), vec![0, 1]);
        assert_eq!(window.due_for_resend(3, 1_400_000, 500_000), vec![0, 1, 2]);
    }

    #[test]
    fn test_in_flight_seqs_wrap() {
        let mut window = OutgoingWindow::new(8);
        window.push(data(65534), 0);
        window.push(data(65535), 0);
        window.push(data(0), 0);
        let seqs: Vec<u16> = window.in_flight_seqs(1).collect();
        assert_eq!(seqs, vec![65534, 65535, 0]);
    }
}
