use crate::buffers::seq_window::{OutOfBounds, SeqWindow};
use crate::packet::PacketType;
use crate::seq_nr::SeqNr;
use bytes::Bytes;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// An outstanding packet, kept until it is acked so it can be resent
pub struct SendEntry {
    pub packet_type: PacketType,
    pub payload: Bytes,
    pub first_sent: Instant,
    pub resend_count: u32,
    /// number of selective acks that reported a later packet but not this one
    pub acks_skipped: u32,
    resend_timer: Option<JoinHandle<()>>,
}

impl SendEntry {
    pub fn new(packet_type: PacketType, payload: Bytes, first_sent: Instant) -> SendEntry {
        SendEntry {
            packet_type,
            payload,
            first_sent,
            resend_count: 0,
            acks_skipped: 0,
            resend_timer: None,
        }
    }

    /// installs a new resend timer, cancelling the previous one
    pub fn set_resend_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(prev) = self.resend_timer.replace(timer) {
            prev.abort();
        }
    }

    /// Forgets the resend timer without cancelling it. A timer calls this for itself when it
    ///  fires, so that re-arming does not abort the running timer task.
    pub fn detach_resend_timer(&mut self) {
        self.resend_timer = None;
    }
}

impl Drop for SendEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.resend_timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct AckOutcome {
    /// time from first transmission to ack, for each newly acked packet
    pub latencies: Vec<Duration>,
    /// packets that reached a fast resend threshold
    pub resend: Vec<SeqNr>,
}

/// Outstanding packets indexed by sequence number. The window starts at `last_ack + 1`, and
///  everything in `(last_ack, end)` was sent, though some of it may have been selectively acked.
pub struct SendBuffer {
    window: SeqWindow<SendEntry>,
}

impl SendBuffer {
    pub fn new(last_ack: SeqNr, capacity: usize) -> SendBuffer {
        SendBuffer {
            window: SeqWindow::new(last_ack.next(), capacity),
        }
    }

    pub fn last_ack(&self) -> SeqNr {
        self.window.base().prev()
    }

    /// one past the newest packet pushed
    pub fn end(&self) -> SeqNr {
        self.window.end()
    }

    pub fn push(&mut self, seq_nr: SeqNr, entry: SendEntry) -> Result<(), OutOfBounds> {
        self.window.push(seq_nr, entry).map(|_| ())
    }

    pub fn get_mut(&mut self, seq_nr: SeqNr) -> Option<&mut SendEntry> {
        self.window.get_mut(seq_nr)
    }

    /// Marks a packet as acked, returning the latency if it was outstanding
    pub fn ack(&mut self, seq_nr: SeqNr, now: Instant) -> Option<Duration> {
        if !seq_nr.is_before(self.end()) {
            return None;
        }
        let entry = self.window.take(seq_nr)?;
        self.window.trim_front();
        Some(now.saturating_duration_since(entry.first_sent))
    }

    /// acks every packet up to and including `seq_nr`; acks for packets that were never sent are
    ///  ignored
    pub fn ack_to(&mut self, seq_nr: SeqNr, now: Instant) -> Vec<Duration> {
        let mut latencies = Vec::new();
        if !seq_nr.is_before(self.end()) {
            return latencies;
        }
        while self.last_ack().is_before(seq_nr) {
            let next = self.last_ack().next();
            if let Some(entry) = self.window.take(next) {
                latencies.push(now.saturating_duration_since(entry.first_sent));
            }
            self.window.trim_front();
            if self.window.base() == next {
                // empty window: nothing left to ack
                break;
            }
        }
        latencies
    }

    /// Applies a selective ack bitmask that refers to packets starting at `ack_nr + 2`. Packets
    ///  the peer skipped over count towards fast resend, including `ack_nr + 1`.
    pub fn apply_selective_ack(&mut self, ack_nr: SeqNr, bitmask: &[u8], resend_thresholds: &[u32], now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        self.ack_skipped(ack_nr.next(), resend_thresholds, &mut outcome);

        for bit in 0..bitmask.len() * 8 {
            let seq_nr = ack_nr + 2 + (bit as u16);
            if !seq_nr.is_before(self.end()) {
                break;
            }
            if bitmask[bit / 8] & (1 << (bit % 8)) != 0 {
                if let Some(latency) = self.ack(seq_nr, now) {
                    outcome.latencies.push(latency);
                }
            }
            else {
                self.ack_skipped(seq_nr, resend_thresholds, &mut outcome);
            }
        }
        outcome
    }

    fn ack_skipped(&mut self, seq_nr: SeqNr, resend_thresholds: &[u32], outcome: &mut AckOutcome) {
        if let Some(entry) = self.window.get_mut(seq_nr) {
            entry.acks_skipped += 1;
            if resend_thresholds.contains(&entry.acks_skipped) {
                outcome.resend.push(seq_nr);
            }
        }
    }

    /// the oldest outstanding packet
    pub fn head(&self) -> Option<SeqNr> {
        self.window.iter()
            .next()
            .map(|(seq_nr, _)| seq_nr)
    }

    pub fn outstanding(&self) -> Vec<SeqNr> {
        self.window.iter()
            .map(|(seq_nr, _)| seq_nr)
            .collect()
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.window.iter()
            .map(|(_, entry)| entry.payload.len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// drops all entries, cancelling their timers
    pub fn clear(&mut self) {
        self.window.clear();
    }
}
