use crate::buffers::byte_ring::ByteRing;
use crate::buffers::seq_window::SeqWindow;
use crate::error::UtpResult;
use crate::seq_nr::SeqNr;
use bytes::Bytes;
use tracing::{trace, warn};

pub struct InboundPacket {
    pub fin: bool,
    pub payload: Bytes,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
    OutOfWindow,
    /// the stream already ended with a FIN
    AfterFin,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Drained {
    pub packets: usize,
    pub bytes: usize,
    pub fin: bool,
}

/// The reorder window for incoming DATA and FIN packets. It starts right after the cumulative
///  ack, and packets leave it strictly in sequence, into the connection's byte ring.
pub struct ReceiveBuffer {
    window: SeqWindow<InboundPacket>,
    buffered_bytes: usize,
    fin_drained: bool,
}

impl ReceiveBuffer {
    pub fn new(ack_nr: SeqNr, max_unacked: usize) -> ReceiveBuffer {
        ReceiveBuffer {
            window: SeqWindow::new(ack_nr.next(), max_unacked),
            buffered_bytes: 0,
            fin_drained: false,
        }
    }

    /// the highest sequence number delivered in order
    pub fn ack_nr(&self) -> SeqNr {
        self.window.base().prev()
    }

    pub fn insert(&mut self, seq_nr: SeqNr, fin: bool, payload: Bytes) -> InsertOutcome {
        if self.fin_drained {
            trace!("packet #{} after the end of the stream - discarding", seq_nr);
            return InsertOutcome::AfterFin;
        }
        if seq_nr.is_before(self.window.base()) || self.window.contains(seq_nr) {
            trace!("duplicate packet #{}", seq_nr);
            return InsertOutcome::Duplicate;
        }
        let len = payload.len();
        match self.window.push(seq_nr, InboundPacket { fin, payload }) {
            Ok(_) => {
                self.buffered_bytes += len;
                InsertOutcome::Inserted
            }
            Err(_) => {
                warn!("packet #{} is beyond the receive window starting at #{} - discarding", seq_nr, self.window.base());
                InsertOutcome::OutOfWindow
            }
        }
    }

    /// Moves consecutive packets into `ring`. Draining stops at the first gap, after a FIN, or
    ///  when the next payload does not fit into the ring; that packet stays here until the
    ///  application makes room. Packets beyond a drained FIN are discarded.
    pub fn drain(&mut self, ring: &ByteRing) -> UtpResult<Drained> {
        let mut result = Drained::default();
        while let Some(next) = self.window.front() {
            if !ring.try_write(&next.payload)? {
                break;
            }
            if let Some(packet) = self.window.pop_front() {
                self.buffered_bytes -= packet.payload.len();
                result.packets += 1;
                result.bytes += packet.payload.len();
                if packet.fin {
                    result.fin = true;
                    self.fin_drained = true;
                    self.window.clear();
                    self.buffered_bytes = 0;
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Bit `i` is set if the packet `ack_nr + 2 + i` was received, i.e. the first bit refers to
    ///  the second packet after the cumulative ack. Bits are LSB first, trailing zero bytes are
    ///  omitted.
    pub fn selective_ack(&self) -> Option<Vec<u8>> {
        let base = self.window.base();
        let mut bitmask = Vec::new();
        for (seq_nr, _) in self.window.iter() {
            let offset = (seq_nr - base) as usize;
            if offset == 0 {
                continue;
            }
            let bit = offset - 1;
            if bitmask.len() <= bit / 8 {
                bitmask.resize(bit / 8 + 1, 0);
            }
            bitmask[bit / 8] |= 1 << (bit % 8);
        }

        if bitmask.is_empty() {
            None
        }
        else {
            Some(bitmask)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// number of packets held back
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}
