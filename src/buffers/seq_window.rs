use crate::safe_converter::SafeCast;
use crate::seq_nr::SeqNr;
use std::collections::VecDeque;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OutOfBounds;

/// A window of slots indexed by sequence number, starting at `base` and holding at most
///  `capacity` consecutive sequence numbers (with wrap-around semantics).
///
/// Slots are stored densely from `base` up to the highest sequence number ever pushed, so
///  `base + slots.len()` is one past the newest entry. Slots that were taken out stay in place
///  as `None` until they reach the front.
pub struct SeqWindow<T> {
    base: SeqNr,
    capacity: usize,
    slots: VecDeque<Option<T>>,
}

impl<T> SeqWindow<T> {
    pub fn new(base: SeqNr, capacity: usize) -> SeqWindow<T> {
        SeqWindow {
            base,
            capacity,
            slots: VecDeque::with_capacity(capacity),
        }
    }

    pub fn base(&self) -> SeqNr {
        self.base
    }

    /// one past the highest slot ever pushed
    pub fn end(&self) -> SeqNr {
        self.base + (self.slots.len() as u16)
    }

    fn offset(&self, seq: SeqNr) -> Option<usize> {
        let offset: usize = (seq - self.base).safe_cast();
        if offset < self.capacity {
            Some(offset)
        }
        else {
            None
        }
    }

    /// Stores a value at `seq`, replacing and returning a previous value
    pub fn push(&mut self, seq: SeqNr, value: T) -> Result<Option<T>, OutOfBounds> {
        let offset = self.offset(seq).ok_or(OutOfBounds)?;
        while self.slots.len() <= offset {
            self.slots.push_back(None);
        }
        Ok(self.slots[offset].replace(value))
    }

    pub fn get(&self, seq: SeqNr) -> Option<&T> {
        self.offset(seq)
            .and_then(|offset| self.slots.get(offset))
            .and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, seq: SeqNr) -> Option<&mut T> {
        let offset = self.offset(seq)?;
        self.slots.get_mut(offset)
            .and_then(|slot| slot.as_mut())
    }

    pub fn contains(&self, seq: SeqNr) -> bool {
        self.get(seq).is_some()
    }

    /// removes the value at `seq`, leaving an empty slot
    pub fn take(&mut self, seq: SeqNr) -> Option<T> {
        let offset = self.offset(seq)?;
        self.slots.get_mut(offset)
            .and_then(|slot| slot.take())
    }

    pub fn front(&self) -> Option<&T> {
        self.slots.front()
            .and_then(|slot| slot.as_ref())
    }

    /// removes the value at `base` if there is one, advancing `base`
    pub fn pop_front(&mut self) -> Option<T> {
        if self.front().is_none() {
            return None;
        }
        self.base = self.base.next();
        self.slots.pop_front().flatten()
    }

    /// drops empty slots at the front, advancing `base` past them
    pub fn trim_front(&mut self) {
        while let Some(None) = self.slots.front() {
            self.slots.pop_front();
            self.base = self.base.next();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SeqNr, &T)> + '_ {
        let base = self.base;
        self.slots.iter()
            .enumerate()
            .filter_map(move |(offset, slot)| slot.as_ref().map(|v| (base + (offset as u16), v)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
