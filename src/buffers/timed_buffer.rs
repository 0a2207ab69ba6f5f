use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// number of time slots per retention window; samples within a slot share one entry
const SLOTS_PER_RETENTION: u32 = 120;

/// Sliding-window minimum over recent samples. This is LEDBAT's base delay: the smallest one-way
///  delay seen recently is taken to be the delay of an empty queue.
///
/// Entries are kept in a monotonic queue: oldest first, with strictly increasing values. A sample
///  that is newer and not bigger makes older entries irrelevant, so they are dropped on push.
///  Within a time slot, an entry is refreshed instead of appending, which bounds the number of
///  entries by the number of slots per retention window. A refreshed minimum can outlive its
///  original sample by at most one slot.
pub struct TimedBuffer {
    retention: Duration,
    slot_len: Duration,
    origin: Instant,
    /// (value, pushed at), oldest first
    entries: VecDeque<(u32, Instant)>,
}

impl TimedBuffer {
    pub fn new(retention: Duration) -> TimedBuffer {
        TimedBuffer {
            retention,
            slot_len: (retention / SLOTS_PER_RETENTION).max(Duration::from_millis(1)),
            origin: Instant::now(),
            entries: VecDeque::new(),
        }
    }

    fn slot(&self, at: Instant) -> u128 {
        at.duration_since(self.origin).as_nanos() / self.slot_len.as_nanos()
    }

    pub fn push(&mut self, value: u32) {
        let now = Instant::now();
        self.expire(now);

        while let Some(&(newest, pushed_at)) = self.entries.back() {
            if newest >= value {
                self.entries.pop_back();
                continue;
            }
            if self.slot(pushed_at) == self.slot(now) {
                // a smaller value from the same slot covers this sample
                if let Some(back) = self.entries.back_mut() {
                    back.1 = now;
                }
                return;
            }
            break;
        }
        self.entries.push_back((value, now));
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, pushed_at)) = self.entries.front() {
            if now.duration_since(*pushed_at) <= self.retention {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// minimum of all values pushed within the retention window, 0 if there are none
    pub fn min(&self) -> u32 {
        let now = Instant::now();
        self.entries.iter()
            .find(|(_, pushed_at)| now.duration_since(*pushed_at) <= self.retention)
            .map(|(value, _)| *value)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
