//! A bounded circular byte buffer between a connection's delivery processor (writing in-order
//!  payloads) and the application (reading).
//!
//! Blocking reads and writes are async and take an optional deadline. Closing the ring wakes
//!  all waiters: readers drain what is left and then see end-of-stream, writers fail.

use crate::error::{UtpError, UtpResult};
use std::cmp::min;
use std::pin::pin;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

struct RingState {
    buf: Box<[u8]>,
    read_pos: usize,
    len: usize,
    closed: bool,
}

impl RingState {
    fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    fn put(&mut self, data: &[u8]) -> usize {
        let n = min(data.len(), self.free());
        let capacity = self.buf.len();
        let write_pos = (self.read_pos + self.len) % capacity.max(1);

        let first = min(n, capacity - write_pos);
        self.buf[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);

        self.len += n;
        n
    }

    fn take(&mut self, out: &mut [u8]) -> usize {
        let n = min(out.len(), self.len);
        let capacity = self.buf.len();

        let first = min(n, capacity - self.read_pos);
        out[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);

        self.read_pos = (self.read_pos + n) % capacity.max(1);
        self.len -= n;
        n
    }
}

pub struct ByteRing {
    state: Mutex<RingState>,
    not_empty: Notify,
    not_full: Notify,
}

impl ByteRing {
    pub fn new(capacity: usize) -> ByteRing {
        ByteRing {
            state: Mutex::new(RingState {
                buf: vec![0; capacity].into_boxed_slice(),
                read_pos: 0,
                len: 0,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.state().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// number of bytes that can be written without blocking
    pub fn free(&self) -> usize {
        self.state().free()
    }

    /// Writes all of `data` if it fits, and nothing otherwise
    pub fn try_write(&self, data: &[u8]) -> UtpResult<bool> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(UtpError::Closed);
            }
            if state.free() < data.len() {
                return Ok(false);
            }
            state.put(data);
        }
        if !data.is_empty() {
            self.not_empty.notify_waiters();
        }
        Ok(true)
    }

    /// Waits until all of `data` is written. On timeout, the part written so far stays in the
    ///  ring.
    pub async fn write(&self, data: &[u8], deadline: Option<Instant>) -> UtpResult<usize> {
        let mut written = 0;
        loop {
            let mut notified = pin!(self.not_full.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.closed {
                    return Err(UtpError::Closed);
                }
                let n = state.put(&data[written..]);
                written += n;
                if n > 0 {
                    self.not_empty.notify_waiters();
                }
                if written == data.len() {
                    return Ok(written);
                }
            }

            if !wait_with_deadline(notified, deadline).await {
                return Err(UtpError::Timeout);
            }
        }
    }

    /// Waits until at least one byte is available, and returns `Ok(0)` once the ring is closed
    ///  and drained
    pub async fn read_timeout(&self, out: &mut [u8], deadline: Option<Instant>) -> UtpResult<usize> {
        loop {
            let mut notified = pin!(self.not_empty.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.len > 0 && !out.is_empty() {
                    let n = state.take(out);
                    drop(state);
                    self.not_full.notify_waiters();
                    return Ok(n);
                }
                if state.closed || out.is_empty() {
                    return Ok(0);
                }
            }

            if !wait_with_deadline(notified, deadline).await {
                return Err(UtpError::Timeout);
            }
        }
    }

    pub fn close(&self) {
        self.state().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

/// returns `false` if the deadline passed before the notification
pub(crate) async fn wait_with_deadline(notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>, deadline: Option<Instant>) -> bool {
    match deadline {
        None => {
            notified.await;
            true
        }
        Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use rstest::rstest;

    #[rstest]
    #[case::fits(8, vec![1,2,3], true, 5)]
    #[case::exact(3, vec![1,2,3], true, 0)]
    #[case::too_big(2, vec![1,2,3], false, 2)]
    #[case::empty(2, vec![], true, 2)]
    fn test_try_write(#[case] capacity: usize, #[case] data: Vec<u8>, #[case] expected: bool, #[case] expected_free: usize) {
        let ring = ByteRing::new(capacity);
        assert_eq!(ring.try_write(&data).unwrap(), expected);
        assert_eq!(ring.free(), expected_free);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_around() {
        let ring = ByteRing::new(5);
        assert!(ring.try_write(&[1,2,3,4]).unwrap());

        let mut buf = [0u8; 3];
        assert_eq!(ring.read_timeout(&mut buf, None).await.unwrap(), 3);
        assert_eq!(buf, [1,2,3]);

        assert!(ring.try_write(&[5,6,7,8]).unwrap());
        assert_eq!(ring.free(), 0);

        let mut buf = [0u8; 10];
        assert_eq!(ring.read_timeout(&mut buf, None).await.unwrap(), 5);
        assert_eq!(&buf[..5], &[4,5,6,7,8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let ring = ByteRing::new(5);
        let mut buf = [0u8; 3];
        let result = ring.read_timeout(&mut buf, Some(Instant::now() + Duration::from_millis(10))).await;
        assert!(matches!(result, Err(UtpError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_wakes_on_write() {
        let ring = Arc::new(ByteRing::new(5));

        let reader = {
            let ring = ring.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 5];
                let n = ring.read_timeout(&mut buf, None).await.unwrap();
                buf[..n].to_vec()
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        ring.write(&[9,8], None).await.unwrap();

        assert_eq!(reader.await.unwrap(), vec![9,8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_blocks_until_read() {
        let ring = Arc::new(ByteRing::new(4));

        let writer = {
            let ring = ring.clone();
            tokio::spawn(async move {
                ring.write(&[1,2,3,4,5,6], None).await
            })
        };

        let mut received = Vec::new();
        while received.len() < 6 {
            let mut buf = [0u8; 2];
            let n = ring.read_timeout(&mut buf, None).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }

        assert_eq!(writer.await.unwrap().unwrap(), 6);
        assert_eq!(received, vec![1,2,3,4,5,6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_keeps_partial() {
        let ring = ByteRing::new(4);
        let result = ring.write(&[1,2,3,4,5,6], Some(Instant::now() + Duration::from_millis(1))).await;
        assert!(matches!(result, Err(UtpError::Timeout)));
        assert_eq!(ring.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains_then_ends() {
        let ring = Arc::new(ByteRing::new(8));
        ring.try_write(b"abc").unwrap();
        ring.close();

        assert!(matches!(ring.try_write(b"x"), Err(UtpError::Closed)));
        assert!(matches!(ring.write(b"x", None).await, Err(UtpError::Closed)));

        let mut buf = [0u8; 8];
        assert_eq!(ring.read_timeout(&mut buf, None).await.unwrap(), 3);
        assert_eq!(ring.read_timeout(&mut buf, None).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_reader() {
        let ring = Arc::new(ByteRing::new(8));
        let reader = {
            let ring = ring.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                ring.read_timeout(&mut buf, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        ring.close();
        assert_eq!(reader.await.unwrap().unwrap(), 0);
    }
}
