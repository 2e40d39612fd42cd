//! Bounded frame queue between a capture task and one consumer.
//!
//! Producers never wait: a full queue either rejects the new frame or evicts
//! the oldest one, and both count as a drop. Consumers wait on a `Notify`
//! rather than polling.

use crate::types::FrameRecord;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// What happens to a frame offered to a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Keep the newest frames (preview).
    Overwrite,
    /// Keep what is queued and refuse the new frame (recording).
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub len: usize,
    pub puts: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferClosed;

impl std::fmt::Display for BufferClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("frame buffer closed")
    }
}

impl std::error::Error for BufferClosed {}

#[derive(Debug, Default)]
struct BufferState {
    frames: VecDeque<FrameRecord>,
    puts: u64,
    rejected: u64,
    evicted: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct FrameBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    available: Notify,
}

impl FrameBuffer {
    pub const DEFAULT_CAPACITY: usize = 8;

    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                frames: VecDeque::with_capacity(capacity),
                ..BufferState::default()
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue unless full or closed. A refused frame counts as dropped.
    pub fn try_put(&self, frame: FrameRecord) -> bool {
        let accepted = {
            let mut state = self.lock();
            state.puts += 1;
            if state.closed || state.frames.len() >= self.capacity {
                state.rejected += 1;
                false
            } else {
                state.frames.push_back(frame);
                crate::assert_invariant!(
                    state.frames.len() <= self.capacity,
                    "frame buffer never exceeds capacity",
                    "buffer"
                );
                true
            }
        };
        if accepted {
            self.available.notify_waiters();
        }
        accepted
    }

    /// Enqueue, evicting the oldest frame when full. Only a closed buffer
    /// refuses.
    pub fn put_overwrite(&self, frame: FrameRecord) -> bool {
        {
            let mut state = self.lock();
            state.puts += 1;
            if state.closed {
                state.rejected += 1;
                return false;
            }
            if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.evicted += 1;
            }
            state.frames.push_back(frame);
            crate::assert_invariant!(
                state.frames.len() <= self.capacity,
                "frame buffer never exceeds capacity",
                "buffer"
            );
        }
        self.available.notify_waiters();
        true
    }

    pub fn offer(&self, frame: FrameRecord, policy: AdmissionPolicy) -> bool {
        match policy {
            AdmissionPolicy::Overwrite => self.put_overwrite(frame),
            AdmissionPolicy::Reject => self.try_put(frame),
        }
    }

    pub fn try_recv(&self) -> Option<FrameRecord> {
        self.lock().frames.pop_front()
    }

    /// Wait for the next frame. `None` once the buffer is closed and empty.
    ///
    /// Cancel safe: dropping the future never loses a frame.
    pub async fn recv(&self) -> Option<FrameRecord> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Like [`recv`](Self::recv) with a deadline. `Ok(None)` on timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<FrameRecord>, BufferClosed> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(BufferClosed),
            Err(_) => Ok(None),
        }
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<FrameRecord> {
        self.lock().frames.drain(..).collect()
    }

    /// Refuse further puts and wake every waiting consumer. Frames already
    /// queued stay readable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.lock();
        let dropped = state.rejected + state.evicted;
        BufferStats {
            capacity: self.capacity,
            len: state.frames.len(),
            puts: state.puts,
            accepted: state.puts - state.rejected,
            rejected: state.rejected,
            evicted: state.evicted,
            dropped,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.stats().dropped
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    fn frame(n: u64) -> FrameRecord {
        FrameRecord::new(Bytes::from(vec![n as u8; 4]), n, Duration::from_millis(n), None)
    }

    fn numbers(frames: Vec<FrameRecord>) -> Vec<u64> {
        frames.iter().map(FrameRecord::frame_number).collect()
    }

    #[test]
    fn test_overwrite_keeps_newest() {
        let buffer = FrameBuffer::new(4);
        for n in 1..=6 {
            assert!(buffer.put_overwrite(frame(n)));
        }
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(numbers(buffer.drain()), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_try_put_rejects_when_full() {
        let buffer = FrameBuffer::new(2);
        assert!(buffer.try_put(frame(1)));
        assert!(buffer.try_put(frame(2)));
        assert!(!buffer.try_put(frame(3)));
        let stats = buffer.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted + stats.dropped, stats.puts);
        assert_eq!(numbers(buffer.drain()), vec![1, 2]);
    }

    #[test]
    fn test_closed_buffer_refuses_puts() {
        let buffer = FrameBuffer::new(2);
        buffer.try_put(frame(1));
        buffer.close();
        assert!(!buffer.try_put(frame(2)));
        assert!(!buffer.put_overwrite(frame(3)));
        assert_eq!(buffer.try_recv().map(|f| f.frame_number()), Some(1));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        assert_eq!(FrameBuffer::new(0).capacity(), 1);
        assert_eq!(FrameBuffer::default().capacity(), 8);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_put() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.put_overwrite(frame(7));
        let received = consumer.await.unwrap();
        assert_eq!(received.map(|f| f.frame_number()), Some(7));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let buffer = FrameBuffer::new(2);
        assert!(matches!(
            buffer.recv_timeout(Duration::from_millis(10)).await,
            Ok(None)
        ));
        buffer.try_put(frame(1));
        buffer.close();
        assert_eq!(
            buffer
                .recv_timeout(Duration::from_millis(10))
                .await
                .unwrap()
                .map(|f| f.frame_number()),
            Some(1)
        );
        assert_eq!(
            buffer.recv_timeout(Duration::from_millis(10)).await.unwrap_err(),
            BufferClosed
        );
    }

    #[test]
    fn test_recv_pending_until_put() {
        use tokio_test::{assert_pending, assert_ready, task};

        let buffer = FrameBuffer::new(2);
        let mut recv = task::spawn(buffer.recv());
        assert_pending!(recv.poll());
        buffer.try_put(frame(3));
        assert!(recv.is_woken());
        let received = assert_ready!(recv.poll());
        assert_eq!(received.map(|f| f.frame_number()), Some(3));
    }

    #[tokio::test]
    async fn test_cancelled_recv_loses_nothing() {
        let buffer = FrameBuffer::new(4);
        let _ = tokio::time::timeout(Duration::from_millis(5), buffer.recv()).await;
        buffer.try_put(frame(1));
        assert_eq!(buffer.recv().await.map(|f| f.frame_number()), Some(1));
    }
}
