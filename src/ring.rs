//! Bounded, overwriting fan-out queue of pre-serialized event messages.
//!
//! The ring decouples the serial read threads and the emulation driver
//! (producers) from the control-plane flush (consumer): producers never
//! block beyond a short copy under the ring mutex, and a consumer that
//! falls more than [`RING_SLOTS`] behind silently loses the oldest
//! messages. Clients track their own position with a wrapping cursor
//! against the monotonic push counter (see
//! [`ControlServer`](crate::services::control::ControlServer)).
//!
//! # Example
//!
//! ```rust
//! use treadmill_io::ring::EventRing;
//!
//! let ring = EventRing::new();
//! ring.push(b"{\"type\":\"error\",\"msg\":\"hello\"}\n");
//!
//! let snap = ring.snapshot();
//! assert_eq!(snap.count, 1);
//! assert!(ring.get(0).is_some());
//! ```

use std::sync::Mutex;

/// Number of message slots in the ring.
pub const RING_SLOTS: usize = 2048;

/// Capacity of one slot. Longer messages are truncated on push.
pub const RING_MSG_SIZE: usize = 256;

struct Slot {
    len: u16,
    data: [u8; RING_MSG_SIZE],
}

impl Slot {
    const EMPTY: Self = Self {
        len: 0,
        data: [0; RING_MSG_SIZE],
    };
}

struct Inner {
    slots: Vec<Slot>,
    head: usize,
    count: u32,
}

/// Position of the ring at one instant: the next write index and the
/// total number of pushes so far (wrapping `u32`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingSnapshot {
    /// Slot index the next push will land in.
    pub head: usize,
    /// Monotonic push counter.
    pub count: u32,
}

/// Fixed-capacity ring of pre-serialized messages.
pub struct EventRing {
    inner: Mutex<Inner>,
}

impl EventRing {
    /// Create an empty ring of [`RING_SLOTS`] slots.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(RING_SLOTS);
        slots.resize_with(RING_SLOTS, || Slot::EMPTY);
        Self {
            inner: Mutex::new(Inner {
                slots,
                head: 0,
                count: 0,
            }),
        }
    }

    /// Push one message, overwriting the oldest slot when full. Messages
    /// over [`RING_MSG_SIZE`] bytes are truncated.
    pub fn push(&self, msg: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.head;
        let len = msg.len().min(RING_MSG_SIZE);
        inner.slots[head].data[..len].copy_from_slice(&msg[..len]);
        inner.slots[head].len = len as u16;
        inner.head = (head + 1) % RING_SLOTS;
        inner.count = inner.count.wrapping_add(1);
    }

    /// Current head and push counter, read coherently.
    pub fn snapshot(&self) -> RingSnapshot {
        let inner = self.inner.lock().unwrap();
        RingSnapshot {
            head: inner.head,
            count: inner.count,
        }
    }

    /// Copy the message at slot `idx % RING_SLOTS` out of the ring.
    /// Returns `None` while the slot has never been written.
    pub fn get(&self, idx: usize) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let slot = &inner.slots[idx % RING_SLOTS];
        if slot.len == 0 {
            return None;
        }
        Some(slot.data[..slot.len as usize].to_vec())
    }

    /// Number of slots (fan-out window size).
    pub const fn capacity() -> usize {
        RING_SLOTS
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(i: usize) -> Vec<u8> {
        format!("message-{i}\n").into_bytes()
    }

    #[test]
    fn empty_ring_snapshot() {
        let ring = EventRing::new();
        let snap = ring.snapshot();
        assert_eq!(snap.head, 0);
        assert_eq!(snap.count, 0);
        assert_eq!(ring.get(0), None);
    }

    #[test]
    fn pushes_below_capacity_in_order() {
        let ring = EventRing::new();
        for i in 0..100 {
            ring.push(&msg(i));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.count, 100);
        assert_eq!(snap.head, 100);
        for i in 0..100 {
            assert_eq!(ring.get(i), Some(msg(i)));
        }
    }

    #[test]
    fn overflow_keeps_most_recent_window() {
        let ring = EventRing::new();
        let total = RING_SLOTS + 300;
        for i in 0..total {
            ring.push(&msg(i));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.count as usize, total);
        assert_eq!(snap.head, total % RING_SLOTS);

        // The slot just behind head holds the newest message; the slot at
        // head holds the oldest surviving one.
        let newest = (snap.head + RING_SLOTS - 1) % RING_SLOTS;
        assert_eq!(ring.get(newest), Some(msg(total - 1)));
        assert_eq!(ring.get(snap.head), Some(msg(total - RING_SLOTS)));
    }

    #[test]
    fn oversized_message_truncated() {
        let ring = EventRing::new();
        let big = vec![b'x'; RING_MSG_SIZE * 2];
        ring.push(&big);
        let stored = ring.get(0).unwrap();
        assert_eq!(stored.len(), RING_MSG_SIZE);
        assert!(stored.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn get_wraps_index() {
        let ring = EventRing::new();
        ring.push(b"first\n");
        assert_eq!(ring.get(RING_SLOTS), Some(b"first\n".to_vec()));
    }

    #[test]
    fn concurrent_pushers_never_lose_counts() {
        use std::sync::Arc;
        use std::thread;

        let ring = Arc::new(EventRing::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    ring.push(format!("t{t}-{i}\n").as_bytes());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ring.snapshot().count, 2000);
    }
}
