//! Bounded pending-packet queue with urgent preemption.
//!
//! [`PendingQueue`] keeps two FIFO lanes, one per [`Priority`]. `pop` always
//! drains the urgent lane first, so an emergency stop enqueued behind a run of
//! speed commands goes out on the very next refill. Order within a lane is
//! preserved.
//!
//! Capacity `N` is shared by both lanes. When it is reached `push` returns
//! [`QueueFullError`] and the caller keeps ownership of the decision to retry
//! or drop; nothing is silently discarded.
//!
//! A packet with `repeat > 1` stays at the front of its lane until it has been
//! handed out that many times. It occupies one slot for its whole lifetime.
//!
//! ```rust
//! use dcc_track::{Address, Packet, PendingQueue};
//!
//! let mut queue: PendingQueue<4> = PendingQueue::new();
//! let speed = Packet::new(Address::short(3).unwrap(), &[0x3F, 0x80]).unwrap();
//! let estop = Packet::new(Address::Broadcast, &[0x41]).unwrap().urgent();
//!
//! queue.push(speed.clone()).unwrap();
//! queue.push(estop.clone()).unwrap();
//!
//! assert_eq!(queue.pop(), Some(estop));
//! assert_eq!(queue.pop(), Some(speed));
//! assert_eq!(queue.pop(), None);
//! ```

use heapless::Deque;

use crate::error::QueueFullError;
use crate::packet::{Packet, Priority};

/// What happens to queued packets when the track is paused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum QueuePolicy {
    /// Keep pending packets; they are sent after `resume`.
    #[default]
    Retain,
    /// Drop pending packets when the pause completes.
    Discard,
}

#[derive(Clone, Debug)]
struct Entry {
    packet: Packet,
    remaining: u8,
}

/// Two-lane bounded FIFO of [`Packet`]s.
pub struct PendingQueue<const N: usize> {
    urgent: Deque<Entry, N>,
    normal: Deque<Entry, N>,
}

impl<const N: usize> PendingQueue<N> {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            urgent: Deque::new(),
            normal: Deque::new(),
        }
    }

    /// Appends a packet to the lane matching its priority.
    ///
    /// # Errors
    ///
    /// [`QueueFullError`] when `N` packets are already waiting.
    pub fn push(&mut self, packet: Packet) -> Result<(), QueueFullError> {
        if self.is_full() {
            return Err(QueueFullError { capacity: N });
        }
        let entry = Entry {
            remaining: packet.repeat(),
            packet,
        };
        let lane = match entry.packet.priority() {
            Priority::Urgent => &mut self.urgent,
            Priority::Normal => &mut self.normal,
        };
        lane.push_back(entry)
            .map_err(|_| QueueFullError { capacity: N })
    }

    /// Hands out the next packet to transmit.
    ///
    /// Constant time: looks at the front of at most two lanes.
    pub fn pop(&mut self) -> Option<Packet> {
        let lane = if self.urgent.is_empty() {
            &mut self.normal
        } else {
            &mut self.urgent
        };
        let front = lane.front_mut()?;
        if front.remaining > 1 {
            front.remaining -= 1;
            return Some(front.packet.clone());
        }
        lane.pop_front().map(|entry| entry.packet)
    }

    /// Next packet `pop` would return.
    pub fn peek(&self) -> Option<&Packet> {
        self.urgent
            .front()
            .or_else(|| self.normal.front())
            .map(|entry| &entry.packet)
    }

    /// Drops every pending packet.
    pub fn clear(&mut self) {
        self.urgent.clear();
        self.normal.clear();
    }

    /// Number of packets waiting, repeats not counted.
    pub fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    /// Number of urgent packets waiting.
    pub fn urgent_len(&self) -> usize {
        self.urgent.len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `push` would be rejected.
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Total capacity shared by both lanes.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for PendingQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
