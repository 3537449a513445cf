//! Fixed-capacity receive ring with drop-oldest overflow policy.

use cell_common::can::CanFrame;
use heapless::Deque;

/// Frames held between the drain task and consumers.
pub const RX_RING_CAPACITY: usize = 64;

/// Result of pushing a frame into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// The oldest frame was discarded to make room.
    DroppedOldest {
        /// First drop since the last consumer pop.
        new_episode: bool,
    },
}

/// Receive ring.
///
/// An overflow episode starts with the first drop and ends when a consumer
/// pops a frame. `overflow_events` counts episodes, `dropped` counts frames.
pub struct RxRing<const N: usize = RX_RING_CAPACITY> {
    frames: Deque<CanFrame, N>,
    in_overflow: bool,
    dropped: u64,
    overflow_events: u64,
}

impl<const N: usize> Default for RxRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RxRing<N> {
    pub const fn new() -> Self {
        Self {
            frames: Deque::new(),
            in_overflow: false,
            dropped: 0,
            overflow_events: 0,
        }
    }

    pub fn push(&mut self, frame: CanFrame) -> PushOutcome {
        let Err(frame) = self.frames.push_back(frame) else {
            return PushOutcome::Stored;
        };

        self.frames.pop_front();
        self.dropped += 1;
        let new_episode = !self.in_overflow;
        if new_episode {
            self.in_overflow = true;
            self.overflow_events += 1;
        }
        // Space was freed above.
        let _ = self.frames.push_back(frame);
        PushOutcome::DroppedOldest { new_episode }
    }

    pub fn pop(&mut self) -> Option<CanFrame> {
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.in_overflow = false;
        }
        frame
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[inline]
    pub fn overflow_events(&self) -> u64 {
        self.overflow_events
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.in_overflow = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> CanFrame {
        CanFrame::new(0xD0, &[n]).unwrap()
    }

    #[test]
    fn fifo_order() {
        let mut ring: RxRing<4> = RxRing::new();
        for n in 0..3 {
            assert_eq!(ring.push(frame(n)), PushOutcome::Stored);
        }
        assert_eq!(ring.pop().unwrap().payload(), &[0]);
        assert_eq!(ring.pop().unwrap().payload(), &[1]);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut ring: RxRing<4> = RxRing::new();
        for n in 0..6 {
            ring.push(frame(n));
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.dropped(), 2);
        assert_eq!(ring.overflow_events(), 1);
        assert_eq!(ring.pop().unwrap().payload(), &[2]);
    }

    #[test]
    fn episode_ends_on_pop() {
        let mut ring: RxRing<2> = RxRing::new();
        ring.push(frame(0));
        ring.push(frame(1));
        assert_eq!(
            ring.push(frame(2)),
            PushOutcome::DroppedOldest { new_episode: true }
        );
        assert_eq!(
            ring.push(frame(3)),
            PushOutcome::DroppedOldest { new_episode: false }
        );
        assert_eq!(ring.overflow_events(), 1);

        ring.pop();
        ring.push(frame(4));
        assert_eq!(
            ring.push(frame(5)),
            PushOutcome::DroppedOldest { new_episode: true }
        );
        assert_eq!(ring.overflow_events(), 2);
        assert_eq!(ring.dropped(), 3);
    }
}
