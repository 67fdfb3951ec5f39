//! Deferred release of sub-buffers for multi-frame-in-flight rendering.
//!
//! A sub-buffer dropped while an in-flight frame still reads its range would
//! let the range be handed out again too early. Queue it here instead and the
//! drop happens once enough frames have completed.

use std::collections::VecDeque;

/// An item pending release.
struct PendingRelease<T> {
    item: T,
    frame_queued: u64,
}

/// Queue that holds items (typically [`SubBuffer`](crate::SubBuffer)s) until
/// `frames_in_flight` frames have passed, then drops them.
pub struct DeferredReleaseQueue<T> {
    pending: VecDeque<PendingRelease<T>>,
    frames_in_flight: usize,
}

impl<T> DeferredReleaseQueue<T> {
    /// Create a new deferred release queue.
    ///
    /// # Arguments
    /// * `frames_in_flight` - Number of frames that can be in flight simultaneously.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue `item` for release; `frame_number` is the current frame.
    pub fn queue(&mut self, item: T, frame_number: u64) {
        self.pending.push_back(PendingRelease {
            item,
            frame_queued: frame_number,
        });
    }

    /// Drop every item whose frame is old enough. Returns how many were released.
    ///
    /// Call this at the start of each frame.
    pub fn process(&mut self, current_frame_number: u64) -> usize {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // Queue order is FIFO and frame numbers are non-decreasing, so only the front can mature.
        let mut released = 0;
        while matches!(self.pending.front(), Some(p) if p.frame_queued < cutoff) {
            self.pending.pop_front();
            released += 1;
        }

        if released > 0 {
            tracing::trace!(released, current_frame_number, "Released deferred items");
        }
        released
    }

    /// Drop everything immediately.
    ///
    /// Call this during shutdown after `device_wait_idle()`.
    pub fn flush(&mut self) -> usize {
        let released = self.pending.len();
        self.pending.clear();
        released
    }

    /// Get the number of pending releases.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Update the frames in flight count.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::HostBacking;
    use crate::dynamic_buffer::DynamicResizableBuffer;

    #[test]
    fn items_wait_for_frames_in_flight() {
        let mut queue = DeferredReleaseQueue::new(2);
        queue.queue("a", 10);
        queue.queue("b", 11);

        assert_eq!(queue.process(11), 0);
        assert_eq!(queue.process(12), 0);
        assert_eq!(queue.process(13), 1);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.process(14), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn sub_buffer_range_stays_reserved_until_processed() {
        let buffer = DynamicResizableBuffer::new(HostBacking::new(128), 1).unwrap();
        let mut queue = DeferredReleaseQueue::new(1);

        let sub = buffer.allocate_buffer(128, None).unwrap();
        queue.queue(sub, 0);
        assert!(buffer.allocate_buffer(1, None).is_err());

        queue.process(1);
        assert_eq!(buffer.free_size(), 0);
        queue.process(2);
        assert_eq!(buffer.free_size(), 128);
    }

    #[test]
    fn flush_releases_everything() {
        let mut queue = DeferredReleaseQueue::new(3);
        queue.queue(1, 0);
        queue.queue(2, 0);
        queue.set_frames_in_flight(100);
        assert_eq!(queue.flush(), 2);
        assert_eq!(queue.pending_count(), 0);
    }
}
