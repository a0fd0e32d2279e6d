//! Single-slot latest-value buffer shared between the acquisition thread and readers

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::capture::Frame;

/// Counters published alongside the frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub frames_published: u64,
    pub read_failures: u64,
    /// Failed pulls since the last successful one
    pub consecutive_failures: u32,
}

/// Everything a reader can observe, swapped in as one unit
#[derive(Debug, Clone, Default)]
pub struct Published {
    pub frame: Option<Arc<Frame>>,
    pub rate: f64,
    pub stats: AcquisitionStats,
}

/// Readers take a snapshot with a single atomic load and never wait on the
/// writer; each write replaces the whole snapshot so a frame is never seen
/// half-written.
#[derive(Debug, Default)]
pub struct LatestSlot {
    inner: ArcSwap<Published>,
}

impl LatestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Published> {
        self.inner.load_full()
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.inner.load().frame.clone()
    }

    pub fn rate(&self) -> f64 {
        self.inner.load().rate
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.inner.load().stats
    }

    /// Replace the frame, releasing the previous occupant.
    pub(crate) fn publish_frame(&self, frame: Frame) {
        let frame = Arc::new(frame);
        self.inner.rcu(|current| {
            let mut next = Published::clone(current);
            next.frame = Some(frame.clone());
            next.stats.frames_published += 1;
            next.stats.consecutive_failures = 0;
            next
        });
    }

    pub(crate) fn publish_rate(&self, rate: f64) {
        self.inner.rcu(|current| {
            let mut next = Published::clone(current);
            next.rate = rate.max(0.0);
            next
        });
    }

    /// Count a failed pull; returns the current run of consecutive failures.
    pub(crate) fn record_failure(&self) -> u32 {
        let previous = self.inner.rcu(|current| {
            let mut next = Published::clone(current);
            next.stats.read_failures += 1;
            next.stats.consecutive_failures = next.stats.consecutive_failures.saturating_add(1);
            next
        });
        previous.stats.consecutive_failures.saturating_add(1)
    }

    pub(crate) fn clear(&self) {
        self.inner.store(Arc::new(Published::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use std::thread;

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            vec![sequence as u8; 12],
            FrameMetadata::packed(sequence, 2, 2, PixelFormat::Rgb24).unwrap(),
        )
    }

    #[test]
    fn empty_until_first_publish() {
        let slot = LatestSlot::new();
        assert!(slot.latest().is_none());
        assert_eq!(slot.rate(), 0.0);
        assert_eq!(slot.stats(), AcquisitionStats::default());
    }

    #[test]
    fn newest_frame_wins() {
        let slot = LatestSlot::new();
        slot.publish_frame(frame(1));
        slot.publish_frame(frame(2));

        assert_eq!(slot.latest().unwrap().sequence(), 2);
        assert_eq!(slot.stats().frames_published, 2);
    }

    #[test]
    fn reader_keeps_its_frame_after_overwrite() {
        let slot = LatestSlot::new();
        slot.publish_frame(frame(1));
        let held = slot.latest().unwrap();

        slot.publish_frame(frame(2));
        assert_eq!(held.sequence(), 1);
        assert_eq!(held.data[0], 1);
    }

    #[test]
    fn failures_reset_on_success() {
        let slot = LatestSlot::new();
        assert_eq!(slot.record_failure(), 1);
        assert_eq!(slot.record_failure(), 2);
        slot.publish_frame(frame(1));

        let stats = slot.stats();
        assert_eq!(stats.read_failures, 2);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(slot.record_failure(), 1);
    }

    #[test]
    fn rate_and_frame_update_independently() {
        let slot = LatestSlot::new();
        slot.publish_frame(frame(3));
        slot.publish_rate(29.7);

        let snapshot = slot.snapshot();
        assert_eq!(snapshot.frame.as_ref().unwrap().sequence(), 3);
        assert_eq!(snapshot.rate, 29.7);

        slot.clear();
        assert!(slot.latest().is_none());
        assert_eq!(slot.rate(), 0.0);
    }

    #[test]
    fn concurrent_readers_see_monotonic_sequence() {
        let slot = Arc::new(LatestSlot::new());

        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for sequence in 1..=2_000 {
                    slot.publish_frame(frame(sequence));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..2_000 {
                        if let Some(frame) = slot.latest() {
                            assert!(frame.sequence() >= last);
                            assert!(frame.is_complete());
                            last = frame.sequence();
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(slot.latest().unwrap().sequence(), 2_000);
    }
}
