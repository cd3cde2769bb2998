//! Watermark merging across inbound streams.
//!
//! The coordinator keeps the greatest watermark observed on each stream and
//! answers one question per call: is there a watermark that may be forwarded
//! now? The answer is the minimum across streams, with two relaxations:
//! streams that reached end-of-stream leave the merge, and under a
//! non-negative retention interval a stream that has been silent for the
//! whole interval no longer holds the minimum back. A silent stream that is
//! holding the greatest observed watermark stays in the merge; silence only
//! relaxes laggards, so the eligible value can rise but never fall. The
//! emitted floor makes a stream returning to activity unable to lower the
//! result either.

const NONE: i64 = i64::MIN;

struct StreamWatermark {
    /// Greatest watermark observed on this stream, `NONE` until the first.
    observed: i64,
    /// Call time of the last watermark observation; seeded with the time of
    /// the first call.
    last_observed_at: Option<u64>,
    done: bool,
}

pub(crate) struct WatermarkCoordinator {
    streams: Vec<StreamWatermark>,
    /// Greatest watermark already forwarded, `NONE` until the first.
    last_emitted: i64,
    /// `None` means retain indefinitely.
    retain_nanos: Option<u64>,
}

impl WatermarkCoordinator {
    pub(crate) fn new(stream_count: usize, max_watermark_retain_millis: i64) -> Self {
        let retain_nanos = u64::try_from(max_watermark_retain_millis)
            .ok()
            .map(|millis| millis.saturating_mul(1_000_000));
        let streams = (0..stream_count)
            .map(|_| StreamWatermark {
                observed: NONE,
                last_observed_at: None,
                done: false,
            })
            .collect();
        WatermarkCoordinator {
            streams,
            last_emitted: NONE,
            retain_nanos,
        }
    }

    /// Seeds the observation clock of streams that have not produced a
    /// watermark yet. Invoked with the time of every call; only the first
    /// call has an effect per stream.
    pub(crate) fn note_call(&mut self, now_nanos: u64) {
        for stream in &mut self.streams {
            stream.last_observed_at.get_or_insert(now_nanos);
        }
    }

    /// Records a watermark observed on `ordinal`. Watermarks inside one
    /// stream are non-decreasing, but a stale value is tolerated and simply
    /// has no effect on the maximum.
    pub(crate) fn observe(&mut self, ordinal: usize, timestamp: i64, now_nanos: u64) {
        let stream = &mut self.streams[ordinal];
        stream.observed = stream.observed.max(timestamp);
        stream.last_observed_at = Some(now_nanos);
    }

    /// Takes `ordinal` out of the merge for good.
    pub(crate) fn mark_done(&mut self, ordinal: usize) {
        self.streams[ordinal].done = true;
    }

    pub(crate) fn record_emitted(&mut self, timestamp: i64) {
        debug_assert!(timestamp > self.last_emitted);
        self.last_emitted = timestamp;
    }

    /// The watermark that may be forwarded at `now_nanos`, if any.
    pub(crate) fn eligible(&self, now_nanos: u64) -> Option<i64> {
        let top = self
            .streams
            .iter()
            .filter(|s| !s.done)
            .map(|s| s.observed)
            .max()?;
        if top == NONE {
            // no stream has contributed yet
            return None;
        }
        let mut min = i64::MAX;
        for stream in self.streams.iter().filter(|s| !s.done) {
            if stream.observed < top && self.is_silent(stream, now_nanos) {
                continue;
            }
            min = min.min(stream.observed);
        }
        if min == NONE {
            return None;
        }
        (min > self.last_emitted).then_some(min)
    }

    fn is_silent(&self, stream: &StreamWatermark, now_nanos: u64) -> bool {
        let Some(retain) = self.retain_nanos else {
            return false;
        };
        match stream.last_observed_at {
            Some(at) => now_nanos.saturating_sub(at) >= retain,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_single_stream_forwards_immediately() {
        let mut coordinator = WatermarkCoordinator::new(1, -1);
        coordinator.note_call(0);
        coordinator.observe(0, 100, 0);
        assert_eq!(coordinator.eligible(0), Some(100));

        coordinator.record_emitted(100);
        assert_eq!(coordinator.eligible(0), None);

        coordinator.observe(0, 101, MS);
        assert_eq!(coordinator.eligible(MS), Some(101));
    }

    #[test]
    fn test_min_across_streams() {
        let mut coordinator = WatermarkCoordinator::new(2, -1);
        coordinator.note_call(0);
        coordinator.observe(0, 100, 0);
        // the second stream has not contributed, so nothing is eligible
        assert_eq!(coordinator.eligible(0), None);

        coordinator.observe(1, 99, MS);
        assert_eq!(coordinator.eligible(MS), Some(99));
    }

    #[test]
    fn test_infinite_retention_never_relaxes() {
        let mut coordinator = WatermarkCoordinator::new(2, -1);
        coordinator.note_call(0);
        coordinator.observe(0, 100, 0);
        assert_eq!(coordinator.eligible(u64::MAX), None);
    }

    #[test]
    fn test_silent_laggard_relaxed_at_retention_boundary() {
        let mut coordinator = WatermarkCoordinator::new(2, 16);
        coordinator.note_call(400 * MS);
        coordinator.observe(1, 100, 400 * MS);

        // within the interval the silent stream still holds the min back
        assert_eq!(coordinator.eligible(400 * MS), None);
        assert_eq!(coordinator.eligible(415 * MS), None);

        // the boundary is inclusive
        assert_eq!(coordinator.eligible(416 * MS), Some(100));
    }

    #[test]
    fn test_returning_stream_cannot_lower_the_result() {
        let mut coordinator = WatermarkCoordinator::new(2, 16);
        coordinator.note_call(0);
        coordinator.observe(0, 100, 0);
        assert_eq!(coordinator.eligible(16 * MS), Some(100));
        coordinator.record_emitted(100);

        // the silent stream comes back with an old watermark
        coordinator.observe(1, 50, 17 * MS);
        assert_eq!(coordinator.eligible(17 * MS), None);

        coordinator.observe(1, 150, 18 * MS);
        assert_eq!(coordinator.eligible(18 * MS), Some(150));
    }

    #[test]
    fn test_done_stream_leaves_the_merge() {
        let mut coordinator = WatermarkCoordinator::new(2, -1);
        coordinator.note_call(0);
        coordinator.observe(0, 100, 0);
        assert_eq!(coordinator.eligible(0), None);

        coordinator.mark_done(1);
        assert_eq!(coordinator.eligible(0), Some(100));

        coordinator.mark_done(0);
        assert_eq!(coordinator.eligible(0), None);
    }
}
