//! Stateful streaming over a time range.
//!
//! A `Streamer` owns a cursor over a time axis and hands out successive
//! half-open index windows of a declared step (a fixed number of samples
//! or a calendar span). The trailing window may be shorter than the
//! nominal step; it is returned, not dropped. Advancing past the end is
//! an explicit error, distinct from an empty result.

use tracing::debug;

use cda_common::{shift_date, TimeAxis, TimeUnit};

use crate::error::{ReaderError, Result};
use crate::lazy::LazyDataset;

/// Step size of a stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamStep {
    /// A fixed number of time samples per chunk.
    Samples(usize),
    /// A calendar span per chunk, e.g. 3 days.
    Calendar(u32, TimeUnit),
}

/// Cursor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Active,
    Exhausted,
}

/// A resettable cursor yielding index windows over a time axis.
#[derive(Debug, Clone)]
pub struct Streamer {
    step: StreamStep,
    state: StreamState,
    /// Next window start, as an index into the axis.
    cursor: usize,
}

impl Streamer {
    pub fn new(step: StreamStep) -> Self {
        Self {
            step,
            state: StreamState::Idle,
            cursor: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Back to the beginning of the range.
    pub fn reset(&mut self) {
        debug!("stream reset to idle");
        self.state = StreamState::Idle;
        self.cursor = 0;
    }

    /// The next window over `axis`, advancing the cursor. Fails with
    /// `StreamExhausted` once the range is consumed.
    pub fn next_window(&mut self, axis: &TimeAxis) -> Result<(usize, usize)> {
        if self.state == StreamState::Exhausted || self.cursor >= axis.len() {
            self.state = StreamState::Exhausted;
            return Err(ReaderError::StreamExhausted);
        }
        let lo = self.cursor;
        let hi = match self.step {
            StreamStep::Samples(n) => (lo + n.max(1)).min(axis.len()),
            StreamStep::Calendar(n, unit) => {
                let end_date = shift_date(axis.times[lo], n, unit);
                // First index at or past the window end
                let mut hi = lo;
                while hi < axis.len() && axis.times[hi] < end_date {
                    hi += 1;
                }
                hi.max(lo + 1)
            }
        };
        self.cursor = hi;
        self.state = if hi >= axis.len() {
            StreamState::Exhausted
        } else {
            StreamState::Active
        };
        debug!("stream window [{lo}, {hi})");
        Ok((lo, hi))
    }
}

/// A finite iterator of materialized chunks over a lazy dataset.
///
/// Restart by constructing a new iterator; an exhausted one stays
/// exhausted.
pub struct ChunkIterator {
    data: LazyDataset,
    streamer: Streamer,
}

impl ChunkIterator {
    pub fn new(data: LazyDataset, step: StreamStep) -> Self {
        Self {
            data,
            streamer: Streamer::new(step),
        }
    }
}

impl Iterator for ChunkIterator {
    type Item = Result<cda_common::Dataset>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.streamer.next_window(&self.data.times()) {
            Ok((lo, hi)) => Some(self.data.materialize_range(lo, hi)),
            Err(ReaderError::StreamExhausted) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cda_common::parse_date;
    use chrono::Duration;

    fn daily_axis(start: &str, n: usize) -> TimeAxis {
        let t0 = parse_date(start).unwrap();
        TimeAxis {
            times: (0..n).map(|i| t0 + Duration::days(i as i64)).collect(),
        }
    }

    #[test]
    fn test_three_day_windows() {
        // Daily data over May 2020, stepped by 3 days
        let axis = daily_axis("2020-05-01T00:00:00", 31);
        let mut s = Streamer::new(StreamStep::Calendar(3, TimeUnit::Days));
        let mut windows = Vec::new();
        loop {
            match s.next_window(&axis) {
                Ok(w) => windows.push(w),
                Err(ReaderError::StreamExhausted) => break,
                Err(e) => panic!("{e}"),
            }
        }
        // No gaps, no overlaps, full coverage
        assert_eq!(windows[0], (0, 3));
        assert_eq!(windows[1], (3, 6));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert_eq!(windows.last().unwrap().1, 31);
        // 31 = 10 * 3 + 1: the last window is the one-day remainder
        assert_eq!(windows.len(), 11);
        assert_eq!(windows.last().unwrap(), &(30, 31));
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let axis = daily_axis("2020-05-01T00:00:00", 4);
        let mut s = Streamer::new(StreamStep::Samples(2));
        assert_eq!(s.state(), StreamState::Idle);
        s.next_window(&axis).unwrap();
        assert_eq!(s.state(), StreamState::Active);
        s.next_window(&axis).unwrap();
        assert_eq!(s.state(), StreamState::Exhausted);
        assert!(matches!(
            s.next_window(&axis),
            Err(ReaderError::StreamExhausted)
        ));
        // And it keeps failing rather than restarting silently
        assert!(s.next_window(&axis).is_err());
    }

    #[test]
    fn test_reset_restarts() {
        let axis = daily_axis("2020-05-01T00:00:00", 4);
        let mut s = Streamer::new(StreamStep::Samples(4));
        s.next_window(&axis).unwrap();
        assert!(s.next_window(&axis).is_err());
        s.reset();
        assert_eq!(s.state(), StreamState::Idle);
        assert_eq!(s.next_window(&axis).unwrap(), (0, 4));
    }

    #[test]
    fn test_monthly_steps_vary_in_length() {
        let axis = daily_axis("2020-01-01T00:00:00", 91); // Jan + Feb + Mar 2020
        let mut s = Streamer::new(StreamStep::Calendar(1, TimeUnit::Months));
        assert_eq!(s.next_window(&axis).unwrap(), (0, 31));
        assert_eq!(s.next_window(&axis).unwrap(), (31, 60)); // leap February
        assert_eq!(s.next_window(&axis).unwrap(), (60, 91));
        assert!(s.next_window(&axis).is_err());
    }
}
