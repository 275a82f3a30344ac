//! Vanished-trip detection.
//!
//! A trip has vanished when its vehicle goes silent for at least 30 minutes
//! before the trip's scheduled end. The last minute it was seen becomes the
//! trip's vanish anchor. Trips whose vehicle reports within the final two
//! minutes before the scheduled end reached their terminus and are never
//! flagged.

use std::collections::HashMap;

use tracing::debug;

use crate::types::{MinuteRecord, TripSchedule};

pub const VANISH_SILENCE_SECS: i64 = 30 * 60;
pub const TERMINUS_GRACE_SECS: i64 = 2 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripState {
    Active,
    NearTerminus,
    PresumedVanished,
}

/// Per (vehicle, trip) state machine fed with observations in time order.
#[derive(Debug, Clone)]
pub struct TripTracker {
    scheduled_end: i64,
    state: TripState,
    last_seen: Option<(i64, usize)>,
}

impl TripTracker {
    pub fn new(scheduled_end: i64) -> Self {
        TripTracker {
            scheduled_end,
            state: TripState::Active,
            last_seen: None,
        }
    }

    pub fn state(&self) -> TripState {
        self.state
    }

    /// Records an observation of `row` at `minute`.
    pub fn observe(&mut self, minute: i64, row: usize) {
        self.last_seen = Some((minute, row));
        if self.state == TripState::Active && minute >= self.scheduled_end - TERMINUS_GRACE_SECS {
            self.state = TripState::NearTerminus;
        }
    }

    /// Closes the sequence. Silence runs from the last observation to the
    /// scheduled end, cut at `horizon` when the data stops earlier.
    pub fn finish(&mut self, horizon: i64) -> TripState {
        if self.state == TripState::Active {
            if let Some((last, _)) = self.last_seen {
                let silence = self.scheduled_end.min(horizon) - last;
                if silence >= VANISH_SILENCE_SECS {
                    self.state = TripState::PresumedVanished;
                }
            }
        }
        self.state
    }

    /// Row of the last observation, once the trip is presumed vanished.
    pub fn anchor(&self) -> Option<usize> {
        match (self.state, self.last_seen) {
            (TripState::PresumedVanished, Some((_, row))) => Some(row),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VanishSummary {
    pub pairs: usize,
    pub vanished: usize,
    pub near_terminus: usize,
    pub unscheduled: usize,
}

/// Sets `vanish_anchor` on the last observed row of every vanished
/// (vehicle, trip) pair and clears it everywhere else.
pub fn flag_vanished(rows: &mut [MinuteRecord], schedule: &[TripSchedule]) -> VanishSummary {
    let ends: HashMap<&str, i64> = schedule
        .iter()
        .map(|s| (s.trip_id.as_str(), s.scheduled_end))
        .collect();

    let horizon = rows.iter().map(|r| r.timestamp).max().unwrap_or(i64::MIN);

    let mut by_pair: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        by_pair.entry(row.pair_key()).or_default().push(i);
    }

    let mut summary = VanishSummary {
        pairs: by_pair.len(),
        ..Default::default()
    };
    let mut anchors = Vec::new();

    for ((_, trip_id), mut idx) in by_pair {
        let Some(&end) = ends.get(trip_id) else {
            summary.unscheduled += 1;
            continue;
        };

        idx.sort_by_key(|&i| (rows[i].timestamp, i));
        let mut tracker = TripTracker::new(end);
        for i in idx {
            tracker.observe(rows[i].timestamp, i);
        }

        match tracker.finish(horizon) {
            TripState::PresumedVanished => summary.vanished += 1,
            TripState::NearTerminus => summary.near_terminus += 1,
            TripState::Active => {}
        }
        anchors.extend(tracker.anchor());
    }

    for row in rows.iter_mut() {
        row.vanish_anchor = false;
    }
    for i in anchors {
        rows[i].vanish_anchor = true;
    }

    debug!(
        pairs = summary.pairs,
        vanished = summary.vanished,
        near_terminus = summary.near_terminus,
        unscheduled = summary.unscheduled,
        "Vanish detection complete"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    const END: i64 = 36_000;

    fn seen(vehicle: &str, trip: &str, ts: i64) -> MinuteRecord {
        MinuteRecord {
            vehicle_id: vehicle.into(),
            trip_id: trip.into(),
            timestamp: ts,
            ..Default::default()
        }
    }

    fn schedule(trip: &str, end: i64) -> TripSchedule {
        TripSchedule {
            trip_id: trip.into(),
            scheduled_start: end - 3_600,
            scheduled_end: end,
        }
    }

    /// Rows for one trip plus a far-away observation that pushes the
    /// horizon past the scheduled end.
    fn with_horizon(mut rows: Vec<MinuteRecord>) -> Vec<MinuteRecord> {
        rows.push(seen("other", "other", END + 7_200));
        rows
    }

    fn anchored(rows: &[MinuteRecord]) -> Vec<i64> {
        rows.iter().filter(|r| r.vanish_anchor).map(|r| r.timestamp).collect()
    }

    #[test]
    fn test_thirty_minutes_of_silence_flags() {
        let last = END - VANISH_SILENCE_SECS;
        let mut rows = with_horizon(vec![seen("v1", "t1", last - 60), seen("v1", "t1", last)]);
        let summary = flag_vanished(&mut rows, &[schedule("t1", END)]);
        assert_eq!(summary.vanished, 1);
        assert_eq!(anchored(&rows), vec![last]);
    }

    #[test]
    fn test_twenty_nine_minutes_does_not_flag() {
        let last = END - VANISH_SILENCE_SECS + 60;
        let mut rows = with_horizon(vec![seen("v1", "t1", last)]);
        let summary = flag_vanished(&mut rows, &[schedule("t1", END)]);
        assert_eq!(summary.vanished, 0);
        assert!(anchored(&rows).is_empty());
    }

    #[test]
    fn test_near_terminus_is_never_flagged() {
        let mut tracker = TripTracker::new(END);
        tracker.observe(END - TERMINUS_GRACE_SECS, 0);
        assert_eq!(tracker.state(), TripState::NearTerminus);
        assert_eq!(tracker.finish(END + 10_000), TripState::NearTerminus);
        assert_eq!(tracker.anchor(), None);
    }

    #[test]
    fn test_only_one_row_anchored_per_pair() {
        let last = END - 3_000;
        let mut rows = with_horizon(vec![
            seen("v1", "t1", last),
            seen("v1", "t1", last - 60),
            seen("v1", "t1", last),
        ]);
        flag_vanished(&mut rows, &[schedule("t1", END)]);
        let flagged: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.vanish_anchor)
            .map(|(i, _)| i)
            .collect();
        // the later of the two rows in the final minute
        assert_eq!(flagged, vec![2]);
    }

    #[test]
    fn test_silence_is_cut_at_data_horizon() {
        // data stops 10 minutes after the last sighting
        let last = END - 3_000;
        let mut rows = vec![seen("v1", "t1", last), seen("v2", "t2", last + 600)];
        let summary = flag_vanished(&mut rows, &[schedule("t1", END), schedule("t2", END)]);
        assert_eq!(summary.vanished, 0);
    }

    #[test]
    fn test_unscheduled_trips_are_skipped() {
        let mut rows = with_horizon(vec![seen("v1", "ghost", 0)]);
        let summary = flag_vanished(&mut rows, &[]);
        assert_eq!(summary.vanished, 0);
        assert_eq!(summary.unscheduled, 2);
    }

    #[test]
    fn test_gap_then_resume_is_not_vanished() {
        let mut rows = with_horizon(vec![
            seen("v1", "t1", END - 6_000),
            seen("v1", "t1", END - 600),
        ]);
        let summary = flag_vanished(&mut rows, &[schedule("t1", END)]);
        assert_eq!(summary.vanished, 0);
    }

    #[test]
    fn test_pairs_are_tracked_separately() {
        // same trip served by two vehicles; only v1 goes silent
        let mut rows = with_horizon(vec![
            seen("v1", "t1", END - 4_000),
            seen("v2", "t1", END - 60),
        ]);
        let summary = flag_vanished(&mut rows, &[schedule("t1", END)]);
        assert_eq!(summary.vanished, 1);
        assert_eq!(summary.near_terminus, 1);
        assert_eq!(anchored(&rows), vec![END - 4_000]);
    }

    #[test]
    fn test_stale_flags_are_cleared() {
        let mut rows = with_horizon(vec![seen("v1", "t1", END - 60)]);
        rows[0].vanish_anchor = true;
        flag_vanished(&mut rows, &[schedule("t1", END)]);
        assert!(anchored(&rows).is_empty());
    }
}
