//! Clock offset estimation from round-trip probes.
//!
//! The client stamps its input with the server's clock. [`ClockSync`] learns
//! the offset between the two clocks by sending numbered probes and assuming
//! the reply was produced halfway through the round trip. All times are
//! milliseconds supplied by the caller; nothing here reads a wall clock.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use skylink_config::OffsetFilterKind;

/// Latest derived relation between the local and server clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEstimate {
    /// `server_time - local_time`, in milliseconds.
    pub offset_millis: i64,
    /// Round trip of the probe the offset was taken from, in milliseconds.
    pub last_sample_round_trip: u64,
}

/// One completed probe.
#[derive(Debug, Clone, Copy)]
struct Sample {
    offset_millis: i64,
    round_trip: u64,
}

/// Client-side clock synchronizer, one per connection.
#[derive(Debug, Clone)]
pub struct ClockSync {
    filter: OffsetFilterKind,
    next_probe_id: u8,
    /// Outstanding probes: id -> local send time.
    pending: BTreeMap<u8, u64>,
    samples: VecDeque<Sample>,
    estimate: Option<ClockEstimate>,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new(OffsetFilterKind::default())
    }
}

impl ClockSync {
    /// Creates a synchronizer with no completed probe (offset 0).
    pub fn new(filter: OffsetFilterKind) -> Self {
        Self {
            filter,
            next_probe_id: 0,
            pending: BTreeMap::new(),
            samples: VecDeque::new(),
            estimate: None,
        }
    }

    /// Starts a probe sent at `local_send_time` and returns its id.
    ///
    /// Ids wrap at 256. If the id is still outstanding from a previous lap the
    /// old probe is superseded and its late response will be ignored.
    pub fn begin_probe(&mut self, local_send_time: u64) -> u8 {
        let probe_id = self.next_probe_id;
        self.next_probe_id = self.next_probe_id.wrapping_add(1);

        if self.pending.insert(probe_id, local_send_time).is_some() {
            tracing::trace!(probe_id, "Superseded outstanding clock probe");
        }
        probe_id
    }

    /// Completes a probe.
    ///
    /// Returns the new estimate, or `None` when the response does not match an
    /// outstanding probe (unknown, duplicate, superseded, or received before
    /// it was sent). Mismatches are expected on an unreliable transport.
    pub fn on_response(
        &mut self,
        probe_id: u8,
        server_time: u64,
        local_receive_time: u64,
    ) -> Option<ClockEstimate> {
        let Some(local_send_time) = self.pending.remove(&probe_id) else {
            tracing::trace!(probe_id, "Ignoring response to unknown clock probe");
            return None;
        };
        if local_receive_time < local_send_time {
            tracing::trace!(
                probe_id,
                local_send_time,
                local_receive_time,
                "Ignoring clock probe answered before it was sent"
            );
            return None;
        }

        let round_trip = local_receive_time - local_send_time;
        let midpoint = local_send_time + round_trip / 2;
        let offset_millis = signed_difference(server_time, midpoint);

        self.record(Sample {
            offset_millis,
            round_trip,
        });
        self.estimate
    }

    /// Maps a local time onto the server clock. Identity before the first
    /// completed probe.
    pub fn estimate_server_time(&self, local_time: u64) -> u64 {
        match self.estimate {
            Some(estimate) => local_time.saturating_add_signed(estimate.offset_millis),
            None => local_time,
        }
    }

    /// The current estimate, if any probe has completed.
    pub fn estimate(&self) -> Option<ClockEstimate> {
        self.estimate
    }

    /// Round trip of the sample the current estimate is based on.
    pub fn round_trip(&self) -> Option<u64> {
        self.estimate.map(|e| e.last_sample_round_trip)
    }

    /// Number of probes sent but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn record(&mut self, sample: Sample) {
        let window = match self.filter {
            OffsetFilterKind::LatestProbe => 1,
            OffsetFilterKind::MinRoundTrip { window } => window.max(1),
        };
        self.samples.push_back(sample);
        while self.samples.len() > window {
            self.samples.pop_front();
        }

        // Ties go to the newer sample.
        let mut best = sample;
        for s in &self.samples {
            if s.round_trip < best.round_trip {
                best = *s;
            }
        }

        self.estimate = Some(ClockEstimate {
            offset_millis: best.offset_millis,
            last_sample_round_trip: best.round_trip,
        });
    }
}

/// `a - b` as a signed value, saturating at the `i64` range.
fn signed_difference(a: u64, b: u64) -> i64 {
    let diff = i128::from(a) - i128::from(b);
    i64::try_from(diff).unwrap_or(if diff > 0 { i64::MAX } else { i64::MIN })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_before_first_probe() {
        let clock = ClockSync::default();
        assert_eq!(clock.estimate_server_time(0), 0);
        assert_eq!(clock.estimate_server_time(12_345), 12_345);
        assert!(clock.estimate().is_none());
    }

    #[test]
    fn test_midpoint_offset() {
        let mut clock = ClockSync::default();
        let id = clock.begin_probe(0);
        let estimate = clock.on_response(id, 1000, 100).unwrap();
        assert_eq!(estimate.offset_millis, 950);
        assert_eq!(estimate.last_sample_round_trip, 100);
        assert_eq!(clock.estimate_server_time(100), 1050);
    }

    #[test]
    fn test_negative_offset() {
        let mut clock = ClockSync::default();
        let id = clock.begin_probe(5000);
        clock.on_response(id, 1000, 5020).unwrap();
        assert_eq!(clock.estimate().unwrap().offset_millis, -4010);
        assert_eq!(clock.estimate_server_time(5020), 1010);
        // Saturates rather than wrapping.
        assert_eq!(clock.estimate_server_time(0), 0);
    }

    #[test]
    fn test_duplicate_response_ignored() {
        let mut clock = ClockSync::default();
        let id = clock.begin_probe(0);
        assert!(clock.on_response(id, 1000, 100).is_some());
        assert!(clock.on_response(id, 9999, 120).is_none());
        assert_eq!(clock.estimate().unwrap().offset_millis, 950);
    }

    #[test]
    fn test_unknown_probe_ignored() {
        let mut clock = ClockSync::default();
        assert!(clock.on_response(42, 1000, 10).is_none());
        assert_eq!(clock.estimate_server_time(10), 10);
    }

    #[test]
    fn test_response_before_send_ignored() {
        let mut clock = ClockSync::default();
        let id = clock.begin_probe(500);
        assert!(clock.on_response(id, 1000, 400).is_none());
        assert_eq!(clock.outstanding(), 0);
    }

    #[test]
    fn test_latest_probe_wins() {
        let mut clock = ClockSync::default();
        let a = clock.begin_probe(0);
        let b = clock.begin_probe(10);
        clock.on_response(a, 1000, 20).unwrap();
        clock.on_response(b, 2000, 410).unwrap();
        // b: rtt 400, midpoint 210
        assert_eq!(clock.estimate().unwrap().offset_millis, 1790);
        assert_eq!(clock.round_trip(), Some(400));
    }

    #[test]
    fn test_probe_ids_wrap_and_supersede() {
        let mut clock = ClockSync::default();
        let first = clock.begin_probe(0);
        for t in 1..256 {
            clock.begin_probe(t);
        }
        assert_eq!(clock.outstanding(), 256);

        let lapped = clock.begin_probe(1000);
        assert_eq!(lapped, first);
        assert_eq!(clock.outstanding(), 256);

        // The response is matched against the newer send time.
        let estimate = clock.on_response(first, 5000, 1100).unwrap();
        assert_eq!(estimate.last_sample_round_trip, 100);
    }

    #[test]
    fn test_min_round_trip_filter() {
        let mut clock = ClockSync::new(OffsetFilterKind::MinRoundTrip { window: 3 });

        let id = clock.begin_probe(0);
        clock.on_response(id, 1000, 40).unwrap(); // rtt 40, offset 980
        let id = clock.begin_probe(100);
        clock.on_response(id, 1200, 400).unwrap(); // rtt 300, offset 950
        assert_eq!(clock.estimate().unwrap().offset_millis, 980);

        let id = clock.begin_probe(500);
        clock.on_response(id, 1500, 700).unwrap(); // rtt 200
        let id = clock.begin_probe(800);
        clock.on_response(id, 1800, 1000).unwrap(); // rtt 200, evicts rtt 40
        let estimate = clock.estimate().unwrap();
        assert_eq!(estimate.last_sample_round_trip, 200);
        assert_eq!(estimate.offset_millis, 900);
    }
}
