//! Nearest-beacon election.
//!
//! Candidates are ranked by ascending distance, then by most recent sighting,
//! then by identity, which makes the election a total order: the same set of
//! records always elects the same anchor regardless of input order.

use crate::model::{AnchorState, BeaconRecord};
use std::cmp::Ordering;

/// Rank two eligible records; `Less` means `a` is the better anchor.
pub fn compare_candidates(a: &BeaconRecord, b: &BeaconRecord) -> Ordering {
    let da = a.latest_distance.meters().unwrap_or(f64::INFINITY);
    let db = b.latest_distance.meters().unwrap_or(f64::INFINITY);

    da.total_cmp(&db)
        .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
        .then_with(|| a.identity.cmp(&b.identity))
}

/// Elect the anchor among `records`. Records with an unknown or non-finite
/// distance are not eligible.
pub fn recompute(records: &[BeaconRecord]) -> AnchorState {
    let mut candidates: Vec<BeaconRecord> = records
        .iter()
        .filter(|r| r.latest_distance.is_usable())
        .cloned()
        .collect();

    if candidates.is_empty() {
        return AnchorState::none();
    }

    candidates.sort_by(compare_candidates);

    AnchorState {
        current_anchor: candidates.first().map(|r| r.identity.clone()),
        candidates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BeaconIdentity, Distance, SignalSample};

    fn record(minor: u16, meters: Distance, seen: i64) -> BeaconRecord {
        let identity = BeaconIdentity::new("ns", 1, minor);
        BeaconRecord {
            identity: identity.clone(),
            latest_sample: SignalSample::new(identity, -70.0, seen),
            latest_distance: meters,
            last_seen_at: seen,
        }
    }

    #[test]
    fn test_empty_has_no_anchor() {
        let state = recompute(&[]);
        assert_eq!(state.current_anchor, None);
        assert!(state.candidates.is_empty());
    }

    #[test]
    fn test_minimum_distance_wins() {
        let records = vec![
            record(1, Distance::Meters(3.0), 0),
            record(2, Distance::Meters(1.5), 0),
            record(3, Distance::Meters(7.0), 0),
        ];
        let state = recompute(&records);
        assert_eq!(state.current_anchor.as_ref().unwrap().minor, 2);
        let order: Vec<u16> = state.candidates.iter().map(|r| r.identity.minor).collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert_eq!(state.anchor_meters(), Some(1.5));
    }

    #[test]
    fn test_unknown_and_non_finite_are_ineligible() {
        let records = vec![
            record(1, Distance::Unknown, 5),
            record(2, Distance::Meters(f64::NAN), 5),
            record(3, Distance::Meters(9.0), 0),
        ];
        let state = recompute(&records);
        assert_eq!(state.current_anchor.as_ref().unwrap().minor, 3);
        assert_eq!(state.candidates.len(), 1);

        let state = recompute(&[record(1, Distance::Unknown, 0)]);
        assert_eq!(state.current_anchor, None);
    }

    #[test]
    fn test_tie_broken_by_most_recent() {
        let records = vec![
            record(1, Distance::Meters(2.0), 100),
            record(2, Distance::Meters(2.0), 200),
        ];
        assert_eq!(recompute(&records).current_anchor.unwrap().minor, 2);
    }

    #[test]
    fn test_full_tie_broken_by_identity() {
        let a = vec![
            record(9, Distance::Meters(2.0), 100),
            record(4, Distance::Meters(2.0), 100),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(recompute(&a).current_anchor.unwrap().minor, 4);
        assert_eq!(recompute(&a), recompute(&b));
    }
}
