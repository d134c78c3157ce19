//! Iterative coalescing of time-adjacent, speed-similar step intervals.
//!
//! A pair is coalesced when the gap between the two records stays under
//! [`Params::merge_gap_sec`] and their speeds differ by less than
//! [`Params::speed_tolerance_pct`] percent. Merging is strictly pairwise
//! within a pass; the set is rebuilt and re-sorted after every pass, and the
//! loop runs until a pass produces no merge. Each merging pass shrinks the
//! set by at least one record, so the loop terminates.

use chrono::Duration;

use super::{sort_intervals, Params, StepInterval};

/// Converged interval set plus merge-loop diagnostics.
#[derive(Clone, Debug, Default)]
pub struct MergeResult {
    pub intervals: Vec<StepInterval>,
    /// Passes that performed at least one merge.
    pub passes: usize,
    /// Total pairs coalesced across all passes.
    pub merges: usize,
}

/// Merge similar adjacent intervals until no mergeable pair remains.
///
/// The input need not be sorted. The returned set is sorted by ascending
/// start time and is a fixed point: merging it again yields it unchanged.
pub fn merge_intervals(mut intervals: Vec<StepInterval>, params: &Params) -> MergeResult {
    sort_intervals(&mut intervals);

    let mut passes = 0;
    let mut merges = 0;
    loop {
        let (next, merged) = merge_pass(&intervals, params);
        if merged == 0 {
            break;
        }
        passes += 1;
        merges += merged;
        intervals = next;
        sort_intervals(&mut intervals);
    }

    MergeResult {
        intervals,
        passes,
        merges,
    }
}

/// One left-to-right sweep. A matched pair is replaced by its merge result
/// and the scan resumes after the consumed successor, so no record
/// participates in more than one merge per pass.
fn merge_pass(intervals: &[StepInterval], params: &Params) -> (Vec<StepInterval>, usize) {
    let mut out = Vec::with_capacity(intervals.len());
    let mut merged = 0;
    let mut idx = 0;
    while idx < intervals.len() {
        let current = intervals[idx];
        if let Some(next) = intervals.get(idx + 1) {
            if is_merge_candidate(&current, next, params) {
                out.push(merge_pair(&current, next));
                merged += 1;
                idx += 2;
                continue;
            }
        }
        out.push(current);
        idx += 1;
    }
    (out, merged)
}

fn is_merge_candidate(current: &StepInterval, next: &StepInterval, params: &Params) -> bool {
    // Signed gap: an overlapping successor counts as adjacent.
    let gap = next.start_utc.signed_duration_since(current.end_utc);
    if gap >= Duration::seconds(params.merge_gap_sec) {
        return false;
    }
    match (current.speed, next.speed) {
        (Some(current_speed), Some(next_speed)) => {
            let relative_diff = (100.0 - 100.0 * next_speed / current_speed).abs();
            relative_diff.is_finite() && relative_diff < params.speed_tolerance_pct
        }
        _ => false,
    }
}

fn merge_pair(current: &StepInterval, next: &StepInterval) -> StepInterval {
    let speed = match (current.speed, next.speed) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        _ => None,
    };
    StepInterval {
        start_utc: current.start_utc,
        end_utc: next.end_utc,
        // Provisional sum; the classifier re-derives the authoritative count
        // from speed and duration.
        steps: current.steps + next.steps,
        speed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDateTime, Utc};

    fn utc(value: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn interval(start: &str, end: &str, steps: f64) -> StepInterval {
        let mut interval = StepInterval {
            start_utc: utc(start),
            end_utc: utc(end),
            steps,
            speed: None,
        };
        interval.speed = interval.duration_min().map(|mins| steps / mins);
        interval
    }

    #[test]
    fn adjacent_similar_pair_merges() {
        let result = merge_intervals(
            vec![
                interval("2021-03-01 10:00:00", "2021-03-01 10:10:00", 800.0),
                interval("2021-03-01 10:10:30", "2021-03-01 10:20:00", 798.0),
            ],
            &Params::default(),
        );
        assert_eq!(result.intervals.len(), 1);
        assert_eq!(result.passes, 1);
        assert_eq!(result.merges, 1);

        let walk = &result.intervals[0];
        assert_eq!(walk.start_utc, utc("2021-03-01 10:00:00"));
        assert_eq!(walk.end_utc, utc("2021-03-01 10:20:00"));
        assert_eq!(walk.speed, Some(82.0));
        assert_eq!(walk.steps, 1598.0);
    }

    #[test]
    fn speed_mismatch_is_not_merged() {
        let result = merge_intervals(
            vec![
                interval("2021-03-01 10:00:00", "2021-03-01 10:10:00", 800.0),
                interval("2021-03-01 10:10:10", "2021-03-01 10:20:10", 400.0),
            ],
            &Params::default(),
        );
        assert_eq!(result.intervals.len(), 2);
        assert_eq!(result.passes, 0);
    }

    #[test]
    fn wide_gap_is_not_merged() {
        let result = merge_intervals(
            vec![
                interval("2021-03-01 10:00:00", "2021-03-01 10:10:00", 800.0),
                interval("2021-03-01 10:11:00", "2021-03-01 10:21:00", 800.0),
            ],
            &Params::default(),
        );
        assert_eq!(result.intervals.len(), 2);
    }

    #[test]
    fn overlapping_similar_pair_merges() {
        let result = merge_intervals(
            vec![
                interval("2021-03-01 10:00:00", "2021-03-01 10:10:00", 800.0),
                interval("2021-03-01 10:08:00", "2021-03-01 10:18:00", 810.0),
            ],
            &Params::default(),
        );
        assert_eq!(result.intervals.len(), 1);
        assert_eq!(result.intervals[0].end_utc, utc("2021-03-01 10:18:00"));
    }

    #[test]
    fn chain_coalesces_over_successive_passes() {
        let result = merge_intervals(
            vec![
                interval("2021-03-01 10:00:00", "2021-03-01 10:10:00", 800.0),
                interval("2021-03-01 10:10:30", "2021-03-01 10:20:00", 798.0),
                interval("2021-03-01 10:20:20", "2021-03-01 10:30:00", 800.0),
            ],
            &Params::default(),
        );
        // Pairwise within a pass: the first two coalesce, then their result
        // absorbs the third on the next pass.
        assert_eq!(result.intervals.len(), 1);
        assert_eq!(result.passes, 2);
        assert_eq!(result.merges, 2);
        assert_eq!(result.intervals[0].start_utc, utc("2021-03-01 10:00:00"));
        assert_eq!(result.intervals[0].end_utc, utc("2021-03-01 10:30:00"));
    }

    #[test]
    fn merge_is_idempotent() {
        let params = Params::default();
        let first = merge_intervals(
            vec![
                interval("2021-03-01 10:00:00", "2021-03-01 10:10:00", 800.0),
                interval("2021-03-01 10:10:30", "2021-03-01 10:20:00", 798.0),
                interval("2021-03-01 12:00:00", "2021-03-01 12:10:00", 500.0),
            ],
            &params,
        );
        let second = merge_intervals(first.intervals.clone(), &params);
        assert_eq!(second.intervals, first.intervals);
        assert_eq!(second.passes, 0);
        assert_eq!(second.merges, 0);
    }

    #[test]
    fn zero_speed_never_matches() {
        let result = merge_intervals(
            vec![
                interval("2021-03-01 10:00:00", "2021-03-01 10:10:00", 0.0),
                interval("2021-03-01 10:10:10", "2021-03-01 10:20:00", 0.0),
            ],
            &Params::default(),
        );
        assert_eq!(result.intervals.len(), 2);
    }

    #[test]
    fn undefined_speed_never_matches() {
        let degenerate = StepInterval {
            start_utc: utc("2021-03-01 10:00:00"),
            end_utc: utc("2021-03-01 10:00:00"),
            steps: 500.0,
            speed: None,
        };
        let result = merge_intervals(
            vec![
                degenerate,
                interval("2021-03-01 10:00:30", "2021-03-01 10:10:30", 800.0),
            ],
            &Params::default(),
        );
        assert_eq!(result.intervals.len(), 2);
    }

    #[test]
    fn unsorted_input_is_handled() {
        let result = merge_intervals(
            vec![
                interval("2021-03-01 10:10:30", "2021-03-01 10:20:00", 798.0),
                interval("2021-03-01 10:00:00", "2021-03-01 10:10:00", 800.0),
            ],
            &Params::default(),
        );
        assert_eq!(result.intervals.len(), 1);
        assert_eq!(result.intervals[0].start_utc, utc("2021-03-01 10:00:00"));
    }

    #[test]
    fn empty_set_converges_immediately() {
        let result = merge_intervals(Vec::new(), &Params::default());
        assert!(result.intervals.is_empty());
        assert_eq!(result.passes, 0);
    }
}
