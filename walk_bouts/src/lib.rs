//! Walking-bout detection from wearable step-interval logs.
//!
//! Raw feeds overlap, near-duplicate, and split a single continuous walk
//! across several adjacent records. [`detect_walks`] normalizes the feed
//! onto one absolute time axis, drops polling artifacts, coalesces adjacent
//! records with similar speed (see [`merge`]), and groups the qualifying
//! walking bouts by calendar day. The individual stages are public so
//! callers can drive them separately.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub mod merge;
pub use merge::{merge_intervals, MergeResult};

#[derive(Error, Debug)]
pub enum WalkError {
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Pipeline tuning. The defaults are the feed contract; changing them
/// produces output that is not comparable with other consumers of the feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
    pub near_duplicate_eps_sec: i64,
    pub merge_gap_sec: i64,
    pub speed_tolerance_pct: f64,
    pub min_bout_minutes: f64,
    pub min_bout_speed: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            near_duplicate_eps_sec: 1,
            merge_gap_sec: 60,
            speed_tolerance_pct: 15.0,
            min_bout_minutes: 5.0,
            min_bout_speed: 75.0,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), WalkError> {
        if self.near_duplicate_eps_sec < 0 {
            return Err(WalkError::InvalidParameter(
                "near_duplicate_eps_sec must be non-negative".into(),
            ));
        }
        if self.merge_gap_sec < 0 {
            return Err(WalkError::InvalidParameter(
                "merge_gap_sec must be non-negative".into(),
            ));
        }
        if !self.speed_tolerance_pct.is_finite() || self.speed_tolerance_pct <= 0.0 {
            return Err(WalkError::InvalidParameter(
                "speed_tolerance_pct must be finite and positive".into(),
            ));
        }
        if !self.min_bout_minutes.is_finite() || self.min_bout_minutes < 0.0 {
            return Err(WalkError::InvalidParameter(
                "min_bout_minutes must be finite and non-negative".into(),
            ));
        }
        if !self.min_bout_speed.is_finite() || self.min_bout_speed < 0.0 {
            return Err(WalkError::InvalidParameter(
                "min_bout_speed must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// One row of the raw device feed. Timestamps arrive as local-time text;
/// `time_offset` is the signed UTC offset in seconds in effect for both.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawRecord {
    pub time_start_local: String,
    pub time_end_local: String,
    pub time_offset: i64,
    pub steps: u64,
}

/// A normalized activity interval on the common absolute time axis.
///
/// `speed` starts out as `steps / duration_min` and becomes the pair mean
/// when two intervals merge, so it is carried as state, not re-derived.
/// `None` marks a record with no meaningful rate; such records never match
/// a similarity test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepInterval {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub steps: f64,
    pub speed: Option<f64>,
}

impl StepInterval {
    /// Interval length in minutes, from whole elapsed seconds. `None` unless
    /// the interval spans at least one full second forward.
    pub fn duration_min(&self) -> Option<f64> {
        let secs = (self.end_utc - self.start_utc).num_seconds();
        if secs > 0 {
            Some(secs as f64 / 60.0)
        } else {
            None
        }
    }
}

/// A qualifying walking bout. Serializes as
/// `{"start": "YYYY-MM-DD HH:MM:SS", "end": "...", "steps": n}`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct WalkBout {
    #[serde(rename = "start", serialize_with = "serialize_timestamp")]
    pub start_utc: DateTime<Utc>,
    #[serde(rename = "end", serialize_with = "serialize_timestamp")]
    pub end_utc: DateTime<Utc>,
    pub steps: u64,
    #[serde(skip)]
    pub date: NaiveDate,
}

/// Date-keyed walk summary; serializes to `{"YYYY-MM-DD": [bout, ...]}`.
/// Dates without a qualifying bout are absent; within a date, bouts are
/// ordered by ascending start time.
pub type DailyWalks = BTreeMap<NaiveDate, Vec<WalkBout>>;

fn serialize_timestamp<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&ts.format("%Y-%m-%d %H:%M:%S"))
}

/// Run the full reconciliation pipeline on a raw record feed.
///
/// An empty feed is valid and yields an empty mapping. An unparseable
/// timestamp aborts the whole batch, since every later stage depends on all
/// rows being comparable.
pub fn detect_walks(rows: &[RawRecord], params: &Params) -> Result<DailyWalks, WalkError> {
    params.validate()?;
    if rows.is_empty() {
        return Ok(DailyWalks::new());
    }
    let intervals = normalize_records(rows)?;
    let intervals = drop_near_duplicates(intervals, params.near_duplicate_eps_sec);
    let merged = merge::merge_intervals(intervals, params);
    let bouts = classify_walks(&merged.intervals, params);
    Ok(group_by_date(bouts))
}

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, WalkError> {
    let trimmed = value.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(ts);
        }
    }
    Err(WalkError::MalformedTimestamp(value.to_string()))
}

/// Convert raw rows into [`StepInterval`]s by subtracting each record's
/// offset from both local labels; the offset is not carried any further.
pub fn normalize_records(rows: &[RawRecord]) -> Result<Vec<StepInterval>, WalkError> {
    let mut intervals = Vec::with_capacity(rows.len());
    for row in rows {
        let offset = Duration::seconds(row.time_offset);
        let start_utc = (parse_timestamp(&row.time_start_local)? - offset).and_utc();
        let end_utc = (parse_timestamp(&row.time_end_local)? - offset).and_utc();
        let mut interval = StepInterval {
            start_utc,
            end_utc,
            steps: row.steps as f64,
            speed: None,
        };
        interval.speed = interval.duration_min().map(|mins| interval.steps / mins);
        intervals.push(interval);
    }
    Ok(intervals)
}

pub(crate) fn sort_intervals(intervals: &mut [StepInterval]) {
    intervals.sort_by(|a, b| {
        (a.start_utc, a.end_utc)
            .cmp(&(b.start_utc, b.end_utc))
            .then_with(|| a.steps.partial_cmp(&b.steps).unwrap_or(Ordering::Equal))
    });
}

/// Remove exact duplicates and spurious re-polls from the interval set.
///
/// A row whose successor starts *and* ends within `eps_sec` whole seconds
/// of it is a polling artifact of that successor and is dropped; the last
/// row is always kept. Removal preserves the sorted order.
pub fn drop_near_duplicates(mut intervals: Vec<StepInterval>, eps_sec: i64) -> Vec<StepInterval> {
    sort_intervals(&mut intervals);
    intervals.dedup_by(|a, b| {
        a.start_utc == b.start_utc && a.end_utc == b.end_utc && a.steps == b.steps
    });

    let mut kept = Vec::with_capacity(intervals.len());
    for (idx, current) in intervals.iter().enumerate() {
        let spurious = intervals.get(idx + 1).is_some_and(|next| {
            let start_delta = (next.start_utc - current.start_utc).num_seconds();
            let end_delta = (next.end_utc - current.end_utc).num_seconds();
            start_delta <= eps_sec && end_delta <= eps_sec
        });
        if !spurious {
            kept.push(*current);
        }
    }
    kept
}

/// Select genuine walking bouts from the converged interval set. The step
/// count is recomputed from `speed * duration`, since merging sums steps
/// across intervals that may overlap.
pub fn classify_walks(intervals: &[StepInterval], params: &Params) -> Vec<WalkBout> {
    intervals
        .iter()
        .filter_map(|interval| {
            let duration_min = interval.duration_min()?;
            let speed = interval.speed?;
            if duration_min < params.min_bout_minutes || speed < params.min_bout_speed {
                return None;
            }
            Some(WalkBout {
                start_utc: interval.start_utc,
                end_utc: interval.end_utc,
                steps: (speed * duration_min).round() as u64,
                date: interval.start_utc.date_naive(),
            })
        })
        .collect()
}

/// Partition bouts by the calendar date of their start, preserving input
/// order within each date.
pub fn group_by_date(bouts: Vec<WalkBout>) -> DailyWalks {
    let mut days = DailyWalks::new();
    for bout in bouts {
        days.entry(bout.date).or_insert_with(Vec::new).push(bout);
    }
    days
}
