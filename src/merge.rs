//! Combining one bucket into a single ordered day series.
//!
//! Overlap policy is first-writer-wins: fragments are written in
//! (start time, arrival) order and a sample slot already filled is never
//! overwritten. The discarded duplicate samples are counted on the result
//! so that the run report shows them.

use std::{fmt, iter, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    binner::{Bucket, BucketKey},
    error::{ConfigError, MergeError},
    fragment::{seconds_between, Fragment},
    reconcile::{common_rate, distinct_rates},
};

/// What to put in the sample slots of a gap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GapFill {
    /// Leave the gap empty: the series stays split into segments.
    #[default]
    Preserve,
    /// Join the segments, writing this value into every missing slot.
    Fill(f64),
}

impl FromStr for GapFill {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preserve" | "none" => Ok(GapFill::Preserve),
            "zero"              => Ok(GapFill::Fill(0.0)),
            other => other
                .parse::<f64>()
                .map(GapFill::Fill)
                .map_err(|_| ConfigError::Invalid(format!("unknown gap fill policy '{s}'"))),
        }
    }
}

impl TryFrom<String> for GapFill {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GapFill> for String {
    fn from(g: GapFill) -> Self {
        g.to_string()
    }
}

impl fmt::Display for GapFill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapFill::Preserve => f.write_str("preserve"),
            GapFill::Fill(v)  => write!(f, "{v}"),
        }
    }
}

/// A stretch of the day with no samples between two segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gap {
    /// Last sample before the gap.
    pub after:           DateTime<Utc>,
    /// First sample after the gap.
    pub before:          DateTime<Utc>,
    pub missing_samples: usize,
}

/// Result of merging one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSeries {
    pub key:               BucketKey,
    pub sampling_rate:     f64,
    /// Contiguous runs in time order; more than one only when gaps are preserved.
    pub segments:          Vec<Fragment>,
    pub gaps:              Vec<Gap>,
    pub overlap_discarded: usize,
    /// Samples dropped because they fell after the day's end.
    pub trimmed:           usize,
}

impl MergedSeries {
    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(Fragment::sample_count).sum()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.segments.first().map(|s| s.start)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.segments.last().map(Fragment::end_time)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine {
    pub gap_fill: GapFill,
}

impl MergeEngine {
    pub fn new(gap_fill: GapFill) -> Self {
        Self { gap_fill }
    }

    /// Merges the bucket. Rates must already be reconciled.
    pub fn merge(&self, bucket: Bucket) -> Result<MergedSeries, MergeError> {
        let Bucket { key, fragments } = bucket;
        if fragments.is_empty() {
            return Err(MergeError::Inconsistent(format!("bucket {} is empty", key.identity)));
        }
        let (day_start, day_end) = match (key.day_start(), key.day_end()) {
            (Some(s), Some(e)) => (s, e),
            _ => {
                return Err(MergeError::Inconsistent(format!(
                    "invalid day {}.{:03}",
                    key.year, key.day_of_year
                )))
            }
        };
        let rate = common_rate(&fragments)
            .ok_or_else(|| MergeError::IncompatibleRate { rates: distinct_rates(&fragments) })?;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(MergeError::Inconsistent(format!("invalid sampling rate {rate}")));
        }
        for f in &fragments {
            if f.identity != key.identity {
                return Err(MergeError::Inconsistent(format!(
                    "fragment {} in bucket {}",
                    f.identity, key.identity
                )));
            }
            if f.start < day_start || f.start >= day_end {
                return Err(MergeError::Inconsistent(format!(
                    "fragment starting {} outside day {}.{:03}",
                    f.start, key.year, key.day_of_year
                )));
            }
        }

        let mut pieces: Vec<Fragment> = fragments
            .into_iter()
            .flat_map(Fragment::unmasked_runs)
            .filter(|f| !f.is_empty())
            .collect();
        pieces.sort_by(|a, b| a.start.cmp(&b.start).then(a.arrival.cmp(&b.arrival)));

        let mut segments: Vec<Fragment> = Vec::new();
        let mut gaps = Vec::new();
        let mut overlap_discarded = 0;

        for piece in pieces {
            let Some(last) = segments.last_mut() else {
                segments.push(piece);
                continue;
            };
            let offset = (seconds_between(last.next_sample_time(), piece.start) * rate).round() as i64;
            if offset > 0 {
                debug!(id = %key.identity, after = %last.end_time(), missing = offset, "gap");
                gaps.push(Gap {
                    after:           last.end_time(),
                    before:          piece.start,
                    missing_samples: offset as usize,
                });
                segments.push(piece);
                continue;
            }
            let duplicate = offset.unsigned_abs() as usize;
            if duplicate > 0 {
                debug!(id = %key.identity, at = %piece.start, duplicate, "overlap, keeping earlier samples");
            }
            if duplicate >= piece.sample_count() {
                overlap_discarded += piece.sample_count();
                continue;
            }
            overlap_discarded += duplicate;
            last.samples.extend_from_slice(&piece.samples[duplicate..]);
        }

        let mut trimmed = 0;
        if let Some(last) = segments.last_mut() {
            // a sample exactly at midnight still belongs to this day
            let keep = last.samples_before(day_end + Duration::nanoseconds(1));
            trimmed = last.sample_count() - keep;
            last.samples.truncate(keep);
        }
        if trimmed > 0 {
            warn!(id = %key.identity, trimmed, "samples past the end of day dropped");
        }

        if let GapFill::Fill(value) = self.gap_fill {
            segments = fill_gaps(segments, &gaps, value);
        }

        Ok(MergedSeries { key, sampling_rate: rate, segments, gaps, overlap_discarded, trimmed })
    }
}

fn fill_gaps(segments: Vec<Fragment>, gaps: &[Gap], value: f64) -> Vec<Fragment> {
    let mut iter = segments.into_iter();
    let Some(mut joined) = iter.next() else {
        return Vec::new();
    };
    for (segment, gap) in iter.zip(gaps) {
        joined.samples.extend(iter::repeat(value).take(gap.missing_samples));
        joined.samples.extend(segment.samples);
    }
    vec![joined]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Arrival, Identity};
    use chrono::TimeZone;

    fn id() -> Identity {
        Identity::new("NR", "PIR", "", "EHZ")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 4, 4, 10, 0, 0).unwrap()
    }

    fn frag(offset_s: i64, n: usize, value: f64, source: usize) -> Fragment {
        Fragment::new(id(), t0() + Duration::seconds(offset_s), 10.0, vec![value; n])
            .with_arrival(Arrival { source, trace: 0 })
    }

    fn bucket(fragments: Vec<Fragment>) -> Bucket {
        Bucket { key: BucketKey::new(id(), 2012, 95), fragments }
    }

    #[test]
    fn contiguous_fragments_concatenate() {
        let merged = MergeEngine::default()
            .merge(bucket(vec![frag(10, 100, 2.0, 2), frag(0, 100, 1.0, 1)]))
            .unwrap();
        assert_eq!(merged.segments.len(), 1);
        assert_eq!(merged.sample_count(), 200);
        assert_eq!(merged.segments[0].samples[99], 1.0);
        assert_eq!(merged.segments[0].samples[100], 2.0);
        assert!(merged.gaps.is_empty());
    }

    #[test]
    fn gap_is_preserved_by_default() {
        let merged = MergeEngine::default()
            .merge(bucket(vec![frag(0, 100, 1.0, 1), frag(15, 50, 2.0, 2)]))
            .unwrap();
        assert_eq!(merged.segments.len(), 2);
        assert_eq!(merged.gaps.len(), 1);
        assert_eq!(merged.gaps[0].missing_samples, 50);
        assert_eq!(merged.segments[1].start, t0() + Duration::seconds(15));
    }

    #[test]
    fn gap_fill_joins_segments() {
        let merged = MergeEngine::new(GapFill::Fill(0.0))
            .merge(bucket(vec![frag(0, 100, 1.0, 1), frag(15, 50, 2.0, 2)]))
            .unwrap();
        assert_eq!(merged.segments.len(), 1);
        assert_eq!(merged.sample_count(), 200);
        assert_eq!(merged.segments[0].samples[120], 0.0);
        assert_eq!(merged.gaps.len(), 1);
    }

    #[test]
    fn identical_start_keeps_first_arrival() {
        let merged = MergeEngine::default()
            .merge(bucket(vec![frag(0, 100, 2.0, 7), frag(0, 100, 1.0, 3)]))
            .unwrap();
        assert_eq!(merged.sample_count(), 100);
        assert!(merged.segments[0].samples.iter().all(|s| *s == 1.0));
        assert_eq!(merged.overlap_discarded, 100);
    }

    #[test]
    fn masked_samples_become_gaps() {
        let mut f = frag(0, 100, 1.0, 1);
        for s in &mut f.samples[40..60] {
            *s = f64::NAN;
        }
        let merged = MergeEngine::default().merge(bucket(vec![f])).unwrap();
        assert_eq!(merged.segments.len(), 2);
        assert_eq!(merged.gaps[0].missing_samples, 20);
        assert_eq!(merged.sample_count(), 80);
    }

    #[test]
    fn differing_rates_are_an_error() {
        let mut other = frag(20, 10, 1.0, 2);
        other.sampling_rate = 20.0;
        let err = MergeEngine::default().merge(bucket(vec![frag(0, 10, 1.0, 1), other])).unwrap_err();
        assert!(matches!(err, MergeError::IncompatibleRate { .. }));
    }

    #[test]
    fn foreign_identity_or_day_is_inconsistent() {
        let mut stranger = frag(0, 10, 1.0, 1);
        stranger.identity.channel = "EHN".into();
        assert!(matches!(
            MergeEngine::default().merge(bucket(vec![stranger])),
            Err(MergeError::Inconsistent(_))
        ));

        let next_day = frag(86_400, 10, 1.0, 1);
        assert!(matches!(
            MergeEngine::default().merge(bucket(vec![next_day])),
            Err(MergeError::Inconsistent(_))
        ));
    }

    #[test]
    fn samples_past_midnight_are_trimmed() {
        // 18h of data starting at 10:00 runs 4h into the next day
        let f = frag(0, 18 * 3600 * 10, 1.0, 1);
        let merged = MergeEngine::default().merge(bucket(vec![f])).unwrap();
        assert_eq!(merged.end(), Some(Utc.with_ymd_and_hms(2012, 4, 5, 0, 0, 0).unwrap()));
        assert_eq!(merged.sample_count(), 14 * 3600 * 10 + 1);
        assert_eq!(merged.trimmed, 4 * 3600 * 10 - 1);
    }

    #[test]
    fn gap_fill_parses_from_cli_words() {
        assert_eq!("preserve".parse::<GapFill>().unwrap(), GapFill::Preserve);
        assert_eq!("zero".parse::<GapFill>().unwrap(), GapFill::Fill(0.0));
        assert_eq!("-1.5".parse::<GapFill>().unwrap(), GapFill::Fill(-1.5));
        assert!("sometimes".parse::<GapFill>().is_err());
    }
}
