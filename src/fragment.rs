use std::{fmt, ops::Range};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

// ─────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────

/// `network.station.location.channel` address of one logical channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub network:  String,
    pub station:  String,
    pub location: String,
    pub channel:  String,
}

impl Identity {
    pub fn new(
        network:  impl Into<String>,
        station:  impl Into<String>,
        location: impl Into<String>,
        channel:  impl Into<String>,
    ) -> Self {
        Self {
            network:  network.into(),
            station:  station.into(),
            location: location.into(),
            channel:  channel.into(),
        }
    }
}

/// An empty location renders as a double dot, e.g. `NR.PIR..EHZ`.
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.network, self.station, self.location, self.channel)
    }
}

// ─────────────────────────────────────────────────────────────────────
// Fragment
// ─────────────────────────────────────────────────────────────────────

/// Position of a fragment in source enumeration order. Used as the
/// overlap tie-break, so it must not depend on thread timing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Arrival {
    pub source: usize,
    pub trace:  usize,
}

/// A contiguous, evenly sampled run of samples for one channel.
///
/// `NaN` samples mark masked input ("no data"). The end time is always
/// derived from `start`, the rate and the sample count.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub identity:      Identity,
    pub start:         DateTime<Utc>,
    pub sampling_rate: f64,
    pub samples:       Vec<f64>,
    pub arrival:       Arrival,
}

impl Fragment {
    pub fn new(identity: Identity, start: DateTime<Utc>, sampling_rate: f64, samples: Vec<f64>) -> Self {
        Self { identity, start, sampling_rate, samples, arrival: Arrival::default() }
    }

    pub fn with_arrival(mut self, arrival: Arrival) -> Self {
        self.arrival = arrival;
        self
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time of sample `index`, measured from `start` so that repeated
    /// slicing never accumulates drift.
    pub fn time_of(&self, index: usize) -> DateTime<Utc> {
        self.start + sample_offset(index, self.sampling_rate)
    }

    /// Time of the last sample; equal to `start` for an empty fragment.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.time_of(self.samples.len().saturating_sub(1))
    }

    /// Time the sample after the last one would carry.
    pub fn next_sample_time(&self) -> DateTime<Utc> {
        self.time_of(self.samples.len())
    }

    /// Number of samples whose time is strictly before `t`.
    pub fn samples_before(&self, t: DateTime<Utc>) -> usize {
        if t <= self.start {
            return 0;
        }
        let len = self.samples.len();
        let estimate = (seconds_between(self.start, t) * self.sampling_rate).ceil();
        let mut n = if estimate.is_finite() && estimate > 0.0 { (estimate as usize).min(len) } else { 0 };
        while n > 0 && self.time_of(n - 1) >= t {
            n -= 1;
        }
        while n < len && self.time_of(n) < t {
            n += 1;
        }
        n
    }

    /// Copy of the samples in `range`, re-timed to the first kept sample.
    pub fn slice(&self, range: Range<usize>) -> Fragment {
        Fragment {
            identity:      self.identity.clone(),
            start:         self.time_of(range.start),
            sampling_rate: self.sampling_rate,
            samples:       self.samples[range].to_vec(),
            arrival:       self.arrival,
        }
    }

    /// Splits into `[0, at)` and `[at, len)` without copying the head.
    pub fn split_off(mut self, at: usize) -> (Fragment, Fragment) {
        let tail_samples = self.samples.split_off(at);
        let tail = Fragment {
            identity:      self.identity.clone(),
            start:         self.time_of(at),
            sampling_rate: self.sampling_rate,
            samples:       tail_samples,
            arrival:       self.arrival,
        };
        (self, tail)
    }

    pub fn has_masked(&self) -> bool {
        self.samples.iter().any(|s| s.is_nan())
    }

    /// Breaks the fragment at runs of `NaN` so each piece holds real data only.
    pub fn unmasked_runs(self) -> Vec<Fragment> {
        if !self.has_masked() {
            return vec![self];
        }
        let mut runs = Vec::new();
        let mut run_start: Option<usize> = None;
        for (i, s) in self.samples.iter().enumerate() {
            match (s.is_nan(), run_start) {
                (false, None)    => run_start = Some(i),
                (true, Some(r0)) => {
                    runs.push(self.slice(r0..i));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(r0) = run_start {
            runs.push(self.slice(r0..self.samples.len()));
        }
        runs
    }
}

// ─────────────────────────────────────────────────────────────────────
// Time helpers
// ─────────────────────────────────────────────────────────────────────

/// Offset of sample `index` from the first sample, rounded to the nanosecond.
pub fn sample_offset(index: usize, sampling_rate: f64) -> Duration {
    Duration::nanoseconds((index as f64 / sampling_rate * 1e9).round() as i64)
}

/// Signed seconds from `a` to `b`.
pub fn seconds_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    let d = b - a;
    match d.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        None     => d.num_milliseconds() as f64 / 1e3,
    }
}

/// UTC midnight at or before `t`.
pub fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&t.date_naive().and_time(NaiveTime::MIN))
}

/// UTC midnight strictly after `t`'s day start.
pub fn day_end(t: DateTime<Utc>) -> DateTime<Utc> {
    day_start(t) + Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(samples: Vec<f64>) -> Fragment {
        let start = Utc.with_ymd_and_hms(2012, 4, 4, 12, 0, 0).unwrap();
        Fragment::new(Identity::new("NR", "PIR", "", "EHZ"), start, 100.0, samples)
    }

    #[test]
    fn end_time_is_derived_from_count_and_rate() {
        let f = frag(vec![0.0; 101]);
        assert_eq!(f.end_time(), f.start + Duration::seconds(1));
        assert_eq!(f.next_sample_time(), f.start + Duration::milliseconds(1010));
    }

    #[test]
    fn samples_before_counts_strictly_earlier_samples() {
        let f = frag(vec![0.0; 200]);
        assert_eq!(f.samples_before(f.start), 0);
        assert_eq!(f.samples_before(f.start + Duration::seconds(1)), 100);
        assert_eq!(f.samples_before(f.start + Duration::milliseconds(1005)), 101);
        assert_eq!(f.samples_before(f.start + Duration::days(1)), 200);
    }

    #[test]
    fn unmasked_runs_cut_at_nan() {
        let f = frag(vec![1.0, 2.0, f64::NAN, f64::NAN, 5.0, 6.0, f64::NAN]);
        let runs = f.clone().unmasked_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].samples, vec![1.0, 2.0]);
        assert_eq!(runs[1].samples, vec![5.0, 6.0]);
        assert_eq!(runs[1].start, f.time_of(4));
    }

    #[test]
    fn display_renders_empty_location_as_double_dot() {
        assert_eq!(Identity::new("NR", "PIR", "", "EHZ").to_string(), "NR.PIR..EHZ");
        assert_eq!(Identity::new("NR", "PIR", "00", "EHZ").to_string(), "NR.PIR.00.EHZ");
    }
}
