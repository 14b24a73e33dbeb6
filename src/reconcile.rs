use serde::{Deserialize, Serialize};

use crate::{binner::Bucket, error::MergeError, fragment::Fragment};

/// Snaps near-integer sampling rates so that merge arithmetic is exact.
///
/// Recorders report rates such as 99.9997 Hz for a true 100 Hz stream;
/// left alone these produce one-sample gaps and overlaps at every merge
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateReconciler {
    pub tolerance_hz:          f64,
    /// Wider snap applied only when the first pass leaves differing rates.
    pub fallback_tolerance_hz: f64,
}

impl Default for RateReconciler {
    fn default() -> Self {
        Self { tolerance_hz: 1e-3, fallback_tolerance_hz: 0.05 }
    }
}

/// `rate` rounded to the nearest integer if it is within `tolerance`.
pub fn snap_rate(rate: f64, tolerance: f64) -> f64 {
    let nearest = rate.round();
    if nearest > 0.0 && (rate - nearest).abs() < tolerance {
        nearest
    } else {
        rate
    }
}

impl RateReconciler {
    pub fn snap_fragment(&self, fragment: &mut Fragment) {
        fragment.sampling_rate = snap_rate(fragment.sampling_rate, self.tolerance_hz);
    }

    /// Brings every fragment of the bucket to one common rate and returns it.
    pub fn reconcile(&self, bucket: &mut Bucket) -> Result<f64, MergeError> {
        if bucket.fragments.is_empty() {
            return Err(MergeError::Inconsistent(format!("bucket {} is empty", bucket.key.identity)));
        }
        for tolerance in [self.tolerance_hz, self.fallback_tolerance_hz] {
            for f in &mut bucket.fragments {
                f.sampling_rate = snap_rate(f.sampling_rate, tolerance);
            }
            if let Some(rate) = common_rate(&bucket.fragments) {
                return Ok(rate);
            }
        }
        Err(MergeError::IncompatibleRate { rates: distinct_rates(&bucket.fragments) })
    }
}

/// The shared rate of all fragments, if there is exactly one.
pub fn common_rate(fragments: &[Fragment]) -> Option<f64> {
    let first = fragments.first()?.sampling_rate;
    fragments.iter().all(|f| f.sampling_rate == first).then_some(first)
}

pub fn distinct_rates(fragments: &[Fragment]) -> Vec<f64> {
    let mut rates: Vec<f64> = fragments.iter().map(|f| f.sampling_rate).collect();
    rates.sort_by(f64::total_cmp);
    rates.dedup();
    rates
}
