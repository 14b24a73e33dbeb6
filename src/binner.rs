//! Per-identity, per-day accumulation of fragments.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use dashmap::DashMap;

use crate::fragment::{Fragment, Identity};

/// Address of one day file: identity plus calendar year and day-of-year.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub identity:    Identity,
    pub year:        i32,
    pub day_of_year: u32,
}

impl BucketKey {
    pub fn new(identity: Identity, year: i32, day_of_year: u32) -> Self {
        Self { identity, year, day_of_year }
    }

    /// Key of the day containing the fragment's first sample. Assumes the
    /// fragment has already been cut at midnights.
    pub fn for_fragment(fragment: &Fragment) -> Self {
        let date = fragment.start.date_naive();
        Self::new(fragment.identity.clone(), date.year(), date.ordinal())
    }

    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_yo_opt(self.year, self.day_of_year)
    }

    pub fn day_start(&self) -> Option<DateTime<Utc>> {
        self.date().and_then(|d| d.and_hms_opt(0, 0, 0)).map(|n| Utc.from_utc_datetime(&n))
    }

    pub fn day_end(&self) -> Option<DateTime<Utc>> {
        self.day_start().map(|t| t + Duration::days(1))
    }
}

/// Fragments destined for one day file.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub key:       BucketKey,
    pub fragments: Vec<Fragment>,
}

impl Bucket {
    pub fn new(key: BucketKey) -> Self {
        Self { key, fragments: Vec::new() }
    }

    pub fn sample_count(&self) -> usize {
        self.fragments.iter().map(Fragment::sample_count).sum()
    }
}

/// The run's bucket map. Inserts from reader threads are serialized per
/// shard; finalizing removes the bucket so merge and write never hold a
/// map lock.
#[derive(Debug, Default)]
pub struct DayBinner {
    buckets: DashMap<BucketKey, Bucket>,
}

impl DayBinner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `fragment` to its bucket and returns the bucket's key.
    pub fn assign(&self, fragment: Fragment) -> BucketKey {
        let key = BucketKey::for_fragment(&fragment);
        self.buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(key.clone()))
            .fragments
            .push(fragment);
        key
    }

    /// Removes a bucket, transferring ownership to the caller.
    pub fn take(&self, key: &BucketKey) -> Option<Bucket> {
        self.buckets.remove(key).map(|(_, bucket)| bucket)
    }

    /// Keys of all open buckets, sorted.
    pub fn keys(&self) -> Vec<BucketKey> {
        let mut keys: Vec<_> = self.buckets.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Tracks the open day of every identity in a streaming run. A change of
/// day for an identity means its previous day can be finalized.
#[derive(Debug, Default)]
pub struct RolloverTracker {
    open: HashMap<Identity, BucketKey>,
}

impl RolloverTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `key` received a fragment. Returns the identity's
    /// previously open key when the day changed.
    pub fn observe(&mut self, key: &BucketKey) -> Option<BucketKey> {
        match self.open.insert(key.identity.clone(), key.clone()) {
            Some(previous) if previous != *key => Some(previous),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag_at(day: u32, hour: u32, channel: &str) -> Fragment {
        let start = Utc.with_ymd_and_hms(2012, 4, day, hour, 0, 0).unwrap();
        Fragment::new(Identity::new("NR", "PIR", "", channel), start, 100.0, vec![0.0; 10])
    }

    #[test]
    fn key_uses_year_and_day_of_year() {
        let key = BucketKey::for_fragment(&frag_at(4, 10, "EHZ"));
        assert_eq!((key.year, key.day_of_year), (2012, 95));
        assert_eq!(key.day_start(), Some(Utc.with_ymd_and_hms(2012, 4, 4, 0, 0, 0).unwrap()));
    }

    #[test]
    fn assign_groups_by_identity_and_day() {
        let binner = DayBinner::new();
        binner.assign(frag_at(4, 1, "EHZ"));
        binner.assign(frag_at(4, 2, "EHZ"));
        binner.assign(frag_at(4, 2, "EHN"));
        binner.assign(frag_at(5, 0, "EHZ"));
        assert_eq!(binner.len(), 3);

        let key = BucketKey::for_fragment(&frag_at(4, 9, "EHZ"));
        let bucket = binner.take(&key).unwrap();
        assert_eq!(bucket.fragments.len(), 2);
        assert!(binner.take(&key).is_none());
    }

    #[test]
    fn rollover_reports_previous_day_once() {
        let mut tracker = RolloverTracker::new();
        let d4 = BucketKey::for_fragment(&frag_at(4, 1, "EHZ"));
        let d5 = BucketKey::for_fragment(&frag_at(5, 1, "EHZ"));
        let other = BucketKey::for_fragment(&frag_at(5, 1, "EHN"));

        assert_eq!(tracker.observe(&d4), None);
        assert_eq!(tracker.observe(&d4), None);
        assert_eq!(tracker.observe(&other), None);
        assert_eq!(tracker.observe(&d5), Some(d4.clone()));
        // a late fragment for day 4 re-opens it and closes day 5
        assert_eq!(tracker.observe(&d4), Some(d5));
        assert_eq!(tracker.observe(&other), None);
    }
}
