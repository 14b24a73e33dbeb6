use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use seis_to_sds::{
    fragment::{day_end, day_start, seconds_between},
    split_at_midnights, Arrival, Bucket, BucketKey, Fragment, Identity, MergeEngine,
};

fn id() -> Identity {
    Identity::new("NR", "PIR", "", "EHZ")
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2012, 4, 4, 0, 0, 0).unwrap()
}

fn ramp(start: DateTime<Utc>, rate: f64, n: usize) -> Fragment {
    Fragment::new(id(), start, rate, (0..n).map(|i| i as f64).collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn split_pieces_cover_the_fragment_within_single_days(
        offset_ms in 0i64..3 * 86_400_000,
        rate in prop::sample::select(vec![0.5, 1.0, 2.0, 20.0]),
        n in 1usize..400_000,
    ) {
        let original = ramp(base() + Duration::milliseconds(offset_ms), rate, n);
        let pieces: Vec<Fragment> = split_at_midnights(original.clone()).collect();

        let mut consumed = 0;
        for piece in &pieces {
            prop_assert!(!piece.is_empty());
            prop_assert_eq!(piece.start, original.time_of(consumed));
            prop_assert_eq!(piece.samples[0], consumed as f64);
            let end = piece.end_time();
            prop_assert!(end <= day_end(piece.start));
            prop_assert!(day_start(piece.start) <= end);
            consumed += piece.sample_count();
        }
        prop_assert_eq!(consumed, n);
    }

    #[test]
    fn contiguous_pieces_merge_without_gaps(
        rate in prop::sample::select(vec![10.0, 40.0, 100.0]),
        n in 2usize..5_000,
        cuts in prop::collection::vec(1usize..5_000, 0..8),
        offset_ms in 0i64..3_600_000,
        order in Just((0..9usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let whole = ramp(base() + Duration::hours(6) + Duration::milliseconds(offset_ms), rate, n);

        let mut bounds: Vec<usize> = cuts.into_iter().filter(|c| *c < n).collect();
        bounds.push(0);
        bounds.push(n);
        bounds.sort_unstable();
        bounds.dedup();
        let pieces: Vec<Fragment> = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| whole.slice(w[0]..w[1]).with_arrival(Arrival { source: i + 1, trace: 0 }))
            .collect();
        let scrambled: Vec<Fragment> =
            order.iter().filter(|i| **i < pieces.len()).map(|&i| pieces[i].clone()).collect();
        prop_assert_eq!(scrambled.len(), pieces.len());

        let key = BucketKey::for_fragment(&whole);
        let merged = MergeEngine::default().merge(Bucket { key, fragments: scrambled }).unwrap();

        prop_assert_eq!(merged.segments.len(), 1);
        prop_assert!(merged.gaps.is_empty());
        prop_assert_eq!(merged.overlap_discarded, 0);
        prop_assert_eq!(&merged.segments[0].samples, &whole.samples);
        let span = seconds_between(merged.segments[0].start, merged.segments[0].end_time());
        prop_assert!((span - (n - 1) as f64 / rate).abs() < 1e-6);
    }
}
