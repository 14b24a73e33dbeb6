//! The `assemble` run.
//!
//! discover → read (parallel) → normalize → snap rate → split at midnight
//! → bin → reconcile → merge → write.
//!
//! Every fragment carries its source's enumeration index, so the merge
//! tie-break does not depend on which reader thread finished first.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::{
    archive::{ArchiveWriter, ExistingPolicy, WriteOutcome},
    binner::{Bucket, BucketKey, DayBinner, RolloverTracker},
    config::{AssembleConfig, RunMode},
    demux::Toolchain,
    discover::{discover_sources, Source},
    error::{DecodeError, Error},
    formats::{FragmentReader, MiniSeed, Sac, SourceKind},
    fragment::{Arrival, Fragment},
    identity::{IdentityRules, SiblingSet},
    merge::{MergeEngine, MergedSeries},
    reconcile::RateReconciler,
    report::write_report,
    split::split_at_midnights,
};

// ─────────────────────────────────────────────────────────────────────
// Simple timing helper
// ─────────────────────────────────────────────────────────────────────
pub fn timeit<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let t0 = Instant::now();
    let out = f();
    debug!(elapsed = ?t0.elapsed(), "{label}");
    out
}

// ─────────────────────────────────────────────────────────────────────
// Tally and outcomes
// ─────────────────────────────────────────────────────────────────────

/// Run counters, updated from reader and writer threads.
#[derive(Debug, Default)]
pub struct RunTally {
    read_ok:         AtomicUsize,
    read_failed:     AtomicUsize,
    dropped:         AtomicUsize,
    out_of_range:    AtomicUsize,
    buckets_written: AtomicUsize,
    buckets_skipped: AtomicUsize,
    buckets_failed:  AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TallySnapshot {
    pub read_ok:         usize,
    pub read_failed:     usize,
    /// Fragments removed by identity normalization (timing channel) or
    /// carrying an unusable sampling rate.
    pub dropped:         usize,
    /// Day pieces outside the configured day range.
    pub out_of_range:    usize,
    pub buckets_written: usize,
    pub buckets_skipped: usize,
    pub buckets_failed:  usize,
}

impl TallySnapshot {
    pub fn failures(&self) -> usize {
        self.read_failed + self.buckets_failed
    }

    /// Whether the run should exit with a failure status.
    pub fn exceeds(&self, max_failures: Option<usize>) -> bool {
        max_failures.is_some_and(|max| self.failures() > max)
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RunTally {
    pub fn snapshot(&self) -> TallySnapshot {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        TallySnapshot {
            read_ok:         get(&self.read_ok),
            read_failed:     get(&self.read_failed),
            dropped:         get(&self.dropped),
            out_of_range:    get(&self.out_of_range),
            buckets_written: get(&self.buckets_written),
            buckets_skipped: get(&self.buckets_skipped),
            buckets_failed:  get(&self.buckets_failed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    Written,
    Skipped,
    Failed,
}

/// What happened to one bucket; one row of the run report.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketOutcome {
    pub key:               BucketKey,
    pub path:              PathBuf,
    pub status:            BucketStatus,
    pub samples:           usize,
    pub segments:          usize,
    pub gaps:              usize,
    pub overlap_discarded: usize,
    pub trimmed:           usize,
    pub error:             Option<String>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub tally:     TallySnapshot,
    pub outcomes:  Vec<BucketOutcome>,
    pub cancelled: bool,
}

// ─────────────────────────────────────────────────────────────────────
// Assembler
// ─────────────────────────────────────────────────────────────────────

pub struct Assembler {
    config:     AssembleConfig,
    rules:      IdentityRules,
    reconciler: RateReconciler,
    merge:      MergeEngine,
    archive:    ArchiveWriter,
    toolchain:  Toolchain,
    tally:      RunTally,
    cancel:     Arc<AtomicBool>,
}

impl Assembler {
    pub fn new(config: AssembleConfig) -> Self {
        let rules = config.identity_rules();
        let reconciler = config.reconciler();
        let merge = MergeEngine::new(config.gap_fill);
        let archive = ArchiveWriter::new(&config.output_root, config.encoding)
            .with_policy(config.existing)
            .with_merge(merge, reconciler);
        let toolchain = Toolchain::new(&config.demux);
        Self {
            config,
            rules,
            reconciler,
            merge,
            archive,
            toolchain,
            tally: RunTally::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the run between buckets. Buckets not yet
    /// written are regenerated by running again.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        let cfg = &self.config;

        let sources = timeit("discover", || discover_sources(&cfg.input_root, Some(&cfg.output_root)))?;
        info!(root = %cfg.input_root.display(), sources = sources.len(), mode = ?cfg.mode, "assembling");
        if sources.iter().any(|s| s.kind == SourceKind::Suds) {
            if let Err(e) = self.toolchain.check() {
                warn!(error = %e, "demux tool chain unavailable; .WVR sources will be skipped");
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.workers)
            .build()
            .context("building reader thread pool")?;
        let outcomes = pool.install(|| match cfg.mode {
            RunMode::Batch     => self.run_batch(&sources),
            RunMode::Streaming => self.run_streaming(&sources),
        });

        if let Some(report) = &cfg.report {
            write_report(report, &outcomes)?;
            info!(path = %report.display(), rows = outcomes.len(), "wrote run report");
        }

        let tally = self.tally.snapshot();
        info!(
            read_ok         = tally.read_ok,
            read_failed     = tally.read_failed,
            dropped         = tally.dropped,
            out_of_range    = tally.out_of_range,
            buckets_written = tally.buckets_written,
            buckets_skipped = tally.buckets_skipped,
            buckets_failed  = tally.buckets_failed,
            "run finished"
        );
        if tally.failures() > 0 {
            warn!(failures = tally.failures(), "run finished with failures");
        }
        if self.cancelled() {
            warn!("run cancelled; days not written are produced by running again");
        }
        Ok(RunSummary { tally, outcomes, cancelled: self.cancelled() })
    }

    // ─────────────────────────────────────────────────────────────────
    // Batch: read everything, then finalize all buckets in parallel
    // ─────────────────────────────────────────────────────────────────
    fn run_batch(&self, sources: &[Source]) -> Vec<BucketOutcome> {
        let binner = DayBinner::new();
        timeit("read+bin", || {
            sources.par_iter().for_each(|source| {
                for fragment in self.ingest(source).unwrap_or_default() {
                    binner.assign(fragment);
                }
            })
        });

        let keys = binner.keys();
        debug!(buckets = keys.len(), "finalizing");
        timeit("merge+write", || {
            keys.par_iter()
                .filter_map(|key| {
                    if self.cancelled() {
                        return None;
                    }
                    binner.take(key).map(|bucket| self.finalize(bucket, self.config.existing))
                })
                .collect()
        })
    }

    // ─────────────────────────────────────────────────────────────────
    // Streaming: chunks read in parallel, ingested in source order; a day
    // is finalized when its identity moves on to a later day
    // ─────────────────────────────────────────────────────────────────
    fn run_streaming(&self, sources: &[Source]) -> Vec<BucketOutcome> {
        let chunk_size = self.config.chunk_size.max(1);
        let total_batches = sources.len().div_ceil(chunk_size);

        let binner = DayBinner::new();
        let mut tracker = RolloverTracker::new();
        let mut finished: HashMap<BucketKey, BucketStatus> = HashMap::new();
        let mut outcomes = Vec::new();

        for (batch_no, chunk) in sources.chunks(chunk_size).enumerate() {
            if self.cancelled() {
                break;
            }
            debug!(batch = batch_no + 1, of = total_batches, "reading batch");

            let batch: Vec<Vec<Fragment>> = chunk.par_iter().map(|s| self.ingest(s).unwrap_or_default()).collect();

            for fragment in batch.into_iter().flatten() {
                let key = binner.assign(fragment);
                if finished.contains_key(&key) {
                    trace!(id = %key.identity, day = key.day_of_year, "late data for a finalized day");
                }
                // an identity stepping back to an earlier day does not close the later one
                let Some(previous) = tracker.observe(&key).filter(|p| *p < key) else { continue };
                if let Some(bucket) = binner.take(&previous) {
                    let policy = self.policy_after(&previous, &finished);
                    let outcome = self.finalize(bucket, policy);
                    finished.insert(previous, outcome.status);
                    outcomes.push(outcome);
                }
            }
        }

        let rest = binner.keys();
        let tail: Vec<BucketOutcome> = rest
            .par_iter()
            .filter_map(|key| {
                if self.cancelled() {
                    return None;
                }
                let policy = self.policy_after(key, &finished);
                binner.take(key).map(|bucket| self.finalize(bucket, policy))
            })
            .collect();
        outcomes.extend(tail);
        outcomes
    }

    /// A day already written in this run is re-opened by merging into it.
    fn policy_after(&self, key: &BucketKey, finished: &HashMap<BucketKey, BucketStatus>) -> ExistingPolicy {
        match finished.get(key) {
            Some(BucketStatus::Written) => {
                debug!(id = %key.identity, day = key.day_of_year, "re-opening finalized day");
                ExistingPolicy::Merge
            }
            _ => self.config.existing,
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Per source
    // ─────────────────────────────────────────────────────────────────

    /// Reads and prepares one source; `None` when it could not be read.
    fn ingest(&self, source: &Source) -> Option<Vec<Fragment>> {
        match self.read_source(source) {
            Ok(fragments) => {
                bump(&self.tally.read_ok);
                trace!(path = %source.path.display(), traces = fragments.len(), "read");
                Some(self.prepare(fragments))
            }
            Err(e) => {
                bump(&self.tally.read_failed);
                warn!(path = %source.path.display(), error = %e, "skipping unreadable source");
                None
            }
        }
    }

    fn read_source(&self, source: &Source) -> Result<Vec<Fragment>, Error> {
        let fragments = match source.kind {
            SourceKind::MiniSeed => MiniSeed::default().read(&source.path)?,
            SourceKind::Sac      => Sac.read(&source.path)?,
            SourceKind::Suds     => {
                self.toolchain.check()?;
                let mut traces = Vec::new();
                for sac in self.toolchain.run(&source.path)? {
                    match Sac.read(&sac) {
                        Ok(t) => traces.extend(t),
                        Err(e) => warn!(file = %sac.display(), error = %e, "could not read demultiplexed trace"),
                    }
                }
                if traces.is_empty() {
                    return Err(DecodeError::Empty.into());
                }
                traces
            }
        };
        Ok(fragments
            .into_iter()
            .enumerate()
            .map(|(trace, f)| f.with_arrival(Arrival { source: source.index, trace }))
            .collect())
    }

    /// Normalizes identities, snaps rates and cuts at midnights. The
    /// sibling set is the raw station codes of this one source.
    fn prepare(&self, fragments: Vec<Fragment>) -> Vec<Fragment> {
        let siblings = SiblingSet::new(fragments.iter().map(|f| f.identity.station.trim().to_string()));
        let mut out = Vec::with_capacity(fragments.len());

        for mut fragment in fragments {
            let Some(identity) = self.rules.normalize(&fragment.identity, &siblings) else {
                trace!(raw = %fragment.identity, "dropped by identity rules");
                bump(&self.tally.dropped);
                continue;
            };
            if !(fragment.sampling_rate.is_finite() && fragment.sampling_rate > 0.0) {
                warn!(id = %identity, rate = fragment.sampling_rate, "dropping fragment with unusable sampling rate");
                bump(&self.tally.dropped);
                continue;
            }
            fragment.identity = identity;
            self.reconciler.snap_fragment(&mut fragment);

            for piece in split_at_midnights(fragment) {
                if let Some(range) = self.config.day_range {
                    if !range.contains(piece.start.date_naive()) {
                        bump(&self.tally.out_of_range);
                        continue;
                    }
                }
                out.push(piece);
            }
        }
        out
    }

    // ─────────────────────────────────────────────────────────────────
    // Per bucket
    // ─────────────────────────────────────────────────────────────────

    fn finalize(&self, bucket: Bucket, policy: ExistingPolicy) -> BucketOutcome {
        let key = bucket.key.clone();
        let path = self.archive.path_for(&key);

        match self.merge_and_write(bucket, policy) {
            Ok((series, WriteOutcome::Written { samples, segments, .. })) => {
                bump(&self.tally.buckets_written);
                info!(
                    path = %path.display(),
                    samples,
                    segments,
                    gaps = series.gaps.len(),
                    overlap = series.overlap_discarded,
                    "wrote day file"
                );
                BucketOutcome {
                    key,
                    path,
                    status: BucketStatus::Written,
                    samples,
                    segments,
                    gaps: series.gaps.len(),
                    overlap_discarded: series.overlap_discarded,
                    trimmed: series.trimmed,
                    error: None,
                }
            }
            Ok((series, WriteOutcome::Skipped { .. })) => {
                bump(&self.tally.buckets_skipped);
                BucketOutcome {
                    key,
                    path,
                    status: BucketStatus::Skipped,
                    samples: series.sample_count(),
                    segments: series.segments.len(),
                    gaps: series.gaps.len(),
                    overlap_discarded: series.overlap_discarded,
                    trimmed: series.trimmed,
                    error: None,
                }
            }
            Err(e) => {
                bump(&self.tally.buckets_failed);
                warn!(path = %path.display(), error = %e, "day not written");
                BucketOutcome {
                    key,
                    path,
                    status: BucketStatus::Failed,
                    samples: 0,
                    segments: 0,
                    gaps: 0,
                    overlap_discarded: 0,
                    trimmed: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn merge_and_write(&self, mut bucket: Bucket, policy: ExistingPolicy) -> Result<(MergedSeries, WriteOutcome), Error> {
        let rate = self.reconciler.reconcile(&mut bucket)?;
        trace!(id = %bucket.key.identity, rate, fragments = bucket.fragments.len(), "reconciled");
        let series = self.merge.merge(bucket)?;
        let outcome = self.archive.write_with(&series, policy)?;
        Ok((series, outcome))
    }
}
