//! Assembles fragmented seismic waveform files into an SDS archive of
//! per-channel, per-day miniSEED files.

pub mod archive;
pub mod binner;
pub mod config;
pub mod convert;
pub mod demux;
pub mod discover;
pub mod error;
pub mod formats;
pub mod fragment;
pub mod identity;
pub mod merge;
pub mod pipeline;
pub mod reconcile;
pub mod report;
pub mod split;

pub use archive::{archive_path, ArchiveWriter, ExistingPolicy, WriteOutcome};
pub use binner::{Bucket, BucketKey, DayBinner, RolloverTracker};
pub use config::{AssembleConfig, DayRange, RunMode};
pub use error::{Error, Result};
pub use formats::{ContainerWriter, Encoding, FragmentReader, MiniSeed, Sac};
pub use fragment::{Arrival, Fragment, Identity};
pub use identity::{IdentityRules, SiblingSet};
pub use merge::{GapFill, MergeEngine, MergedSeries};
pub use pipeline::{Assembler, BucketOutcome, BucketStatus, RunSummary, TallySnapshot};
pub use reconcile::RateReconciler;
pub use split::split_at_midnights;
