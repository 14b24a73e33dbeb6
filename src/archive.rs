//! SDS day-file archive.
//!
//! Layout: `<root>/<YYYY>/<NET>/<STA>/<CHA>.D/<NET>.<STA>.<LOC>.<CHA>.D.<YYYY>.<JJJ>`.
//! Files are written to a temporary sibling and renamed into place, so a
//! day file is either absent, the old version or the complete new one.

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    binner::{Bucket, BucketKey},
    error::{ArchiveError, ConfigError, DecodeError, EncodeError},
    formats::{ContainerWriter, Encoding, FragmentReader, MiniSeed},
    fragment::Fragment,
    merge::{MergeEngine, MergedSeries},
    reconcile::RateReconciler,
};

/// Path of the day file for `key` under `root`.
pub fn archive_path(root: &Path, key: &BucketKey) -> PathBuf {
    let id = &key.identity;
    let year = format!("{:04}", key.year);
    root.join(&year)
        .join(&id.network)
        .join(&id.station)
        .join(format!("{}.D", id.channel))
        .join(format!(
            "{}.{}.{}.{}.D.{}.{:03}",
            id.network, id.station, id.location, id.channel, year, key.day_of_year
        ))
}

/// What to do when the day file already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingPolicy {
    #[default]
    Overwrite,
    Skip,
    /// Merge the new series into the existing file's contents; the
    /// archived samples win overlaps.
    Merge,
}

impl FromStr for ExistingPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(ExistingPolicy::Overwrite),
            "skip"      => Ok(ExistingPolicy::Skip),
            "merge"     => Ok(ExistingPolicy::Merge),
            _ => Err(ConfigError::Invalid(format!("unknown existing-file policy '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written { path: PathBuf, samples: usize, segments: usize },
    Skipped { path: PathBuf },
}

impl WriteOutcome {
    pub fn path(&self) -> &Path {
        match self {
            WriteOutcome::Written { path, .. } | WriteOutcome::Skipped { path } => path,
        }
    }
}

#[derive(Clone)]
pub struct ArchiveWriter {
    root:       PathBuf,
    encoding:   Encoding,
    policy:     ExistingPolicy,
    writer:     Arc<dyn ContainerWriter>,
    reader:     Arc<dyn FragmentReader>,
    merge:      MergeEngine,
    reconciler: RateReconciler,
}

impl ArchiveWriter {
    pub fn new(root: impl Into<PathBuf>, encoding: Encoding) -> Self {
        Self {
            root: root.into(),
            encoding,
            policy: ExistingPolicy::default(),
            writer: Arc::new(MiniSeed::default()),
            reader: Arc::new(MiniSeed::default()),
            merge: MergeEngine::default(),
            reconciler: RateReconciler::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExistingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Engine and reconciler used when merging into an existing file.
    pub fn with_merge(mut self, merge: MergeEngine, reconciler: RateReconciler) -> Self {
        self.merge = merge;
        self.reconciler = reconciler;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &BucketKey) -> PathBuf {
        archive_path(&self.root, key)
    }

    pub fn write(&self, series: &MergedSeries) -> Result<WriteOutcome, ArchiveError> {
        self.write_with(series, self.policy)
    }

    /// Writes `series` with an explicit existing-file policy.
    pub fn write_with(&self, series: &MergedSeries, policy: ExistingPolicy) -> Result<WriteOutcome, ArchiveError> {
        let path = self.path_for(&series.key);
        let exists = path.is_file();

        let merged;
        let series = match policy {
            ExistingPolicy::Skip if exists => {
                debug!(path = %path.display(), "day file exists, skipping");
                return Ok(WriteOutcome::Skipped { path });
            }
            ExistingPolicy::Merge if exists => {
                merged = self.merge_existing(series, &path)?;
                &merged
            }
            _ => series,
        };

        write_file_atomic(&path, self.writer.as_ref(), &series.segments, self.encoding)?;
        Ok(WriteOutcome::Written { path, samples: series.sample_count(), segments: series.segments.len() })
    }

    /// Day-file contents for `key`, if the file exists.
    pub fn load_existing(&self, key: &BucketKey) -> Result<Option<Vec<Fragment>>, ArchiveError> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        match self.reader.read(&path) {
            Ok(fragments) => Ok(Some(fragments.into_iter().filter(|f| f.identity == key.identity).collect())),
            Err(DecodeError::Empty) => Ok(Some(Vec::new())),
            Err(source) => Err(ArchiveError::Existing { path, source }),
        }
    }

    fn merge_existing(&self, series: &MergedSeries, path: &Path) -> Result<MergedSeries, ArchiveError> {
        let existing = self.load_existing(&series.key)?.unwrap_or_default();
        let (day_start, day_end) = (series.key.day_start(), series.key.day_end());
        let mut fragments: Vec<Fragment> = existing
            .into_iter()
            .filter(|f| matches!((day_start, day_end), (Some(s), Some(e)) if f.start >= s && f.start < e))
            .collect();
        debug!(path = %path.display(), archived = fragments.len(), "merging into existing day file");

        // archived fragments carry the default arrival, so they win ties
        fragments.extend(series.segments.iter().cloned());
        let mut bucket = Bucket { key: series.key.clone(), fragments };
        self.reconciler.reconcile(&mut bucket)?;
        let mut merged = self.merge.merge(bucket)?;
        merged.overlap_discarded += series.overlap_discarded;
        merged.trimmed += series.trimmed;
        Ok(merged)
    }
}

/// Encodes `segments` into `path` via a temporary sibling and a rename.
/// A failed attempt is retried once after re-creating the parent
/// directory; the temporary file never outlives a failure.
pub fn write_file_atomic(
    path:     &Path,
    writer:   &dyn ContainerWriter,
    segments: &[Fragment],
    encoding: Encoding,
) -> Result<(), ArchiveError> {
    match try_write(path, writer, segments, encoding) {
        Err(e) if retryable(&e) => {
            warn!(path = %path.display(), error = %e, "write failed, retrying once");
            try_write(path, writer, segments, encoding)
        }
        other => other,
    }
}

fn try_write(path: &Path, writer: &dyn ContainerWriter, segments: &[Fragment], encoding: Encoding) -> Result<(), ArchiveError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| ArchiveError::CreateDir { path: dir.to_path_buf(), source })?;
    }

    let tmp = temp_path(path);
    let result = encode_to(&tmp, writer, segments, encoding).and_then(|()| {
        fs::rename(&tmp, path).map_err(|source| ArchiveError::Rename {
            from: tmp.clone(),
            to: path.to_path_buf(),
            source,
        })
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn encode_to(tmp: &Path, writer: &dyn ContainerWriter, segments: &[Fragment], encoding: Encoding) -> Result<(), ArchiveError> {
    let encode_err = |source: EncodeError| ArchiveError::Encode { path: tmp.to_path_buf(), source };
    let file = File::create(tmp).map_err(|e| encode_err(e.into()))?;
    let mut out = BufWriter::new(file);
    writer.write(&mut out, segments, encoding).map_err(encode_err)?;
    let file = out.into_inner().map_err(|e| encode_err(e.into_error().into()))?;
    file.sync_all().map_err(|e| encode_err(e.into()))
}

fn retryable(e: &ArchiveError) -> bool {
    match e {
        ArchiveError::Encode { source, .. } => matches!(source, EncodeError::Io(_)),
        ArchiveError::CreateDir { .. } | ArchiveError::Rename { .. } => true,
        _ => false,
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.part", std::process::id()))
}
