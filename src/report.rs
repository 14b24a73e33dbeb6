//! Per-bucket CSV run report.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::pipeline::{BucketOutcome, BucketStatus};

#[derive(Debug, Serialize)]
struct Row<'a> {
    id:                String,
    year:              i32,
    day:               u32,
    path:              String,
    status:            &'a str,
    samples:           usize,
    segments:          usize,
    gaps:              usize,
    overlap_discarded: usize,
    trimmed:           usize,
    error:             &'a str,
}

impl BucketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BucketStatus::Written => "written",
            BucketStatus::Skipped => "skipped",
            BucketStatus::Failed  => "failed",
        }
    }
}

/// Writes one row per bucket, in key order.
pub fn write_report(path: &Path, outcomes: &[BucketOutcome]) -> Result<()> {
    let mut sorted: Vec<&BucketOutcome> = outcomes.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("creating report {}", path.display()))?;
    for o in sorted {
        wtr.serialize(Row {
            id:                o.key.identity.to_string(),
            year:              o.key.year,
            day:               o.key.day_of_year,
            path:              o.path.display().to_string(),
            status:            o.status.as_str(),
            samples:           o.samples,
            segments:          o.segments,
            gaps:              o.gaps,
            overlap_discarded: o.overlap_discarded,
            trimmed:           o.trimmed,
            error:             o.error.as_deref().unwrap_or(""),
        })?;
    }
    wtr.flush()?;
    Ok(())
}
