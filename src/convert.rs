//! One-file-per-source conversions that bypass day assembly.
//!
//! `convert_suds` turns each legacy `.WVR` file into `<base>.mseed`;
//! `bundle_events` packs each event folder of SAC files into
//! `<year>_<folder>.mseed`. Both sort traces by identity then start time
//! before writing, and both keep going after a per-item failure.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Datelike;
use glob::{glob_with, MatchOptions, Pattern};
use regex::Regex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{
    archive::write_file_atomic,
    demux::Toolchain,
    formats::{Encoding, FragmentReader, MiniSeed, Sac},
    fragment::Fragment,
};

/// Event type codes the event folders are expected to use.
pub const EVENT_TYPES: [&str; 3] = ["VT", "HB", "LP"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed:  usize,
}

/// Sorts traces by identity then start time and writes them as one
/// miniSEED file.
pub fn write_bundle(path: &Path, mut traces: Vec<Fragment>, encoding: Encoding) -> Result<()> {
    if traces.is_empty() {
        bail!("no traces to write for {}", path.display());
    }
    traces.sort_by(|a, b| a.identity.cmp(&b.identity).then(a.start.cmp(&b.start)));
    write_file_atomic(path, &MiniSeed::default(), &traces, encoding)?;
    Ok(())
}

/// Reads every file with `reader`, logging and skipping the unreadable ones.
fn read_all(reader: &dyn FragmentReader, files: &[PathBuf]) -> Vec<Fragment> {
    files
        .iter()
        .flat_map(|f| match reader.read(f) {
            Ok(traces) => traces,
            Err(e) => {
                error!(file = %f.display(), error = %e, "could not read");
                Vec::new()
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────
// Legacy archive → miniSEED
// ─────────────────────────────────────────────────────────────────────

/// Target of one source: `<base>.mseed` beside it, or at the same relative
/// place under `output_root`.
pub fn suds_target(wvr: &Path, input_root: &Path, output_root: Option<&Path>) -> Result<PathBuf> {
    let base = wvr.file_stem().and_then(|s| s.to_str()).ok_or_else(|| anyhow!("bad file name {}", wvr.display()))?;
    let dir = wvr.parent().unwrap_or(Path::new("."));
    let out_dir = match output_root {
        Some(out) => out.join(dir.strip_prefix(input_root).unwrap_or(Path::new(""))),
        None => dir.to_path_buf(),
    };
    Ok(out_dir.join(format!("{base}.mseed")))
}

fn is_wvr(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("wvr"))
}

pub fn convert_suds(
    input_root:  &Path,
    output_root: Option<&Path>,
    toolchain:   &Toolchain,
    encoding:    Encoding,
) -> Result<ConvertSummary> {
    toolchain.check()?;

    let mut sources: Vec<PathBuf> = WalkDir::new(input_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_wvr(e.path()))
        .map(|e| e.into_path())
        .collect();
    sources.sort();
    info!(root = %input_root.display(), sources = sources.len(), "converting legacy archive");

    let mut summary = ConvertSummary::default();
    for wvr in &sources {
        let target = suds_target(wvr, input_root, output_root)?;
        if target.exists() {
            debug!(source = %wvr.display(), target = %target.display(), "target exists, skipping");
            summary.skipped += 1;
            continue;
        }
        info!(source = %wvr.display(), "processing");
        match convert_one(wvr, &target, toolchain, encoding) {
            Ok(n) => {
                info!(target = %target.display(), traces = n, "wrote");
                summary.written += 1;
            }
            Err(e) => {
                error!(source = %wvr.display(), error = %format!("{e:#}"), "conversion failed");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

fn convert_one(wvr: &Path, target: &Path, toolchain: &Toolchain, encoding: Encoding) -> Result<usize> {
    let sac_files = toolchain.run(wvr)?;
    let traces = read_all(&Sac, &sac_files);
    if traces.is_empty() {
        bail!("no valid traces among {} SAC file(s)", sac_files.len());
    }
    let n = traces.len();
    write_bundle(target, traces, encoding)?;
    Ok(n)
}

// ─────────────────────────────────────────────────────────────────────
// Event folders → miniSEED
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleSummary {
    pub written:     usize,
    pub failed:      usize,
    /// Event type codes seen in folder names.
    pub event_types: BTreeSet<String>,
}

impl BundleSummary {
    pub fn unexpected_types(&self) -> Vec<&str> {
        self.event_types.iter().map(String::as_str).filter(|t| !EVENT_TYPES.contains(t)).collect()
    }
}

/// `MMDDhhmm.R??` folder names; the capture is the event type.
pub fn event_folder_pattern() -> Result<Regex> {
    Regex::new(r"^\d{8}\.R([A-Z]{2})$").context("event folder pattern")
}

pub fn bundle_events(root: &Path, out_dir: Option<&Path>, encoding: Encoding) -> Result<BundleSummary> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let pattern = event_folder_pattern()?;
    let out_dir = out_dir.unwrap_or(root);

    let mut folders: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("listing {}", root.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    folders.sort();

    let mut summary = BundleSummary::default();
    for folder in &folders {
        let Some(name) = folder.file_name().and_then(|n| n.to_str()) else { continue };
        let Some(caps) = pattern.captures(name) else {
            debug!(folder = name, "not an event folder");
            continue;
        };
        summary.event_types.insert(caps[1].to_string());

        match bundle_event(folder, out_dir, encoding) {
            Ok(path) => {
                info!(path = %path.display(), "wrote");
                summary.written += 1;
            }
            Err(e) => {
                error!(folder = name, error = %format!("{e:#}"), "event failed");
                summary.failed += 1;
            }
        }
    }

    let extra = summary.unexpected_types();
    if extra.is_empty() {
        info!(types = ?summary.event_types, "event types seen");
    } else {
        warn!(extra = ?extra, "event types besides VT/HB/LP found");
    }
    Ok(summary)
}

/// Packs one event folder; returns the written path.
pub fn bundle_event(folder: &Path, out_dir: &Path, encoding: Encoding) -> Result<PathBuf> {
    let opts = MatchOptions { case_sensitive: false, ..MatchOptions::new() };
    let pattern = format!("{}/*.sac", Pattern::escape(&folder.display().to_string()));
    let mut files: Vec<PathBuf> = glob_with(&pattern, opts)?.filter_map(Result::ok).collect();
    files.sort();
    if files.is_empty() {
        bail!("no SAC files in {}", folder.display());
    }

    let traces = read_all(&Sac, &files);
    let first = traces
        .iter()
        .min_by(|a, b| a.identity.cmp(&b.identity).then(a.start.cmp(&b.start)))
        .ok_or_else(|| anyhow!("could not read any SAC file in {}", folder.display()))?;
    let name = folder.file_name().and_then(|n| n.to_str()).unwrap_or("event");
    let path = out_dir.join(format!("{}_{name}.mseed", first.start.year()));

    write_bundle(&path, traces, encoding)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{formats::sac, fragment::Identity};
    use chrono::{TimeZone, Utc};

    #[test]
    fn event_folder_names() {
        let re = event_folder_pattern().unwrap();
        assert_eq!(&re.captures("01041230.RVT").unwrap()[1], "VT");
        assert!(re.captures("0104123.RVT").is_none());
        assert!(re.captures("01041230.Rvt").is_none());
        assert!(re.captures("01041230.RVTX").is_none());
    }

    #[test]
    fn suds_target_mirrors_tree() {
        let wvr = Path::new("/in/2004/01/04-004.WVR");
        assert_eq!(suds_target(wvr, Path::new("/in"), None).unwrap(), PathBuf::from("/in/2004/01/04-004.mseed"));
        assert_eq!(
            suds_target(wvr, Path::new("/in"), Some(Path::new("/out"))).unwrap(),
            PathBuf::from("/out/2004/01/04-004.mseed")
        );
    }

    #[test]
    fn bundles_event_folder_and_flags_odd_types() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let start = Utc.with_ymd_and_hms(2004, 1, 4, 12, 30, 0).unwrap();
        for (folder, station) in [("01041230.RVT", "PIR"), ("01041231.RXX", "BIS")] {
            fs::create_dir(root.join(folder)).unwrap();
            let id = Identity::new("NR", station, "", "EHZ");
            let bytes = sac::build(&id, start, 0.01, &[1.0, 2.0, 3.0], true);
            fs::write(root.join(folder).join(format!("{station}.SAC")), bytes).unwrap();
        }
        fs::create_dir(root.join("misc")).unwrap();
        fs::create_dir(root.join("01041232.RLP")).unwrap();

        let summary = bundle_events(root, None, Encoding::Float32).unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unexpected_types(), vec!["XX"]);

        let back = MiniSeed::default().read(&root.join("2004_01041230.RVT.mseed")).unwrap();
        assert_eq!(back[0].samples, vec![1.0, 2.0, 3.0]);
        assert_eq!(back[0].identity.station, "PIR");
    }
}
