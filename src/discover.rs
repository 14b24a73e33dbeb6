use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

use crate::formats::SourceKind;

/// A source file and its position in enumeration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// 1-based; 0 is reserved for fragments read back from the archive.
    pub index: usize,
    pub path:  PathBuf,
    pub kind:  SourceKind,
}

/// All recognised source files under `root`, sorted by path. Anything
/// under `skip` (typically an output tree nested in the input) and hidden
/// files are ignored.
pub fn discover_sources(root: &Path, skip: Option<&Path>) -> Result<Vec<Source>> {
    let mut paths = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || (skip.map_or(true, |s| e.path() != s) && !is_hidden(e.path())));

    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(kind) = SourceKind::from_path(entry.path()) {
            paths.push((entry.into_path(), kind));
        }
    }
    paths.sort();
    debug!(root = %root.display(), found = paths.len(), "discovered sources");

    Ok(paths
        .into_iter()
        .enumerate()
        .map(|(i, (path, kind))| Source { index: i + 1, path, kind })
        .collect())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with('.'))
}
