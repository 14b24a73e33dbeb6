//! Error types for the day-assembly engine and its I/O edges.
//!
//! Per-file and per-bucket failures are values, not aborts: the pipeline
//! logs them, counts them in the run tally and moves on.

use std::{io, path::PathBuf, process::ExitStatus};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A source fragment file could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("truncated input: needed {needed} bytes at offset {offset}, file has {len}")]
    Truncated { offset: usize, needed: usize, len: usize },

    #[error("malformed header: {0}")]
    BadHeader(String),

    #[error("unsupported data encoding code {0}")]
    UnsupportedEncoding(u8),

    #[error("corrupt compressed data: {0}")]
    Corrupt(String),

    #[error("no waveform data found")]
    Empty,
}

/// A series could not be encoded by the container writer.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("sample {index} ({value}) is not representable as a 32-bit integer")]
    NotIntegral { index: usize, value: f64 },

    #[error("difference {0} exceeds the 30-bit STEIM2 range")]
    DifferenceOverflow(i64),

    #[error("invalid sampling rate {0}")]
    InvalidRate(f64),
}

/// A bucket could not be merged into a single day series.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MergeError {
    #[error("incompatible sampling rates after reconciliation: {rates:?}")]
    IncompatibleRate { rates: Vec<f64> },

    #[error("inconsistent bucket: {0}")]
    Inconsistent(String),
}

/// Writing a finished day file failed.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to encode {path}: {source}")]
    Encode { path: PathBuf, source: EncodeError },

    #[error("failed to move {from} into place at {to}: {source}")]
    Rename { from: PathBuf, to: PathBuf, source: io::Error },

    #[error("failed to read existing day file {path}: {source}")]
    Existing { path: PathBuf, source: DecodeError },

    #[error("merge with existing day file failed: {0}")]
    Merge(#[from] MergeError),
}

/// The external legacy-format tool chain failed for one source file.
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("missing tool(s): {}", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    MissingTools(Vec<PathBuf>),

    #[error("could not start {tool}: {source}")]
    Spawn { tool: String, source: io::Error },

    #[error("{tool} failed on {input}: {status}")]
    ToolFailed { tool: String, input: PathBuf, status: ExitStatus },

    #[error("expected output not found: {0}")]
    MissingOutput(PathBuf),

    #[error("source path has no usable file name: {0}")]
    BadSource(PathBuf),
}

/// Configuration could not be loaded or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Any failure surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Demux(#[from] DemuxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
