//! Waveform containers at the edge of the engine.
//!
//! The engine only needs "read fragments from a file" and "write a series
//! of segments to a stream"; these traits are that boundary.

pub mod mseed;
pub mod sac;
pub mod steim;

use std::{fmt, io::Write, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, DecodeError, EncodeError},
    fragment::Fragment,
};

pub use mseed::MiniSeed;
pub use sac::Sac;

pub trait FragmentReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<Fragment>, DecodeError>;
}

pub trait ContainerWriter: Send + Sync {
    /// Writes `segments` (each contiguous, in time order) to `out`.
    fn write(&self, out: &mut dyn Write, segments: &[Fragment], encoding: Encoding) -> Result<(), EncodeError>;
}

/// Sample encoding of written records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Encoding {
    /// Samples are rounded to `f32`; `NaN` survives.
    #[default]
    Float32,
    Float64,
    Int32,
    /// Compressed integers. Samples must be integral.
    Steim2,
}

impl Encoding {
    pub fn is_integer(self) -> bool {
        matches!(self, Encoding::Int32 | Encoding::Steim2)
    }
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FLOAT32" => Ok(Encoding::Float32),
            "FLOAT64" => Ok(Encoding::Float64),
            "INT32"   => Ok(Encoding::Int32),
            "STEIM2"  => Ok(Encoding::Steim2),
            _ => Err(ConfigError::Invalid(format!("unknown encoding '{s}' (FLOAT32, FLOAT64, INT32, STEIM2)"))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Float32 => "FLOAT32",
            Encoding::Float64 => "FLOAT64",
            Encoding::Int32   => "INT32",
            Encoding::Steim2  => "STEIM2",
        };
        f.write_str(name)
    }
}

/// Kind of a discovered source file, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    MiniSeed,
    Sac,
    /// Legacy multiplexed archive; needs the external demux tool chain.
    Suds,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mseed" | "miniseed" | "msd" => Some(SourceKind::MiniSeed),
            "sac"                        => Some(SourceKind::Sac),
            "wvr"                        => Some(SourceKind::Suds),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_names_round_trip_through_display() {
        for e in [Encoding::Float32, Encoding::Float64, Encoding::Int32, Encoding::Steim2] {
            assert_eq!(e.to_string().parse::<Encoding>().unwrap(), e);
        }
        assert_eq!("steim2".parse::<Encoding>().unwrap(), Encoding::Steim2);
        assert!("STEIM3".parse::<Encoding>().is_err());
    }

    #[test]
    fn source_kind_is_case_insensitive() {
        assert_eq!(SourceKind::from_path(Path::new("a/04-004.WVR")), Some(SourceKind::Suds));
        assert_eq!(SourceKind::from_path(Path::new("x.MSEED")), Some(SourceKind::MiniSeed));
        assert_eq!(SourceKind::from_path(Path::new("x.sac")), Some(SourceKind::Sac));
        assert_eq!(SourceKind::from_path(Path::new("x.png")), None);
    }
}
