//! External tool chain for legacy multiplexed `.WVR` archives.
//!
//! Three tools run in the source file's own directory:
//! `demux <base>.WVR` writes `<base>.DMX`, `irig <base>.DMX` fixes its
//! timing in place and `sud2sac <base>.DMX` writes one SAC file per
//! channel as `<base>.sac-*` (some builds use `.SAC-*`).

use std::{
    env,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use glob::{glob_with, MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DemuxError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Directory holding the three tools; relative paths are resolved
    /// against the working directory at start-up.
    pub tool_dir: PathBuf,
    /// Program the tools are run through, e.g. `wine`.
    pub launcher: Option<String>,
    pub demux:    String,
    pub irig:     String,
    pub sud2sac:  String,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            tool_dir: PathBuf::from("winsuds").join("bin"),
            launcher: None,
            demux:    "demux.exe".to_string(),
            irig:     "irig.exe".to_string(),
            sud2sac:  "sud2sac.exe".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Toolchain {
    demux:    PathBuf,
    irig:     PathBuf,
    sud2sac:  PathBuf,
    launcher: Option<String>,
}

impl Toolchain {
    pub fn new(config: &DemuxConfig) -> Self {
        let dir = if config.tool_dir.is_absolute() {
            config.tool_dir.clone()
        } else {
            env::current_dir().map(|cwd| cwd.join(&config.tool_dir)).unwrap_or_else(|_| config.tool_dir.clone())
        };
        Self {
            demux:    dir.join(&config.demux),
            irig:     dir.join(&config.irig),
            sud2sac:  dir.join(&config.sud2sac),
            launcher: config.launcher.clone(),
        }
    }

    pub fn tools(&self) -> [&Path; 3] {
        [self.demux.as_path(), self.irig.as_path(), self.sud2sac.as_path()]
    }

    /// Fails listing every tool that is not present.
    pub fn check(&self) -> Result<(), DemuxError> {
        let missing: Vec<PathBuf> = self.tools().into_iter().filter(|p| !p.is_file()).map(Path::to_path_buf).collect();
        if missing.is_empty() { Ok(()) } else { Err(DemuxError::MissingTools(missing)) }
    }

    /// Runs the chain on one `.WVR` file and returns the SAC files it
    /// produced, sorted.
    pub fn run(&self, wvr: &Path) -> Result<Vec<PathBuf>, DemuxError> {
        let (dir, base, name) = split_source(wvr)?;

        self.invoke(&self.demux, &name, &dir, wvr)?;
        let dmx_name = format!("{base}.DMX");
        let dmx = dir.join(&dmx_name);
        if !dmx.is_file() {
            return Err(DemuxError::MissingOutput(dmx));
        }
        self.invoke(&self.irig, &dmx_name, &dir, wvr)?;
        self.invoke(&self.sud2sac, &dmx_name, &dir, wvr)?;

        let outputs = sac_outputs(&dir, &base);
        if outputs.is_empty() {
            return Err(DemuxError::MissingOutput(dir.join(format!("{base}.sac-*"))));
        }
        Ok(outputs)
    }

    fn invoke(&self, tool: &Path, arg: &str, cwd: &Path, source: &Path) -> Result<(), DemuxError> {
        let mut cmd = match &self.launcher {
            Some(launcher) => {
                let mut c = Command::new(launcher);
                c.arg(tool);
                c
            }
            None => Command::new(tool),
        };
        let tool_name = tool.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        debug!(tool = %tool_name, arg, cwd = %cwd.display(), "running");

        let status = cmd
            .arg(arg)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .status()
            .map_err(|source| DemuxError::Spawn { tool: tool_name.clone(), source })?;
        if !status.success() {
            return Err(DemuxError::ToolFailed { tool: tool_name, input: source.to_path_buf(), status });
        }
        Ok(())
    }
}

/// Directory, base name and file name of a source file.
fn split_source(wvr: &Path) -> Result<(PathBuf, String, String), DemuxError> {
    let bad = || DemuxError::BadSource(wvr.to_path_buf());
    let name = wvr.file_name().and_then(|n| n.to_str()).ok_or_else(bad)?.to_string();
    let base = wvr.file_stem().and_then(|n| n.to_str()).ok_or_else(bad)?.to_string();
    let dir = match wvr.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, base, name))
}

/// `<base>.sac-*` and `<base>.SAC-*` files in `dir`, sorted and distinct.
pub fn sac_outputs(dir: &Path, base: &str) -> Vec<PathBuf> {
    let opts = MatchOptions { case_sensitive: true, ..MatchOptions::new() };
    let prefix = Pattern::escape(&dir.display().to_string());
    let base = Pattern::escape(base);

    let mut out: Vec<PathBuf> = ["sac", "SAC"]
        .iter()
        .filter_map(|ext| glob_with(&format!("{prefix}/{base}.{ext}-*"), opts).ok())
        .flat_map(|paths| paths.filter_map(Result::ok))
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_tools_are_all_listed() {
        let dir = tempfile::tempdir().unwrap();
        let config = DemuxConfig { tool_dir: dir.path().to_path_buf(), ..DemuxConfig::default() };
        fs::write(dir.path().join("irig.exe"), b"").unwrap();

        match Toolchain::new(&config).check() {
            Err(DemuxError::MissingTools(missing)) => {
                assert_eq!(missing, vec![dir.path().join("demux.exe"), dir.path().join("sud2sac.exe")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sac_outputs_match_both_cases() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["04-004.sac-PIRZ", "04-004.SAC-BISL", "04-005.sac-PIRZ", "04-004.DMX"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = sac_outputs(dir.path(), "04-004");
        let names: Vec<_> = found.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["04-004.SAC-BISL", "04-004.sac-PIRZ"]);
    }

    /// Writes executable shell scripts named after the three tools.
    #[cfg(unix)]
    fn shell_tools(dir: &Path, demux: &str, irig: &str, sud2sac: &str) -> Toolchain {
        use std::os::unix::fs::PermissionsExt;

        let config = DemuxConfig { tool_dir: dir.to_path_buf(), ..DemuxConfig::default() };
        for (name, body) in [(&config.demux, demux), (&config.irig, irig), (&config.sud2sac, sud2sac)] {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        Toolchain::new(&config)
    }

    #[cfg(unix)]
    #[test]
    fn tool_chain_collects_sac_outputs() {
        let tools = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let wvr = data.path().join("04-004.WVR");
        fs::write(&wvr, b"raw").unwrap();

        let chain = shell_tools(
            tools.path(),
            r#"touch "${1%.*}.DMX""#,
            "exit 0",
            r#"touch "${1%.*}.sac-PIRZ" "${1%.*}.sac-PIRN""#,
        );
        chain.check().unwrap();
        let outputs = chain.run(&wvr).unwrap();
        assert_eq!(outputs, vec![data.path().join("04-004.sac-PIRN"), data.path().join("04-004.sac-PIRZ")]);
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_reports_its_exit_status() {
        let tools = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let wvr = data.path().join("04-004.WVR");
        fs::write(&wvr, b"raw").unwrap();

        let chain = shell_tools(tools.path(), "exit 3", "exit 3", "exit 3");
        match chain.run(&wvr) {
            Err(DemuxError::ToolFailed { tool, input, status }) => {
                assert_eq!(tool, "demux.exe");
                assert_eq!(input, wvr);
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn silent_tool_without_output_is_missing_output() {
        let tools = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let wvr = data.path().join("04-004.WVR");
        fs::write(&wvr, b"raw").unwrap();

        let chain = shell_tools(tools.path(), "exit 0", "exit 0", "exit 0");
        match chain.run(&wvr) {
            Err(DemuxError::MissingOutput(path)) => assert_eq!(path, data.path().join("04-004.DMX")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn relative_tool_dir_is_anchored() {
        let chain = Toolchain::new(&DemuxConfig::default());
        assert!(chain.tools().iter().all(|p| p.is_absolute()));
    }
}
