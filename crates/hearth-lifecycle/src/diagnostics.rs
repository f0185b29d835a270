//! Point-in-time memory profile, written on the diagnostic signal.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use hearth_state::epoch_secs;
use serde::Serialize;

use crate::machine::LifecycleState;

const STATUS_PATH: &str = "/proc/self/status";

/// Counters copied from `/proc/self/status`, in kB.
const COUNTERS: [&str; 6] = ["VmRSS", "VmHWM", "VmSize", "VmData", "RssAnon", "RssFile"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryProfile {
    pub taken_at: u64,
    pub pid: u32,
    pub state: LifecycleState,
    pub counters_kb: BTreeMap<String, u64>,
}

impl MemoryProfile {
    /// Sample the current process. Counters are empty where procfs is absent.
    pub fn capture(state: LifecycleState) -> Self {
        let counters_kb = std::fs::read_to_string(STATUS_PATH)
            .map(|text| parse_status(&text))
            .unwrap_or_default();
        Self {
            taken_at: epoch_secs(),
            pid: std::process::id(),
            state,
            counters_kb,
        }
    }
}

/// Extract the tracked counters from procfs status text.
pub fn parse_status(text: &str) -> BTreeMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            if !COUNTERS.contains(&name) {
                return None;
            }
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((name.to_string(), value))
        })
        .collect()
}

/// Write `profile` as JSON to `path`, replacing any previous dump atomically.
pub fn write_profile(path: &Path, profile: &MemoryProfile) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(profile).map_err(io::Error::other)?;
    let tmp = temp_path(path);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
