// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::MartianError;

/// State of a node, fork or chunk, as derived from the metadata files present
/// in its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataState {
    /// Blocked on an incomplete prenode.
    Waiting,
    /// Eligible to run; nothing dispatched yet.
    Ready,
    /// Submitted to a job manager but not yet observed running.
    Queued,
    Running,
    Complete,
    Failed,
    /// A `disabled` modifier binding resolved truthy.
    #[serde(rename = "disabled")]
    DisabledState,
    /// Structurally alive, but the enclosing pipeline fork has not settled
    /// yet; the node leaves the frontier until its parent advances.
    #[serde(rename = "forkwaiting")]
    ForkWaiting,
}

impl MetadataState {
    /// True for states that satisfy a downstream dependency.
    pub fn satisfied(self) -> bool {
        matches!(self, MetadataState::Complete | MetadataState::DisabledState)
    }
}

impl fmt::Display for MetadataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetadataState::Waiting => "waiting",
            MetadataState::Ready => "ready",
            MetadataState::Queued => "queued",
            MetadataState::Running => "running",
            MetadataState::Complete => "complete",
            MetadataState::Failed => "failed",
            MetadataState::DisabledState => "disabled",
            MetadataState::ForkWaiting => "forkwaiting",
        };
        f.write_str(s)
    }
}

/// Volatile Data Removal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VdrMode {
    /// Collect after each node completes.
    Rolling,
    /// Collect once, after the whole pipestance completes.
    Post,
    /// Never collect.
    Disable,
}

impl Default for VdrMode {
    fn default() -> Self {
        VdrMode::Rolling
    }
}

impl FromStr for VdrMode {
    type Err = MartianError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rolling" => Ok(VdrMode::Rolling),
            "post" => Ok(VdrMode::Post),
            "disable" => Ok(VdrMode::Disable),
            other => Err(MartianError::InvalidVdrMode(other.to_string())),
        }
    }
}

impl fmt::Display for VdrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VdrMode::Rolling => "rolling",
            VdrMode::Post => "post",
            VdrMode::Disable => "disable",
        };
        f.write_str(s)
    }
}

/// Stage profiling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileMode {
    Disable,
    Cpu,
    Mem,
    Line,
    Perf,
}

impl Default for ProfileMode {
    fn default() -> Self {
        ProfileMode::Disable
    }
}

impl FromStr for ProfileMode {
    type Err = MartianError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Ok(ProfileMode::Disable),
            "cpu" => Ok(ProfileMode::Cpu),
            "mem" => Ok(ProfileMode::Mem),
            "line" => Ok(ProfileMode::Line),
            "perf" => Ok(ProfileMode::Perf),
            other => Err(MartianError::InvalidProfileMode(other.to_string())),
        }
    }
}

impl fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProfileMode::Disable => "disable",
            ProfileMode::Cpu => "cpu",
            ProfileMode::Mem => "mem",
            ProfileMode::Line => "line",
            ProfileMode::Perf => "perf",
        };
        f.write_str(s)
    }
}

/// Phase of a stage's work: split plans the chunks, chunks do the main work,
/// join merges the chunk outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageType {
    Split,
    Chunk,
    Join,
}

impl StageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StageType::Split => "split",
            StageType::Chunk => "chunk",
            StageType::Join => "join",
        }
    }

    /// The shell command name passed to the stage adapter.
    pub fn shell_name(self) -> &'static str {
        match self {
            StageType::Split => "split",
            StageType::Chunk => "main",
            StageType::Join => "join",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vdr_mode_parses_known_modes_only() {
        assert_eq!("rolling".parse::<VdrMode>().unwrap(), VdrMode::Rolling);
        assert_eq!("POST".parse::<VdrMode>().unwrap(), VdrMode::Post);
        assert!("aggressive".parse::<VdrMode>().is_err());
    }

    #[test]
    fn metadata_state_serde_names_are_stable() {
        let s = serde_json::to_string(&MetadataState::DisabledState).unwrap();
        assert_eq!(s, "\"disabled\"");
        let s = serde_json::to_string(&MetadataState::Complete).unwrap();
        assert_eq!(s, "\"complete\"");
    }
}
