// src/perf.rs

//! Serialization records for `_perf`, `_vdrkill`, `_jobinfo` and
//! `_finalstate`.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::types::MetadataState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub martian: String,
    pub pipelines: String,
}

/// Description of a submitted job, written to `_jobinfo` at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub job_mode: String,
    pub threads: i64,
    pub memgb: i64,
    pub vmemgb: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_mode: Option<String>,
    pub invocation: serde_json::Value,
    pub version: VersionInfo,
}

/// One timed element of a fork's execution (the split, one chunk, the join,
/// or the fork as a whole).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfElement {
    pub fqname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Local>>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPerfInfo {
    pub index: usize,
    pub chunk_stats: PerfElement,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForkPerfInfo {
    pub index: usize,
    pub fork_stats: PerfElement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_stats: Option<PerfElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_stats: Option<PerfElement>,
    pub chunks: Vec<ChunkPerfInfo>,
    /// How many times this fork was reset and resubmitted after a transient
    /// failure.
    pub num_restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vdr_kill: Option<VdrKillReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePerfInfo {
    pub name: String,
    pub fqname: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub forks: Vec<ForkPerfInfo>,
}

/// One file deletion performed by the VDR collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdrEvent {
    pub path: String,
    pub bytes: u64,
    pub timestamp: DateTime<Local>,
}

/// Summary written to a fork's `_vdrkill` after collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VdrKillReport {
    pub count: usize,
    pub size: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<VdrEvent>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
}

/// Final-state records written to `_finalstate` on terminal exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeErrorInfo {
    pub fqname: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeInfo {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: usize,
    pub state: MetadataState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkInfo {
    pub index: usize,
    pub state: MetadataState,
    pub arg_permute: serde_json::Map<String, serde_json::Value>,
    pub chunks: Vec<ChunkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub fqname: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub state: MetadataState,
    pub forks: Vec<ForkInfo>,
    pub edges: Vec<EdgeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeErrorInfo>,
}
