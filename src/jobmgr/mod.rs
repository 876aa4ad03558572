// src/jobmgr/mod.rs

//! Job submission.
//!
//! The engine talks to a [`JobManager`] instead of spawning processes
//! directly. Production uses [`LocalJobManager`] (or a remote/cluster
//! implementation provided by the embedder); tests provide a fake that
//! completes jobs by writing metadata files and journal breadcrumbs.

pub mod local;

pub use local::LocalJobManager;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::Result;
use crate::metadata::Metadata;

/// Resource request for one job. Field names follow the chunk-definition
/// wire format, where resource keys are prefixed with double underscores to
/// keep them apart from stage arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResources {
    #[serde(default, rename = "__threads")]
    pub threads: i64,
    #[serde(default, rename = "__mem_gb")]
    pub mem_gb: i64,
    #[serde(default, rename = "__vmem_gb")]
    pub vmem_gb: i64,
    #[serde(default, rename = "__special", skip_serializing_if = "Option::is_none")]
    pub special: Option<String>,
}

impl JobResources {
    /// Layer a more specific request over this one: zero/empty fields keep
    /// the base value.
    pub fn apply(&self, job_def: &JobResources) -> JobResources {
        JobResources {
            threads: if job_def.threads != 0 {
                job_def.threads
            } else {
                self.threads
            },
            mem_gb: if job_def.mem_gb != 0 {
                job_def.mem_gb
            } else {
                self.mem_gb
            },
            vmem_gb: if job_def.vmem_gb != 0 {
                job_def.vmem_gb
            } else {
                self.vmem_gb
            },
            special: job_def.special.clone().or_else(|| self.special.clone()),
        }
    }
}

/// Submission interface to a local or remote job runner.
///
/// `exec_job` is fire and forget: the job itself writes its metadata files
/// and drops journal breadcrumbs; the engine observes them on later ticks.
pub trait JobManager: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn exec_job(
        &self,
        shell_cmd: &Path,
        argv: Vec<String>,
        envs: HashMap<String, String>,
        metadata: &Metadata,
        res: &JobResources,
        fqname: &str,
        shell_name: &str,
        local_override: bool,
    );

    /// Clamp a request to this manager's capacity.
    fn get_system_reqs(&self, res: &JobResources) -> JobResources;

    /// Duration subtracted from "now" before each journal poll, covering
    /// queue managers whose breadcrumbs may predate their visibility.
    fn queue_check_grace(&self) -> Duration;

    /// Release any reservation held for the job owning `metadata`.
    fn end_job(&self, metadata: &Metadata);

    /// Check queue health; called periodically by the step loop.
    fn refresh_resources(&self, local_mode: bool) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RetryJson {
    #[serde(default)]
    default_retries: u32,
    #[serde(default)]
    retry_on: Vec<String>,
}

/// Which stage failures are considered transient, and how many automatic
/// restarts each failed fork gets.
#[derive(Debug)]
pub struct RetryConfig {
    pub default_retries: u32,
    retry_on: Vec<Regex>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            default_retries: 0,
            retry_on: vec![Regex::new("^signal: ").unwrap()],
        }
    }
}

impl RetryConfig {
    pub fn new(default_retries: u32, patterns: &[&str]) -> Self {
        let mut retry_on = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match Regex::new(pattern) {
                Ok(re) => retry_on.push(re),
                Err(e) => warn!(pattern = %pattern, error = %e, "invalid retry pattern; skipping"),
            }
        }
        RetryConfig {
            default_retries,
            retry_on,
        }
    }

    /// Load `retry.json`. A missing file yields the defaults; invalid
    /// patterns are logged and skipped.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(RetryConfig::default());
        }
        let text = std::fs::read_to_string(path)?;
        let raw: RetryJson = serde_json::from_str(&text)?;
        let mut retry_on = Vec::with_capacity(raw.retry_on.len());
        for pattern in &raw.retry_on {
            match Regex::new(pattern) {
                Ok(re) => retry_on.push(re),
                Err(e) => warn!(pattern = %pattern, error = %e, "invalid retry pattern; skipping"),
            }
        }
        Ok(RetryConfig {
            default_retries: raw.default_retries,
            retry_on,
        })
    }

    /// True if any line of the error log matches a retry pattern.
    pub fn is_transient(&self, errlog: &str) -> bool {
        errlog
            .lines()
            .any(|line| self.retry_on.iter().any(|re| re.is_match(line)))
    }
}
