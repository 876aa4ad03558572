// src/node.rs

//! A vertex in the pipestance graph.
//!
//! Nodes are stored in a flat table ([`crate::graph::Graph`]) and refer to
//! each other by numeric id, so the pre/post relations never form reference
//! cycles. A node owns its forks; its rolled-up state is derived from them
//! and from its prenodes, never stored durably.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::errors::Result;
use crate::binding::Binding;
use crate::fork::Fork;
use crate::graph::{ArgPermute, NodeId};
use crate::jobmgr::{JobManager, JobResources, RetryConfig};
use crate::metadata::{Metadata, MetadataFile};
use crate::overrides::PipestanceOverrides;
use crate::perf::{JobInfo, NodePerfInfo, VersionInfo};
use crate::runtime::RuntimeOptions;
use crate::syntax::invocation::InvocationData;
use crate::syntax::StageCode;
use crate::types::{MetadataState, ProfileMode, StageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Pipeline,
    Stage,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Pipeline => "pipeline",
            NodeKind::Stage => "stage",
        }
    }
}

/// Stage-only attributes.
#[derive(Debug, Clone)]
pub struct StageInfo {
    pub code: StageCode,
    pub split: bool,
}

/// A sweep source contributing forks to a node: the declaration-site root id
/// and its value set.
#[derive(Debug, Clone)]
pub struct SweepBinding {
    pub root_id: String,
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
    pub name: String,
    pub callable_id: String,
    pub fqname: String,
    pub path: PathBuf,
    pub metadata: Metadata,
    pub stage: Option<StageInfo>,
    pub resources: Option<JobResources>,
    pub arg_bindings: Vec<Binding>,
    pub ret_bindings: Vec<Binding>,
    pub disabled: Vec<Binding>,
    pub sweep_bindings: Vec<SweepBinding>,
    pub subnodes: Vec<NodeId>,
    pub prenodes: Vec<NodeId>,
    pub direct_prenodes: Vec<NodeId>,
    pub postnodes: Vec<NodeId>,
    pub forks: Vec<Fork>,
    /// Last state computed by the step loop; refreshed by `step`, not
    /// persisted.
    pub state: MetadataState,
    pub volatile: bool,
    pub strict_volatile: bool,
    pub local: bool,
    pub preflight: bool,
    /// In-memory count of retry resets applied to this node.
    pub restarts: u32,
}

/// First fatal error found under a node.
#[derive(Debug, Clone)]
pub struct FatalErrorInfo {
    pub fqname: String,
    pub preflight: bool,
    pub summary: String,
    pub log: String,
    pub kind: MetadataFile,
    pub paths: Vec<PathBuf>,
}

/// Shared context threaded through the step loop.
pub struct StepEnv<'a> {
    pub config: &'a RuntimeOptions,
    pub job_manager: &'a Arc<dyn JobManager>,
    pub local_job_manager: &'a Arc<dyn JobManager>,
    pub overrides: &'a PipestanceOverrides,
    pub retry: &'a RetryConfig,
    pub invocation: &'a InvocationData,
    pub mro_version: &'a str,
    pub envs: &'a HashMap<String, String>,
    /// Byte cap for large metadata reads; 0 means unlimited.
    pub mem_cap: u64,
}

impl Node {
    /// Find the fork matching a downstream permutation: every one of the
    /// fork's sweep-root entries must equal the target's value for that
    /// root. The lowest index wins; under the sweep invariants at most one
    /// fork can match.
    pub fn match_fork(&self, target: &ArgPermute) -> Option<&Fork> {
        let matched = self
            .forks
            .iter()
            .find(|fork| fork.arg_permute.iter().all(|(k, v)| target.get(k) == Some(v)));
        #[cfg(debug_assertions)]
        if let Some(found) = matched {
            let extra = self.forks.iter().filter(|fork| {
                fork.index != found.index
                    && fork.arg_permute.iter().all(|(k, v)| target.get(k) == Some(v))
            });
            debug_assert_eq!(extra.count(), 0, "multiple forks match one permutation");
        }
        matched
    }

    pub fn get_fork(&self, index: usize) -> Option<&Fork> {
        self.forks.get(index)
    }

    pub fn collect_metadatas(&self) -> Vec<&Metadata> {
        let mut all = vec![&self.metadata];
        for fork in &self.forks {
            all.extend(fork.collect_metadatas());
        }
        all
    }

    /// Seed metadata caches and heartbeat clocks from disk, and rebuild
    /// chunk lists from any stage-defs a previous runtime left behind.
    pub fn load_metadata(&mut self) {
        for md in self.collect_metadatas() {
            md.load_cache();
            md.reset_heartbeat();
        }
        for fork in &mut self.forks {
            fork.load_chunks();
        }
    }

    /// Create the node directory and every fork directory. Fork directories
    /// are created concurrently; pipestances routinely have hundreds.
    pub fn mkdirs(&self) -> Result<()> {
        if let Err(e) = std::fs::create_dir_all(&self.path) {
            let msg = format!("could not create root directory for {}: {e}", self.fqname);
            warn!(fqname = %self.fqname, error = %e, "mkdir failed");
            let _ = self.metadata.write_raw(MetadataFile::Errors, &msg);
            return Err(e.into());
        }
        let errors: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .forks
                .iter()
                .map(|fork| scope.spawn(move || fork.mkdirs()))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().expect("fork mkdir thread panicked").err())
                .collect()
        });
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn check_heartbeats(&self, timeout: Duration) {
        for md in self.collect_metadatas() {
            md.check_heartbeat(timeout);
        }
    }

    pub fn kill(&self, message: &str) {
        for fork in &self.forks {
            fork.kill(message);
        }
    }

    /// Reset this node after a failure. With `FullStageReset` the whole
    /// stage directory is deleted; otherwise completed chunks are preserved.
    /// Journal breadcrumbs for this node are cleared either way.
    pub fn reset(&mut self, full_stage_reset: bool, journal_dir: &Path) -> Result<()> {
        if full_stage_reset {
            info!(fqname = %self.fqname, "(reset)");
            if self.path.exists() {
                std::fs::remove_dir_all(&self.path)?;
            }
            for fork in &mut self.forks {
                fork.reset()?;
            }
        } else {
            for fork in &mut self.forks {
                fork.reset_partial()?;
            }
        }
        clear_journal(journal_dir, &self.fqname);
        self.mkdirs()?;
        self.load_metadata();
        Ok(())
    }

    /// Return queued (and, for a dead local runtime, running) jobs to Ready
    /// so they are resubmitted. No-op under FullStageReset, where failed
    /// stages are rebuilt wholesale.
    pub fn restart_jobs(&mut self, include_running: bool, full_stage_reset: bool) -> Result<()> {
        if full_stage_reset {
            return Ok(());
        }
        for fork in &mut self.forks {
            fork.restart_jobs(include_running)?;
        }
        Ok(())
    }

    /// Walk fork metadatas and report the first fatal error. The summary is
    /// the last line of an assertion, or the second-to-last line of a python
    /// stage's error log (the last is the traceback terminator).
    pub fn get_fatal_error(&self) -> Option<FatalErrorInfo> {
        for md in self.collect_metadatas() {
            if md.get_state() != Some(MetadataState::Failed) {
                continue;
            }
            if md.exists(MetadataFile::Errors) {
                let errlog = md.read_raw(MetadataFile::Errors).unwrap_or_default();
                let lines: Vec<&str> = errlog.lines().collect();
                let is_python = matches!(
                    self.stage.as_ref().map(|s| &s.code),
                    Some(StageCode::Python { .. })
                );
                // Only python stages have a summarizable error log layout
                // (the second-to-last line; the last is the traceback
                // terminator). Other stage kinds get no summary; the full
                // log is still attached.
                let summary = if is_python {
                    if lines.len() >= 2 {
                        lines[lines.len() - 2]
                    } else {
                        lines.first().copied().unwrap_or("<none>")
                    }
                } else {
                    "<none>"
                };
                return Some(FatalErrorInfo {
                    fqname: md.fqname().to_string(),
                    preflight: self.preflight,
                    summary: summary.to_string(),
                    log: errlog.clone(),
                    kind: MetadataFile::Errors,
                    paths: vec![
                        md.file_path(MetadataFile::Errors),
                        md.file_path(MetadataFile::StdOut),
                        md.file_path(MetadataFile::StdErr),
                    ],
                });
            }
            if md.exists(MetadataFile::Assert) {
                let assertlog = md.read_raw(MetadataFile::Assert).unwrap_or_default();
                let summary = assertlog.lines().last().unwrap_or("<none>").to_string();
                return Some(FatalErrorInfo {
                    fqname: md.fqname().to_string(),
                    preflight: self.preflight,
                    summary,
                    log: assertlog,
                    kind: MetadataFile::Assert,
                    paths: vec![md.file_path(MetadataFile::Assert)],
                });
            }
        }
        None
    }

    /// True if this node's failure (if any) matches a configured retry
    /// pattern. Assertions are never transient. Returns the error log for
    /// reporting.
    pub fn is_error_transient(&self, retry: &RetryConfig) -> (bool, String) {
        for md in self.collect_metadatas() {
            if md.get_state() != Some(MetadataState::Failed) {
                continue;
            }
            if md.exists(MetadataFile::Assert) {
                return (false, String::new());
            }
            if md.exists(MetadataFile::Errors) {
                let errlog = md.read_raw(MetadataFile::Errors).unwrap_or_default();
                return (retry.is_transient(&errlog), errlog);
            }
        }
        (true, String::new())
    }

    //
    // Resource requests
    //

    /// Resolve the resource request for one phase: declared resources,
    /// overlaid by the split's job def, overlaid by the overrides file,
    /// clamped by the job manager.
    pub fn get_job_reqs(
        &self,
        env: &StepEnv<'_>,
        job_def: Option<&JobResources>,
        stage_type: StageType,
    ) -> JobResources {
        let mut res = self.resources.clone().unwrap_or_default();
        if let Some(def) = job_def {
            res = res.apply(def);
        }

        res.threads = self.override_num(env, stage_type, "threads", res.threads);
        res.mem_gb = self.override_num(env, stage_type, "mem_gb", res.mem_gb);
        res.vmem_gb = self.override_num(env, stage_type, "vmem_gb", res.vmem_gb);

        let manager = if self.local {
            env.local_job_manager
        } else {
            env.job_manager
        };
        manager.get_system_reqs(&res)
    }

    fn override_num(&self, env: &StepEnv<'_>, stage_type: StageType, key: &str, default: i64) -> i64 {
        let full_key = format!("{stage_type}.{key}");
        let value = env
            .overrides
            .get_override(&self.fqname, &full_key, Value::from(default));
        match value.as_i64() {
            Some(n) => n,
            None => {
                info!(fqname = %self.fqname, key = %full_key, value = %value,
                    "invalid override value; ignoring");
                default
            }
        }
    }

    /// Per-phase profile mode: the override key `<type>.profile` if valid,
    /// else the global configuration.
    pub fn get_profile_mode(&self, env: &StepEnv<'_>, stage_type: StageType) -> ProfileMode {
        let key = format!("{stage_type}.profile");
        let value = env.overrides.get_override(&self.fqname, &key, Value::Null);
        match value {
            Value::Null => env.config.profile_mode,
            Value::String(s) if s.is_empty() => env.config.profile_mode,
            Value::String(s) => match s.parse() {
                Ok(mode) => mode,
                Err(_) => {
                    info!(fqname = %self.fqname, key = %key, value = %s,
                        "invalid profile override; ignoring");
                    env.config.profile_mode
                }
            },
            other => {
                info!(fqname = %self.fqname, key = %key, value = %other,
                    "invalid profile override; ignoring");
                env.config.profile_mode
            }
        }
    }

    //
    // Job dispatch
    //

    pub fn run_split(&self, env: &StepEnv<'_>, metadata: &Metadata, res: &JobResources) {
        self.run_job(env, StageType::Split, metadata, res);
    }

    pub fn run_chunk(&self, env: &StepEnv<'_>, metadata: &Metadata, res: &JobResources) {
        self.run_job(env, StageType::Chunk, metadata, res);
    }

    pub fn run_join(&self, env: &StepEnv<'_>, metadata: &Metadata, res: &JobResources) {
        self.run_job(env, StageType::Join, metadata, res);
    }

    fn run_job(&self, env: &StepEnv<'_>, stage_type: StageType, metadata: &Metadata, res: &JobResources) {
        let stage = self
            .stage
            .as_ref()
            .expect("run_job called on a pipeline node");
        let shell_name = stage_type.shell_name();
        let run_file = metadata
            .journal_file_stem()
            .unwrap_or_else(|| metadata.path().join(metadata.fqname()));
        let run_file = run_file.to_string_lossy().into_owned();
        let md_path = metadata.path().to_string_lossy().into_owned();
        let files_path = metadata.files_path().to_string_lossy().into_owned();

        // The argv layout is the only thing that differs between stage code
        // flavors.
        let (shell_cmd, argv) = match &stage.code {
            StageCode::Python { module } => (
                env.config.mrjob_path.clone(),
                vec![
                    env.config
                        .adapters_path
                        .join("python")
                        .join("martian_shell.py")
                        .to_string_lossy()
                        .into_owned(),
                    module.clone(),
                    shell_name.to_string(),
                    md_path,
                    files_path,
                    run_file,
                ],
            ),
            StageCode::Compiled { cmd } => {
                let mut argv: Vec<String> = cmd.split_whitespace().map(String::from).collect();
                argv.extend([shell_name.to_string(), md_path, files_path, run_file]);
                (env.config.mrjob_path.clone(), argv)
            }
            StageCode::Exec { cmd } => {
                let mut parts = cmd.split_whitespace().map(String::from);
                let exe = PathBuf::from(parts.next().unwrap_or_default());
                let mut argv: Vec<String> = parts.collect();
                argv.extend([shell_name.to_string(), md_path, files_path, run_file]);
                (exe, argv)
            }
        };

        let (job_mode, manager) = if self.local {
            ("local".to_string(), env.local_job_manager)
        } else {
            (env.config.job_mode.clone(), env.job_manager)
        };

        info!(
            "(run:{job_mode}) {}.{shell_name}",
            metadata.fqname()
        );

        let profile_mode = self.get_profile_mode(env, stage_type);
        let job_info = JobInfo {
            name: metadata.fqname().to_string(),
            job_mode: job_mode.clone(),
            threads: res.threads,
            memgb: res.mem_gb,
            vmemgb: res.vmem_gb,
            profile_mode: (profile_mode != ProfileMode::Disable).then(|| profile_mode.to_string()),
            invocation: serde_json::to_value(env.invocation).unwrap_or(Value::Null),
            version: VersionInfo {
                martian: env.config.martian_version.clone(),
                pipelines: env.mro_version.to_string(),
            },
        };
        if let Err(e) = metadata.write_time(MetadataFile::QueuedLocally) {
            warn!(fqname = %metadata.fqname(), error = %e, "could not record queue time");
        }
        if let Err(e) = metadata.write(MetadataFile::JobInfo, &job_info) {
            warn!(fqname = %metadata.fqname(), error = %e, "could not write jobinfo");
        }

        let mut envs = env.envs.clone();
        if let Some(td) = metadata.temp_dir() {
            envs.insert("TMPDIR".to_string(), td.to_string_lossy().into_owned());
        }

        manager.exec_job(
            &shell_cmd,
            argv,
            envs,
            metadata,
            res,
            metadata.fqname(),
            shell_name,
            self.preflight && self.local,
        );
    }

    //
    // Serialization
    //

    pub fn serialize_perf(&self) -> NodePerfInfo {
        NodePerfInfo {
            name: self.name.clone(),
            fqname: self.fqname.clone(),
            kind: self.kind.as_str().to_string(),
            forks: self
                .forks
                .iter()
                .map(|fork| fork.serialize_perf(self.restarts))
                .collect(),
        }
    }
}

/// Remove journal breadcrumbs belonging to a node (its forks and chunks).
pub(crate) fn clear_journal(journal_dir: &Path, fqname: &str) {
    let prefix = format!("{fqname}.");
    if let Ok(entries) = std::fs::read_dir(journal_dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}
