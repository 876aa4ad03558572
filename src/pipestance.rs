// src/pipestance.rs

//! The top-level owner of one running pipeline instance.
//!
//! A pipestance is rooted at a directory on a shared filesystem. It holds
//! the advisory lock, writes the top-level metadata files, drives the
//! frontier scheduler from its run loop, and reports the final state.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::errors::{MartianError, Result};
use crate::frontier::Frontier;
use crate::graph::{Graph, NodeId};
use crate::journal;
use crate::metadata::{Metadata, MetadataFile};
use crate::node::{FatalErrorInfo, StepEnv};
use crate::perf::{ChunkInfo, EdgeInfo, ForkInfo, NodeErrorInfo, NodeInfo, NodePerfInfo};
use crate::runtime::Runtime;
use crate::syntax::invocation::InvocationData;
use crate::types::{MetadataState, VdrMode};

/// Terminal outcome of a pipestance run.
#[derive(Debug, Clone)]
pub enum PipestanceFinal {
    Complete,
    /// The whole pipestance was disabled; this exits successfully.
    Disabled,
    Failed { error: Option<FatalErrorInfo> },
}

impl PipestanceFinal {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipestanceFinal::Complete | PipestanceFinal::Disabled => 0,
            PipestanceFinal::Failed { error } => match error {
                Some(e) if e.preflight => 3,
                _ => 2,
            },
        }
    }

    pub fn state(&self) -> MetadataState {
        match self {
            PipestanceFinal::Complete => MetadataState::Complete,
            PipestanceFinal::Disabled => MetadataState::DisabledState,
            PipestanceFinal::Failed { .. } => MetadataState::Failed,
        }
    }
}

#[derive(Debug)]
pub struct Pipestance {
    psid: String,
    path: PathBuf,
    metadata: Metadata,
    invocation: InvocationData,
    graph: Graph,
    frontier: Frontier,
    journal_dir: PathBuf,
    tmp_path: PathBuf,
    mro_version: String,
    envs: HashMap<String, String>,
    read_only: bool,
    locked: bool,
}

impl Pipestance {
    pub(crate) fn new(
        psid: impl Into<String>,
        path: impl Into<PathBuf>,
        invocation: InvocationData,
        graph: Graph,
        mro_version: impl Into<String>,
        envs: HashMap<String, String>,
        read_only: bool,
    ) -> Self {
        let path = path.into();
        let psid = psid.into();
        Pipestance {
            metadata: Metadata::new(format!("ID.{psid}"), &path),
            journal_dir: path.join("journal"),
            tmp_path: path.join("tmp"),
            psid,
            path,
            invocation,
            graph,
            frontier: Frontier::new(),
            mro_version: mro_version.into(),
            envs,
            read_only,
            locked: false,
        }
    }

    pub fn psid(&self) -> &str {
        &self.psid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn invocation(&self) -> &InvocationData {
        &self.invocation
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    //
    // Locking
    //

    /// Take the advisory lock. At most one live writer may hold it.
    pub fn lock(&mut self) -> Result<()> {
        let lock_path = self.metadata.file_path(MetadataFile::Lock);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {
                self.locked = true;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(MartianError::PipestanceLocked(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn unlock(&mut self) {
        if self.locked {
            let _ = fs::remove_file(self.metadata.file_path(MetadataFile::Lock));
            self.locked = false;
        }
    }

    //
    // Setup
    //

    pub(crate) fn mkdirs(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        fs::create_dir_all(&self.journal_dir)?;
        fs::create_dir_all(&self.tmp_path)?;
        for id in self.graph.ids() {
            self.graph.node(id).mkdirs()?;
        }
        Ok(())
    }

    /// Seed every node's metadata cache from disk, compute initial states
    /// and put everything on the frontier.
    pub fn load_metadata(&mut self) {
        let ids: Vec<NodeId> = self.graph.ids().collect();
        for &id in &ids {
            self.graph.node_mut(id).load_metadata();
        }
        for &id in &ids {
            let state = self.graph.node_state(id);
            let node = self.graph.node_mut(id);
            node.state = state;
            let fqname = node.fqname.clone();
            self.frontier.add(&fqname, id);
        }
    }

    pub fn set_uuid(&self, uuid: &str) -> Result<()> {
        self.metadata.write_raw(MetadataFile::Uuid, uuid)
    }

    /// Reattachment must use the job mode the pipestance was started with.
    pub fn verify_job_mode(&self, job_mode: &str) -> Result<()> {
        if !self.metadata.exists(MetadataFile::JobMode) {
            return Ok(());
        }
        let expected = self.metadata.read_raw(MetadataFile::JobMode)?;
        let expected = expected.trim();
        if expected != job_mode {
            return Err(MartianError::JobModeMismatch {
                expected: expected.to_string(),
                actual: job_mode.to_string(),
            });
        }
        Ok(())
    }

    //
    // Stepping
    //

    /// One journal-watcher pass.
    pub fn refresh_state(&self, rt: &Runtime) {
        journal::refresh_state(
            &self.graph,
            &self.frontier,
            &self.journal_dir,
            rt.job_manager.queue_check_grace(),
            self.read_only,
        );
    }

    /// Step every frontier node once and check heartbeats. Returns true if
    /// any node's state changed.
    pub fn step_nodes(&mut self, rt: &Runtime) -> bool {
        if let Err(e) = rt
            .job_manager
            .refresh_resources(rt.config.job_mode == "local")
        {
            warn!(error = %e, "job manager resource refresh failed");
        }
        let mut changed = false;
        for id in self.frontier.node_ids() {
            let env = StepEnv {
                config: &rt.config,
                job_manager: &rt.job_manager,
                local_job_manager: &rt.local_job_manager,
                overrides: &rt.overrides,
                retry: &rt.retry,
                invocation: &self.invocation,
                mro_version: &self.mro_version,
                envs: &self.envs,
                mem_cap: rt.free_mem_bytes() / 2,
            };
            changed |= self.graph.step_node(&env, &self.frontier, id);
        }
        for id in self.frontier.node_ids() {
            self.graph
                .node(id)
                .check_heartbeats(rt.config.heartbeat_timeout);
        }
        changed
    }

    pub fn get_state(&self) -> MetadataState {
        self.graph.node_state(self.graph.root())
    }

    /// The first fatal error observed, walking nodes in table order.
    pub fn get_fatal_error(&self) -> Option<FatalErrorInfo> {
        for id in self.graph.ids() {
            if self.graph.node_state(id) == MetadataState::Failed {
                if let Some(err) = self.graph.node(id).get_fatal_error() {
                    return Some(err);
                }
            }
        }
        None
    }

    /// Whether every failed node's error matches a retry pattern.
    pub fn is_error_transient(&self, rt: &Runtime) -> (bool, String) {
        let mut log = String::new();
        for id in self.graph.ids() {
            if self.graph.node_state(id) != MetadataState::Failed {
                continue;
            }
            let (transient, errlog) = self.graph.node(id).is_error_transient(&rt.retry);
            if !transient {
                return (false, errlog);
            }
            log = errlog;
        }
        (true, log)
    }

    /// Reset failed nodes for a retry, consuming one unit of their budget.
    /// Returns false if any failed node has exhausted its budget.
    fn retry_failed_nodes(&mut self, rt: &Runtime) -> Result<bool> {
        // Only stage nodes carry resettable work; pipeline failure is
        // derived and clears once the failing stages are reset.
        let failed: Vec<NodeId> = self
            .graph
            .ids()
            .filter(|&id| {
                self.graph.node(id).kind == crate::node::NodeKind::Stage
                    && self.graph.node_state(id) == MetadataState::Failed
            })
            .collect();
        for &id in &failed {
            if self.graph.node(id).restarts >= rt.retry.default_retries {
                return Ok(false);
            }
        }
        for id in failed {
            let node = self.graph.node_mut(id);
            node.restarts += 1;
            let fqname = node.fqname.clone();
            let restarts = node.restarts;
            info!(fqname = %fqname, attempt = restarts, "retrying failed stage");
            node.reset(rt.config.full_stage_reset, &self.journal_dir.clone())?;
            let state = self.graph.node_state(id);
            self.graph.node_mut(id).state = state;
            self.frontier.add(&fqname, id);
        }
        Ok(true)
    }

    /// Ask every node to fail its in-flight forks with `message`; used on
    /// operator termination.
    pub fn kill_with_message(&self, message: &str) {
        for id in self.graph.ids() {
            self.graph.node(id).kill(message);
        }
    }

    /// Transition forks whose jobs died with the previous runtime process
    /// back to Ready. Jobs queued locally are always restarted; jobs that
    /// were observed running are restarted only under a local job mode
    /// (their processes are assumed dead with the parent).
    pub fn restart_running_nodes(&mut self, job_mode: &str, rt: &Runtime) -> Result<()> {
        let include_running = job_mode == "local";
        for id in self.graph.ids().collect::<Vec<_>>() {
            self.graph
                .node_mut(id)
                .restart_jobs(include_running, rt.config.full_stage_reset)?;
        }
        for id in self.graph.ids().collect::<Vec<_>>() {
            let state = self.graph.node_state(id);
            self.graph.node_mut(id).state = state;
        }
        Ok(())
    }

    //
    // VDR and teardown
    //

    /// Collect every node (post mode, or a final sweep before teardown).
    pub fn vdr_kill_all(&self) {
        for id in self.graph.ids() {
            crate::vdr::vdr_kill_node(&self.graph, id);
            crate::vdr::cache_perf(&self.graph, id);
        }
    }

    /// Final cleanup: surface the top-level outputs, delete the journal and
    /// scratch directories, and archive metadata when configured.
    pub fn post_process(&self, rt: &Runtime) {
        if let Some(root_fork) = self.graph.node(self.graph.root()).forks.first() {
            if let Ok(outs) = root_fork.metadata.read(MetadataFile::Outs, 0) {
                if let Err(e) = self.metadata.write(MetadataFile::Outs, &outs) {
                    warn!(error = %e, "could not write top-level outs");
                }
            }
        }
        let _ = fs::remove_dir_all(&self.journal_dir);
        let _ = fs::remove_dir_all(&self.tmp_path);
        if rt.config.zip {
            if let Err(e) = self.zip_metadata() {
                warn!(error = %e, "could not archive metadata");
            }
        }
    }

    /// Bundle every node/fork/chunk metadata file into `_metadata.zip` and
    /// remove the originals, leaving the output files in place.
    pub fn zip_metadata(&self) -> Result<()> {
        let zip_path = self.metadata.file_path(MetadataFile::MetadataZip);
        let file = fs::File::create(&zip_path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        let mut zipped: Vec<PathBuf> = Vec::new();
        for id in self.graph.ids() {
            for md in self.graph.node(id).collect_metadatas() {
                let Ok(entries) = fs::read_dir(md.path()) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    if !name.to_string_lossy().starts_with('_') {
                        continue;
                    }
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    let rel = path
                        .strip_prefix(&self.path)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .into_owned();
                    zip.start_file(rel, options)
                        .map_err(|e| MartianError::Other(e.into()))?;
                    let mut src = fs::File::open(&path)?;
                    io::copy(&mut src, &mut zip)?;
                    zipped.push(path);
                }
            }
        }
        zip.finish().map_err(|e| MartianError::Other(e.into()))?;
        for path in zipped {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    /// Extract an archived `_metadata.zip`, skipping files that already
    /// exist, then remove the archive.
    pub fn unzip_metadata(&self) -> Result<()> {
        let zip_path = self.metadata.file_path(MetadataFile::MetadataZip);
        if !zip_path.exists() {
            return Ok(());
        }
        let file = fs::File::open(&zip_path)?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| MartianError::Other(e.into()))?;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| MartianError::Other(e.into()))?;
            let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                continue;
            };
            let target = self.path.join(rel);
            if target.exists() {
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
        }
        fs::remove_file(&zip_path)?;
        Ok(())
    }

    //
    // Serialization
    //

    pub fn serialize_state(&self) -> Vec<NodeInfo> {
        self.graph.ids().map(|id| self.serialize_node(id)).collect()
    }

    fn serialize_node(&self, id: NodeId) -> NodeInfo {
        let node = self.graph.node(id);
        let state = self.graph.node_state(id);
        let forks = node
            .forks
            .iter()
            .map(|fork| ForkInfo {
                index: fork.index,
                state: self.graph.fork_state(id, fork.index),
                arg_permute: fork
                    .arg_permute
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                chunks: fork
                    .chunks
                    .iter()
                    .map(|chunk| ChunkInfo {
                        index: chunk.index,
                        state: chunk.get_state(),
                    })
                    .collect(),
            })
            .collect();
        let edges = node
            .direct_prenodes
            .iter()
            .map(|&p| EdgeInfo {
                from: self.graph.node(p).fqname.clone(),
                to: node.fqname.clone(),
            })
            .collect();
        let error = if state == MetadataState::Failed {
            node.get_fatal_error().map(|e| NodeErrorInfo {
                fqname: e.fqname,
                path: e
                    .paths
                    .first()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                summary: Some(e.summary),
                log: Some(e.log),
            })
        } else {
            None
        };
        NodeInfo {
            name: node.name.clone(),
            fqname: node.fqname.clone(),
            kind: node.kind.as_str().to_string(),
            path: node.path.to_string_lossy().into_owned(),
            state,
            forks,
            edges,
            error,
        }
    }

    pub fn serialize_perf(&self) -> Vec<NodePerfInfo> {
        self.graph
            .ids()
            .map(|id| self.graph.node(id).serialize_perf())
            .collect()
    }

    /// Write `_finalstate` and `_perf`; done on terminal exit regardless of
    /// success.
    pub fn write_final_state(&self) {
        if let Err(e) = self.metadata.write(MetadataFile::FinalState, &self.serialize_state()) {
            warn!(error = %e, "could not write final state");
        }
        if let Err(e) = self.metadata.write(MetadataFile::Perf, &self.serialize_perf()) {
            warn!(error = %e, "could not write perf");
        }
    }

    //
    // The run loop
    //

    /// Drive the pipestance to a terminal state: tick the journal watcher,
    /// step the frontier, retry transient failures, and finish with VDR and
    /// teardown. Cancellation is cooperative: the embedder calls
    /// [`Pipestance::kill_with_message`] and the loop observes the failure.
    pub async fn run_loop(&mut self, rt: &Runtime) -> PipestanceFinal {
        info!(psid = %self.psid, "pipestance running");
        loop {
            self.refresh_state(rt);
            self.step_nodes(rt);

            match self.get_state() {
                MetadataState::Complete => {
                    if rt.config.vdr_mode != VdrMode::Disable {
                        self.vdr_kill_all();
                    }
                    self.post_process(rt);
                    self.write_final_state();
                    self.run_on_finish(rt, MetadataState::Complete).await;
                    info!(psid = %self.psid, "pipestance complete");
                    return PipestanceFinal::Complete;
                }
                MetadataState::DisabledState => {
                    self.post_process(rt);
                    self.write_final_state();
                    self.run_on_finish(rt, MetadataState::DisabledState).await;
                    info!(psid = %self.psid, "pipestance disabled; exiting successfully");
                    return PipestanceFinal::Disabled;
                }
                MetadataState::Failed => {
                    let (transient, errlog) = self.is_error_transient(rt);
                    if transient {
                        match self.retry_failed_nodes(rt) {
                            Ok(true) => continue,
                            Ok(false) => {
                                debug!("retry budget exhausted");
                            }
                            Err(e) => {
                                error!(error = %e, "could not reset failed nodes");
                            }
                        }
                    }
                    let fatal = self.get_fatal_error();
                    if let Some(f) = &fatal {
                        error!(fqname = %f.fqname, summary = %f.summary, "pipestance failed");
                    } else if !errlog.is_empty() {
                        error!(log = %errlog, "pipestance failed");
                    }
                    self.write_final_state();
                    self.run_on_finish(rt, MetadataState::Failed).await;
                    return PipestanceFinal::Failed { error: fatal };
                }
                _ => {
                    tokio::time::sleep(rt.config.step_interval).await;
                }
            }
        }
    }

    async fn run_on_finish(&self, rt: &Runtime, state: MetadataState) {
        let Some(hook) = &rt.config.on_finish else {
            return;
        };
        let Some(exe) = crate::util::look_path(hook) else {
            warn!(hook = %hook, "onfinish hook not found");
            return;
        };
        let status = tokio::process::Command::new(exe)
            .arg(&self.path)
            .arg(state.to_string())
            .arg(&self.psid)
            .status()
            .await;
        if let Err(e) = status {
            warn!(hook = %hook, error = %e, "onfinish hook failed");
        }
    }
}

impl Drop for Pipestance {
    fn drop(&mut self) {
        self.unlock();
    }
}
