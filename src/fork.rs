// src/fork.rs

//! One permutation of sweep arguments for a node.
//!
//! A fork advances through the split/chunks/join state machine, reflected in
//! the breadcrumb files under its directory:
//!
//! ```text
//! Ready -> Queued -> Running(split) -> Complete(split)
//!       -> Ready(chunks) -> Running(chunks) -> Complete(chunks)
//!       -> Ready(join) -> Running(join) -> Complete(join) -> Complete
//! ```
//!
//! with branches into `DisabledState` (a disabled binding resolved truthy),
//! `Failed` (errors, assert, or heartbeat expiry) and `ForkWaiting` (the
//! enclosing pipeline fork has not settled yet).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkDef, StageDefs};
use crate::errors::Result;
use crate::graph::{ArgPermute, NodeId};
use crate::metadata::{Metadata, MetadataFile};
use crate::perf::{ChunkPerfInfo, ForkPerfInfo, PerfElement, VdrKillReport};
use crate::types::{MetadataState, StageType};

/// Reference to a fork of some node in the flat node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkRef {
    pub node: NodeId,
    pub index: usize,
}

/// A fork's state plus the stage phase it is in, mirroring the prefixed
/// breadcrumbs (`split_complete`, `join_errors`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkPhaseState {
    pub state: MetadataState,
    pub phase: Option<StageType>,
}

impl ForkPhaseState {
    fn bare(state: MetadataState) -> Self {
        ForkPhaseState { state, phase: None }
    }

    fn in_phase(state: MetadataState, phase: StageType) -> Self {
        ForkPhaseState {
            state,
            phase: Some(phase),
        }
    }

    /// Collapse to the single state used for node roll-up.
    pub fn collapse(self) -> MetadataState {
        match (self.state, self.phase) {
            (MetadataState::Failed, _) => MetadataState::Failed,
            (MetadataState::DisabledState, _) => MetadataState::DisabledState,
            (MetadataState::ForkWaiting, _) => MetadataState::ForkWaiting,
            (MetadataState::Complete, None) => MetadataState::Complete,
            (MetadataState::Ready, None) => MetadataState::Ready,
            _ => MetadataState::Running,
        }
    }
}

#[derive(Debug)]
pub struct Fork {
    pub index: usize,
    pub fqname: String,
    pub path: PathBuf,
    pub arg_permute: ArgPermute,
    pub metadata: Metadata,
    /// Present only when the stage declares a split.
    pub split_metadata: Option<Metadata>,
    pub join_metadata: Option<Metadata>,
    pub chunks: Vec<Chunk>,
    pub parent_fork: Option<ForkRef>,
    pub subforks: Vec<ForkRef>,
    /// Output parameter → consumer nodes that may read files from it.
    /// `None` marks a pipeline-level output: the file is pinned forever.
    pub file_args: HashMap<String, HashSet<Option<NodeId>>>,
    /// Consumer node → the output parameters it reads. Suppressed for
    /// top-level pipeline consumers (they never count as "done").
    pub file_post_nodes: HashMap<NodeId, HashSet<String>>,
    /// Resolution of the `disabled` modifier for this fork; `None` until the
    /// referenced upstream values are available.
    pub disabled_flag: Option<bool>,
    pub split_has_run: bool,
    pub join_has_run: bool,

    journal_dir: PathBuf,
    tmp_path: PathBuf,
}

impl Fork {
    pub fn new(
        node_fqname: &str,
        node_path: &Path,
        journal_dir: &Path,
        tmp_path: &Path,
        index: usize,
        arg_permute: ArgPermute,
        split: bool,
    ) -> Self {
        let fqname = format!("{node_fqname}.fork{index}");
        let path = node_path.join(format!("fork{index}"));
        let metadata = Metadata::with_journal(
            fqname.clone(),
            &path,
            journal_dir,
            fqname.clone(),
            "",
            Some(tmp_path.join(&fqname)),
        );
        let (split_metadata, join_metadata) = if split {
            (
                Some(Metadata::with_journal(
                    fqname.clone(),
                    path.join("split"),
                    journal_dir,
                    fqname.clone(),
                    "split_",
                    Some(tmp_path.join(format!("{fqname}.split"))),
                )),
                Some(Metadata::with_journal(
                    fqname.clone(),
                    path.join("join"),
                    journal_dir,
                    fqname.clone(),
                    "join_",
                    Some(tmp_path.join(format!("{fqname}.join"))),
                )),
            )
        } else {
            (None, None)
        };
        Fork {
            index,
            fqname,
            path,
            arg_permute,
            metadata,
            split_metadata,
            join_metadata,
            chunks: Vec::new(),
            parent_fork: None,
            subforks: Vec::new(),
            file_args: HashMap::new(),
            file_post_nodes: HashMap::new(),
            disabled_flag: None,
            split_has_run: false,
            join_has_run: false,
            journal_dir: journal_dir.to_path_buf(),
            tmp_path: tmp_path.to_path_buf(),
        }
    }

    /// The metadata the split phase reports through: the split directory for
    /// splitting stages, the fork itself otherwise.
    pub fn split_meta(&self) -> &Metadata {
        self.split_metadata.as_ref().unwrap_or(&self.metadata)
    }

    pub fn join_meta(&self) -> &Metadata {
        self.join_metadata.as_ref().unwrap_or(&self.metadata)
    }

    pub fn get_chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    pub fn mkdirs(&self) -> Result<()> {
        self.metadata.mkdirs()?;
        if let Some(md) = &self.split_metadata {
            md.mkdirs()?;
        }
        if let Some(md) = &self.join_metadata {
            md.mkdirs()?;
        }
        for chunk in &self.chunks {
            chunk.metadata.mkdirs()?;
        }
        Ok(())
    }

    pub fn collect_metadatas(&self) -> Vec<&Metadata> {
        let mut all = vec![&self.metadata];
        if let Some(md) = &self.split_metadata {
            all.push(md);
        }
        if let Some(md) = &self.join_metadata {
            all.push(md);
        }
        all.extend(self.chunks.iter().map(|c| &c.metadata));
        all
    }

    /// Fork state ignoring the enclosing pipeline (graph-level concerns like
    /// ForkWaiting are layered on by [`crate::graph::Graph::fork_state`]).
    pub fn local_phase_state(&self) -> ForkPhaseState {
        if self.disabled_flag == Some(true) || self.metadata.exists(MetadataFile::Disabled) {
            return ForkPhaseState::bare(MetadataState::DisabledState);
        }
        if let Some(state) = self.metadata.get_state() {
            if state == MetadataState::Failed || state == MetadataState::Complete {
                return ForkPhaseState::bare(state);
            }
        }
        if let Some(join_md) = &self.join_metadata {
            if let Some(state) = join_md.get_state() {
                if state == MetadataState::Failed {
                    return ForkPhaseState::bare(MetadataState::Failed);
                }
                return ForkPhaseState::in_phase(state, StageType::Join);
            }
            if self.join_has_run {
                return ForkPhaseState::in_phase(MetadataState::Queued, StageType::Join);
            }
        }
        if !self.chunks.is_empty() {
            let mut complete = true;
            for chunk in &self.chunks {
                match chunk.get_state() {
                    MetadataState::Failed => {
                        return ForkPhaseState::bare(MetadataState::Failed)
                    }
                    MetadataState::Complete => {}
                    _ => complete = false,
                }
            }
            if complete {
                return ForkPhaseState::in_phase(MetadataState::Complete, StageType::Chunk);
            }
            return ForkPhaseState::in_phase(MetadataState::Running, StageType::Chunk);
        }
        if let Some(split_md) = &self.split_metadata {
            if let Some(state) = split_md.get_state() {
                if state == MetadataState::Failed {
                    return ForkPhaseState::bare(MetadataState::Failed);
                }
                return ForkPhaseState::in_phase(state, StageType::Split);
            }
            if self.split_has_run {
                return ForkPhaseState::in_phase(MetadataState::Queued, StageType::Split);
            }
        }
        ForkPhaseState::bare(MetadataState::Ready)
    }

    /// Reconstruct the chunk list from the stage-defs already on disk, after
    /// reattachment. Chunks that were dispatched by the previous runtime are
    /// marked as run so they are not blindly resubmitted.
    pub fn load_chunks(&mut self) {
        if !self.chunks.is_empty() {
            return;
        }
        let defs: Option<StageDefs> = match &self.split_metadata {
            Some(split_md) => {
                if split_md.get_state() == Some(MetadataState::Complete) {
                    split_md.read_into(MetadataFile::StageDefs).ok()
                } else {
                    None
                }
            }
            None => self.metadata.read_into(MetadataFile::StageDefs).ok(),
        };
        if let Some(defs) = defs {
            self.build_chunks(&defs);
            for chunk in &mut self.chunks {
                chunk.metadata.load_cache();
                if chunk.metadata.exists(MetadataFile::Args) {
                    chunk.has_been_run = true;
                }
            }
        }
    }

    /// Build the chunk list from a stage-defs plan. Chunk indices follow the
    /// plan order, so they are stable across restarts.
    pub fn build_chunks(&mut self, stage_defs: &StageDefs) {
        debug_assert!(self.chunks.is_empty());
        for (index, chunk_def) in stage_defs.chunks.iter().enumerate() {
            self.chunks.push(Chunk::new(
                &self.path,
                &self.journal_dir,
                &self.fqname,
                &self.tmp_path,
                index,
                chunk_def.clone(),
                None,
            ));
        }
    }

    /// Record a disabled resolution and leave a marker so the state survives
    /// reattachment without re-resolving.
    pub fn write_disable(&mut self) -> Result<()> {
        self.disabled_flag = Some(true);
        self.metadata.mkdirs()?;
        self.metadata.write_raw(MetadataFile::Disabled, "")?;
        Ok(())
    }

    /// Finish the fork: write `_outs` and `_complete`.
    pub fn write_complete(&self, outs: &Value) -> Result<()> {
        self.metadata.write(MetadataFile::Outs, outs)?;
        self.metadata.write_time(MetadataFile::Complete)?;
        info!(fqname = %self.fqname, "fork complete");
        Ok(())
    }

    /// Write an `_errors` file into every phase of this fork that is still
    /// in flight, so the pipestance records why it stopped.
    pub fn kill(&self, message: &str) {
        let state = self.local_phase_state().collapse();
        if matches!(
            state,
            MetadataState::Complete | MetadataState::Failed | MetadataState::DisabledState
        ) {
            return;
        }
        if let Err(e) = self.metadata.write_raw(MetadataFile::Errors, message) {
            warn!(fqname = %self.fqname, error = %e, "could not write kill message");
        }
    }

    /// Full reset: delete everything under the fork directory and start
    /// over. Idempotent.
    pub fn reset(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        self.chunks.clear();
        self.split_has_run = false;
        self.join_has_run = false;
        self.disabled_flag = None;
        for md in self.collect_metadatas() {
            md.load_cache();
            md.reset_heartbeat();
        }
        self.mkdirs()?;
        Ok(())
    }

    /// Partial reset: clear failed or in-flight phases but keep completed
    /// chunks. Restarted chunks get a fresh uniquified directory so files
    /// from the dead attempt cannot collide.
    pub fn reset_partial(&mut self) -> Result<()> {
        if self.metadata.get_state() == Some(MetadataState::Complete) {
            return Ok(());
        }
        for kind in [
            MetadataFile::Errors,
            MetadataFile::Assert,
            MetadataFile::QueuedLocally,
            MetadataFile::Log,
            MetadataFile::JobInfo,
            MetadataFile::Heartbeat,
        ] {
            self.metadata.remove(kind)?;
        }
        if let Some(split_md) = &self.split_metadata {
            if split_md.get_state() != Some(MetadataState::Complete) {
                split_md.remove_all()?;
                self.split_has_run = false;
            }
        }
        if let Some(join_md) = &self.join_metadata {
            if join_md.get_state() != Some(MetadataState::Complete) {
                join_md.remove_all()?;
                self.join_has_run = false;
            }
        }
        let mut replacements = Vec::new();
        for chunk in &self.chunks {
            if chunk.get_state() != MetadataState::Complete {
                let uniq = crate::graph::new_uniquifier();
                debug!(fqname = %self.fqname, chunk = chunk.index, uniq = %uniq,
                    "re-uniquifying incomplete chunk");
                replacements.push((chunk.index, chunk.chunk_def.clone(), uniq));
            }
        }
        for (index, chunk_def, uniq) in replacements {
            let chunk = Chunk::new(
                &self.path,
                &self.journal_dir,
                &self.fqname,
                &self.tmp_path,
                index,
                chunk_def,
                Some(uniq),
            );
            chunk.metadata.mkdirs()?;
            self.chunks[index] = chunk;
        }
        self.mkdirs()?;
        Ok(())
    }

    /// Clear transient submission files for phases that were queued (and
    /// optionally running) when the previous runtime process died, returning
    /// them to Ready so they get resubmitted.
    pub fn restart_jobs(&mut self, include_running: bool) -> Result<()> {
        let clear = |md: &Metadata| -> Result<bool> {
            let state = md.get_state();
            let restart = state == Some(MetadataState::Queued)
                || (include_running && state == Some(MetadataState::Running));
            if restart {
                for kind in [
                    MetadataFile::QueuedLocally,
                    MetadataFile::JobInfo,
                    MetadataFile::Log,
                    MetadataFile::Heartbeat,
                ] {
                    md.remove(kind)?;
                }
            }
            Ok(restart)
        };
        if let Some(split_md) = &self.split_metadata {
            if clear(split_md)? {
                self.split_has_run = false;
            }
        }
        if let Some(join_md) = &self.join_metadata {
            if clear(join_md)? {
                self.join_has_run = false;
            }
        }
        for chunk in &mut self.chunks {
            if clear(&chunk.metadata)? {
                chunk.has_been_run = false;
            }
        }
        // The fork-level metadata itself carries no job, but stale heartbeat
        // bookkeeping should not outlive the process that owned it.
        for md in self.collect_metadatas() {
            md.reset_heartbeat();
        }
        Ok(())
    }

    //
    // Perf
    //

    fn perf_element(md: &Metadata, fqname: &str) -> PerfElement {
        fn mtime(md: &Metadata, kind: MetadataFile) -> Option<chrono::DateTime<chrono::Local>> {
            let meta = fs::metadata(md.file_path(kind)).ok()?;
            let modified = meta.modified().ok()?;
            Some(modified.into())
        }
        let start = mtime(md, MetadataFile::Args).or_else(|| mtime(md, MetadataFile::QueuedLocally));
        let end = mtime(md, MetadataFile::Complete).or_else(|| mtime(md, MetadataFile::Errors));
        let duration_seconds = match (start, end) {
            (Some(s), Some(e)) => (e - s).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        PerfElement {
            fqname: fqname.to_string(),
            start,
            end,
            duration_seconds,
        }
    }

    pub fn serialize_perf(&self, num_restarts: u32) -> ForkPerfInfo {
        let split_stats = self
            .split_metadata
            .as_ref()
            .map(|md| Self::perf_element(md, &format!("{}.split", self.fqname)));
        let join_stats = self
            .join_metadata
            .as_ref()
            .map(|md| Self::perf_element(md, &format!("{}.join", self.fqname)));
        let chunks = self
            .chunks
            .iter()
            .map(|chunk| ChunkPerfInfo {
                index: chunk.index,
                chunk_stats: Self::perf_element(&chunk.metadata, chunk.metadata.fqname()),
            })
            .collect();
        let vdr_kill = self
            .metadata
            .read_into::<VdrKillReport>(MetadataFile::VdrKill)
            .ok();
        ForkPerfInfo {
            index: self.index,
            fork_stats: Self::perf_element(&self.metadata, &self.fqname),
            split_stats,
            join_stats,
            chunks,
            num_restarts,
            vdr_kill,
        }
    }
}
