// src/graph/step.rs

//! The per-node step: plan what each fork should do next from the on-disk
//! state (read-only), then apply the plan (mutations and job dispatch).
//!
//! Splitting plan from apply keeps every cross-node read (upstream outs,
//! parent fork flags, chunk outputs) in one place, and makes the state
//! machine itself deterministic and unit-testable.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::binding::{resolve_disabled, DisabledResolution};
use crate::chunk::{ChunkDef, StageDefs};
use crate::errors::Result;
use crate::frontier::Frontier;
use crate::graph::{Graph, NodeId};
use crate::jobmgr::JobResources;
use crate::metadata::MetadataFile;
use crate::node::{NodeKind, StepEnv};
use crate::types::{MetadataState, StageType, VdrMode};

/// What one fork should do on this tick.
#[derive(Debug)]
pub(crate) enum ForkAction {
    Noop,
    /// Structurally alive but the parent fork has not settled; leave the
    /// frontier until it advances.
    Wait,
    Disable,
    RunSplit {
        args: Map<String, Value>,
        res: JobResources,
    },
    /// Build the chunk list from a plan (the split's output, or a synthetic
    /// single chunk for stages without a split), then dispatch.
    BuildChunks {
        stage_defs: StageDefs,
        args: Map<String, Value>,
    },
    DispatchChunks {
        args: Map<String, Value>,
    },
    RunJoin {
        args: Map<String, Value>,
        chunk_defs: Vec<ChunkDef>,
        chunk_outs: Vec<Value>,
        res: JobResources,
    },
    Complete {
        outs: Value,
    },
}

impl Graph {
    /// Decide the next action for one fork. Read-only: all filesystem and
    /// cross-node reads happen here.
    pub(crate) fn plan_fork(
        &self,
        env: &StepEnv<'_>,
        id: NodeId,
        fork_index: usize,
    ) -> Result<ForkAction> {
        let node = self.node(id);
        let fork = &node.forks[fork_index];

        if let Some(parent) = fork.parent_fork {
            let parent_node = self.node(parent.node);
            let parent_fork = &parent_node.forks[parent.index];
            if parent_fork.disabled_flag == Some(true)
                || parent_fork.metadata.exists(MetadataFile::Disabled)
            {
                return Ok(if fork.disabled_flag == Some(true) {
                    ForkAction::Noop
                } else {
                    ForkAction::Disable
                });
            }
            if parent_fork.disabled_flag.is_none() && !parent_node.disabled.is_empty() {
                return Ok(ForkAction::Wait);
            }
        }

        if fork.disabled_flag.is_none() && !node.disabled.is_empty() {
            match resolve_disabled(&node.disabled, self, &fork.arg_permute, env.mem_cap)? {
                DisabledResolution::Undetermined => return Ok(ForkAction::Wait),
                DisabledResolution::Disabled => return Ok(ForkAction::Disable),
                DisabledResolution::Enabled => {}
            }
        }
        if fork.disabled_flag == Some(true) || fork.metadata.exists(MetadataFile::Disabled) {
            return Ok(ForkAction::Noop);
        }

        match node.kind {
            NodeKind::Pipeline => self.plan_pipeline_fork(env, id, fork_index),
            NodeKind::Stage => self.plan_stage_fork(env, id, fork_index),
        }
    }

    fn plan_pipeline_fork(
        &self,
        env: &StepEnv<'_>,
        id: NodeId,
        fork_index: usize,
    ) -> Result<ForkAction> {
        let node = self.node(id);
        let fork = &node.forks[fork_index];
        if fork.metadata.exists(MetadataFile::Complete) {
            return Ok(ForkAction::Noop);
        }
        let mut any = false;
        let mut all_disabled = true;
        for sub in &fork.subforks {
            any = true;
            match self.fork_state(sub.node, sub.index) {
                MetadataState::Failed => return Ok(ForkAction::Noop),
                MetadataState::DisabledState => {}
                s if s.satisfied() => all_disabled = false,
                _ => return Ok(ForkAction::Noop),
            }
        }
        if any && all_disabled {
            // Every subfork is disabled: the pipeline fork reads as disabled
            // through state roll-up; there are no outs to write.
            return Ok(ForkAction::Noop);
        }
        let outs = self.resolve_rets(id, &fork.arg_permute, env.mem_cap)?;
        Ok(ForkAction::Complete {
            outs: Value::Object(outs),
        })
    }

    fn plan_stage_fork(
        &self,
        env: &StepEnv<'_>,
        id: NodeId,
        fork_index: usize,
    ) -> Result<ForkAction> {
        let node = self.node(id);
        let fork = &node.forks[fork_index];
        let stage = node.stage.as_ref().expect("stage fork on non-stage node");
        let phase = fork.local_phase_state();

        match (phase.state, phase.phase) {
            (MetadataState::Ready, None) => {
                let args = self.resolve_args(id, &fork.arg_permute, env.mem_cap)?;
                if stage.split {
                    let res = node.get_job_reqs(env, None, StageType::Split);
                    Ok(ForkAction::RunSplit { args, res })
                } else {
                    // No split declared: synthesize a single chunk from the
                    // resolved args.
                    Ok(ForkAction::BuildChunks {
                        stage_defs: StageDefs {
                            chunks: vec![ChunkDef::default()],
                            join: None,
                        },
                        args,
                    })
                }
            }
            (MetadataState::Complete, Some(StageType::Split)) if fork.chunks.is_empty() => {
                let stage_defs: StageDefs = fork.split_meta().read_into(MetadataFile::StageDefs)?;
                let args = self.resolve_args(id, &fork.arg_permute, env.mem_cap)?;
                Ok(ForkAction::BuildChunks { stage_defs, args })
            }
            (MetadataState::Running, Some(StageType::Chunk)) => {
                if fork
                    .chunks
                    .iter()
                    .any(|c| !c.has_been_run && c.get_state() == MetadataState::Ready)
                {
                    let args = self.resolve_args(id, &fork.arg_permute, env.mem_cap)?;
                    Ok(ForkAction::DispatchChunks { args })
                } else {
                    Ok(ForkAction::Noop)
                }
            }
            (MetadataState::Complete, Some(StageType::Chunk)) => {
                if stage.split {
                    if fork.join_has_run {
                        return Ok(ForkAction::Noop);
                    }
                    let stage_defs: StageDefs = fork
                        .split_meta()
                        .read_into(MetadataFile::StageDefs)
                        .unwrap_or_default();
                    let args = self.resolve_args(id, &fork.arg_permute, env.mem_cap)?;
                    let chunk_defs: Vec<ChunkDef> =
                        fork.chunks.iter().map(|c| c.chunk_def.clone()).collect();
                    let mut chunk_outs = Vec::with_capacity(fork.chunks.len());
                    for chunk in &fork.chunks {
                        chunk_outs.push(chunk.metadata.read(MetadataFile::Outs, env.mem_cap)?);
                    }
                    let res = node.get_job_reqs(env, stage_defs.join.as_ref(), StageType::Join);
                    Ok(ForkAction::RunJoin {
                        args,
                        chunk_defs,
                        chunk_outs,
                        res,
                    })
                } else {
                    let outs = fork.chunks[0].metadata.read(MetadataFile::Outs, env.mem_cap)?;
                    Ok(ForkAction::Complete { outs })
                }
            }
            (MetadataState::Complete, Some(StageType::Join)) => {
                let outs = fork.join_meta().read(MetadataFile::Outs, env.mem_cap)?;
                Ok(ForkAction::Complete { outs })
            }
            _ => Ok(ForkAction::Noop),
        }
    }

    /// Apply one fork's action: mutate fork state, then dispatch any jobs.
    pub(crate) fn apply_fork(
        &mut self,
        env: &StepEnv<'_>,
        id: NodeId,
        fork_index: usize,
        action: ForkAction,
    ) -> Result<()> {
        enum Dispatch {
            None,
            Split(JobResources),
            Chunks(Vec<usize>),
            Join(JobResources),
        }

        let mut dispatch = Dispatch::None;
        {
            let node = &mut self.nodes[id.0];
            let fork = &mut node.forks[fork_index];
            if !matches!(action, ForkAction::Wait) && fork.disabled_flag.is_none() {
                fork.disabled_flag = Some(matches!(action, ForkAction::Disable));
            }
            match action {
                ForkAction::Noop | ForkAction::Wait => {}
                ForkAction::Disable => {
                    fork.write_disable()?;
                }
                ForkAction::RunSplit { args, res } => {
                    fork.mkdirs()?;
                    fork.metadata.write(MetadataFile::Args, &args)?;
                    fork.split_meta().write(MetadataFile::Args, &args)?;
                    fork.split_has_run = true;
                    dispatch = Dispatch::Split(res);
                }
                ForkAction::BuildChunks { stage_defs, args } => {
                    if fork.chunks.is_empty() {
                        fork.metadata.mkdirs()?;
                        fork.metadata.write(MetadataFile::Args, &args)?;
                        if fork.split_metadata.is_none() {
                            // Keep the synthesized plan visible on disk.
                            fork.metadata.write(MetadataFile::StageDefs, &stage_defs)?;
                        }
                        fork.build_chunks(&stage_defs);
                    }
                    dispatch = Dispatch::Chunks(prepare_chunks(fork, &args)?);
                }
                ForkAction::DispatchChunks { args } => {
                    dispatch = Dispatch::Chunks(prepare_chunks(fork, &args)?);
                }
                ForkAction::RunJoin {
                    args,
                    chunk_defs,
                    chunk_outs,
                    res,
                } => {
                    let join = fork.join_meta();
                    join.mkdirs()?;
                    join.write(MetadataFile::Args, &args)?;
                    join.write(MetadataFile::ChunkDefs, &chunk_defs)?;
                    join.write(MetadataFile::ChunkOuts, &chunk_outs)?;
                    fork.join_has_run = true;
                    dispatch = Dispatch::Join(res);
                }
                ForkAction::Complete { outs } => {
                    fork.write_complete(&outs)?;
                }
            }
        }

        let node = &self.nodes[id.0];
        let fork = &node.forks[fork_index];
        match dispatch {
            Dispatch::None => {}
            Dispatch::Split(res) => node.run_split(env, fork.split_meta(), &res),
            Dispatch::Join(res) => node.run_join(env, fork.join_meta(), &res),
            Dispatch::Chunks(indices) => {
                for index in indices {
                    let chunk = &fork.chunks[index];
                    let res =
                        node.get_job_reqs(env, Some(&chunk.chunk_def.resources), StageType::Chunk);
                    node.run_chunk(env, &chunk.metadata, &res);
                }
            }
        }
        Ok(())
    }

    /// Advance one frontier node, per the scheduler contract:
    /// 1. Step each fork while Running (or skip preflights when configured).
    /// 2. Recompute the rolled-up state.
    /// 3. Failed nodes stay on the frontier for the operator to see.
    /// 4. Running nodes ensure their directories and stay.
    /// 5. Completion under rolling VDR collects this node and its prenodes.
    /// 6. Complete/disabled nodes promote their postnodes and leave.
    /// 7. ForkWaiting nodes leave; the parent's advance re-adds them.
    ///
    /// Returns true if the rolled-up state changed.
    pub fn step_node(&mut self, env: &StepEnv<'_>, frontier: &Frontier, id: NodeId) -> bool {
        let previous = self.node(id).state;
        if previous == MetadataState::Running {
            if self.node(id).preflight && env.config.skip_preflight {
                self.skip_node(id);
            } else {
                for fork_index in 0..self.node(id).forks.len() {
                    match self.plan_fork(env, id, fork_index) {
                        Ok(action) => {
                            debug!(fqname = %self.node(id).fqname, fork = fork_index,
                                action = ?action, "fork step");
                            if let Err(e) = self.apply_fork(env, id, fork_index, action) {
                                warn!(fqname = %self.node(id).fqname, fork = fork_index,
                                    error = %e, "fork step failed; will retry next tick");
                            }
                        }
                        Err(e) => {
                            warn!(fqname = %self.node(id).fqname, fork = fork_index,
                                error = %e, "could not plan fork; will retry next tick");
                        }
                    }
                }
            }
        }

        let state = self.node_state(id);
        self.nodes[id.0].state = state;
        let node = self.node(id);
        match state {
            MetadataState::Failed => {
                frontier.add(&node.fqname, id);
            }
            MetadataState::Running => {
                if state != previous {
                    if let Err(e) = node.mkdirs() {
                        warn!(fqname = %node.fqname, error = %e, "mkdirs failed");
                    }
                }
                frontier.add(&node.fqname, id);
                // A pipeline fork that has settled its disabled resolution
                // unblocks subnodes that left the frontier as ForkWaiting.
                if node.kind == NodeKind::Pipeline {
                    for &sub in &node.subnodes {
                        let sub_node = self.node(sub);
                        if !frontier.contains(&sub_node.fqname)
                            && self.node_state(sub) != MetadataState::ForkWaiting
                        {
                            frontier.add(&sub_node.fqname, sub);
                        }
                    }
                }
            }
            MetadataState::Complete | MetadataState::DisabledState => {
                if state == MetadataState::Complete && env.config.vdr_mode == VdrMode::Rolling {
                    let prenodes = node.prenodes.clone();
                    for prenode in prenodes {
                        crate::vdr::vdr_kill_node(self, prenode);
                        crate::vdr::cache_perf(self, prenode);
                    }
                    crate::vdr::vdr_kill_node(self, id);
                    crate::vdr::cache_perf(self, id);
                }
                let node = self.node(id);
                for &postnode in &node.postnodes {
                    frontier.add(&self.node(postnode).fqname, postnode);
                }
                frontier.remove(&node.fqname);
            }
            MetadataState::ForkWaiting => {
                frontier.remove(&node.fqname);
            }
            _ => {}
        }
        state != previous
    }

    /// Mark every fork of a skipped preflight node complete without running
    /// anything.
    fn skip_node(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.0];
        for fork in &mut node.forks {
            let state = fork.local_phase_state().collapse();
            if !state.satisfied() && state != MetadataState::Failed {
                if let Err(e) = fork
                    .metadata
                    .mkdirs()
                    .and_then(|_| fork.write_complete(&Value::Object(Map::new())))
                {
                    warn!(fqname = %fork.fqname, error = %e, "could not skip preflight fork");
                }
            }
        }
    }
}

/// Write args files for chunks that have not been dispatched yet and mark
/// them run; returns their indices for the dispatch phase.
fn prepare_chunks(
    fork: &mut crate::fork::Fork,
    args: &Map<String, Value>,
) -> Result<Vec<usize>> {
    let mut ready = Vec::new();
    for chunk in &mut fork.chunks {
        if chunk.has_been_run || chunk.get_state() != MetadataState::Ready {
            continue;
        }
        chunk.metadata.mkdirs()?;
        chunk
            .metadata
            .write(MetadataFile::Args, &chunk.chunk_args(args))?;
        chunk.has_been_run = true;
        ready.push(chunk.index);
    }
    Ok(ready)
}
