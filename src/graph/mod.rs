// src/graph/mod.rs

//! The pipestance graph: a flat table of nodes related by numeric id.
//!
//! Storing relations as id-to-id edges (rather than object references)
//! keeps the pre/post structure cycle-free in the ownership sense; walks go
//! through the table. Fork-to-fork relations cross the table the same way
//! via [`ForkRef`].

mod build;
mod step;

pub use build::{build_graph, BuildContext};
pub(crate) use step::ForkAction;

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde_json::Value;

use crate::binding::read_fork_output;
use crate::errors::{MartianError, Result};
use crate::fork::Fork;
use crate::node::Node;
use crate::types::MetadataState;

/// Index into the flat node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Sweep-root-id → concrete value, ordered so fork identity is stable.
pub type ArgPermute = BTreeMap<String, Value>;

/// Ten hex characters distinguishing restarted chunk attempts in journal
/// names and chunk directories.
pub fn new_uniquifier() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..10].to_string()
}

#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    by_fqname: HashMap<String, NodeId>,
    root: NodeId,
}

impl Graph {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn find(&self, fqname: &str) -> Option<NodeId> {
        self.by_fqname.get(fqname).copied()
    }

    //
    // State roll-up
    //

    /// A fork's state as seen from the whole graph: the enclosing pipeline
    /// fork gates its subforks (an unsettled parent means ForkWaiting, a
    /// disabled parent disables them); otherwise the fork's own phase state
    /// applies.
    pub fn fork_state(&self, id: NodeId, fork_index: usize) -> MetadataState {
        let node = self.node(id);
        let fork = &node.forks[fork_index];
        if let Some(parent) = fork.parent_fork {
            let parent_node = self.node(parent.node);
            let parent_fork = &parent_node.forks[parent.index];
            if parent_fork.disabled_flag == Some(true)
                || parent_fork
                    .metadata
                    .exists(crate::metadata::MetadataFile::Disabled)
            {
                return MetadataState::DisabledState;
            }
            if parent_fork.disabled_flag.is_none() && !parent_node.disabled.is_empty() {
                return MetadataState::ForkWaiting;
            }
        }
        match node.kind {
            crate::node::NodeKind::Stage => fork.local_phase_state().collapse(),
            crate::node::NodeKind::Pipeline => self.pipeline_fork_state(fork),
        }
    }

    /// Pipeline forks have no work of their own; their state is the join of
    /// their subforks. Once every subfork has settled, the step loop
    /// resolves the return bindings and writes `_outs`; until then the fork
    /// reads as running. A pipeline whose every subfork is disabled is
    /// itself disabled.
    fn pipeline_fork_state(&self, fork: &Fork) -> MetadataState {
        if fork.disabled_flag == Some(true)
            || fork.metadata.exists(crate::metadata::MetadataFile::Disabled)
        {
            return MetadataState::DisabledState;
        }
        if fork.metadata.exists(crate::metadata::MetadataFile::Complete) {
            return MetadataState::Complete;
        }
        let mut any = false;
        let mut all_disabled = true;
        for sub in &fork.subforks {
            any = true;
            match self.fork_state(sub.node, sub.index) {
                MetadataState::Failed => return MetadataState::Failed,
                MetadataState::DisabledState => {}
                _ => all_disabled = false,
            }
        }
        if any && all_disabled {
            return MetadataState::DisabledState;
        }
        MetadataState::Running
    }

    /// Roll fork states up to a node state:
    /// - any fork Failed → Failed
    /// - any fork ForkWaiting → ForkWaiting
    /// - all forks Disabled → DisabledState
    /// - all forks Complete or Disabled → Complete
    /// - any prenode unsatisfied → Waiting
    /// - otherwise → Running
    pub fn node_state(&self, id: NodeId) -> MetadataState {
        let node = self.node(id);
        let mut complete = true;
        let mut disabled = true;
        for index in 0..node.forks.len() {
            match self.fork_state(id, index) {
                MetadataState::Failed => return MetadataState::Failed,
                MetadataState::ForkWaiting => return MetadataState::ForkWaiting,
                MetadataState::DisabledState => {}
                MetadataState::Complete => disabled = false,
                _ => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            if disabled && !node.forks.is_empty() {
                return MetadataState::DisabledState;
            }
            return MetadataState::Complete;
        }
        for &prenode in &node.prenodes {
            if !self.node_state(prenode).satisfied() {
                return MetadataState::Waiting;
            }
        }
        MetadataState::Running
    }

    //
    // Output resolution
    //

    /// Read one output parameter from the upstream fork matching `permute`.
    /// Disabled forks resolve to null.
    pub fn resolve_output(
        &self,
        id: NodeId,
        output: &str,
        permute: &ArgPermute,
        mem_cap: u64,
    ) -> Result<Value> {
        let node = self.node(id);
        let fork = node.match_fork(permute).ok_or_else(|| {
            MartianError::Invocation(format!(
                "no fork of {} matches the requested permutation",
                node.fqname
            ))
        })?;
        if self.fork_state(id, fork.index) == MetadataState::DisabledState {
            return Ok(Value::Null);
        }
        read_fork_output(&fork.metadata, output, mem_cap)
    }

    /// Materialize the argument map one fork of a node sees.
    pub fn resolve_args(
        &self,
        id: NodeId,
        permute: &ArgPermute,
        mem_cap: u64,
    ) -> Result<serde_json::Map<String, Value>> {
        let node = self.node(id);
        let mut args = serde_json::Map::new();
        for binding in &node.arg_bindings {
            args.insert(
                binding.id.clone(),
                binding.resolve(self, permute, mem_cap)?,
            );
        }
        Ok(args)
    }

    /// Materialize a pipeline fork's outputs from its return bindings.
    pub fn resolve_rets(
        &self,
        id: NodeId,
        permute: &ArgPermute,
        mem_cap: u64,
    ) -> Result<serde_json::Map<String, Value>> {
        let node = self.node(id);
        let mut outs = serde_json::Map::new();
        for binding in &node.ret_bindings {
            outs.insert(
                binding.id.clone(),
                binding.resolve(self, permute, mem_cap)?,
            );
        }
        Ok(outs)
    }
}
