// src/binding.rs

//! Binding resolution.
//!
//! A binding connects one input parameter of a call to its value source: a
//! literal, a sweep over several literals, an array of further bindings, or
//! a reference to an upstream node's output. References are resolved per
//! fork by reading the upstream fork's `_outs` file, selecting the matching
//! permutation by shared sweep roots.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::errors::{MartianError, Result};
use crate::graph::{ArgPermute, Graph, NodeId};
use crate::metadata::MetadataFile;
use crate::syntax::TypeId;

#[derive(Debug, Clone)]
pub struct Binding {
    pub id: String,
    pub tname: TypeId,
    pub kind: BindingKind,
}

#[derive(Debug, Clone)]
pub enum BindingKind {
    Null,
    Literal(Value),
    /// A sweep source. `root_id` uniquely identifies the declaration site
    /// (`<declaring fqname>.<param>`); forks are aligned across nodes by
    /// matching root ids.
    Sweep { root_id: String, values: Vec<Value> },
    Array(Vec<Binding>),
    /// Reference to an upstream output. `node` is the ultimate producer
    /// (references through pipeline returns are chased at build time);
    /// `direct_node` is the immediately-referenced node, kept for graph
    /// edges.
    Reference {
        node: NodeId,
        direct_node: NodeId,
        output: String,
    },
}

impl Binding {
    /// Materialize this binding's value for the fork identified by
    /// `permute`. With an empty permute, sweep bindings return their whole
    /// value set (used during fork expansion).
    pub fn resolve(&self, graph: &Graph, permute: &ArgPermute, mem_cap: u64) -> Result<Value> {
        match &self.kind {
            BindingKind::Null => Ok(Value::Null),
            BindingKind::Literal(v) => Ok(v.clone()),
            BindingKind::Sweep { root_id, values } => match permute.get(root_id) {
                Some(v) => Ok(v.clone()),
                None => Ok(Value::Array(values.clone())),
            },
            BindingKind::Array(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(element.resolve(graph, permute, mem_cap)?);
                }
                Ok(Value::Array(out))
            }
            BindingKind::Reference { node, output, .. } => {
                graph.resolve_output(*node, output, permute, mem_cap)
            }
        }
    }

    /// Collect the sweep sources declared in this binding (including inside
    /// arrays).
    pub fn collect_sweeps<'a>(&'a self, out: &mut Vec<(&'a str, &'a [Value])>) {
        match &self.kind {
            BindingKind::Sweep { root_id, values } => out.push((root_id, values)),
            BindingKind::Array(elements) => {
                for element in elements {
                    element.collect_sweeps(out);
                }
            }
            _ => {}
        }
    }
}

/// Walk a binding list and return:
/// - the distinct upstream nodes it references (prenodes),
/// - the immediately-referenced nodes (for graph edges),
/// - for every referenced node, the set of its output parameters reachable
///   through a binding whose declared type might contain a file name. This
///   last map drives VDR consumer accounting.
pub fn recurse_bound_nodes(
    bindings: &[Binding],
) -> (
    Vec<NodeId>,
    Vec<NodeId>,
    HashMap<NodeId, HashSet<String>>,
) {
    let mut prenodes = Vec::new();
    let mut seen = HashSet::new();
    let mut direct = Vec::new();
    let mut direct_seen = HashSet::new();
    let mut file_parents: HashMap<NodeId, HashSet<String>> = HashMap::new();

    fn walk(
        bindings: &[Binding],
        prenodes: &mut Vec<NodeId>,
        seen: &mut HashSet<NodeId>,
        direct: &mut Vec<NodeId>,
        direct_seen: &mut HashSet<NodeId>,
        file_parents: &mut HashMap<NodeId, HashSet<String>>,
    ) {
        for binding in bindings {
            match &binding.kind {
                BindingKind::Reference {
                    node,
                    direct_node,
                    output,
                } => {
                    if seen.insert(*node) {
                        prenodes.push(*node);
                    }
                    if direct_seen.insert(*direct_node) {
                        direct.push(*direct_node);
                    }
                    if binding.tname.maybe_file_type() {
                        file_parents
                            .entry(*node)
                            .or_default()
                            .insert(output.clone());
                    }
                }
                BindingKind::Array(elements) => {
                    walk(elements, prenodes, seen, direct, direct_seen, file_parents);
                }
                _ => {}
            }
        }
    }

    walk(
        bindings,
        &mut prenodes,
        &mut seen,
        &mut direct,
        &mut direct_seen,
        &mut file_parents,
    );
    (prenodes, direct, file_parents)
}

/// Outcome of evaluating a call's `disabled` modifier bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisabledResolution {
    /// At least one referenced upstream node has not finished yet.
    Undetermined,
    Enabled,
    Disabled,
}

/// Evaluate the disabled bindings for one fork. A binding referencing an
/// upstream node that is not yet complete (or disabled) leaves the outcome
/// undetermined; any binding resolving to `true` disables the fork.
pub fn resolve_disabled(
    bindings: &[Binding],
    graph: &Graph,
    permute: &ArgPermute,
    mem_cap: u64,
) -> Result<DisabledResolution> {
    for binding in bindings {
        let (prenodes, _, _) = recurse_bound_nodes(std::slice::from_ref(binding));
        for prenode in prenodes {
            if !graph.node_state(prenode).satisfied() {
                return Ok(DisabledResolution::Undetermined);
            }
        }
        match binding.resolve(graph, permute, mem_cap)? {
            Value::Bool(true) => return Ok(DisabledResolution::Disabled),
            Value::Bool(false) | Value::Null => {}
            other => {
                return Err(MartianError::Invocation(format!(
                    "disabled modifier resolved to non-boolean value: {other}"
                )))
            }
        }
    }
    Ok(DisabledResolution::Enabled)
}

/// Read one output from an upstream fork's `_outs` file.
pub(crate) fn read_fork_output(
    metadata: &crate::metadata::Metadata,
    output: &str,
    mem_cap: u64,
) -> Result<Value> {
    let outs = metadata.read(MetadataFile::Outs, mem_cap)?;
    match outs {
        Value::Object(map) => Ok(map.get(output).cloned().unwrap_or(Value::Null)),
        other => Err(MartianError::Invocation(format!(
            "outs file for {} is not an object: {other}",
            metadata.fqname()
        ))),
    }
}
