// src/graph/build.rs

//! Graph construction: call statements → nodes, forks and relations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;
use tracing::debug;

use crate::binding::{recurse_bound_nodes, Binding, BindingKind};
use crate::errors::{MartianError, Result};
use crate::fork::{Fork, ForkRef};
use crate::graph::{ArgPermute, Graph, NodeId};
use crate::metadata::Metadata;
use crate::node::{Node, NodeKind, StageInfo, SweepBinding};
use crate::syntax::{CallStm, Callable, Callables, Exp, TypeId};
use crate::types::MetadataState;

/// Everything the builder needs to situate nodes on disk.
pub struct BuildContext<'a> {
    pub callables: &'a Callables,
    pub psid: &'a str,
    pub pipestance_path: &'a Path,
    pub never_local: bool,
}

/// Build the full graph for a top-level call: instantiate nodes recursively,
/// wire pre/post relations, expand sweeps into forks and link forks across
/// the subpipeline boundary.
pub fn build_graph(ctx: &BuildContext<'_>, call: &CallStm) -> Result<Graph> {
    let mut builder = Builder {
        ctx,
        nodes: Vec::new(),
        by_fqname: HashMap::new(),
    };
    let root_fqname = format!("ID.{}", ctx.psid);
    let root = builder.build_node(None, &root_fqname, ctx.pipestance_path, call, None)?;

    let mut graph = Graph {
        nodes: builder.nodes,
        by_fqname: builder.by_fqname,
        root,
    };
    attach_relations(&mut graph);
    expand_sweeps(&mut graph)?;
    attach_file_args(&mut graph);
    link_forks(&mut graph);
    // Preflight gating is layered on after fork construction so it affects
    // scheduling order but never sweep inheritance.
    add_preflight_edges(&mut graph);
    Ok(graph)
}

struct Builder<'a, 'b> {
    ctx: &'a BuildContext<'b>,
    nodes: Vec<Node>,
    by_fqname: HashMap<String, NodeId>,
}

/// Names visible while building one pipeline's sub-calls.
struct Scope {
    pipeline: NodeId,
    siblings: HashMap<String, NodeId>,
}

impl Builder<'_, '_> {
    /// Create the node for `call` and, for pipelines, recursively build its
    /// sub-calls in sibling-reference topological order so that every
    /// reference chases through fully-built return bindings.
    fn build_node(
        &mut self,
        parent: Option<NodeId>,
        parent_fqname: &str,
        parent_path: &Path,
        call: &CallStm,
        scope: Option<&Scope>,
    ) -> Result<NodeId> {
        let callable = self.ctx.callables.require(&call.dec_id)?.clone();
        let fqname = format!("{parent_fqname}.{}", call.id);
        let path = parent_path.join(&call.id);
        let id = NodeId(self.nodes.len());

        let (kind, stage, resources) = match &callable {
            Callable::Stage(s) => (
                NodeKind::Stage,
                Some(StageInfo {
                    code: s.code.clone(),
                    split: s.split,
                }),
                s.resources.clone(),
            ),
            Callable::Pipeline(_) => (NodeKind::Pipeline, None, None),
        };

        let local = call.modifiers.local && (call.modifiers.preflight || !self.ctx.never_local);
        let mut node = Node {
            id,
            parent,
            kind,
            name: call.id.clone(),
            callable_id: call.dec_id.clone(),
            fqname: fqname.clone(),
            path: path.clone(),
            metadata: Metadata::new(fqname.clone(), &path),
            stage,
            resources,
            arg_bindings: Vec::new(),
            ret_bindings: Vec::new(),
            disabled: Vec::new(),
            sweep_bindings: Vec::new(),
            subnodes: Vec::new(),
            prenodes: Vec::new(),
            direct_prenodes: Vec::new(),
            postnodes: Vec::new(),
            forks: Vec::new(),
            state: MetadataState::Waiting,
            volatile: call.modifiers.volatile,
            strict_volatile: call.modifiers.strict_volatile,
            local,
            preflight: call.modifiers.preflight,
            restarts: 0,
        };

        // Inherit the enclosing call's disabled bindings, then add our own.
        if let Some(p) = parent {
            node.disabled = self.nodes[p.0].disabled.clone();
        }

        self.by_fqname.insert(fqname.clone(), id);
        self.nodes.push(node);

        // Arg bindings and the disabled modifier are expressions in the
        // *enclosing* pipeline's scope.
        let mut arg_bindings = Vec::with_capacity(call.bindings.len());
        for bind in &call.bindings {
            let kind = self.build_exp(&bind.exp, &bind.tname, &bind.id, id, scope)?;
            arg_bindings.push(Binding {
                id: bind.id.clone(),
                tname: bind.tname.clone(),
                kind,
            });
        }
        self.nodes[id.0].arg_bindings = arg_bindings;
        if let Some(exp) = &call.modifiers.disabled {
            let kind = self.build_exp(exp, &TypeId::new("bool"), "disabled", id, scope)?;
            self.nodes[id.0].disabled.push(Binding {
                id: "disabled".to_string(),
                tname: TypeId::new("bool"),
                kind,
            });
        }

        if let Callable::Pipeline(pipeline) = &callable {
            let mut inner = Scope {
                pipeline: id,
                siblings: HashMap::new(),
            };
            for sub_call in order_calls(&fqname, &pipeline.calls)? {
                let sub_id = self.build_node(Some(id), &fqname, &path, sub_call, Some(&inner))?;
                inner.siblings.insert(sub_call.id.clone(), sub_id);
                self.nodes[id.0].subnodes.push(sub_id);
            }
            let mut ret_bindings = Vec::with_capacity(pipeline.ret.len());
            for bind in &pipeline.ret {
                let kind = self.build_exp(&bind.exp, &bind.tname, &bind.id, id, Some(&inner))?;
                ret_bindings.push(Binding {
                    id: bind.id.clone(),
                    tname: bind.tname.clone(),
                    kind,
                });
            }
            self.nodes[id.0].ret_bindings = ret_bindings;
        }

        Ok(id)
    }

    /// Lower a binding expression into a resolved [`BindingKind`].
    fn build_exp(
        &self,
        exp: &Exp,
        tname: &TypeId,
        bind_id: &str,
        owner: NodeId,
        scope: Option<&Scope>,
    ) -> Result<BindingKind> {
        Ok(match exp {
            Exp::Null => BindingKind::Null,
            Exp::Value { value } => BindingKind::Literal(value.clone()),
            Exp::Sweep { values } => BindingKind::Sweep {
                root_id: format!("{}.{bind_id}", self.nodes[owner.0].fqname),
                values: values.clone(),
            },
            Exp::Array { elements } => {
                let element_tname = TypeId {
                    tname: tname.tname.clone(),
                    array_dim: tname.array_dim.saturating_sub(1),
                };
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(Binding {
                        id: bind_id.to_string(),
                        tname: element_tname.clone(),
                        kind: self.build_exp(element, &element_tname, bind_id, owner, scope)?,
                    });
                }
                BindingKind::Array(out)
            }
            Exp::Ref { id, output } => {
                let scope = scope.ok_or_else(|| {
                    MartianError::Invocation(format!(
                        "reference {id}.{output} outside a pipeline"
                    ))
                })?;
                self.chase_ref(scope, id, output)?
            }
            Exp::SelfRef { id } => {
                let scope = scope.ok_or_else(|| {
                    MartianError::Invocation(format!("self.{id} outside a pipeline"))
                })?;
                let pipeline = &self.nodes[scope.pipeline.0];
                let binding = pipeline
                    .arg_bindings
                    .iter()
                    .find(|b| b.id == *id)
                    .unwrap_or_else(|| {
                        panic!("self.{id} does not name an input of {}", pipeline.fqname)
                    });
                binding.kind.clone()
            }
        })
    }

    /// Chase a `CALL.output` reference to its ultimate producer, through
    /// pipeline return bindings. The directly-referenced node is kept for
    /// graph edges.
    fn chase_ref(&self, scope: &Scope, call_id: &str, output: &str) -> Result<BindingKind> {
        let &direct = scope.siblings.get(call_id).unwrap_or_else(|| {
            panic!(
                "sub-node {call_id} not found in {}",
                self.nodes[scope.pipeline.0].fqname
            )
        });
        let target = &self.nodes[direct.0];
        match target.kind {
            NodeKind::Stage => Ok(BindingKind::Reference {
                node: direct,
                direct_node: direct,
                output: output.to_string(),
            }),
            NodeKind::Pipeline => {
                let ret = target
                    .ret_bindings
                    .iter()
                    .find(|b| b.id == output)
                    .unwrap_or_else(|| {
                        panic!("{}.{output} does not name a pipeline return", target.fqname)
                    });
                // Inherit the resolved binding, but report the direct edge.
                Ok(match &ret.kind {
                    BindingKind::Reference { node, output, .. } => BindingKind::Reference {
                        node: *node,
                        direct_node: direct,
                        output: output.clone(),
                    },
                    other => other.clone(),
                })
            }
        }
    }
}

/// Topologically order a pipeline's calls by their sibling references so a
/// referenced call is always built before its referencers.
fn order_calls<'c>(pipeline_fqname: &str, calls: &'c [CallStm]) -> Result<Vec<&'c CallStm>> {
    let index_of: HashMap<&str, usize> = calls
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();
    let mut dag: DiGraph<usize, ()> = DiGraph::new();
    let node_ids: Vec<_> = (0..calls.len()).map(|i| dag.add_node(i)).collect();
    for (i, call) in calls.iter().enumerate() {
        let mut referenced = HashSet::new();
        for bind in &call.bindings {
            collect_refs(&bind.exp, &mut referenced);
        }
        if let Some(disabled) = &call.modifiers.disabled {
            collect_refs(disabled, &mut referenced);
        }
        for name in referenced {
            if let Some(&j) = index_of.get(name.as_str()) {
                dag.add_edge(node_ids[j], node_ids[i], ());
            }
        }
    }
    match toposort(&dag, None) {
        Ok(order) => Ok(order.into_iter().map(|n| &calls[dag[n]]).collect()),
        Err(cycle) => Err(MartianError::GraphCycle(format!(
            "{pipeline_fqname}.{}",
            calls[dag[cycle.node_id()]].id
        ))),
    }
}

fn collect_refs(exp: &Exp, out: &mut HashSet<String>) {
    match exp {
        Exp::Ref { id, .. } => {
            out.insert(id.clone());
        }
        Exp::Array { elements } => {
            for element in elements {
                collect_refs(element, out);
            }
        }
        _ => {}
    }
}

/// Wire pre/post relations from the built bindings.
fn attach_relations(graph: &mut Graph) {
    let mut edges: Vec<(NodeId, Vec<NodeId>, Vec<NodeId>)> = Vec::new();
    for id in graph.ids() {
        let node = graph.node(id);
        let mut bindings: Vec<&Binding> = node.arg_bindings.iter().collect();
        bindings.extend(node.ret_bindings.iter());
        bindings.extend(node.disabled.iter());
        let owned: Vec<Binding> = bindings.into_iter().cloned().collect();
        let (prenodes, direct, _) = recurse_bound_nodes(&owned);
        edges.push((id, prenodes, direct));
    }
    for (id, prenodes, direct) in edges {
        for &p in &prenodes {
            let posts = &mut graph.node_mut(p).postnodes;
            if !posts.contains(&id) {
                posts.push(id);
            }
        }
        let node = graph.node_mut(id);
        node.prenodes = prenodes;
        node.direct_prenodes = direct;
    }
}

/// Populate per-fork file-consumer accounting for VDR.
///
/// A top-level pipeline's bound outputs are pinned: the argument is recorded
/// in `file_args` with no consumer node (`None`), but no `file_post_nodes`
/// entry is made, since a top-level pipeline never counts as "done".
/// Non-top pipelines force no retention at all.
fn attach_file_args(graph: &mut Graph) {
    let mut updates: Vec<(NodeId, Option<NodeId>, HashMap<NodeId, HashSet<String>>)> = Vec::new();
    for id in graph.ids() {
        let node = graph.node(id);
        let set_node = match node.kind {
            NodeKind::Stage => Some(id),
            NodeKind::Pipeline if node.parent.is_none() => None,
            NodeKind::Pipeline => continue,
        };
        let mut bindings: Vec<Binding> = node.arg_bindings.clone();
        bindings.extend(node.ret_bindings.iter().cloned());
        let (_, _, file_parents) = recurse_bound_nodes(&bindings);
        if !file_parents.is_empty() {
            updates.push((id, set_node, file_parents));
        }
    }
    for (consumer, set_node, file_parents) in updates {
        for (producer, bound_args) in file_parents {
            let forks = &mut graph.node_mut(producer).forks;
            for fork in forks.iter_mut() {
                if let Some(consumer_id) = set_node {
                    fork.file_post_nodes
                        .entry(consumer_id)
                        .or_default()
                        .extend(bound_args.iter().cloned());
                }
                for arg in &bound_args {
                    fork.file_args
                        .entry(arg.clone())
                        .or_default()
                        .insert(set_node.map(|_| consumer));
                }
            }
        }
    }
}

/// Compute each node's sweep set (own sweeps plus every upstream sweep,
/// uniqued by root id and sorted) and materialize one fork per element of
/// the cartesian product of the value sets.
fn expand_sweeps(graph: &mut Graph) -> Result<()> {
    let order = prenode_topo_order(graph)?;
    for id in order {
        let node = graph.node(id);
        let mut table: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut own: Vec<(&str, &[Value])> = Vec::new();
        for binding in node
            .arg_bindings
            .iter()
            .chain(node.ret_bindings.iter())
            .chain(node.disabled.iter())
        {
            binding.collect_sweeps(&mut own);
        }
        for (root_id, values) in own {
            table.insert(root_id.to_string(), values.to_vec());
        }
        for &prenode in &node.prenodes {
            for sweep in &graph.node(prenode).sweep_bindings {
                table.insert(sweep.root_id.clone(), sweep.values.clone());
            }
        }

        let sweep_bindings: Vec<SweepBinding> = table
            .into_iter()
            .map(|(root_id, values)| SweepBinding { root_id, values })
            .collect();

        let permutes = cartesian_product(&sweep_bindings);
        debug!(fqname = %node.fqname, forks = permutes.len(), "expanding forks");

        let split = node.stage.as_ref().map(|s| s.split).unwrap_or(false);
        let fqname = node.fqname.clone();
        let path = node.path.clone();
        let journal_dir = node_journal_dir(graph, id);
        let tmp_path = node_tmp_dir(graph, id);

        let node = graph.node_mut(id);
        node.sweep_bindings = sweep_bindings;
        node.forks = permutes
            .into_iter()
            .enumerate()
            .map(|(index, permute)| {
                Fork::new(&fqname, &path, &journal_dir, &tmp_path, index, permute, split)
            })
            .collect();
    }
    Ok(())
}

fn node_journal_dir(graph: &Graph, _id: NodeId) -> PathBuf {
    // The journal directory is shared by every node in the pipestance.
    pipestance_root(graph).join("journal")
}

fn node_tmp_dir(graph: &Graph, _id: NodeId) -> PathBuf {
    pipestance_root(graph).join("tmp")
}

fn pipestance_root(graph: &Graph) -> PathBuf {
    graph
        .node(graph.root)
        .path
        .parent()
        .expect("root node path has a parent")
        .to_path_buf()
}

/// Cartesian product of the sweep value sets, in sorted-root order. An
/// empty sweep set yields exactly one empty permutation.
fn cartesian_product(sweeps: &[SweepBinding]) -> Vec<ArgPermute> {
    let mut permutes: Vec<ArgPermute> = vec![ArgPermute::new()];
    for sweep in sweeps {
        let mut next = Vec::with_capacity(permutes.len() * sweep.values.len());
        for permute in &permutes {
            for value in &sweep.values {
                let mut p = permute.clone();
                p.insert(sweep.root_id.clone(), value.clone());
                next.push(p);
            }
        }
        permutes = next;
    }
    permutes
}

/// Topological order over prenode edges; a cycle is a malformed graph.
fn prenode_topo_order(graph: &Graph) -> Result<Vec<NodeId>> {
    let mut dag: DiGraph<usize, ()> = DiGraph::new();
    let petgraph_ids: Vec<_> = (0..graph.len()).map(|i| dag.add_node(i)).collect();
    for id in graph.ids() {
        for &prenode in &graph.node(id).prenodes {
            dag.add_edge(petgraph_ids[prenode.0], petgraph_ids[id.0], ());
        }
    }
    match toposort(&dag, None) {
        Ok(order) => Ok(order.into_iter().map(|n| NodeId(dag[n])).collect()),
        Err(cycle) => Err(MartianError::GraphCycle(
            graph.node(NodeId(dag[cycle.node_id()])).fqname.clone(),
        )),
    }
}

/// Link each fork to the parent fork whose permutation it extends, across
/// the subpipeline boundary.
fn link_forks(graph: &mut Graph) {
    let mut links: Vec<(NodeId, usize, NodeId, usize)> = Vec::new();
    for id in graph.ids() {
        let node = graph.node(id);
        if node.kind != NodeKind::Pipeline {
            continue;
        }
        for fork in &node.forks {
            for &sub in &node.subnodes {
                if let Some(matched) = graph.node(sub).match_fork(&fork.arg_permute) {
                    links.push((sub, matched.index, id, fork.index));
                }
            }
        }
    }
    for (sub, sub_index, parent, parent_index) in links {
        graph.node_mut(sub).forks[sub_index].parent_fork = Some(ForkRef {
            node: parent,
            index: parent_index,
        });
        graph.node_mut(parent).forks[parent_index]
            .subforks
            .push(ForkRef {
                node: sub,
                index: sub_index,
            });
    }
}

/// Preflight stages gate everything else: make each preflight top-level call
/// a prenode of every non-preflight sibling, recursively through subnodes.
pub(crate) fn add_preflight_edges(graph: &mut Graph) {
    let root = graph.root();
    let subnodes = graph.node(root).subnodes.clone();
    let preflights: Vec<NodeId> = subnodes
        .iter()
        .copied()
        .filter(|&id| graph.node(id).preflight)
        .collect();
    if preflights.is_empty() {
        return;
    }
    let targets: Vec<NodeId> = subnodes
        .iter()
        .copied()
        .filter(|&id| !graph.node(id).preflight)
        .collect();
    for target in targets {
        for &preflight in &preflights {
            set_prenode_recursive(graph, target, preflight);
        }
    }
}

fn set_prenode_recursive(graph: &mut Graph, target: NodeId, prenode: NodeId) {
    let subnodes = graph.node(target).subnodes.clone();
    for sub in subnodes {
        set_prenode_recursive(graph, sub, prenode);
    }
    let node = graph.node_mut(target);
    if !node.prenodes.contains(&prenode) {
        node.prenodes.push(prenode);
    }
    let pre = graph.node_mut(prenode);
    if !pre.postnodes.contains(&target) {
        pre.postnodes.push(target);
    }
}
