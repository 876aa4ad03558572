// src/vdr.rs

//! Volatile Data Removal.
//!
//! Once every consumer of a volatile stage's output has finished, the files
//! backing that output are deleted and the deletions are recorded in the
//! fork's `_vdrkill` report. Consumer accounting is per output parameter:
//! `file_args` maps each output to the downstream nodes that may read files
//! from it. An entry with no consumer node marks a pipeline-level output,
//! which is pinned forever.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::graph::{Graph, NodeId};
use crate::metadata::MetadataFile;
use crate::node::NodeKind;
use crate::perf::{VdrEvent, VdrKillReport};
use crate::types::MetadataState;

/// Collect every eligible fork of a node. Pipelines own no files; only
/// volatile stages participate.
pub fn vdr_kill_node(graph: &Graph, id: NodeId) {
    let node = graph.node(id);
    if node.kind == NodeKind::Pipeline || !node.volatile {
        return;
    }
    for fork in &node.forks {
        if graph.fork_state(id, fork.index) != MetadataState::Complete {
            continue;
        }
        if fork.metadata.exists(MetadataFile::VdrKill) {
            continue;
        }
        match vdr_kill_fork(graph, id, fork) {
            Ok(Some(report)) => {
                info!(fqname = %fork.fqname, count = report.count, bytes = report.size,
                    "VDR removed volatile files");
                if let Err(e) = fork.metadata.write(MetadataFile::VdrKill, &report) {
                    warn!(fqname = %fork.fqname, error = %e, "could not write vdrkill report");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(fqname = %fork.fqname, error = %e, "VDR collection failed");
            }
        }
    }
}

/// Write the fork perf records for a node whose files may be about to
/// disappear, so later reporting does not depend on them.
pub fn cache_perf(graph: &Graph, id: NodeId) {
    let node = graph.node(id);
    for fork in &node.forks {
        if !fork.metadata.exists(MetadataFile::Perf) {
            let perf = fork.serialize_perf(node.restarts);
            if let Err(e) = fork.metadata.write(MetadataFile::Perf, &perf) {
                debug!(fqname = %fork.fqname, error = %e, "could not cache fork perf");
            }
        }
    }
}

/// Collect one fork. Returns `None` when nothing is eligible yet.
fn vdr_kill_fork(
    graph: &Graph,
    id: NodeId,
    fork: &crate::fork::Fork,
) -> crate::errors::Result<Option<VdrKillReport>> {
    let node = graph.node(id);
    let outs = match fork.metadata.read(MetadataFile::Outs, 0) {
        Ok(Value::Object(outs)) => outs,
        _ => return Ok(None),
    };

    let mut killable_args = Vec::new();
    let mut all_killable = true;
    for arg in outs.keys() {
        if arg_is_killable(graph, node.strict_volatile, fork, arg) {
            killable_args.push(arg.clone());
        } else {
            all_killable = false;
        }
    }
    if killable_args.is_empty() {
        return Ok(None);
    }

    // Gather the file paths backing the killable outputs. Outs may point
    // into the fork's own files directory or into a chunk's.
    let mut roots: Vec<PathBuf> = vec![fork.metadata.files_path().to_path_buf()];
    roots.extend(
        fork.chunks
            .iter()
            .map(|c| c.metadata.files_path().to_path_buf()),
    );
    let mut paths: HashSet<PathBuf> = HashSet::new();
    for arg in &killable_args {
        for root in &roots {
            collect_file_paths(&outs[arg], root, &mut paths);
        }
    }
    // With no surviving consumer for anything, the files directories are
    // dead weight wholesale (split and join scratch included).
    if all_killable {
        paths.extend(roots);
        paths.insert(fork.split_meta().files_path().to_path_buf());
        paths.insert(fork.join_meta().files_path().to_path_buf());
    }

    let mut report = VdrKillReport::default();
    let mut sorted: Vec<PathBuf> = paths.into_iter().collect();
    sorted.sort();
    for path in sorted {
        if !path.exists() {
            continue;
        }
        let bytes = path_size(&path);
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {
                report.count += 1;
                report.size += bytes;
                report.paths.push(path.to_string_lossy().into_owned());
                report.events.push(VdrEvent {
                    path: path.to_string_lossy().into_owned(),
                    bytes,
                    timestamp: chrono::Local::now(),
                });
            }
            Err(e) => report
                .errors
                .push(format!("{}: {e}", path.to_string_lossy())),
        }
    }
    Ok(Some(report))
}

/// An output is killable when every consumer that might read files from it
/// has finished. Pinned outputs (a pipeline-level consumer, recorded as
/// `None`) are never killable. Under strict-volatile, consumers that are
/// themselves strict-volatile no longer hold files alive.
fn arg_is_killable(
    graph: &Graph,
    strict_volatile: bool,
    fork: &crate::fork::Fork,
    arg: &str,
) -> bool {
    match fork.file_args.get(arg) {
        None => true,
        Some(consumers) => consumers.iter().all(|consumer| match consumer {
            None => false,
            Some(id) => {
                graph.node_state(*id).satisfied()
                    || (strict_volatile && graph.node(*id).strict_volatile)
            }
        }),
    }
}

/// File names can hide anywhere a string can: walk strings, arrays and maps,
/// keeping paths under the fork's files directory.
fn collect_file_paths(value: &Value, files_dir: &Path, out: &mut HashSet<PathBuf>) {
    match value {
        Value::String(s) => {
            let path = Path::new(s);
            if path.starts_with(files_dir) {
                out.insert(path.to_path_buf());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_file_paths(item, files_dir, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_file_paths(item, files_dir, out);
            }
        }
        _ => {}
    }
}

fn path_size(path: &Path) -> u64 {
    if path.is_dir() {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                total += path_size(&entry.path());
            }
        }
        total
    } else {
        fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }
}
