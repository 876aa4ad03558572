// src/journal.rs

//! The journal watcher.
//!
//! Jobs report transitions by dropping empty breadcrumb files into the
//! pipestance's `journal/` directory, named
//!
//! ```text
//! <fqname>.fork<N>[.chnk<M>][.u<uniq>].<state>
//! ```
//!
//! where `<state>` is a metadata kind, optionally prefixed with `split_` or
//! `join_` for those phases. Each scheduler tick scans the directory,
//! applies the updates to the matching fork or chunk metadata caches,
//! removes the breadcrumbs, and invalidates any stale negative cache
//! observations made before the tick began.

use std::path::Path;
use std::sync::OnceLock;
use std::time::SystemTime;

use regex::Regex;
use tracing::{debug, info};

use crate::frontier::Frontier;
use crate::graph::Graph;
use crate::metadata::{Metadata, MetadataFile};
use crate::types::StageType;

/// Decomposition of one journal file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub fqname: String,
    pub fork_index: usize,
    pub chunk_index: Option<usize>,
    pub uniquifier: Option<String>,
    pub state: String,
}

fn journal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(.*)\.fork(\d+)(?:\.chnk(\d+))?(?:\.u([a-f0-9]{10}))?\.(.*)$").unwrap()
    })
}

/// Parse a journal file name; returns `None` for names that do not match.
pub fn parse_journal_name(name: &str) -> Option<JournalEntry> {
    let caps = journal_re().captures(name)?;
    Some(JournalEntry {
        fqname: caps.get(1)?.as_str().to_string(),
        fork_index: caps.get(2)?.as_str().parse().ok()?,
        chunk_index: caps.get(3).and_then(|m| m.as_str().parse().ok()),
        uniquifier: caps.get(4).map(|m| m.as_str().to_string()),
        state: caps.get(5)?.as_str().to_string(),
    })
}

/// Split a breadcrumb state into its phase prefix and metadata kind:
/// `split_complete` → (split phase, complete).
fn split_state(state: &str) -> (Option<StageType>, Option<MetadataFile>) {
    if let Some(rest) = state.strip_prefix("split_") {
        (Some(StageType::Split), MetadataFile::from_name(rest))
    } else if let Some(rest) = state.strip_prefix("join_") {
        (Some(StageType::Join), MetadataFile::from_name(rest))
    } else {
        (None, MetadataFile::from_name(state))
    }
}

/// One pass of the journal watcher. Scans the journal directory, applies
/// the observed transitions, removes the breadcrumbs (unless read-only),
/// then invalidates stale negative cache entries on every frontier node and
/// emits one progress line per updated fork.
pub fn refresh_state(
    graph: &Graph,
    frontier: &Frontier,
    journal_dir: &Path,
    queue_grace: std::time::Duration,
    read_only: bool,
) {
    let start_time = SystemTime::now() - queue_grace;

    let mut updated: Vec<(String, usize)> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(journal_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                continue;
            }
            if let Some(parsed) = parse_journal_name(&name) {
                if apply_update(graph, &parsed) {
                    updated.push((parsed.fqname.clone(), parsed.fork_index));
                }
            }
            if !read_only {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    for id in frontier.node_ids() {
        for md in graph.node(id).collect_metadatas() {
            md.end_refresh(start_time);
        }
    }

    updated.sort();
    updated.dedup();
    for (fqname, fork_index) in updated {
        if let Some(id) = graph.find(&fqname) {
            let state = graph.fork_state(id, fork_index);
            info!("{fqname}.fork{fork_index} -> {state}");
        }
    }
}

/// Apply one breadcrumb to the fork or chunk it names. Returns true if a
/// known fork was updated; unknown names are ignored.
fn apply_update(graph: &Graph, entry: &JournalEntry) -> bool {
    let Some(id) = graph.find(&entry.fqname) else {
        debug!(fqname = %entry.fqname, "journal entry for unknown node; ignoring");
        return false;
    };
    let node = graph.node(id);
    let Some(fork) = node.get_fork(entry.fork_index) else {
        debug!(fqname = %entry.fqname, fork = entry.fork_index,
            "journal entry for unknown fork; ignoring");
        return false;
    };

    let (phase, kind) = split_state(&entry.state);
    let Some(kind) = kind else {
        debug!(state = %entry.state, "journal entry with unknown state; ignoring");
        return false;
    };

    let metadata: &Metadata = match entry.chunk_index {
        Some(chunk_index) => {
            let Some(chunk) = fork.get_chunk(chunk_index) else {
                debug!(fqname = %entry.fqname, chunk = chunk_index,
                    "journal entry for unknown chunk; ignoring");
                return false;
            };
            &chunk.metadata
        }
        None => match phase {
            Some(StageType::Split) => fork.split_meta(),
            Some(StageType::Join) => fork.join_meta(),
            _ => &fork.metadata,
        },
    };

    // A breadcrumb from a superseded attempt must not resurrect it.
    if entry.uniquifier != metadata.uniquifier() {
        debug!(fqname = %entry.fqname, uniq = ?entry.uniquifier,
            "journal entry from a stale attempt; ignoring");
        return false;
    }

    metadata.cache_present(kind);
    if kind == MetadataFile::Progress {
        if let Ok(progress) = metadata.read_raw(MetadataFile::Progress) {
            info!("{}: {}", metadata.fqname(), progress.trim());
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fork_chunk_uniquifier_and_state() {
        let entry =
            parse_journal_name("ID.ps.P.S.fork0.chnk2.u0123456789.complete").unwrap();
        assert_eq!(entry.fqname, "ID.ps.P.S");
        assert_eq!(entry.fork_index, 0);
        assert_eq!(entry.chunk_index, Some(2));
        assert_eq!(entry.uniquifier.as_deref(), Some("0123456789"));
        assert_eq!(entry.state, "complete");
    }

    #[test]
    fn parses_phase_prefixed_states() {
        let entry = parse_journal_name("ID.ps.P.S.fork1.split_complete").unwrap();
        assert_eq!(entry.fork_index, 1);
        assert_eq!(entry.chunk_index, None);
        assert_eq!(entry.state, "split_complete");
        assert_eq!(
            split_state(&entry.state),
            (Some(StageType::Split), Some(MetadataFile::Complete))
        );
    }

    #[test]
    fn rejects_names_without_fork_component() {
        assert!(parse_journal_name("ID.ps.P.S.complete").is_none());
        assert!(parse_journal_name("random-file").is_none());
    }

    #[test]
    fn short_uniquifier_is_not_a_uniquifier() {
        // Nine hex characters do not match the uniquifier group; the `.uXXX`
        // component ends up inside the fqname/state split instead.
        let entry = parse_journal_name("ID.ps.P.S.fork0.u012345678.errors").unwrap();
        assert_eq!(entry.uniquifier, None);
        assert_eq!(entry.state, "u012345678.errors");
    }
}
