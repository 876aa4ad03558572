// src/chunk.rs

//! One shard of a stage's main phase.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobmgr::JobResources;
use crate::metadata::Metadata;
use crate::types::MetadataState;

/// One chunk definition, as emitted by a stage's split: a resource request
/// plus chunk-local arguments that are merged over the fork's arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDef {
    #[serde(flatten)]
    pub resources: JobResources,
    #[serde(flatten)]
    pub args: serde_json::Map<String, Value>,
}

/// Contents of `_stage_defs`: the chunk plan plus the join's resource hint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageDefs {
    pub chunks: Vec<ChunkDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JobResources>,
}

#[derive(Debug)]
pub struct Chunk {
    pub index: usize,
    pub chunk_def: ChunkDef,
    pub metadata: Metadata,
    pub has_been_run: bool,
}

impl Chunk {
    /// `journal_stem` is the owning fork's breadcrumb stem
    /// (`<fqname>.fork<N>`); the chunk appends its own `.chnk<M>` component.
    /// A uniquifier (from a restarted attempt) moves the chunk into a fresh
    /// directory so files from the dead attempt cannot collide.
    pub fn new(
        fork_path: &Path,
        journal_dir: &Path,
        journal_stem: &str,
        tmp_path: &Path,
        index: usize,
        chunk_def: ChunkDef,
        uniquifier: Option<String>,
    ) -> Self {
        let dir_name = match &uniquifier {
            Some(u) => format!("chnk{index}.u{u}"),
            None => format!("chnk{index}"),
        };
        let journal_name = format!("{journal_stem}.chnk{index}");
        let fqname = format!("{journal_stem}.chnk{index}");
        let metadata = Metadata::with_journal(
            fqname,
            fork_path.join(dir_name),
            journal_dir,
            journal_name.clone(),
            "",
            Some(tmp_path.join(&journal_name)),
        );
        metadata.set_uniquifier(uniquifier);
        Chunk {
            index,
            chunk_def,
            metadata,
            has_been_run: false,
        }
    }

    pub fn get_state(&self) -> MetadataState {
        self.metadata.get_state().unwrap_or(MetadataState::Ready)
    }

    /// The arguments this chunk's job sees: the fork's resolved arguments
    /// with the chunk-local arguments layered on top.
    pub fn chunk_args(
        &self,
        fork_args: &serde_json::Map<String, Value>,
    ) -> serde_json::Map<String, Value> {
        let mut args = fork_args.clone();
        for (k, v) in &self.chunk_def.args {
            args.insert(k.clone(), v.clone());
        }
        args
    }
}
