// src/metadata.rs

//! Filesystem-backed metadata store.
//!
//! Every node, fork and chunk owns a directory of small typed files
//! (`_args`, `_outs`, `_complete`, ...). File presence is the primary state
//! signal; contents are JSON except for raw text kinds like `_errors`.
//!
//! Writes are atomic (temp file + rename) so readers never observe partial
//! contents. Existence checks go through a small cache; `end_refresh`
//! invalidates negative observations older than the start of the current
//! journal tick, so a cached "file absent" can never mask a write that
//! happened after the tick began.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{MartianError, Result};
use crate::types::MetadataState;

/// The enumerated metadata file kinds. Stable on-disk names, with a leading
/// underscore (`MetadataFile::Args` is the file `_args`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataFile {
    Invocation,
    MroSource,
    JobMode,
    Versions,
    Tags,
    Uuid,
    Timestamp,
    Args,
    Outs,
    StageDefs,
    Complete,
    Errors,
    Assert,
    Heartbeat,
    Log,
    StdOut,
    StdErr,
    Stackvars,
    Perf,
    VdrKill,
    JobInfo,
    ChunkDefs,
    ChunkOuts,
    Progress,
    QueuedLocally,
    Disabled,
    FinalState,
    MetadataZip,
    Lock,
}

impl MetadataFile {
    /// The bare kind name, as used in journal breadcrumbs.
    pub fn name(self) -> &'static str {
        match self {
            MetadataFile::Invocation => "invocation",
            MetadataFile::MroSource => "mrosource",
            MetadataFile::JobMode => "jobmode",
            MetadataFile::Versions => "versions",
            MetadataFile::Tags => "tags",
            MetadataFile::Uuid => "uuid",
            MetadataFile::Timestamp => "timestamp",
            MetadataFile::Args => "args",
            MetadataFile::Outs => "outs",
            MetadataFile::StageDefs => "stage_defs",
            MetadataFile::Complete => "complete",
            MetadataFile::Errors => "errors",
            MetadataFile::Assert => "assert",
            MetadataFile::Heartbeat => "heartbeat",
            MetadataFile::Log => "log",
            MetadataFile::StdOut => "stdout",
            MetadataFile::StdErr => "stderr",
            MetadataFile::Stackvars => "stackvars",
            MetadataFile::Perf => "perf",
            MetadataFile::VdrKill => "vdrkill",
            MetadataFile::JobInfo => "jobinfo",
            MetadataFile::ChunkDefs => "chunk_defs",
            MetadataFile::ChunkOuts => "chunk_outs",
            MetadataFile::Progress => "progress",
            MetadataFile::QueuedLocally => "queued_locally",
            MetadataFile::Disabled => "disabled",
            MetadataFile::FinalState => "finalstate",
            MetadataFile::MetadataZip => "metadata.zip",
            MetadataFile::Lock => "lock",
        }
    }

    /// The on-disk file name (`_<name>`).
    pub fn file_name(self) -> String {
        format!("_{}", self.name())
    }

    /// Inverse of [`MetadataFile::name`], used when parsing journal
    /// breadcrumbs and scanning directories.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "invocation" => MetadataFile::Invocation,
            "mrosource" => MetadataFile::MroSource,
            "jobmode" => MetadataFile::JobMode,
            "versions" => MetadataFile::Versions,
            "tags" => MetadataFile::Tags,
            "uuid" => MetadataFile::Uuid,
            "timestamp" => MetadataFile::Timestamp,
            "args" => MetadataFile::Args,
            "outs" => MetadataFile::Outs,
            "stage_defs" => MetadataFile::StageDefs,
            "complete" => MetadataFile::Complete,
            "errors" => MetadataFile::Errors,
            "assert" => MetadataFile::Assert,
            "heartbeat" => MetadataFile::Heartbeat,
            "log" => MetadataFile::Log,
            "stdout" => MetadataFile::StdOut,
            "stderr" => MetadataFile::StdErr,
            "stackvars" => MetadataFile::Stackvars,
            "perf" => MetadataFile::Perf,
            "vdrkill" => MetadataFile::VdrKill,
            "jobinfo" => MetadataFile::JobInfo,
            "chunk_defs" => MetadataFile::ChunkDefs,
            "chunk_outs" => MetadataFile::ChunkOuts,
            "progress" => MetadataFile::Progress,
            "queued_locally" => MetadataFile::QueuedLocally,
            "disabled" => MetadataFile::Disabled,
            "finalstate" => MetadataFile::FinalState,
            "metadata.zip" => MetadataFile::MetadataZip,
            "lock" => MetadataFile::Lock,
            _ => return None,
        })
    }
}

/// Identity used when dropping journal breadcrumbs for this metadata.
#[derive(Debug)]
struct JournalIdent {
    dir: PathBuf,
    /// `<fqname>.fork<N>[.chnk<M>]`.
    name: String,
    /// `""`, `"split_"` or `"join_"`.
    prefix: &'static str,
}

#[derive(Debug, Default)]
struct MetadataCache {
    present: HashSet<MetadataFile>,
    /// Negative observations with the time they were made.
    absent_since: HashMap<MetadataFile, SystemTime>,
    last_heartbeat: Option<SystemTime>,
}

#[derive(Debug)]
struct MetadataInner {
    fqname: String,
    path: PathBuf,
    files_path: PathBuf,
    temp_dir: Option<PathBuf>,
    journal: Option<JournalIdent>,
    uniquifier: Mutex<Option<String>>,
    cache: Mutex<MetadataCache>,
}

/// Cheaply cloneable handle to one metadata directory.
#[derive(Debug, Clone)]
pub struct Metadata {
    inner: Arc<MetadataInner>,
}

impl Metadata {
    pub fn new(fqname: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let files_path = path.join("files");
        Metadata {
            inner: Arc::new(MetadataInner {
                fqname: fqname.into(),
                path,
                files_path,
                temp_dir: None,
                journal: None,
                uniquifier: Mutex::new(None),
                cache: Mutex::new(MetadataCache::default()),
            }),
        }
    }

    /// A metadata directory whose state transitions are reported through the
    /// pipestance journal. `journal_name` is the breadcrumb stem
    /// (`<fqname>.fork<N>[.chnk<M>]`); `prefix` distinguishes split/join
    /// phase files that share the fork's stem.
    pub fn with_journal(
        fqname: impl Into<String>,
        path: impl Into<PathBuf>,
        journal_dir: impl Into<PathBuf>,
        journal_name: impl Into<String>,
        prefix: &'static str,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        let path = path.into();
        let files_path = path.join("files");
        Metadata {
            inner: Arc::new(MetadataInner {
                fqname: fqname.into(),
                path,
                files_path,
                temp_dir,
                journal: Some(JournalIdent {
                    dir: journal_dir.into(),
                    name: journal_name.into(),
                    prefix,
                }),
                uniquifier: Mutex::new(None),
                cache: Mutex::new(MetadataCache::default()),
            }),
        }
    }

    pub fn fqname(&self) -> &str {
        &self.inner.fqname
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Directory where the stage writes its output files.
    pub fn files_path(&self) -> &Path {
        &self.inner.files_path
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.inner.temp_dir.as_deref()
    }

    pub fn file_path(&self, kind: MetadataFile) -> PathBuf {
        self.inner.path.join(kind.file_name())
    }

    pub fn uniquifier(&self) -> Option<String> {
        self.inner.uniquifier.lock().unwrap().clone()
    }

    pub fn set_uniquifier(&self, uniq: Option<String>) {
        *self.inner.uniquifier.lock().unwrap() = uniq;
    }

    /// Create the metadata directory, its files directory and, if set, the
    /// scratch directory.
    pub fn mkdirs(&self) -> Result<()> {
        fs::create_dir_all(&self.inner.path)?;
        fs::create_dir_all(&self.inner.files_path)?;
        if let Some(td) = &self.inner.temp_dir {
            fs::create_dir_all(td)?;
        }
        Ok(())
    }

    //
    // Existence cache
    //

    pub fn exists(&self, kind: MetadataFile) -> bool {
        let mut cache = self.inner.cache.lock().unwrap();
        if cache.present.contains(&kind) {
            return true;
        }
        if cache.absent_since.contains_key(&kind) {
            return false;
        }
        drop(cache);
        let found = self.file_path(kind).exists();
        let mut cache = self.inner.cache.lock().unwrap();
        if found {
            cache.present.insert(kind);
        } else {
            cache.absent_since.entry(kind).or_insert_with(SystemTime::now);
        }
        found
    }

    /// Record that `kind` now exists without touching the filesystem; used by
    /// the journal watcher when a breadcrumb arrives, and by our own writes.
    pub fn cache_present(&self, kind: MetadataFile) {
        let mut cache = self.inner.cache.lock().unwrap();
        cache.absent_since.remove(&kind);
        cache.present.insert(kind);
    }

    pub fn uncache(&self, kind: MetadataFile) {
        let mut cache = self.inner.cache.lock().unwrap();
        cache.present.remove(&kind);
        cache.absent_since.remove(&kind);
    }

    /// Scan the directory once and seed the cache with everything present.
    pub fn load_cache(&self) {
        let mut present = HashSet::new();
        if let Ok(entries) = fs::read_dir(&self.inner.path) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(stripped) = name.strip_prefix('_') {
                    if let Some(kind) = MetadataFile::from_name(stripped) {
                        present.insert(kind);
                    }
                }
            }
        }
        let mut cache = self.inner.cache.lock().unwrap();
        cache.present = present;
        cache.absent_since.clear();
    }

    /// Drop cached "absent" observations made before `start_time`, so that a
    /// stale negative lookup cannot mask a file written during the tick.
    pub fn end_refresh(&self, start_time: SystemTime) {
        let mut cache = self.inner.cache.lock().unwrap();
        cache.absent_since.retain(|_, observed| *observed >= start_time);
    }

    //
    // Reads and writes
    //

    /// Atomic write: serialize to a `.tmp` sibling, then rename into place.
    pub fn write<T: Serialize>(&self, kind: MetadataFile, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.write_raw(kind, &text)
    }

    pub fn write_raw(&self, kind: MetadataFile, text: &str) -> Result<()> {
        let target = self.file_path(kind);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = target.with_file_name(format!("{}.tmp", kind.file_name()));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &target)?;
        self.cache_present(kind);
        Ok(())
    }

    /// Write the current timestamp to `kind` (e.g. `_queued_locally`).
    pub fn write_time(&self, kind: MetadataFile) -> Result<()> {
        self.write_raw(kind, &crate::util::timestamp())
    }

    pub fn read_raw(&self, kind: MetadataFile) -> Result<String> {
        Ok(fs::read_to_string(self.file_path(kind))?)
    }

    /// Read and decode a JSON metadata file. `mem_cap` bounds the file size
    /// in bytes; 0 means unlimited.
    pub fn read(&self, kind: MetadataFile, mem_cap: u64) -> Result<serde_json::Value> {
        let path = self.file_path(kind);
        if mem_cap > 0 {
            let len = fs::metadata(&path)?.len();
            if len > mem_cap {
                return Err(MartianError::MetadataTooLarge(path));
            }
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn read_into<T: DeserializeOwned>(&self, kind: MetadataFile) -> Result<T> {
        let text = self.read_raw(kind)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn open_file(&self, kind: MetadataFile) -> Result<File> {
        Ok(File::open(self.file_path(kind))?)
    }

    pub fn remove(&self, kind: MetadataFile) -> Result<()> {
        let path = self.file_path(kind);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.uncache(kind);
        Ok(())
    }

    //
    // Journal breadcrumbs
    //

    /// Drop a breadcrumb into the pipestance journal so the watcher observes
    /// this metadata's transition on its next tick. Used by the runtime for
    /// files it writes itself; jobs drop their own breadcrumbs.
    pub fn update_journal(&self, kind: MetadataFile) -> Result<()> {
        let Some(journal) = &self.inner.journal else {
            return Ok(());
        };
        let mut name = journal.name.clone();
        if let Some(uniq) = self.uniquifier() {
            name.push_str(".u");
            name.push_str(&uniq);
        }
        name.push('.');
        name.push_str(journal.prefix);
        name.push_str(kind.name());
        fs::create_dir_all(&journal.dir)?;
        let target = journal.dir.join(&name);
        let tmp = journal.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, b"")?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// The journal path stem handed to jobs (`journal/<name>[.u<uniq>]`);
    /// the job appends `.<prefix><kind>` when dropping breadcrumbs.
    pub fn journal_file_stem(&self) -> Option<PathBuf> {
        let journal = self.inner.journal.as_ref()?;
        let mut name = journal.name.clone();
        if let Some(uniq) = self.uniquifier() {
            name.push_str(".u");
            name.push_str(&uniq);
        }
        Some(journal.dir.join(name))
    }

    //
    // Heartbeat
    //

    pub fn reset_heartbeat(&self) {
        let mut cache = self.inner.cache.lock().unwrap();
        cache.last_heartbeat = None;
    }

    /// If this metadata is in the Running state and its heartbeat file has
    /// not been refreshed within `timeout`, declare the job failed with a
    /// synthetic error. Returns true if a failure was recorded.
    pub fn check_heartbeat(&self, timeout: Duration) -> bool {
        if self.get_state() != Some(MetadataState::Running) {
            return false;
        }
        let now = SystemTime::now();
        let mut last = {
            let cache = self.inner.cache.lock().unwrap();
            cache.last_heartbeat
        };
        if self.exists(MetadataFile::Heartbeat) {
            if let Ok(meta) = fs::metadata(self.file_path(MetadataFile::Heartbeat)) {
                if let Ok(mtime) = meta.modified() {
                    if last.map_or(true, |l| mtime > l) {
                        last = Some(mtime);
                    }
                }
            }
        }
        let last = match last {
            Some(l) => l,
            None => {
                // First observation of a running job; start the clock now.
                let mut cache = self.inner.cache.lock().unwrap();
                cache.last_heartbeat = Some(now);
                return false;
            }
        };
        {
            let mut cache = self.inner.cache.lock().unwrap();
            cache.last_heartbeat = Some(last);
        }
        let age = now.duration_since(last).unwrap_or(Duration::ZERO);
        if age <= timeout {
            return false;
        }
        let minutes = timeout.as_secs() / 60;
        let msg = format!(
            "{} has not updated heartbeat in {} minutes",
            self.inner.fqname, minutes
        );
        warn!(fqname = %self.inner.fqname, "heartbeat expired; failing job");
        if let Err(e) = self.write_raw(MetadataFile::Errors, &msg) {
            warn!(fqname = %self.inner.fqname, error = %e, "could not record heartbeat failure");
            return false;
        }
        true
    }

    //
    // State
    //

    /// State signalled by the files currently present, if any.
    pub fn get_state(&self) -> Option<MetadataState> {
        if self.exists(MetadataFile::Errors) || self.exists(MetadataFile::Assert) {
            return Some(MetadataState::Failed);
        }
        if self.exists(MetadataFile::Complete) {
            return Some(MetadataState::Complete);
        }
        if self.exists(MetadataFile::Log) {
            return Some(MetadataState::Running);
        }
        if self.exists(MetadataFile::QueuedLocally) || self.exists(MetadataFile::JobInfo) {
            return Some(MetadataState::Queued);
        }
        None
    }

    /// Delete every metadata file in this directory (not the stage's output
    /// files). Used by fork reset.
    pub fn remove_all(&self) -> Result<()> {
        if let Ok(entries) = fs::read_dir(&self.inner.path) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('_') {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        debug!(path = ?entry.path(), error = %e, "could not remove metadata file");
                    }
                }
            }
        }
        let mut cache = self.inner.cache.lock().unwrap();
        cache.present.clear();
        cache.absent_since.clear();
        cache.last_heartbeat = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_exists_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let md = Metadata::new("ID.test.P.S", dir.path().join("S"));
        md.mkdirs().unwrap();
        md.write_raw(MetadataFile::Errors, "boom").unwrap();
        assert!(md.exists(MetadataFile::Errors));
        assert_eq!(md.read_raw(MetadataFile::Errors).unwrap(), "boom");
        assert_eq!(md.get_state(), Some(MetadataState::Failed));
    }

    #[test]
    fn end_refresh_invalidates_stale_absence() {
        let dir = tempfile::tempdir().unwrap();
        let md = Metadata::new("ID.test.P.S", dir.path().join("S"));
        md.mkdirs().unwrap();

        // Observe absence, then have "someone else" write the file directly.
        assert!(!md.exists(MetadataFile::Complete));
        fs::write(md.file_path(MetadataFile::Complete), "").unwrap();

        // Cached absence still wins...
        assert!(!md.exists(MetadataFile::Complete));

        // ...until a tick that started after the observation invalidates it.
        md.end_refresh(SystemTime::now() + Duration::from_secs(1));
        assert!(md.exists(MetadataFile::Complete));
    }

    #[test]
    fn journal_breadcrumb_name_includes_prefix_and_uniquifier() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("journal");
        let md = Metadata::with_journal(
            "ID.test.P.S",
            dir.path().join("S").join("fork0").join("split"),
            &journal,
            "ID.test.P.S.fork0",
            "split_",
            None,
        );
        md.mkdirs().unwrap();
        md.update_journal(MetadataFile::Complete).unwrap();
        assert!(journal.join("ID.test.P.S.fork0.split_complete").exists());

        md.set_uniquifier(Some("0123456789".to_string()));
        md.update_journal(MetadataFile::Errors).unwrap();
        assert!(journal
            .join("ID.test.P.S.fork0.u0123456789.split_errors")
            .exists());
    }

    #[test]
    fn remove_all_clears_metadata_but_not_files_dir() {
        let dir = tempfile::tempdir().unwrap();
        let md = Metadata::new("ID.test.P.S", dir.path().join("S"));
        md.mkdirs().unwrap();
        md.write_raw(MetadataFile::Complete, "").unwrap();
        fs::write(md.files_path().join("data.txt"), "payload").unwrap();

        md.remove_all().unwrap();
        assert!(!md.exists(MetadataFile::Complete));
        assert!(md.files_path().join("data.txt").exists());
    }
}
