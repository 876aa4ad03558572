//! A fake job manager.
//!
//! Plays the stage-code adapter's role without spawning processes: each
//! `exec_job` call runs a registered handler synchronously, writing the
//! metadata files and journal breadcrumbs a real job would, so the whole
//! engine (journal watcher, state machines, VDR, retry) is exercised
//! end-to-end.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};

use martian::chunk::StageDefs;
use martian::errors::Result;
use martian::jobmgr::{JobManager, JobResources};
use martian::metadata::{Metadata, MetadataFile};

/// What a fake job does when it "runs".
#[derive(Clone)]
pub enum FakeOutcome {
    /// Write `_outs` (main/join) and complete.
    Success(Map<String, Value>),
    /// Write `_stage_defs` (split) and complete.
    SplitPlan(StageDefs),
    /// Write `_errors` and fail.
    Errors(String),
    /// Write `_assert` and fail.
    Assert(String),
    /// Write `_log` only: the job looks alive but never finishes.
    Hang,
}

/// Context handed to a stage handler.
pub struct FakeJob<'a> {
    /// The dispatched work unit (`ID.x.P.S.fork0[.chnk0]`).
    pub fqname: String,
    /// "split", "main" or "join".
    pub shell: String,
    pub metadata: &'a Metadata,
    /// Decoded `_args`.
    pub args: Map<String, Value>,
}

type StageFn = Arc<dyn Fn(&FakeJob<'_>) -> FakeOutcome + Send + Sync>;

#[derive(Default)]
pub struct FakeJobManager {
    /// node fqname → handler; consulted for every shell of that node.
    handlers: Mutex<HashMap<String, StageFn>>,
    /// (node fqname, shell) → one-shot outcomes, consumed in order. Takes
    /// precedence over `handlers`; used for failure injection.
    one_shots: Mutex<HashMap<(String, String), Vec<FakeOutcome>>>,
    /// Every dispatched (fqname, shell), in order.
    pub calls: Mutex<Vec<(String, String)>>,
}

impl FakeJobManager {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeJobManager::default())
    }

    /// Register the handler for a stage node (keyed by node fqname, e.g.
    /// `ID.t.P.S`).
    pub fn on_stage(
        &self,
        node_fqname: &str,
        f: impl Fn(&FakeJob<'_>) -> FakeOutcome + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .unwrap()
            .insert(node_fqname.to_string(), Arc::new(f));
    }

    /// Queue a one-shot outcome for the next dispatch of (node, shell).
    pub fn inject(&self, node_fqname: &str, shell: &str, outcome: FakeOutcome) {
        self.one_shots
            .lock()
            .unwrap()
            .entry((node_fqname.to_string(), shell.to_string()))
            .or_default()
            .push(outcome);
    }

    pub fn dispatched(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// `ID.t.P.S.fork0.chnk0` → `ID.t.P.S`.
    fn node_fqname(job_fqname: &str) -> String {
        match job_fqname.find(".fork") {
            Some(pos) => job_fqname[..pos].to_string(),
            None => job_fqname.to_string(),
        }
    }

    fn outcome_for(&self, job: &FakeJob<'_>) -> FakeOutcome {
        let node = Self::node_fqname(&job.fqname);
        if let Some(queue) = self
            .one_shots
            .lock()
            .unwrap()
            .get_mut(&(node.clone(), job.shell.clone()))
        {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        if let Some(handler) = self.handlers.lock().unwrap().get(&node) {
            return handler(job);
        }
        // Default behavior: a well-behaved no-op stage.
        match job.shell.as_str() {
            "split" => FakeOutcome::SplitPlan(StageDefs {
                chunks: vec![Default::default()],
                join: None,
            }),
            _ => FakeOutcome::Success(Map::new()),
        }
    }

    fn run(&self, metadata: &Metadata, shell: &str, fqname: &str) -> Result<()> {
        let args = match metadata.read(MetadataFile::Args, 0) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let job = FakeJob {
            fqname: fqname.to_string(),
            shell: shell.to_string(),
            metadata,
            args,
        };
        let outcome = self.outcome_for(&job);
        metadata.write_raw(MetadataFile::Log, "fake job log\n")?;
        metadata.update_journal(MetadataFile::Log)?;
        match outcome {
            FakeOutcome::Success(outs) => {
                metadata.write(MetadataFile::Outs, &Value::Object(outs))?;
                metadata.write_time(MetadataFile::Complete)?;
                metadata.update_journal(MetadataFile::Complete)?;
            }
            FakeOutcome::SplitPlan(defs) => {
                metadata.write(MetadataFile::StageDefs, &defs)?;
                metadata.write_time(MetadataFile::Complete)?;
                metadata.update_journal(MetadataFile::Complete)?;
            }
            FakeOutcome::Errors(text) => {
                metadata.write_raw(MetadataFile::Errors, &text)?;
                metadata.update_journal(MetadataFile::Errors)?;
            }
            FakeOutcome::Assert(text) => {
                metadata.write_raw(MetadataFile::Assert, &text)?;
                metadata.update_journal(MetadataFile::Assert)?;
            }
            FakeOutcome::Hang => {
                // Log only: the scheduler sees Running until the heartbeat
                // check gives up on it.
            }
        }
        Ok(())
    }
}

impl JobManager for FakeJobManager {
    fn exec_job(
        &self,
        _shell_cmd: &Path,
        _argv: Vec<String>,
        _envs: HashMap<String, String>,
        metadata: &Metadata,
        _res: &JobResources,
        fqname: &str,
        shell_name: &str,
        _local_override: bool,
    ) {
        self.calls
            .lock()
            .unwrap()
            .push((fqname.to_string(), shell_name.to_string()));
        if let Err(e) = self.run(metadata, shell_name, fqname) {
            let _ = metadata.write_raw(MetadataFile::Errors, &format!("fake job failed: {e}"));
            let _ = metadata.update_journal(MetadataFile::Errors);
        }
    }

    fn get_system_reqs(&self, res: &JobResources) -> JobResources {
        JobResources {
            threads: res.threads.max(1),
            mem_gb: res.mem_gb.max(1),
            vmem_gb: res.vmem_gb,
            special: res.special.clone(),
        }
    }

    fn queue_check_grace(&self) -> Duration {
        Duration::ZERO
    }

    fn end_job(&self, _metadata: &Metadata) {}

    fn refresh_resources(&self, _local_mode: bool) -> Result<()> {
        Ok(())
    }
}
