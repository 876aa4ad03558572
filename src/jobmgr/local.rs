// src/jobmgr/local.rs

//! Local job manager.
//!
//! Runs jobs as child processes on this machine, bounded by a reservation
//! over (cores, memGB, vmemGB). Each submission acquires its reservation,
//! spawns the process with stdout/stderr attached to the job's metadata
//! files, and releases the reservation when the process exits. Jobs report
//! their own progress through metadata files and journal breadcrumbs; the
//! manager only synthesizes an `_errors` file when a process dies without
//! leaving one.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::jobmgr::{JobManager, JobResources};
use crate::metadata::{Metadata, MetadataFile};

#[derive(Debug, Clone, Copy)]
struct Avail {
    cores: i64,
    mem_gb: i64,
    vmem_gb: i64,
}

/// Async counting reservation over three resource dimensions.
#[derive(Debug)]
struct ResourceSem {
    avail: Mutex<Avail>,
    notify: Notify,
}

impl ResourceSem {
    fn new(cores: i64, mem_gb: i64, vmem_gb: i64) -> Self {
        ResourceSem {
            avail: Mutex::new(Avail {
                cores,
                mem_gb,
                vmem_gb,
            }),
            notify: Notify::new(),
        }
    }

    async fn acquire(&self, res: &JobResources) {
        loop {
            // Register for wakeup before checking, so a release between the
            // check and the await cannot be lost.
            let notified = self.notify.notified();
            {
                let mut avail = self.avail.lock().unwrap();
                if avail.cores >= res.threads
                    && avail.mem_gb >= res.mem_gb
                    && avail.vmem_gb >= res.vmem_gb
                {
                    avail.cores -= res.threads;
                    avail.mem_gb -= res.mem_gb;
                    avail.vmem_gb -= res.vmem_gb;
                    return;
                }
            }
            notified.await;
        }
    }

    fn release(&self, res: &JobResources) {
        let mut avail = self.avail.lock().unwrap();
        avail.cores += res.threads;
        avail.mem_gb += res.mem_gb;
        avail.vmem_gb += res.vmem_gb;
        drop(avail);
        self.notify.notify_waiters();
    }

    fn current_mem_gb(&self) -> i64 {
        self.avail.lock().unwrap().mem_gb
    }
}

pub struct LocalJobManager {
    cores: i64,
    mem_gb: i64,
    vmem_gb: i64,
    monitor: bool,
    sem: std::sync::Arc<ResourceSem>,
    handle: tokio::runtime::Handle,
}

impl LocalJobManager {
    /// Must be constructed inside a tokio runtime; spawned jobs run on it.
    ///
    /// Nonpositive capacities fall back to the machine's logical core count
    /// and a conventional memory estimate of 1 GB per core.
    pub fn new(cores: i64, mem_gb: i64, vmem_gb: i64, monitor: bool) -> Self {
        let detected = std::thread::available_parallelism()
            .map(|n| n.get() as i64)
            .unwrap_or(1);
        let cores = if cores > 0 { cores } else { detected };
        let mem_gb = if mem_gb > 0 { mem_gb } else { cores };
        let vmem_gb = if vmem_gb > 0 { vmem_gb } else { mem_gb * 2 };
        info!(cores, mem_gb, vmem_gb, "local job manager configured");
        LocalJobManager {
            cores,
            mem_gb,
            vmem_gb,
            monitor,
            sem: std::sync::Arc::new(ResourceSem::new(cores, mem_gb, vmem_gb)),
            handle: tokio::runtime::Handle::current(),
        }
    }

    /// Memory currently available for the runtime's own use (e.g. reading
    /// large metadata files). Capped at 1 GB when monitoring is on so file
    /// reads cannot starve jobs; 0 means unlimited.
    pub fn free_mem_bytes(&self) -> u64 {
        if !self.monitor {
            return 0;
        }
        let free_gb = self.sem.current_mem_gb().max(0).min(1);
        (free_gb as u64) * 1024 * 1024 * 1024
    }
}

impl JobManager for LocalJobManager {
    fn exec_job(
        &self,
        shell_cmd: &Path,
        argv: Vec<String>,
        envs: HashMap<String, String>,
        metadata: &Metadata,
        res: &JobResources,
        fqname: &str,
        shell_name: &str,
        _local_override: bool,
    ) {
        let res = self.get_system_reqs(res);
        let sem = std::sync::Arc::clone(&self.sem);
        let metadata = metadata.clone();
        let shell_cmd = shell_cmd.to_path_buf();
        let fqname = fqname.to_string();
        let shell_name = shell_name.to_string();

        self.handle.spawn(async move {
            sem.acquire(&res).await;
            let outcome = run_job(&shell_cmd, &argv, &envs, &metadata, &fqname, &shell_name).await;
            sem.release(&res);
            if let Err(e) = outcome {
                error!(fqname = %fqname, error = %e, "local job failed to run");
            }
        });
    }

    fn get_system_reqs(&self, res: &JobResources) -> JobResources {
        JobResources {
            threads: res.threads.clamp(1, self.cores),
            mem_gb: res.mem_gb.clamp(1, self.mem_gb),
            vmem_gb: res.vmem_gb.clamp(0, self.vmem_gb),
            special: res.special.clone(),
        }
    }

    fn queue_check_grace(&self) -> Duration {
        // Local breadcrumbs are visible as soon as they are written.
        Duration::ZERO
    }

    fn end_job(&self, _metadata: &Metadata) {
        // Reservations are released by the spawned task when the process
        // exits.
    }

    fn refresh_resources(&self, _local_mode: bool) -> Result<()> {
        Ok(())
    }
}

async fn run_job(
    shell_cmd: &Path,
    argv: &[String],
    envs: &HashMap<String, String>,
    metadata: &Metadata,
    fqname: &str,
    shell_name: &str,
) -> Result<()> {
    let stdout = std::fs::File::create(metadata.file_path(MetadataFile::StdOut))?;
    let stderr = std::fs::File::create(metadata.file_path(MetadataFile::StdErr))?;

    let mut cmd = tokio::process::Command::new(shell_cmd);
    cmd.args(argv)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);

    debug!(fqname = %fqname, shell = %shell_name, cmd = ?shell_cmd, "spawning local job");
    let status = match cmd.spawn() {
        Ok(mut child) => child.wait().await?,
        Err(e) => {
            record_abnormal_exit(metadata, &format!("could not spawn job: {e}"))?;
            return Err(e.into());
        }
    };

    if !status.success()
        && !metadata.exists(MetadataFile::Errors)
        && !metadata.exists(MetadataFile::Complete)
    {
        let msg = exit_message(&status);
        record_abnormal_exit(metadata, &msg)?;
    }
    Ok(())
}

/// The process died without reporting: leave an `_errors` file and a journal
/// breadcrumb so the watcher observes the failure.
fn record_abnormal_exit(metadata: &Metadata, msg: &str) -> Result<()> {
    metadata.write_raw(MetadataFile::Errors, msg)?;
    metadata.update_journal(MetadataFile::Errors)?;
    Ok(())
}

#[cfg(unix)]
fn exit_message(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (_, Some(sig)) => format!("signal: {}", signal_name(sig)),
        (Some(code), _) => format!("job exited with code {code}"),
        _ => "job exited abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn exit_message(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("job exited with code {code}"),
        None => "job exited abnormally".to_string(),
    }
}

#[cfg(unix)]
fn signal_name(sig: i32) -> &'static str {
    match sig {
        1 => "hangup",
        2 => "interrupt",
        6 => "aborted",
        9 => "killed",
        11 => "segmentation fault",
        15 => "terminated",
        _ => "unknown",
    }
}
