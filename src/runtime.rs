// src/runtime.rs

//! Runtime configuration and pipestance instantiation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::{MartianError, Result};
use crate::graph::{build_graph, BuildContext};
use crate::jobmgr::{JobManager, LocalJobManager, RetryConfig};
use crate::metadata::MetadataFile;
use crate::overrides::PipestanceOverrides;
use crate::perf::VersionInfo;
use crate::pipestance::Pipestance;
use crate::syntax::invocation::build_call_data;
use crate::syntax::{equivalent_call, CallStm, Callable, Callables};
use crate::types::{ProfileMode, VdrMode};

/// Configuration required to initialize a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// "local" or a named cluster mode handled by an external job manager.
    pub job_mode: String,
    pub vdr_mode: VdrMode,
    pub profile_mode: ProfileMode,
    pub martian_version: String,
    pub local_cores: i64,
    pub local_mem: i64,
    pub local_vmem: i64,
    pub mem_per_core: i64,
    pub max_jobs: i64,
    pub job_freq_millis: i64,
    pub full_stage_reset: bool,
    pub skip_preflight: bool,
    pub monitor: bool,
    pub debug: bool,
    pub zip: bool,
    pub never_local: bool,
    pub on_finish: Option<String>,
    pub mrjob_path: PathBuf,
    pub adapters_path: PathBuf,
    pub retry_path: Option<PathBuf>,
    pub overrides_path: Option<PathBuf>,
    pub heartbeat_timeout: Duration,
    pub step_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        RuntimeOptions {
            job_mode: "local".to_string(),
            vdr_mode: VdrMode::Rolling,
            profile_mode: ProfileMode::Disable,
            martian_version: env!("CARGO_PKG_VERSION").to_string(),
            local_cores: 0,
            local_mem: 0,
            local_vmem: 0,
            mem_per_core: 0,
            max_jobs: 0,
            job_freq_millis: 0,
            full_stage_reset: false,
            skip_preflight: false,
            monitor: false,
            debug: false,
            zip: false,
            never_local: false,
            on_finish: None,
            mrjob_path: exe_dir.join("mrjob"),
            adapters_path: exe_dir.join("..").join("adapters"),
            retry_path: None,
            overrides_path: None,
            heartbeat_timeout: Duration::from_secs(60 * 60),
            step_interval: Duration::from_secs(3),
        }
    }
}

impl RuntimeOptions {
    /// The command line flags equivalent to these options, stored in
    /// `_jobmode` so reattachment can recover them.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.job_mode != "local" {
            flags.push(format!("--jobmode={}", self.job_mode));
        }
        if self.vdr_mode != VdrMode::Post {
            flags.push(format!("--vdrmode={}", self.vdr_mode));
        }
        if self.profile_mode != ProfileMode::Disable {
            flags.push(format!("--profile={}", self.profile_mode));
        }
        if self.local_mem != 0 {
            flags.push(format!("--localmem={}", self.local_mem));
        }
        if self.local_vmem != 0 {
            flags.push(format!("--localvmem={}", self.local_vmem));
        }
        if self.local_cores != 0 {
            flags.push(format!("--localcores={}", self.local_cores));
        }
        if self.mem_per_core != 0 {
            flags.push(format!("--mempercore={}", self.mem_per_core));
        }
        if self.max_jobs != 0 {
            flags.push(format!("--maxjobs={}", self.max_jobs));
        }
        if self.job_freq_millis != 0 {
            flags.push(format!("--jobinterval={}", self.job_freq_millis));
        }
        if self.zip {
            flags.push("--zip".to_string());
        }
        if self.skip_preflight {
            flags.push("--nopreflight".to_string());
        }
        if self.monitor {
            flags.push("--monitor".to_string());
        }
        if self.debug {
            flags.push("--debug".to_string());
        }
        if let Some(hook) = &self.on_finish {
            flags.push(format!("--onfinish={hook}"));
        }
        if self.never_local {
            flags.push("--never-local".to_string());
        }
        flags
    }
}

/// Collects the configuration and collaborators required to instantiate and
/// run pipestances.
pub struct Runtime {
    pub config: RuntimeOptions,
    pub job_manager: Arc<dyn JobManager>,
    pub local_job_manager: Arc<dyn JobManager>,
    pub overrides: PipestanceOverrides,
    pub retry: RetryConfig,
    local_concrete: Option<Arc<LocalJobManager>>,
}

impl Runtime {
    /// Build a runtime for local execution. Must be called inside a tokio
    /// runtime (the local job manager spawns its jobs there). For cluster
    /// modes, chain [`Runtime::with_job_manager`].
    pub fn new(config: RuntimeOptions) -> Result<Self> {
        if let Some(hook) = &config.on_finish {
            if crate::util::look_path(hook).is_none() {
                return Err(MartianError::Invocation(format!(
                    "invalid onfinish hook executable: {hook}"
                )));
            }
        }
        let local = Arc::new(LocalJobManager::new(
            config.local_cores,
            config.local_mem,
            config.local_vmem,
            config.monitor,
        ));
        let overrides = match &config.overrides_path {
            Some(path) => PipestanceOverrides::load(path)?,
            None => PipestanceOverrides::default(),
        };
        let retry = match &config.retry_path {
            Some(path) => RetryConfig::load(path)?,
            None => RetryConfig::default(),
        };
        Ok(Runtime {
            job_manager: local.clone(),
            local_job_manager: local.clone(),
            local_concrete: Some(local),
            overrides,
            retry,
            config,
        })
    }

    /// Replace the remote job manager (for cluster job modes). Preflight and
    /// `local`-modified stages keep using the local manager.
    pub fn with_job_manager(mut self, manager: Arc<dyn JobManager>) -> Self {
        self.job_manager = manager;
        self
    }

    /// Replace the local job manager as well (tests use a fake for both).
    pub fn with_local_job_manager(mut self, manager: Arc<dyn JobManager>) -> Self {
        self.local_job_manager = manager;
        self.local_concrete = None;
        self
    }

    /// Memory the runtime may use for reading large metadata files. Capped
    /// at 1 GiB when monitoring is on; 0 means unlimited.
    pub fn free_mem_bytes(&self) -> u64 {
        self.local_concrete
            .as_ref()
            .map(|l| l.free_mem_bytes())
            .unwrap_or(0)
    }

    //
    // Instantiation
    //

    fn instantiate(
        &self,
        src: &str,
        psid: &str,
        pipestance_path: &Path,
        callables: &Callables,
        mro_version: &str,
        envs: &HashMap<String, String>,
        read_only: bool,
    ) -> Result<(String, CallStm, Pipestance)> {
        let data = build_call_data(src)?;
        match data.callable(callables)? {
            Callable::Pipeline(_) => {}
            Callable::Stage(_) => {
                return Err(MartianError::Invocation(format!(
                    "'{}' is not a declared pipeline",
                    data.call
                )))
            }
        }
        let call = data.call_stm(callables)?;
        let postsrc = data.build_call_source(callables)?;
        let graph = build_graph(
            &BuildContext {
                callables,
                psid,
                pipestance_path,
                never_local: self.config.never_local,
            },
            &call,
        )?;
        let pipestance = Pipestance::new(
            psid,
            pipestance_path,
            data,
            graph,
            mro_version,
            envs.clone(),
            read_only,
        );
        Ok((postsrc, call, pipestance))
    }

    /// Invoke a new pipestance in `pipestance_path`, which must be empty
    /// (dotfiles allowed). On any failure the directory is rolled back.
    pub fn invoke_pipeline(
        &self,
        src: &str,
        callables: &Callables,
        psid: &str,
        pipestance_path: &Path,
        mro_version: &str,
        envs: &HashMap<String, String>,
        tags: &[String],
    ) -> Result<Pipestance> {
        fs::create_dir_all(pipestance_path)?;
        for entry in fs::read_dir(pipestance_path)? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with('.') {
                return Err(MartianError::PipestanceExists(psid.to_string()));
            }
        }

        let src = expand_env_vars(src);
        match self.invoke_inner(&src, callables, psid, pipestance_path, mro_version, envs, tags)
        {
            Ok(pipestance) => Ok(pipestance),
            Err(e) => {
                let _ = fs::remove_dir_all(pipestance_path);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke_inner(
        &self,
        src: &str,
        callables: &Callables,
        psid: &str,
        pipestance_path: &Path,
        mro_version: &str,
        envs: &HashMap<String, String>,
        tags: &[String],
    ) -> Result<Pipestance> {
        let (postsrc, _, mut pipestance) =
            self.instantiate(src, psid, pipestance_path, callables, mro_version, envs, false)?;
        pipestance.lock()?;
        pipestance.mkdirs()?;

        let md = pipestance.metadata();
        md.write_raw(MetadataFile::Invocation, src)?;
        md.write_raw(MetadataFile::JobMode, &self.config.job_mode)?;
        md.write_raw(MetadataFile::MroSource, &postsrc)?;
        md.write(
            MetadataFile::Versions,
            &VersionInfo {
                martian: self.config.martian_version.clone(),
                pipelines: mro_version.to_string(),
            },
        )?;
        md.write(MetadataFile::Tags, &tags)?;
        match std::env::var("MRO_FORCE_UUID") {
            Ok(uuid) if !uuid.is_empty() => {
                info!(uuid = %uuid, "UUID forced by environment");
                pipestance.set_uuid(&uuid)?;
            }
            _ => pipestance.set_uuid(&uuid::Uuid::new_v4().to_string())?,
        }
        md.write_raw(
            MetadataFile::Timestamp,
            &format!("start: {}", crate::util::timestamp()),
        )?;

        pipestance.load_metadata();
        Ok(pipestance)
    }

    /// Reattach using the `_invocation` file as the source of truth.
    pub fn reattach_to_pipestance(
        &self,
        psid: &str,
        pipestance_path: &Path,
        src: Option<&str>,
        callables: &Callables,
        mro_version: &str,
        envs: &HashMap<String, String>,
        check_src: bool,
        read_only: bool,
    ) -> Result<Pipestance> {
        self.reattach_inner(
            psid,
            pipestance_path,
            src,
            callables,
            mro_version,
            envs,
            check_src,
            read_only,
            MetadataFile::Invocation,
        )
    }

    /// Reattach using the canonicalized `_mrosource` instead.
    pub fn reattach_to_pipestance_with_mro_src(
        &self,
        psid: &str,
        pipestance_path: &Path,
        src: Option<&str>,
        callables: &Callables,
        mro_version: &str,
        envs: &HashMap<String, String>,
        check_src: bool,
        read_only: bool,
    ) -> Result<Pipestance> {
        self.reattach_inner(
            psid,
            pipestance_path,
            src,
            callables,
            mro_version,
            envs,
            check_src,
            read_only,
            MetadataFile::MroSource,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn reattach_inner(
        &self,
        psid: &str,
        pipestance_path: &Path,
        src: Option<&str>,
        callables: &Callables,
        mro_version: &str,
        envs: &HashMap<String, String>,
        check_src: bool,
        read_only: bool,
        src_type: MetadataFile,
    ) -> Result<Pipestance> {
        let src_path = pipestance_path.join(src_type.file_name());
        let src = match src {
            Some(s) => s.to_string(),
            None => fs::read_to_string(&src_path)
                .map_err(|_| MartianError::PipestancePath(pipestance_path.to_path_buf()))?,
        };
        if check_src {
            let on_disk = fs::read_to_string(&src_path)
                .map_err(|_| MartianError::PipestancePath(pipestance_path.to_path_buf()))?;
            if src != on_disk {
                return Err(MartianError::PipestanceInvocation {
                    psid: psid.to_string(),
                    path: src_path.clone(),
                });
            }
        }

        let (_, call, mut pipestance) = self.instantiate(
            &src,
            psid,
            pipestance_path,
            callables,
            mro_version,
            envs,
            read_only,
        )?;
        if !read_only {
            pipestance.lock()?;
        }

        // Both AST sources exist; when reattaching from `_invocation`, also
        // compile `_mrosource` and require the calls to be equivalent.
        if check_src && src_type != MetadataFile::MroSource {
            let mro_src_path = pipestance_path.join(MetadataFile::MroSource.file_name());
            match fs::read_to_string(&mro_src_path) {
                Ok(mro_src) => {
                    let old = build_call_data(&mro_src)?;
                    let old_call = old.call_stm(callables)?;
                    if !equivalent_call(&call, &old_call) {
                        pipestance.unlock();
                        return Err(MartianError::PipestanceInvocation {
                            psid: psid.to_string(),
                            path: mro_src_path,
                        });
                    }
                }
                Err(e) => {
                    pipestance.unlock();
                    return Err(e.into());
                }
            }
        }

        if !read_only {
            if let Err(e) = pipestance.verify_job_mode(&self.config.job_mode) {
                pipestance.unlock();
                return Err(e);
            }
        }

        if let Err(e) = pipestance.unzip_metadata() {
            pipestance.unlock();
            return Err(e);
        }

        pipestance.load_metadata();

        if !read_only {
            info!(job_mode = %self.config.job_mode, "reattaching");
            if let Err(e) = pipestance.restart_running_nodes(&self.config.job_mode, self) {
                pipestance.unlock();
                return Err(e);
            }
        }

        Ok(pipestance)
    }
}

/// Expand `$VAR` and `${VAR}` in invocation source, leaving unknown
/// variables untouched.
fn expand_env_vars(src: &str) -> String {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
    });
    re.replace_all(src, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                warn!(var = %name, "undefined environment variable in invocation");
                caps.get(0).unwrap().as_str().to_string()
            }
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_through_parse_job_mode() {
        let config = RuntimeOptions {
            job_mode: "sge".to_string(),
            local_cores: 4,
            local_mem: 16,
            ..RuntimeOptions::default()
        };
        let flags = config.to_flags().join(" ");
        let (mode, cores, mem) = crate::util::parse_job_mode(&flags);
        assert_eq!(mode, "sge");
        assert_eq!(cores, "4");
        assert_eq!(mem, "16");
    }

    #[test]
    fn env_vars_expand_in_both_forms() {
        std::env::set_var("MARTIAN_TEST_VALUE", "42");
        let out = expand_env_vars("x = ${MARTIAN_TEST_VALUE}, y = $MARTIAN_TEST_VALUE");
        assert_eq!(out, "x = 42, y = 42");
        let out = expand_env_vars("z = $MARTIAN_TEST_UNDEFINED_VALUE");
        assert_eq!(out, "z = $MARTIAN_TEST_UNDEFINED_VALUE");
    }
}
