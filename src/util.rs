// src/util.rs

//! Small helpers shared across the runtime.

use std::path::{Path, PathBuf};

use chrono::Local;

use crate::perf::VersionInfo;

/// Current local time in the format used by `_timestamp` and
/// `_queued_locally`.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Fully-qualified name of a pipestance root call.
pub fn make_fqname(pipeline: &str, psid: &str) -> String {
    format!("ID.{psid}.{pipeline}")
}

/// Split a root fqname back into (pipeline, psid).
pub fn parse_fqname(fqname: &str) -> Option<(&str, &str)> {
    let mut parts = fqname.split('.');
    if parts.next() != Some("ID") {
        return None;
    }
    let psid = parts.next()?;
    let pipeline = parts.next()?;
    Some((pipeline, psid))
}

/// Extract the start time from a `_timestamp` file, tolerating both the
/// bare-timestamp and `start: <ts>` formats.
pub fn parse_timestamp(data: &str) -> &str {
    let first = data.lines().next().unwrap_or("");
    match first.strip_prefix("start:") {
        Some(rest) => rest.trim(),
        None => first,
    }
}

/// Decode a `_versions` file.
pub fn parse_versions(data: &str) -> crate::errors::Result<(String, String)> {
    let versions: VersionInfo = serde_json::from_str(data)?;
    Ok((versions.martian, versions.pipelines))
}

/// Recover (jobmode, localcores, localmem) from a stored flag line, as
/// written by [`crate::runtime::RuntimeOptions::to_flags`].
pub fn parse_job_mode(data: &str) -> (String, String, String) {
    fn flag_value<'a>(data: &'a str, flag: &str) -> Option<&'a str> {
        let start = data.find(flag)? + flag.len();
        let rest = &data[start..];
        Some(rest.split_whitespace().next().unwrap_or(rest))
    }
    let jobmode = flag_value(data, "--jobmode=").unwrap_or("local").to_string();
    let localcores = flag_value(data, "--localcores=").unwrap_or("max").to_string();
    let localmem = flag_value(data, "--localmem=").unwrap_or("max").to_string();
    (jobmode, localcores, localmem)
}

/// Resolve an executable the way the shell would: verbatim if it contains a
/// path separator, otherwise searched on `PATH`.
pub fn look_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}
