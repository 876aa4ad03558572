// src/overrides.rs

//! Per-stage resource overrides.
//!
//! An overrides file is JSON keyed by fully-qualified node name, each entry
//! mapping `split|chunk|join.threads|mem_gb|vmem_gb|profile` keys to values:
//!
//! ```json
//! {
//!     "ID.run_001.ANALYZER.ALIGN": { "chunk.mem_gb": 8 },
//!     "ID.run_001.ANALYZER": { "join.threads": 4 }
//! }
//! ```
//!
//! Lookup walks from the node's own fqname up through its ancestors, most
//! specific entry first. Invalid values are logged and ignored at the use
//! site.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;

#[derive(Debug, Default)]
pub struct PipestanceOverrides {
    table: HashMap<String, HashMap<String, Value>>,
}

impl PipestanceOverrides {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(PipestanceOverrides::default());
        }
        let text = std::fs::read_to_string(path)?;
        let table = serde_json::from_str(&text)?;
        Ok(PipestanceOverrides { table })
    }

    pub fn from_table(table: HashMap<String, HashMap<String, Value>>) -> Self {
        PipestanceOverrides { table }
    }

    /// Look up `key` (e.g. `"chunk.mem_gb"`) for the node named `fqname`,
    /// checking the node itself and then each enclosing pipeline. Returns
    /// `default` when nothing matches.
    pub fn get_override(&self, fqname: &str, key: &str, default: Value) -> Value {
        let mut scope = fqname;
        loop {
            if let Some(entry) = self.table.get(scope) {
                if let Some(value) = entry.get(key) {
                    debug!(fqname = %fqname, scope = %scope, key = %key, value = %value,
                        "applying override");
                    return value.clone();
                }
            }
            match scope.rfind('.') {
                Some(dot) => scope = &scope[..dot],
                None => return default,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn overrides() -> PipestanceOverrides {
        PipestanceOverrides::from_table(
            [
                (
                    "ID.t.P".to_string(),
                    [("chunk.threads".to_string(), json!(4))].into_iter().collect(),
                ),
                (
                    "ID.t.P.S".to_string(),
                    [("chunk.threads".to_string(), json!(8))].into_iter().collect(),
                ),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn most_specific_scope_wins() {
        let o = overrides();
        assert_eq!(o.get_override("ID.t.P.S", "chunk.threads", json!(1)), json!(8));
        assert_eq!(o.get_override("ID.t.P.T", "chunk.threads", json!(1)), json!(4));
        assert_eq!(o.get_override("ID.t.Q.S", "chunk.threads", json!(1)), json!(1));
    }

    #[test]
    fn unknown_key_returns_default() {
        let o = overrides();
        assert_eq!(o.get_override("ID.t.P.S", "join.mem_gb", json!(2)), json!(2));
    }
}
