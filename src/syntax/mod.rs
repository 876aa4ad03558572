// src/syntax/mod.rs

//! The AST surface consumed by the engine.
//!
//! The MRO parser/compiler is an external collaborator: it hands the runtime
//! callables (stage and pipeline declarations), call statements and bindings.
//! This module defines those shapes and the small amount of behavior the
//! engine needs from them (lookup, file-type classification, call
//! equivalence). Nothing here parses pipeline or stage definitions.

pub mod invocation;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{MartianError, Result};
use crate::jobmgr::JobResources;

/// Declared type of a parameter or binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeId {
    pub tname: String,
    #[serde(default)]
    pub array_dim: u8,
}

impl TypeId {
    pub fn new(tname: impl Into<String>) -> Self {
        TypeId {
            tname: tname.into(),
            array_dim: 0,
        }
    }

    pub fn array_of(tname: impl Into<String>) -> Self {
        TypeId {
            tname: tname.into(),
            array_dim: 1,
        }
    }

    /// True if a value of this type might contain a file name. Any string,
    /// map, or user-defined file type (or array thereof) qualifies; only
    /// int, float and bool are known to be safe.
    pub fn maybe_file_type(&self) -> bool {
        !matches!(self.tname.as_str(), "int" | "float" | "bool")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InParam {
    pub id: String,
    pub tname: TypeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutParam {
    pub id: String,
    pub tname: TypeId,
}

/// How a stage's code is invoked. The shell argv layout is the only thing
/// that differs between the variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "lang", rename_all = "lowercase")]
pub enum StageCode {
    /// A python module run through the python adapter shell.
    Python { module: String },
    /// A compiled binary speaking the adapter protocol via mrjob.
    Compiled { cmd: String },
    /// An arbitrary executable invoked directly.
    Exec { cmd: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub in_params: Vec<InParam>,
    pub out_params: Vec<OutParam>,
    pub code: StageCode,
    /// Whether the stage declares a split phase.
    #[serde(default)]
    pub split: bool,
    #[serde(default)]
    pub split_params: Vec<InParam>,
    /// Declared resources from the stage's `@using` block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<JobResources>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub in_params: Vec<InParam>,
    pub out_params: Vec<OutParam>,
    pub calls: Vec<CallStm>,
    /// The pipeline's return bindings: one per out param, usually references
    /// into sub-calls.
    pub ret: Vec<BindStm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Callable {
    Stage(Stage),
    Pipeline(Pipeline),
}

impl Callable {
    pub fn id(&self) -> &str {
        match self {
            Callable::Stage(s) => &s.id,
            Callable::Pipeline(p) => &p.id,
        }
    }

    pub fn in_params(&self) -> &[InParam] {
        match self {
            Callable::Stage(s) => &s.in_params,
            Callable::Pipeline(p) => &p.in_params,
        }
    }

    pub fn out_params(&self) -> &[OutParam] {
        match self {
            Callable::Stage(s) => &s.out_params,
            Callable::Pipeline(p) => &p.out_params,
        }
    }
}

/// Table of callables visible to an invocation, keyed by declared id.
#[derive(Debug, Clone, Default)]
pub struct Callables {
    table: HashMap<String, Callable>,
}

impl Callables {
    pub fn new(list: impl IntoIterator<Item = Callable>) -> Self {
        let mut table = HashMap::new();
        for callable in list {
            table.insert(callable.id().to_string(), callable);
        }
        Callables { table }
    }

    pub fn get(&self, id: &str) -> Option<&Callable> {
        self.table.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&Callable> {
        self.get(id)
            .ok_or_else(|| MartianError::UnknownCallable(id.to_string()))
    }

    pub fn insert(&mut self, callable: Callable) {
        self.table.insert(callable.id().to_string(), callable);
    }
}

/// Modifiers attached to a call statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub preflight: bool,
    #[serde(default)]
    pub volatile: bool,
    /// Strict-volatile marks outputs that may be reclaimed even while only
    /// strict-volatile successors remain.
    #[serde(default)]
    pub strict_volatile: bool,
    /// Bindable modifier: when it resolves truthy the call is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<Exp>,
}

/// A call statement: invoke `dec_id` under the local name `id` with the
/// given input bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStm {
    pub id: String,
    pub dec_id: String,
    pub bindings: Vec<BindStm>,
    #[serde(default)]
    pub modifiers: Modifiers,
}

/// One input binding of a call statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindStm {
    pub id: String,
    pub tname: TypeId,
    #[serde(default)]
    pub sweep: bool,
    pub exp: Exp,
}

/// A binding expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "exp", rename_all = "lowercase")]
pub enum Exp {
    Null,
    /// A JSON literal (number, string, bool, map, or any nested mixture).
    Value { value: Value },
    /// An array whose elements may themselves be references or sweeps.
    Array { elements: Vec<Exp> },
    /// A sweep over a set of literal values, inducing fork multiplication.
    Sweep { values: Vec<Value> },
    /// A reference to a sibling call's output (`CALL.output`).
    Ref { id: String, output: String },
    /// A reference to the enclosing pipeline's own input (`self.param`).
    SelfRef { id: String },
}

impl Exp {
    /// True for expressions that could possibly resolve truthy; used to
    /// decide whether a `disabled` modifier needs resolution at all.
    pub fn is_null(&self) -> bool {
        matches!(self, Exp::Null)
    }
}

/// Structural equivalence of two call statements, ignoring binding order.
/// Used on reattach to verify that `_invocation` and `_mrosource` describe
/// the same call.
pub fn equivalent_call(a: &CallStm, b: &CallStm) -> bool {
    if a.dec_id != b.dec_id {
        return false;
    }
    if a.bindings.len() != b.bindings.len() {
        return false;
    }
    let table: HashMap<&str, &BindStm> = b.bindings.iter().map(|x| (x.id.as_str(), x)).collect();
    a.bindings.iter().all(|bind| match table.get(bind.id.as_str()) {
        Some(other) => bind.sweep == other.sweep && bind.exp == other.exp,
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bind(id: &str, exp: Exp) -> BindStm {
        BindStm {
            id: id.to_string(),
            tname: TypeId::new("int"),
            sweep: false,
            exp,
        }
    }

    #[test]
    fn maybe_file_type_excludes_scalars_only() {
        assert!(!TypeId::new("int").maybe_file_type());
        assert!(!TypeId::new("float").maybe_file_type());
        assert!(!TypeId::new("bool").maybe_file_type());
        assert!(TypeId::new("string").maybe_file_type());
        assert!(TypeId::new("bam").maybe_file_type());
        assert!(TypeId::array_of("map").maybe_file_type());
    }

    #[test]
    fn equivalent_call_ignores_binding_order() {
        let a = CallStm {
            id: "P".into(),
            dec_id: "P".into(),
            bindings: vec![
                bind("x", Exp::Value { value: json!(1) }),
                bind("y", Exp::Value { value: json!("s") }),
            ],
            modifiers: Modifiers::default(),
        };
        let mut b = a.clone();
        b.bindings.reverse();
        assert!(equivalent_call(&a, &b));

        b.bindings[0].exp = Exp::Value { value: json!(2) };
        assert!(!equivalent_call(&a, &b));
    }
}
