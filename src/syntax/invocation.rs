// src/syntax/invocation.rs

//! Invocation serialization.
//!
//! An invocation is the top-level call statement of a pipestance. It round
//! trips between MRO text (`_invocation` / `_mrosource`) and
//! [`InvocationData`]: `build_call_data` parses the call statement out of
//! source text, `build_call_source` emits the canonical form. Reattachment
//! relies on this round trip to verify that the pipestance on disk matches
//! what the operator asked for.
//!
//! Only the call statement is handled here. Stage and pipeline definitions
//! always arrive through a [`Callables`] registry supplied by the compiler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{MartianError, Result};
use crate::syntax::{BindStm, CallStm, Callable, Callables, Exp, Modifiers};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationData {
    pub call: String,
    pub args: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sweepargs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
}

impl InvocationData {
    /// Emit the canonical MRO call statement for this invocation.
    ///
    /// Bindings appear in the callable's declared parameter order, each on
    /// its own line, with sweeps rendered as `sweep(v1, v2, ...)`. Parameters
    /// with no argument are bound to `null`.
    pub fn build_call_source(&self, callables: &Callables) -> Result<String> {
        if self.call.is_empty() {
            return Err(MartianError::Invocation(
                "no pipeline or stage specified".to_string(),
            ));
        }
        let callable = callables.require(&self.call)?;

        let mut src = String::new();
        if let Some(include) = &self.include {
            src.push_str(&format!("@include \"{include}\"\n\n"));
        }
        src.push_str(&format!("call {}(\n", self.call));
        for param in callable.in_params() {
            let line = if self.sweepargs.iter().any(|s| s == &param.id) {
                let values = match self.args.get(&param.id) {
                    Some(Value::Array(vs)) => vs
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                    _ => {
                        return Err(MartianError::Invocation(format!(
                            "sweep argument '{}' is not an array",
                            param.id
                        )))
                    }
                };
                format!("    {} = sweep({}),\n", param.id, values)
            } else {
                let value = self.args.get(&param.id).cloned().unwrap_or(Value::Null);
                format!("    {} = {},\n", param.id, value)
            };
            src.push_str(&line);
        }
        src.push_str(")\n");
        Ok(src)
    }

    /// Build the top-level [`CallStm`] for this invocation.
    pub fn call_stm(&self, callables: &Callables) -> Result<CallStm> {
        let callable = callables.require(&self.call)?;
        let mut bindings = Vec::with_capacity(callable.in_params().len());
        for param in callable.in_params() {
            let exp = if self.sweepargs.iter().any(|s| s == &param.id) {
                match self.args.get(&param.id) {
                    Some(Value::Array(vs)) => Exp::Sweep { values: vs.clone() },
                    _ => {
                        return Err(MartianError::Invocation(format!(
                            "sweep argument '{}' is not an array",
                            param.id
                        )))
                    }
                }
            } else {
                match self.args.get(&param.id) {
                    None | Some(Value::Null) => Exp::Null,
                    Some(v) => Exp::Value { value: v.clone() },
                }
            };
            bindings.push(BindStm {
                id: param.id.clone(),
                tname: param.tname.clone(),
                sweep: self.sweepargs.iter().any(|s| s == &param.id),
                exp,
            });
        }
        Ok(CallStm {
            id: self.call.clone(),
            dec_id: self.call.clone(),
            bindings,
            modifiers: Modifiers::default(),
        })
    }

    /// The callable this invocation targets, for convenience.
    pub fn callable<'a>(&self, callables: &'a Callables) -> Result<&'a Callable> {
        callables.require(&self.call)
    }
}

/// Parse the call statement out of invocation source text.
pub fn build_call_data(src: &str) -> Result<InvocationData> {
    let mut include = None;
    for line in src.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("@include") {
            let rest = rest.trim();
            include = Some(rest.trim_matches('"').to_string());
        }
    }

    let call_pos = src
        .find("call ")
        .ok_or_else(|| MartianError::Invocation("no call statement found".to_string()))?;
    let after_call = &src[call_pos + "call ".len()..];
    let open = after_call
        .find('(')
        .ok_or_else(|| MartianError::Invocation("malformed call statement".to_string()))?;
    let name = after_call[..open].trim().to_string();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(MartianError::Invocation(format!(
            "invalid callable name '{name}'"
        )));
    }

    let body = balanced_body(&after_call[open..])?;
    let mut args = serde_json::Map::new();
    let mut sweepargs = Vec::new();
    for piece in split_top_level(body) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let eq = piece.find('=').ok_or_else(|| {
            MartianError::Invocation(format!("binding without '=': {piece}"))
        })?;
        let id = piece[..eq].trim().to_string();
        let value_text = piece[eq + 1..].trim();
        if let Some(inner) = value_text
            .strip_prefix("sweep(")
            .and_then(|r| r.strip_suffix(')'))
        {
            let mut values = Vec::new();
            for v in split_top_level(inner) {
                let v = v.trim();
                if v.is_empty() {
                    continue;
                }
                values.push(parse_value(v)?);
            }
            sweepargs.push(id.clone());
            args.insert(id, Value::Array(values));
        } else {
            args.insert(id, parse_value(value_text)?);
        }
    }

    Ok(InvocationData {
        call: name,
        args,
        sweepargs,
        include,
    })
}

fn parse_value(text: &str) -> Result<Value> {
    serde_json::from_str(text)
        .map_err(|e| MartianError::Invocation(format!("invalid value '{text}': {e}")))
}

/// Return the text between the opening paren at the start of `s` and its
/// matching close paren.
fn balanced_body(s: &str) -> Result<&str> {
    debug_assert!(s.starts_with('('));
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&s[1..i]);
                }
            }
            _ => {}
        }
    }
    Err(MartianError::Invocation(
        "unbalanced parentheses in call statement".to_string(),
    ))
}

/// Split on commas that are not nested inside brackets, braces, parens or
/// strings.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth -= 1,
            ',' if depth == 0 => {
                pieces.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&s[start..]);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{InParam, Pipeline, TypeId};
    use serde_json::json;

    fn registry() -> Callables {
        Callables::new([Callable::Pipeline(Pipeline {
            id: "ANALYZER".into(),
            in_params: vec![
                InParam {
                    id: "sample".into(),
                    tname: TypeId::new("string"),
                },
                InParam {
                    id: "depth".into(),
                    tname: TypeId::new("int"),
                },
                InParam {
                    id: "reads".into(),
                    tname: TypeId::array_of("fastq"),
                },
            ],
            out_params: vec![],
            calls: vec![],
            ret: vec![],
        })])
    }

    #[test]
    fn call_source_round_trip() {
        let data = InvocationData {
            call: "ANALYZER".into(),
            args: [
                ("sample".to_string(), json!("s1")),
                ("depth".to_string(), json!([1, 2, 3])),
                ("reads".to_string(), json!(["a.fastq", "b.fastq"])),
            ]
            .into_iter()
            .collect(),
            sweepargs: vec!["depth".into()],
            include: Some("analyzer.mro".into()),
        };
        let callables = registry();
        let src = data.build_call_source(&callables).unwrap();
        assert!(src.contains("@include \"analyzer.mro\""));
        assert!(src.contains("depth = sweep(1, 2, 3),"));

        let parsed = build_call_data(&src).unwrap();
        assert_eq!(parsed.call, data.call);
        assert_eq!(parsed.sweepargs, data.sweepargs);
        assert_eq!(parsed.args, data.args);
        assert_eq!(parsed.include, data.include);

        // Second generation is byte-identical: the emitted form is canonical.
        let src2 = parsed.build_call_source(&callables).unwrap();
        assert_eq!(src, src2);
    }

    #[test]
    fn missing_args_become_null() {
        let data = InvocationData {
            call: "ANALYZER".into(),
            args: serde_json::Map::new(),
            sweepargs: vec![],
            include: None,
        };
        let src = data.build_call_source(&registry()).unwrap();
        assert!(src.contains("sample = null,"));
        assert!(src.contains("reads = null,"));
    }

    #[test]
    fn rejects_source_without_call() {
        assert!(build_call_data("@include \"x.mro\"\n").is_err());
    }
}
