#![allow(dead_code)]

//! Builders for stages, pipelines and invocations, so tests read like the
//! MRO they stand in for.

use serde_json::Value;

use martian::syntax::invocation::InvocationData;
use martian::syntax::{
    BindStm, CallStm, Callable, Callables, Exp, InParam, Modifiers, OutParam, Pipeline, Stage,
    StageCode, TypeId,
};

pub fn lit(value: Value) -> Exp {
    Exp::Value { value }
}

pub fn refr(call: &str, output: &str) -> Exp {
    Exp::Ref {
        id: call.to_string(),
        output: output.to_string(),
    }
}

pub fn self_ref(param: &str) -> Exp {
    Exp::SelfRef {
        id: param.to_string(),
    }
}

/// Builder for a [`Stage`] callable.
pub struct StageBuilder {
    stage: Stage,
}

impl StageBuilder {
    pub fn new(id: &str) -> Self {
        StageBuilder {
            stage: Stage {
                id: id.to_string(),
                in_params: Vec::new(),
                out_params: Vec::new(),
                code: StageCode::Compiled {
                    cmd: format!("bin/{}", id.to_lowercase()),
                },
                split: false,
                split_params: Vec::new(),
                resources: None,
            },
        }
    }

    pub fn input(mut self, id: &str, tname: &str) -> Self {
        self.stage.in_params.push(InParam {
            id: id.to_string(),
            tname: TypeId::new(tname),
        });
        self
    }

    pub fn output(mut self, id: &str, tname: &str) -> Self {
        self.stage.out_params.push(OutParam {
            id: id.to_string(),
            tname: TypeId::new(tname),
        });
        self
    }

    pub fn split(mut self) -> Self {
        self.stage.split = true;
        self
    }

    pub fn build(self) -> Callable {
        Callable::Stage(self.stage)
    }
}

/// Builder for a call statement inside a pipeline.
pub struct CallBuilder {
    call: CallStm,
}

impl CallBuilder {
    pub fn new(id: &str) -> Self {
        CallBuilder {
            call: CallStm {
                id: id.to_string(),
                dec_id: id.to_string(),
                bindings: Vec::new(),
                modifiers: Modifiers::default(),
            },
        }
    }

    pub fn bind(mut self, id: &str, tname: &str, exp: Exp) -> Self {
        self.call.bindings.push(BindStm {
            id: id.to_string(),
            tname: TypeId::new(tname),
            sweep: false,
            exp,
        });
        self
    }

    pub fn volatile(mut self) -> Self {
        self.call.modifiers.volatile = true;
        self
    }

    pub fn local(mut self) -> Self {
        self.call.modifiers.local = true;
        self
    }

    pub fn preflight(mut self) -> Self {
        self.call.modifiers.preflight = true;
        self
    }

    pub fn disabled(mut self, exp: Exp) -> Self {
        self.call.modifiers.disabled = Some(exp);
        self
    }

    pub fn build(self) -> CallStm {
        self.call
    }
}

/// Builder for a [`Pipeline`] callable.
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    pub fn new(id: &str) -> Self {
        PipelineBuilder {
            pipeline: Pipeline {
                id: id.to_string(),
                in_params: Vec::new(),
                out_params: Vec::new(),
                calls: Vec::new(),
                ret: Vec::new(),
            },
        }
    }

    pub fn input(mut self, id: &str, tname: &str) -> Self {
        self.pipeline.in_params.push(InParam {
            id: id.to_string(),
            tname: TypeId::new(tname),
        });
        self
    }

    pub fn output(mut self, id: &str, tname: &str) -> Self {
        self.pipeline.out_params.push(OutParam {
            id: id.to_string(),
            tname: TypeId::new(tname),
        });
        self
    }

    pub fn call(mut self, call: CallStm) -> Self {
        self.pipeline.calls.push(call);
        self
    }

    pub fn ret(mut self, id: &str, tname: &str, exp: Exp) -> Self {
        self.pipeline.ret.push(BindStm {
            id: id.to_string(),
            tname: TypeId::new(tname),
            sweep: false,
            exp,
        });
        self
    }

    pub fn build(self) -> Callable {
        Callable::Pipeline(self.pipeline)
    }
}

/// Builder for an invocation of a pipeline.
pub struct InvocationBuilder {
    data: InvocationData,
}

impl InvocationBuilder {
    pub fn new(call: &str) -> Self {
        InvocationBuilder {
            data: InvocationData {
                call: call.to_string(),
                args: serde_json::Map::new(),
                sweepargs: Vec::new(),
                include: None,
            },
        }
    }

    pub fn arg(mut self, id: &str, value: Value) -> Self {
        self.data.args.insert(id.to_string(), value);
        self
    }

    pub fn sweep(mut self, id: &str, values: Vec<Value>) -> Self {
        self.data
            .args
            .insert(id.to_string(), Value::Array(values));
        self.data.sweepargs.push(id.to_string());
        self
    }

    pub fn build(self) -> InvocationData {
        self.data
    }

    /// The canonical MRO source for this invocation.
    pub fn source(self, callables: &Callables) -> String {
        let data = self.build();
        data.build_call_source(callables)
            .expect("invocation builder produced invalid invocation")
    }
}
