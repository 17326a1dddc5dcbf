//! Validated call graph consumed from the pipeline compiler.
//!
//! The engine never parses the pipeline language itself. A
//! [`CallGraphCompiler`] turns invocation source into a [`CallGraph`]; the
//! default [`JsonCallGraphCompiler`] accepts the graph already serialized as
//! JSON and checks its references.

use crate::errors::PipestanceError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub array_dim: u32,
    #[serde(default)]
    pub is_file: bool,
}

impl Param {
    pub fn describe(&self) -> String {
        format!("{}{}", self.type_name, "[]".repeat(self.array_dim as usize))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageLang {
    #[default]
    Exec,
    Python,
    Shell,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSource {
    #[serde(default)]
    pub lang: StageLang,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl StageSource {
    /// Command line for one phase:
    /// `<program> <args...> <phase> <metadata dir> <files dir>`.
    pub fn command(&self, phase: &str, metadata_dir: &Path, files_dir: &Path) -> Vec<String> {
        let mut argv = match self.lang {
            StageLang::Exec => vec![self.path.clone()],
            StageLang::Python => vec!["python3".to_string(), self.path.clone()],
            StageLang::Shell => vec!["sh".to_string(), self.path.clone()],
        };
        argv.extend(self.args.iter().cloned());
        argv.push(phase.to_string());
        argv.push(metadata_dir.display().to_string());
        argv.push(files_dir.display().to_string());
        argv
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub mem_gb: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<Param>,
    #[serde(default)]
    pub outputs: Vec<Param>,
    pub src: StageSource,
    /// Declares split and join phases.
    #[serde(default)]
    pub split: bool,
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<Param>,
    #[serde(default)]
    pub outputs: Vec<Param>,
    pub calls: Vec<CallDef>,
    #[serde(default)]
    pub returns: BTreeMap<String, BindingExpr>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallModifiers {
    /// Outputs may be deleted once every consumer has completed.
    #[serde(default)]
    pub volatile: bool,
    /// Always runs on the local scheduler.
    #[serde(default)]
    pub local: bool,
    /// Every sibling call waits for this one.
    #[serde(default)]
    pub preflight: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallDef {
    pub id: String,
    pub callable: String,
    #[serde(default)]
    pub bindings: BTreeMap<String, BindingExpr>,
    #[serde(default)]
    pub modifiers: CallModifiers,
}

/// Right-hand side of a parameter binding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingExpr {
    Value(Value),
    Sweep(Vec<Value>),
    #[serde(rename = "self")]
    SelfRef(String),
    Output {
        call: String,
        #[serde(default)]
        output: Option<String>,
    },
    Array(Vec<BindingExpr>),
}

impl BindingExpr {
    fn visit<'a>(&'a self, out: &mut Vec<&'a BindingExpr>) {
        out.push(self);
        if let BindingExpr::Array(items) = self {
            for item in items {
                item.visit(out);
            }
        }
    }

    pub fn leaves(&self) -> Vec<&BindingExpr> {
        let mut out = Vec::new();
        self.visit(&mut out);
        out
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Callable {
    Stage(StageDef),
    Pipeline(PipelineDef),
}

impl Callable {
    pub fn id(&self) -> &str {
        match self {
            Callable::Stage(stage) => &stage.id,
            Callable::Pipeline(pipeline) => &pipeline.id,
        }
    }

    pub fn inputs(&self) -> &[Param] {
        match self {
            Callable::Stage(stage) => &stage.inputs,
            Callable::Pipeline(pipeline) => &pipeline.inputs,
        }
    }

    pub fn outputs(&self) -> &[Param] {
        match self {
            Callable::Stage(stage) => &stage.outputs,
            Callable::Pipeline(pipeline) => &pipeline.outputs,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallGraph {
    #[serde(default)]
    pub stages: Vec<StageDef>,
    #[serde(default)]
    pub pipelines: Vec<PipelineDef>,
    /// The top-level invocation. Its bindings may only be literal values or
    /// sweeps.
    pub call: CallDef,
}

impl CallGraph {
    pub fn callable(&self, id: &str) -> Option<Callable> {
        if let Some(stage) = self.stages.iter().find(|stage| stage.id == id) {
            return Some(Callable::Stage(stage.clone()));
        }
        self.pipelines
            .iter()
            .find(|pipeline| pipeline.id == id)
            .map(|pipeline| Callable::Pipeline(pipeline.clone()))
    }

    /// Checks every reference in the graph. Type compatibility of values is
    /// checked later, per fork, against the resolved arguments.
    pub fn validate(&self) -> Result<(), PipestanceError> {
        let mut ids = BTreeSet::new();
        for id in self
            .stages
            .iter()
            .map(|stage| &stage.id)
            .chain(self.pipelines.iter().map(|pipeline| &pipeline.id))
        {
            if !ids.insert(id.as_str()) {
                return Err(invalid(format!("duplicate callable '{id}'")));
            }
        }

        let top = self.callable(&self.call.callable).ok_or_else(|| {
            invalid(format!("unknown callable '{}' in top-level call", self.call.callable))
        })?;
        for (name, expr) in &self.call.bindings {
            for leaf in expr.leaves() {
                if matches!(leaf, BindingExpr::SelfRef(_) | BindingExpr::Output { .. }) {
                    return Err(invalid(format!(
                        "top-level binding '{name}' must be a literal value or sweep"
                    )));
                }
            }
        }
        check_bound(&self.call, top.inputs())?;

        for pipeline in &self.pipelines {
            self.validate_pipeline(pipeline)?;
        }
        self.check_recursion(&self.call.callable, &mut Vec::new())
    }

    fn validate_pipeline(&self, pipeline: &PipelineDef) -> Result<(), PipestanceError> {
        let mut siblings: BTreeMap<&str, Callable> = BTreeMap::new();
        for call in &pipeline.calls {
            let callable = self.callable(&call.callable).ok_or_else(|| {
                invalid(format!(
                    "unknown callable '{}' in {}.{}",
                    call.callable, pipeline.id, call.id
                ))
            })?;
            if siblings.insert(call.id.as_str(), callable).is_some() {
                return Err(invalid(format!(
                    "duplicate call '{}' in pipeline {}",
                    call.id, pipeline.id
                )));
            }
        }
        for call in &pipeline.calls {
            let callable = &siblings[call.id.as_str()];
            check_bound(call, callable.inputs())?;
            if call.modifiers.preflight && matches!(callable, Callable::Pipeline(_)) {
                return Err(invalid(format!(
                    "preflight call {}.{} must be a stage",
                    pipeline.id, call.id
                )));
            }
            for expr in call.bindings.values() {
                check_refs(expr, pipeline, &siblings, &call.id)?;
            }
        }
        for param in &pipeline.outputs {
            if !pipeline.returns.contains_key(&param.name) {
                return Err(invalid(format!(
                    "pipeline {} does not return output '{}'",
                    pipeline.id, param.name
                )));
            }
        }
        for (name, expr) in &pipeline.returns {
            if !pipeline.outputs.iter().any(|param| &param.name == name) {
                return Err(invalid(format!(
                    "pipeline {} returns undeclared output '{name}'",
                    pipeline.id
                )));
            }
            check_refs(expr, pipeline, &siblings, "")?;
        }
        Ok(())
    }

    fn check_recursion(&self, id: &str, stack: &mut Vec<String>) -> Result<(), PipestanceError> {
        if stack.iter().any(|seen| seen == id) {
            return Err(invalid(format!("pipeline {id} calls itself")));
        }
        let Some(pipeline) = self.pipelines.iter().find(|pipeline| pipeline.id == id) else {
            return Ok(());
        };
        stack.push(id.to_string());
        for call in &pipeline.calls {
            self.check_recursion(&call.callable, stack)?;
        }
        stack.pop();
        Ok(())
    }
}

fn invalid(message: String) -> PipestanceError {
    PipestanceError::InvalidGraph(message)
}

fn check_bound(call: &CallDef, inputs: &[Param]) -> Result<(), PipestanceError> {
    for param in inputs {
        if !call.bindings.contains_key(&param.name) {
            return Err(invalid(format!(
                "call {} does not bind input '{}'",
                call.id, param.name
            )));
        }
    }
    for name in call.bindings.keys() {
        if !inputs.iter().any(|param| &param.name == name) {
            return Err(invalid(format!(
                "call {} binds undeclared input '{name}'",
                call.id
            )));
        }
    }
    Ok(())
}

fn check_refs(
    expr: &BindingExpr,
    pipeline: &PipelineDef,
    siblings: &BTreeMap<&str, Callable>,
    from_call: &str,
) -> Result<(), PipestanceError> {
    for leaf in expr.leaves() {
        match leaf {
            BindingExpr::SelfRef(name) => {
                if !pipeline.inputs.iter().any(|param| &param.name == name) {
                    return Err(invalid(format!(
                        "pipeline {} has no input '{name}'",
                        pipeline.id
                    )));
                }
            }
            BindingExpr::Output { call, output } => {
                if call == from_call {
                    return Err(invalid(format!("call {call} binds its own output")));
                }
                let producer = siblings.get(call.as_str()).ok_or_else(|| {
                    invalid(format!("pipeline {} has no call '{call}'", pipeline.id))
                })?;
                if let Some(output) = output {
                    if !producer.outputs().iter().any(|param| &param.name == output) {
                        return Err(invalid(format!("call {call} has no output '{output}'")));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Turns invocation source into a validated call graph.
pub trait CallGraphCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<CallGraph, PipestanceError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCallGraphCompiler;

impl CallGraphCompiler for JsonCallGraphCompiler {
    fn compile(&self, source: &str) -> Result<CallGraph, PipestanceError> {
        let graph: CallGraph = serde_json::from_str(source)
            .map_err(|err| PipestanceError::Compile(err.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }
}
