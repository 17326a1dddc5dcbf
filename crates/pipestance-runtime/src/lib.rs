//! Pipestance execution engine.
//!
//! Materializes a compiled call graph into nodes, forks, splits, chunks and
//! joins; derives every unit's state from its metadata on each cycle; and
//! advances units by handing jobs to a [`pipestance_sched::Scheduler`].
//! Lifecycle operations (invoke, reattach, reset, kill, archive) and
//! volatile data removal hang off [`Pipestance`].

pub mod callgraph;
pub mod config;
pub mod errors;
pub mod events;
pub mod graph;
pub mod invocation;
pub mod lock;
pub mod pipestance;
pub mod queries;
pub mod retry;
pub mod shutdown;
pub mod state;
mod step;
pub mod value;
mod vdr;

pub use callgraph::{
    BindingExpr, CallDef, CallGraph, CallGraphCompiler, CallModifiers, Callable,
    JsonCallGraphCompiler, Param, PipelineDef, Resources, StageDef, StageLang, StageSource,
};
pub use config::{EngineConfig, VdrMode};
pub use errors::{ArgumentProblem, PipestanceError, ValidationError};
pub use events::{
    PipestanceEvent, RuntimeEvent, RuntimeEventKind, RuntimeEventObserver, RuntimeEventReceiver,
    RuntimeEventSender, RuntimeEventSink, SharedRuntimeEventObserver, UnitEvent, VdrEvent,
    runtime_event_channel,
};
pub use graph::{Graph, NodeId, UnitRole};
pub use invocation::InvocationRecord;
pub use lock::LockRecord;
pub use pipestance::{CycleOutcome, Pipestance, PipestanceFactory, RunOutcome};
pub use queries::{FatalError, ForkInfo, NodeInfo, UnitInfo};
pub use retry::{FailureClassifier, RegexFailureClassifier, RetryBackoffConfig, RetryConfig};
pub use shutdown::{CriticalSection, ShutdownContext};
pub use state::PipestanceState;
pub use value::{ArgValue, ArgumentMap};
