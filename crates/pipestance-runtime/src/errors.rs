use pipestance_sched::SchedulerError;
use pipestance_store::MetadataStoreError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipestanceError {
    #[error("pipestance {path} is locked by {owner}; remove the _lock file once that process is gone")]
    Locked { path: PathBuf, owner: String },
    #[error("invocation does not match the pipestance already at {path}")]
    InvocationMismatch { path: PathBuf },
    #[error("{path} already exists and is not a pipestance")]
    AlreadyExists { path: PathBuf },
    #[error("{path} is not a pipestance directory")]
    NotPipestance { path: PathBuf },
    #[error("invalid pipestance id '{0}': use letters, digits, '-' and '_'")]
    InvalidPsid(String),
    #[error("pipestance was started in job mode '{recorded}' and cannot be reattached in '{requested}'")]
    JobModeMismatch { recorded: String, requested: String },
    #[error("compile error: {0}")]
    Compile(String),
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] MetadataStoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgumentProblem {
    Missing { name: String },
    Unexpected { name: String },
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },
    NotAMap { found: String },
}

impl fmt::Display for ArgumentProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentProblem::Missing { name } => write!(f, "missing parameter '{name}'"),
            ArgumentProblem::Unexpected { name } => write!(f, "unexpected parameter '{name}'"),
            ArgumentProblem::TypeMismatch {
                name,
                expected,
                found,
            } => write!(f, "parameter '{name}' expects {expected}, found {found}"),
            ArgumentProblem::NotAMap { found } => write!(f, "expected an object, found {found}"),
        }
    }
}

/// Argument and type problems found before a job is launched.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("argument validation failed: {}", join_problems(.problems))]
pub struct ValidationError {
    pub problems: Vec<ArgumentProblem>,
}

impl ValidationError {
    pub fn new(problems: Vec<ArgumentProblem>) -> Self {
        Self { problems }
    }

    pub fn has_type_mismatch(&self) -> bool {
        self.problems
            .iter()
            .any(|problem| matches!(problem, ArgumentProblem::TypeMismatch { .. }))
    }
}

fn join_problems(problems: &[ArgumentProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
