//! Resource-aware job admission for pipestance units.
//!
//! Two strategies share the [`Scheduler`] contract: a local one that admits
//! jobs against in-process core/memory semaphores, and a remote one that
//! renders a site job template and hands it to a cluster submit command.

pub mod errors;
pub mod host;
pub mod job;
pub mod local;
pub mod pool;
pub mod remote;

pub use errors::{SchedulerError, SchedulerResult};
pub use job::{JobMode, JobRequest, Scheduler, SharedScheduler};
pub use local::{HostLoadSource, LoadSource, LocalScheduler, LocalSchedulerConfig};
pub use pool::{ResourceLease, ResourcePool};
pub use remote::{JobTemplate, RemoteScheduler, RemoteSchedulerConfig, render_template};
