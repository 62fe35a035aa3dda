pub mod error;
pub mod expand;
pub mod graph;
pub mod runner;
pub mod scheduler;
pub mod staleness;
pub mod template;

pub use error::{GraphError, TaskError, TemplateError};
pub use expand::{expand, expand_all};
pub use graph::DependencyGraph;
pub use runner::{CommandBuilder, CommandLine, Invocation, ProcessExecutor, TaskExecutor, verify_outputs};
pub use scheduler::{RunSummary, Scheduler, SchedulerOptions, TaskState};
pub use staleness::{Staleness, plan};
pub use template::{InputPattern, Parameterization, Resources, TaskInstance, TaskTemplate};
