// Armada - multi-host deployment orchestration over SSH
//
// Compiles task dependency graphs into linear plans and runs them across a
// fleet with per-task barriers, bounded fan-out, and failure hooks.

pub mod config;
pub mod executor;
pub mod output;
pub mod registry;
pub mod tasks;
pub mod telemetry;

pub use config::{ArmadaConfig, Vars};
pub use executor::{
    CancelHandle, ConnectionManager, ExecutionContext, Executor, ExecutorConfig, ProcessRunner,
    RunOptions,
};
pub use output::{ArmadaError, OutputFormat, OutputWriter, RunReport, TerminalOutput};
pub use registry::{Host, HostRegistry};
pub use tasks::compiler::{compile, CompiledPlan};
pub use tasks::{Task, TaskMode, TaskRegistry};

/// Version of the Armada tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ArmadaConfig, Vars};
    pub use crate::executor::{ConnectionManager, ExecutionContext, Executor, ExecutorConfig};
    pub use crate::output::{ArmadaError, OutputWriter, RunReport};
    pub use crate::registry::{Host, HostRegistry};
    pub use crate::tasks::compiler::compile;
    pub use crate::tasks::{Task, TaskMode, TaskRegistry};
}
