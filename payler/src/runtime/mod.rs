/// Callable registry used to resolve workflow configuration.
pub mod registry;
/// Supervisor running workflows and handling shutdown.
pub mod supervisor;
/// Workflow definition and startup.
pub mod workflow;

pub use registry::{ActionRegistry, WorkflowFn};
pub use supervisor::{ShutdownToken, WorkflowExit, WorkflowRuntime};
pub use workflow::{register_workflows, Workflow, WorkflowContext};
