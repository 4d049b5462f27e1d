mod container;
mod task;

pub use container::ThreadContainer;
pub use task::{find_execution_control, ExecutionControl, PeriodicTask, TaskCallback};
