// Worker lifecycle: restart on crash or stall, pause for maintenance
pub mod heartbeat;
pub mod runner;
pub mod state_machine;

pub use heartbeat::Heartbeat;
pub use runner::{Checkpoint, RecoverySupervisor, WorkerContext, WorkerFactory, WorkerHandle};
pub use state_machine::{BackoffPolicy, LifecycleState, SupervisorMachine, Transition};
