//! Command dispatch and execution framework.
//!
//! 1. **Sequencing** (`sequencer`): per-id ticket lanes for FIFO order
//! 2. **Middleware** (`middleware`): Tower layers (metrics, timeout)
//! 3. **Routing** (`router`): control commands to the registry, the rest to nodes
//! 4. **Tasks** (`task`): one executor task per request
//! 5. **Workers** (`worker`): the executor pool with retry support

pub mod command;
pub mod config;
pub mod middleware;
pub mod router;
pub mod sequencer;
pub mod task;
pub mod worker;

// Re-export key types for convenient access.
pub use command::{control, Command, CommandContext, Dispatch, DispatchError};
pub use config::{ExecutorConfig, ServerConfig};
pub use middleware::{build_command_pipeline, CommandPipeline};
pub use router::CommandRouter;
pub use sequencer::{Sequencer, Ticket};
pub use task::DispatchTask;
pub use worker::{AbandonReason, Executor, ExecutorError, Outcome, Task};
