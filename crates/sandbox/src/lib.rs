//! Per-conversation isolated execution environments.
//!
//! Each conversation gets one container, created on first use and reused
//! across turns (stopped between turns, restarted on the next). All file
//! tools run *inside* the container; the host only prepares the mounted
//! directory layout.

pub mod commands;
pub mod docker;
pub mod manager;
pub mod runtime;
pub mod sandbox;
pub mod testing;

pub use manager::SandboxManager;
pub use runtime::{ContainerRuntime, ContainerSpec, ExecOutput, SandboxError};
pub use sandbox::{EditResult, ExecuteResponse, GrepMatch, LsEntry, Sandbox, WriteResult};
