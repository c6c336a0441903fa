//! Worktree Sandbox - container-free sandboxes for worker server processes
//!
//! Each sandbox gets its own git worktree of a shared base repository and a
//! worker process started inside it on freshly allocated ports. The library
//! provisions workspaces, supervises workers, waits for them to become ready,
//! and keeps an in-memory registry of the sandboxes it runs.

pub mod config;
pub mod error;
pub mod liveness;
pub mod ports;
pub mod process;
pub mod readiness;
pub mod sandbox;
pub mod worker;

pub use config::{
    GitIdentity, PortsConfig, ReadinessConfig, RuntimeConfig, Validate, ValidationResult,
    WorkerConfig,
};
pub use error::{Error, Result};
pub use liveness::{Liveness, ProcessProbe, SignalProbe};
pub use ports::{PortAssignment, PortRange};
pub use process::{LogBuffer, LogLine, LogStream, ProcessHandle};
pub use readiness::{wait_until_alive, ReadinessPolicy};
pub use sandbox::{
    ExposedUrl, RuntimeState, SandboxInfo, SandboxPage, SandboxService, SandboxSpec,
    SandboxStatus, WorktreeProvisioner, WorktreeRuntime,
};
pub use worker::{ProbeOutcome, WorkerClient};
