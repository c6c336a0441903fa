//! Sandboxes backed by git worktrees and a supervised worker process.
//!
//! [`WorktreeProvisioner`] creates the per-sandbox workspaces,
//! [`WorktreeRuntime`] drives one sandbox through its lifecycle, and
//! [`SandboxService`] keeps the registry of sandboxes for the process.

pub mod record;
pub mod runtime;
pub mod service;
pub mod worktree;

pub use record::{
    ExposedUrl, SandboxInfo, SandboxPage, SandboxSpec, SandboxStatus, APP_1, APP_2, EDITOR,
    EXECUTION_SERVER,
};
pub use runtime::{
    worker_env, RuntimeSnapshot, RuntimeState, RuntimeView, WorkerEnvContext, WorktreeRuntime,
};
pub use service::{resolve_in_workspace, SandboxService};
pub use worktree::{validate_sandbox_id, worktree_name, WorktreeProvisioner};
