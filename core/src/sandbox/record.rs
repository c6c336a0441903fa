//! Sandbox specs, records, and status types.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the worker's execution endpoint.
pub const EXECUTION_SERVER: &str = "EXECUTION_SERVER";

/// Name of the editor endpoint.
pub const EDITOR: &str = "EDITOR";

/// Name of the first application endpoint.
pub const APP_1: &str = "APP_1";

/// Name of the second application endpoint.
pub const APP_2: &str = "APP_2";

/// Externally observed sandbox status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    Starting,
    Running,
    /// Workspace retained, process stopped.
    Paused,
    Stopped,
    Error,
}

/// Template a sandbox is created from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub id: String,
    /// Worker argv. Falls back to the configured worker command when unset.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Environment passed to the worker, below the fixed sandbox variables.
    #[serde(default)]
    pub initial_env: HashMap<String, String>,
}

impl SandboxSpec {
    /// Creates a spec that uses the configured worker command.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the worker command.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a worker environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.initial_env.insert(key.into(), value.into());
        self
    }
}

/// A network endpoint exposed by a running sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedUrl {
    pub name: String,
    pub url: String,
    pub port: u16,
}

/// Snapshot of a sandbox returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub user_id: Option<String>,
    pub sandbox_spec_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SandboxStatus,
    /// Present until the sandbox is deleted.
    pub workspace_path: Option<PathBuf>,
    /// Empty unless a worker is running.
    pub exposed_urls: Vec<ExposedUrl>,
}

impl SandboxInfo {
    /// Looks up an exposed URL by endpoint name.
    pub fn url(&self, name: &str) -> Option<&ExposedUrl> {
        self.exposed_urls.iter().find(|u| u.name == name)
    }
}

/// One page of a sandbox listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPage {
    pub items: Vec<SandboxInfo>,
    /// Token for the following page, `None` on the last one.
    pub next_page_id: Option<String>,
}
