//! Runtime configuration and validation.
//!
//! Configuration is loaded from TOML and validated before any sandbox is
//! created, to catch bad port ranges or timeouts early.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ports::PortRange;

/// Environment variable overriding where worktrees are created.
pub const WORKTREE_BASE_DIR_ENV: &str = "SANDBOX_WORKTREE_BASE_DIR";

/// Subdirectory of the system temp dir used when nothing else is configured.
pub const DEFAULT_WORKTREE_DIR_NAME: &str = "sandbox-worktrees";

/// Port ranges for each worker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Range for the execution server port.
    pub execution: PortRange,
    /// Range for the editor port.
    pub editor: PortRange,
    /// Range for the first application port.
    pub app_1: PortRange,
    /// Range for the second application port.
    pub app_2: PortRange,
    /// Fixed editor port. Skips allocation when set.
    pub editor_port: Option<u16>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            execution: PortRange::new(30000, 10000),
            editor: PortRange::new(40000, 10000),
            app_1: PortRange::new(50000, 5000),
            app_2: PortRange::new(55000, 5000),
            editor_port: None,
        }
    }
}

impl PortsConfig {
    fn ranges(&self) -> [(&'static str, PortRange); 4] {
        [
            ("execution", self.execution),
            ("editor", self.editor),
            ("app_1", self.app_1),
            ("app_2", self.app_2),
        ]
    }
}

/// Readiness polling budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Overall budget for the worker to answer its liveness check.
    pub timeout_secs: u64,
    /// Timeout for a single liveness request.
    pub request_timeout_secs: u64,
    /// Pause between liveness attempts.
    pub poll_interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            request_timeout_secs: 2,
            poll_interval_ms: 1000,
        }
    }
}

impl ReadinessConfig {
    /// Returns the overall budget as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the per-request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// How the worker server is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Default argv for the worker. Sandbox specs may override it.
    pub command: Vec<String>,
    /// Extra environment applied to every worker.
    pub env: HashMap<String, String>,
}

/// Git identity written into the base repository and every worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitIdentity {
    pub user_email: String,
    pub user_name: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            user_email: "sandbox@localhost".to_string(),
            user_name: "Sandbox".to_string(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_start_attempts() -> u32 {
    3
}

fn default_page_size() -> usize {
    100
}

/// Top-level configuration for the sandbox orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Repository every worktree is derived from.
    pub base_repo_path: PathBuf,
    /// Where worktrees are created. See [`RuntimeConfig::workspace_base_dir`].
    #[serde(default)]
    pub workspace_base_dir: Option<PathBuf>,
    /// Host used for liveness probes and exposed URLs.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub git: GitIdentity,
    /// Passes `DEBUG=true` to workers.
    #[serde(default)]
    pub debug: bool,
    /// Launch attempts when a worker loses its port to another process.
    #[serde(default = "default_max_start_attempts")]
    pub max_start_attempts: u32,
    /// Sandboxes per page when listing.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl RuntimeConfig {
    /// Creates a configuration with defaults for the given base repository.
    pub fn new(base_repo_path: impl Into<PathBuf>) -> Self {
        Self {
            base_repo_path: base_repo_path.into(),
            workspace_base_dir: None,
            host: default_host(),
            ports: PortsConfig::default(),
            readiness: ReadinessConfig::default(),
            worker: WorkerConfig::default(),
            git: GitIdentity::default(),
            debug: false,
            max_start_attempts: default_max_start_attempts(),
            page_size: default_page_size(),
        }
    }

    /// Sets the directory worktrees are created in.
    pub fn with_workspace_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_base_dir = Some(dir.into());
        self
    }

    /// Sets the default worker command.
    pub fn with_worker_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the port ranges.
    pub fn with_ports(mut self, ports: PortsConfig) -> Self {
        self.ports = ports;
        self
    }

    /// Sets the readiness budget.
    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// Parses a configuration from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Resolves the worktree base directory.
    ///
    /// An explicit setting wins, then [`WORKTREE_BASE_DIR_ENV`], then a fixed
    /// subdirectory of the system temp dir.
    pub fn workspace_base_dir(&self) -> PathBuf {
        if let Some(dir) = &self.workspace_base_dir {
            return dir.clone();
        }
        match std::env::var(WORKTREE_BASE_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir().join(DEFAULT_WORKTREE_DIR_NAME),
        }
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for PortsConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let ranges = self.ranges();

        for (name, range) in &ranges {
            if range.size == 0 {
                result.add_error(format!("port range '{}' is empty", name));
            } else if range.last().is_none() {
                result.add_error(format!("port range '{}' runs past 65535", name));
            }
            if range.start < 1024 {
                result.add_warning(format!(
                    "port range '{}' starts in the privileged range",
                    name
                ));
            }
        }

        // Disjoint ranges keep one assignment from reusing a port
        for (i, (a_name, a)) in ranges.iter().enumerate() {
            for (b_name, b) in ranges.iter().skip(i + 1) {
                if a.overlaps(b) {
                    result.add_error(format!(
                        "port ranges '{}' and '{}' overlap",
                        a_name, b_name
                    ));
                }
            }
        }

        if let Some(port) = self.editor_port {
            if port == 0 {
                result.add_error("editor_port cannot be 0");
            }
        }

        result
    }
}

impl Validate for ReadinessConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.timeout_secs == 0 {
            result.add_error("readiness timeout_secs must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            result.add_error("readiness request_timeout_secs must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            result.add_error("readiness poll_interval_ms must be at least 1");
        }
        if self.poll_interval() > self.timeout() {
            result.add_warning("poll interval is longer than the readiness budget");
        }

        result
    }
}

impl Validate for RuntimeConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.base_repo_path.as_os_str().is_empty() {
            result.add_error("base_repo_path cannot be empty");
        }
        if self.host.trim().is_empty() {
            result.add_error("host cannot be empty");
        }
        if self.worker.command.is_empty() {
            result.add_warning("no default worker command; every sandbox spec must provide one");
        }
        if self.max_start_attempts == 0 {
            result.add_error("max_start_attempts must be at least 1");
        }
        if self.page_size == 0 {
            result.add_error("page_size must be at least 1");
        }

        result.merge(self.ports.validate());
        result.merge(self.readiness.validate());
        result
    }
}
