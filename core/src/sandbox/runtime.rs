//! Lifecycle coordinator for a single sandbox.
//!
//! A [`WorktreeRuntime`] owns one sandbox's workspace and worker process and
//! sequences them through `New -> Starting -> Ready <-> Paused`, ending in
//! `Gone` after [`WorktreeRuntime::close`]. A failed start unwinds everything
//! it created before reporting the error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::liveness::{Liveness, ProcessProbe};
use crate::ports::PortAssignment;
use crate::process::{self, LaunchSpec, LogBuffer, LogLine, ProcessHandle};
use crate::readiness::{wait_until_alive, ReadinessPolicy};
use crate::worker::WorkerClient;

use super::record::{ExposedUrl, SandboxStatus, APP_1, APP_2, EDITOR, EXECUTION_SERVER};
use super::worktree::WorktreeProvisioner;

/// Value of the `RUNTIME` variable passed to workers.
pub const RUNTIME_MARKER: &str = "worktree";

/// Commanded lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    New,
    Starting,
    Ready,
    Paused,
    Error,
    Gone,
}

/// Maps a lifecycle state to the status reported to callers.
///
/// `liveness` is only consulted for a ready sandbox with a known process.
fn observed_status(
    state: RuntimeState,
    pid: Option<u32>,
    liveness: impl FnOnce() -> Liveness,
) -> SandboxStatus {
    match state {
        RuntimeState::New | RuntimeState::Gone => SandboxStatus::Stopped,
        RuntimeState::Starting => SandboxStatus::Starting,
        RuntimeState::Paused => SandboxStatus::Paused,
        RuntimeState::Error => SandboxStatus::Error,
        RuntimeState::Ready => match pid {
            Some(_) => match liveness() {
                Liveness::Alive => SandboxStatus::Running,
                Liveness::Dead => SandboxStatus::Stopped,
                Liveness::Unknown => SandboxStatus::Error,
            },
            None => SandboxStatus::Stopped,
        },
    }
}

/// Lifecycle facts as of the coordinator's last transition.
#[derive(Debug, Clone)]
pub struct RuntimeSnapshot {
    pub state: RuntimeState,
    pub pid: Option<u32>,
    pub workspace: Option<PathBuf>,
    pub exposed_urls: Vec<ExposedUrl>,
}

impl RuntimeSnapshot {
    /// Status from the published state, checking the process with `probe`.
    pub fn status(&self, probe: &dyn ProcessProbe) -> SandboxStatus {
        observed_status(self.state, self.pid, || match self.pid {
            Some(pid) => probe.liveness(pid),
            None => Liveness::Dead,
        })
    }
}

/// Read-only handle on a coordinator's published snapshot.
///
/// Readable while a lifecycle operation holds the coordinator.
#[derive(Debug, Clone)]
pub struct RuntimeView {
    inner: Arc<Mutex<RuntimeSnapshot>>,
}

impl RuntimeView {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RuntimeSnapshot {
                state: RuntimeState::New,
                pid: None,
                workspace: None,
                exposed_urls: Vec::new(),
            })),
        }
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn publish(&self, snapshot: RuntimeSnapshot) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}

/// What the worker needs to know about its sandbox.
#[derive(Debug, Clone, Copy)]
pub struct WorkerEnvContext<'a> {
    pub sandbox_id: &'a str,
    pub workspace: &'a Path,
    pub ports: &'a PortAssignment,
    pub session_api_key: Option<&'a str>,
    pub debug: bool,
}

/// Builds the variables added to the worker's inherited environment.
///
/// Later layers override earlier ones: `initial_env`, then `config_env`, then
/// the fixed sandbox variables.
pub fn worker_env(
    ctx: WorkerEnvContext<'_>,
    initial_env: &HashMap<String, String>,
    config_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = initial_env.clone();
    env.extend(config_env.iter().map(|(k, v)| (k.clone(), v.clone())));

    env.insert("SANDBOX_PORT".to_string(), ctx.ports.execution.to_string());
    env.insert("EDITOR_PORT".to_string(), ctx.ports.editor.to_string());
    for (i, port) in ctx.ports.app.iter().enumerate() {
        env.insert(format!("APP_PORT_{}", i + 1), port.to_string());
    }
    if let Some(key) = ctx.session_api_key {
        env.insert("SESSION_API_KEY".to_string(), key.to_string());
    }
    env.insert("SANDBOX_ID".to_string(), ctx.sandbox_id.to_string());
    env.insert(
        "SANDBOX_WORKSPACE_PATH".to_string(),
        ctx.workspace.to_string_lossy().to_string(),
    );
    env.insert("RUNTIME".to_string(), RUNTIME_MARKER.to_string());
    if ctx.debug {
        env.insert("DEBUG".to_string(), "true".to_string());
    }

    env
}

/// A worker that passed its readiness check.
struct RunningServer {
    handle: ProcessHandle,
    ports: PortAssignment,
    client: WorkerClient,
}

/// Coordinates one sandbox's workspace and worker process.
pub struct WorktreeRuntime {
    sandbox_id: String,
    provisioner: WorktreeProvisioner,
    config: Arc<RuntimeConfig>,
    command: Vec<String>,
    initial_env: HashMap<String, String>,
    session_api_key: Option<String>,
    probe: Arc<dyn ProcessProbe>,
    state: RuntimeState,
    workspace: Option<PathBuf>,
    server: Option<RunningServer>,
    logs: LogBuffer,
    view: RuntimeView,
}

impl std::fmt::Debug for WorktreeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeRuntime")
            .field("sandbox_id", &self.sandbox_id)
            .field("state", &self.state)
            .field("workspace", &self.workspace)
            .field("pid", &self.pid())
            .finish()
    }
}

impl WorktreeRuntime {
    /// Creates a coordinator in the `New` state. Nothing is provisioned yet.
    pub fn new(
        sandbox_id: impl Into<String>,
        provisioner: WorktreeProvisioner,
        config: Arc<RuntimeConfig>,
        command: Vec<String>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            provisioner,
            config,
            command,
            initial_env: HashMap::new(),
            session_api_key: None,
            probe,
            state: RuntimeState::New,
            workspace: None,
            server: None,
            logs: LogBuffer::default(),
            view: RuntimeView::new(),
        }
    }

    /// Sets the sandbox spec environment passed to the worker.
    pub fn with_initial_env(mut self, env: HashMap<String, String>) -> Self {
        self.initial_env = env;
        self
    }

    /// Sets the session credential passed to the worker and sent on probes.
    pub fn with_session_api_key(mut self, key: impl Into<String>) -> Self {
        self.session_api_key = Some(key.into());
        self
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn session_api_key(&self) -> Option<&str> {
        self.session_api_key.as_deref()
    }

    /// Workspace directory, once provisioned and until closed.
    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    /// Ports of the running worker.
    pub fn ports(&self) -> Option<&PortAssignment> {
        self.server.as_ref().map(|s| &s.ports)
    }

    /// Process id of the running worker.
    pub fn pid(&self) -> Option<u32> {
        self.server.as_ref().map(|s| s.handle.pid())
    }

    /// Handle on the state published at each transition.
    pub fn view(&self) -> RuntimeView {
        self.view.clone()
    }

    fn set_state(&mut self, state: RuntimeState) {
        self.state = state;
        self.view.publish(RuntimeSnapshot {
            state,
            pid: self.pid(),
            workspace: self.workspace.clone(),
            exposed_urls: self.exposed_urls(),
        });
    }

    /// Captured worker output, across restarts.
    pub fn logs(&self) -> Vec<LogLine> {
        self.logs.snapshot()
    }

    /// Provisions the workspace, launches the worker and waits for readiness.
    ///
    /// On failure the worker is stopped, the workspace removed, and the
    /// coordinator left in `Error`.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != RuntimeState::New {
            return Err(Error::InvalidState(format!(
                "cannot start sandbox {} from {:?}",
                self.sandbox_id, self.state
            )));
        }

        self.set_state(RuntimeState::Starting);
        tracing::info!(sandbox_id = %self.sandbox_id, "starting sandbox");

        match self.provision_and_launch().await {
            Ok(()) => {
                self.set_state(RuntimeState::Ready);
                tracing::info!(
                    sandbox_id = %self.sandbox_id,
                    pid = ?self.pid(),
                    ports = ?self.ports(),
                    "sandbox ready"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(sandbox_id = %self.sandbox_id, error = %e, "sandbox failed to start, cleaning up");
                self.release().await;
                self.set_state(RuntimeState::Error);
                Err(e)
            }
        }
    }

    async fn provision_and_launch(&mut self) -> Result<()> {
        let workspace = self.provisioner.create_workspace(&self.sandbox_id).await?;
        self.workspace = Some(workspace.clone());
        self.server = Some(self.launch(&workspace).await?);
        Ok(())
    }

    /// Launches the worker, retrying with fresh ports when it loses a port.
    async fn launch(&self, workspace: &Path) -> Result<RunningServer> {
        let max_attempts = self.config.max_start_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.launch_once(workspace).await {
                Ok(server) => return Ok(server),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        sandbox_id = %self.sandbox_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "worker lost a port to another process, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn launch_once(&self, workspace: &Path) -> Result<RunningServer> {
        let config = &self.config;
        let mut ports = PortAssignment::allocate(&config.ports)?;
        if !ports.still_free(&config.ports) {
            tracing::debug!(sandbox_id = %self.sandbox_id, ports = ?ports, "allocated port taken, reallocating");
            ports = PortAssignment::allocate(&config.ports)?;
        }

        let client = WorkerClient::for_port(
            &config.host,
            ports.execution,
            self.session_api_key.clone(),
            config.readiness.request_timeout(),
        )?;

        let env = worker_env(
            WorkerEnvContext {
                sandbox_id: &self.sandbox_id,
                workspace,
                ports: &ports,
                session_api_key: self.session_api_key.as_deref(),
                debug: config.debug,
            },
            &self.initial_env,
            &config.worker.env,
        );

        let mut handle = process::start(
            LaunchSpec {
                command: &self.command,
                working_dir: workspace,
                env: &env,
                log_tag: &self.sandbox_id,
            },
            &self.logs,
        )?;

        let policy = ReadinessPolicy::from(&config.readiness);
        match wait_until_alive(&mut handle, &client, &policy).await {
            Ok(()) => Ok(RunningServer {
                handle,
                ports,
                client,
            }),
            Err(Error::Disconnected { exit_code, .. }) => {
                let port_contended = ports.contended(&config.ports);
                handle.stop().await;
                Err(Error::Disconnected {
                    exit_code,
                    port_contended,
                })
            }
            Err(e) => {
                handle.stop().await;
                Err(e)
            }
        }
    }

    /// Stops the worker and keeps the workspace.
    pub async fn pause(&mut self) -> Result<()> {
        if self.state != RuntimeState::Ready {
            return Err(Error::InvalidState(format!(
                "cannot pause sandbox {} from {:?}",
                self.sandbox_id, self.state
            )));
        }
        let Some(mut server) = self.server.take() else {
            return Err(Error::InvalidState(format!(
                "sandbox {} has no running process",
                self.sandbox_id
            )));
        };

        server.handle.stop().await;
        self.set_state(RuntimeState::Paused);
        tracing::info!(sandbox_id = %self.sandbox_id, "sandbox paused");
        Ok(())
    }

    /// Relaunches the worker in the retained workspace.
    ///
    /// Ports may differ from the previous run. A failed relaunch leaves the
    /// coordinator in `Error` with the workspace intact.
    pub async fn resume(&mut self) -> Result<()> {
        let Some(workspace) = self.workspace.clone() else {
            return Err(Error::InvalidState(format!(
                "sandbox {} has no workspace to resume",
                self.sandbox_id
            )));
        };
        if self.state != RuntimeState::Paused {
            return Err(Error::InvalidState(format!(
                "cannot resume sandbox {} from {:?}",
                self.sandbox_id, self.state
            )));
        }
        if !workspace.exists() {
            return Err(Error::InvalidState(format!(
                "workspace {} of sandbox {} no longer exists",
                workspace.display(),
                self.sandbox_id
            )));
        }

        self.set_state(RuntimeState::Starting);
        match self.launch(&workspace).await {
            Ok(server) => {
                self.server = Some(server);
                self.set_state(RuntimeState::Ready);
                tracing::info!(sandbox_id = %self.sandbox_id, pid = ?self.pid(), "sandbox resumed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(sandbox_id = %self.sandbox_id, error = %e, "sandbox failed to resume");
                self.set_state(RuntimeState::Error);
                Err(e)
            }
        }
    }

    /// Stops the worker and removes the workspace.
    ///
    /// Safe to call repeatedly and on sandboxes that never started.
    pub async fn close(&mut self) {
        if self.state == RuntimeState::Gone {
            return;
        }
        self.release().await;
        self.set_state(RuntimeState::Gone);
        tracing::info!(sandbox_id = %self.sandbox_id, "sandbox closed");
    }

    async fn release(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.handle.stop().await;
        }
        if let Some(workspace) = self.workspace.take() {
            self.provisioner.remove_workspace(&workspace).await;
        }
    }

    /// Observed status. A ready sandbox reports the liveness of its process.
    pub fn status(&mut self) -> SandboxStatus {
        let pid = self.pid();
        let probe = self.probe.clone();
        let server = self.server.as_mut();
        observed_status(self.state, pid, || match server {
            Some(server) => server.handle.liveness(probe.as_ref()),
            None => Liveness::Dead,
        })
    }

    /// Endpoints of the running worker. Empty when nothing runs.
    pub fn exposed_urls(&self) -> Vec<ExposedUrl> {
        let Some(server) = &self.server else {
            return Vec::new();
        };
        let host = &self.config.host;
        let ports = &server.ports;

        let mut urls = vec![
            ExposedUrl {
                name: EXECUTION_SERVER.to_string(),
                url: server.client.base_url().to_string(),
                port: ports.execution,
            },
            ExposedUrl {
                name: EDITOR.to_string(),
                url: match &self.workspace {
                    Some(ws) => format!("http://{}:{}/?folder={}", host, ports.editor, ws.display()),
                    None => format!("http://{}:{}", host, ports.editor),
                },
                port: ports.editor,
            },
        ];
        for (name, port) in [APP_1, APP_2].into_iter().zip(&ports.app) {
            urls.push(ExposedUrl {
                name: name.to_string(),
                url: format!("http://{}:{}", host, port),
                port: *port,
            });
        }
        urls
    }
}
