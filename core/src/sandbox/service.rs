//! In-memory registry of sandboxes for one orchestrator process.
//!
//! The registry map is the only state shared across sandboxes. Each entry
//! wraps its coordinator in its own mutex, so lifecycle operations on
//! different sandboxes run independently.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::liveness::{ProcessProbe, SignalProbe};
use crate::process::LogLine;

use super::record::{SandboxInfo, SandboxPage, SandboxSpec};
use super::runtime::{RuntimeView, WorktreeRuntime};
use super::worktree::{validate_sandbox_id, WorktreeProvisioner};

/// Immutable facts recorded at creation.
#[derive(Debug, Clone)]
struct SandboxMeta {
    user_id: Option<String>,
    sandbox_spec_id: String,
    created_at: DateTime<Utc>,
    session_api_key: String,
}

struct Slot {
    id: String,
    meta: SandboxMeta,
    view: RuntimeView,
    runtime: Mutex<WorktreeRuntime>,
}

impl Slot {
    fn new(id: &str, meta: SandboxMeta, runtime: WorktreeRuntime) -> Self {
        Self {
            id: id.to_string(),
            meta,
            view: runtime.view(),
            runtime: Mutex::new(runtime),
        }
    }
}

/// Creates, tracks and tears down sandboxes.
///
/// Callers must not run two lifecycle operations on the same sandbox id
/// concurrently; distinct ids are independent.
pub struct SandboxService {
    config: Arc<RuntimeConfig>,
    provisioner: WorktreeProvisioner,
    probe: Arc<dyn ProcessProbe>,
    user_id: Option<String>,
    specs: RwLock<HashMap<String, SandboxSpec>>,
    sandboxes: RwLock<HashMap<String, Arc<Slot>>>,
}

impl SandboxService {
    /// Creates a service with the OS signal probe.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_probe(config, Arc::new(SignalProbe))
    }

    /// Creates a service with a custom liveness probe.
    pub fn with_probe(config: RuntimeConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        let provisioner = WorktreeProvisioner::new(
            config.base_repo_path.clone(),
            config.workspace_base_dir(),
            config.git.clone(),
        );
        Self {
            config: Arc::new(config),
            provisioner,
            probe,
            user_id: None,
            specs: RwLock::new(HashMap::new()),
            sandboxes: RwLock::new(HashMap::new()),
        }
    }

    /// Records `user_id` as the owner of sandboxes created from now on.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &WorktreeProvisioner {
        &self.provisioner
    }

    /// Registers or replaces a sandbox spec.
    pub async fn register_spec(&self, spec: SandboxSpec) {
        tracing::debug!(spec_id = %spec.id, "registering sandbox spec");
        self.specs.write().await.insert(spec.id.clone(), spec);
    }

    pub async fn get_spec(&self, spec_id: &str) -> Option<SandboxSpec> {
        self.specs.read().await.get(spec_id).cloned()
    }

    /// Creates a sandbox with a fresh UUID.
    pub async fn create(&self, spec_id: &str, session_api_key: &str) -> Result<SandboxInfo> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_with_id(&id, spec_id, session_api_key).await
    }

    /// Creates a sandbox with a caller-chosen id.
    ///
    /// Returns only once the worker is ready. A failed start leaves nothing
    /// registered and nothing on disk.
    pub async fn create_with_id(
        &self,
        sandbox_id: &str,
        spec_id: &str,
        session_api_key: &str,
    ) -> Result<SandboxInfo> {
        validate_sandbox_id(sandbox_id)?;
        let spec = self
            .get_spec(spec_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("sandbox spec {}", spec_id)))?;

        if self.sandboxes.read().await.contains_key(sandbox_id) {
            return Err(Error::InvalidState(format!(
                "sandbox {} already exists",
                sandbox_id
            )));
        }

        let command = spec
            .command
            .clone()
            .unwrap_or_else(|| self.config.worker.command.clone());
        if command.is_empty() {
            return Err(Error::Config(format!(
                "no worker command for sandbox spec {}",
                spec_id
            )));
        }

        let mut runtime = WorktreeRuntime::new(
            sandbox_id,
            self.provisioner.clone(),
            self.config.clone(),
            command,
            self.probe.clone(),
        )
        .with_initial_env(spec.initial_env.clone())
        .with_session_api_key(session_api_key);

        runtime.start().await?;

        let meta = SandboxMeta {
            user_id: self.user_id.clone(),
            sandbox_spec_id: spec_id.to_string(),
            created_at: Utc::now(),
            session_api_key: session_api_key.to_string(),
        };
        let slot = Arc::new(Slot::new(sandbox_id, meta, runtime));

        {
            let mut sandboxes = self.sandboxes.write().await;
            if !sandboxes.contains_key(sandbox_id) {
                sandboxes.insert(sandbox_id.to_string(), slot.clone());
                drop(sandboxes);
                tracing::info!(sandbox_id = %sandbox_id, spec_id = %spec_id, "sandbox created");
                return Ok(self.info(&slot));
            }
        }

        // Lost a same-id race; undo our copy
        slot.runtime.lock().await.close().await;
        Err(Error::InvalidState(format!(
            "sandbox {} already exists",
            sandbox_id
        )))
    }

    async fn slot(&self, sandbox_id: &str) -> Result<Arc<Slot>> {
        self.sandboxes
            .read()
            .await
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", sandbox_id)))
    }

    /// Builds the public record without waiting on a lifecycle operation.
    ///
    /// A busy coordinator is described by its last published snapshot.
    fn info(&self, slot: &Slot) -> SandboxInfo {
        let (status, workspace_path, exposed_urls) = match slot.runtime.try_lock() {
            Ok(mut runtime) => (
                runtime.status(),
                runtime.workspace_path().map(Path::to_path_buf),
                runtime.exposed_urls(),
            ),
            Err(_) => {
                let snapshot = slot.view.snapshot();
                (
                    snapshot.status(self.probe.as_ref()),
                    snapshot.workspace,
                    snapshot.exposed_urls,
                )
            }
        };
        SandboxInfo {
            id: slot.id.clone(),
            user_id: slot.meta.user_id.clone(),
            sandbox_spec_id: slot.meta.sandbox_spec_id.clone(),
            created_at: slot.meta.created_at,
            status,
            workspace_path,
            exposed_urls,
        }
    }

    /// Looks up a sandbox. Status is observed, not remembered.
    pub async fn get(&self, sandbox_id: &str) -> Option<SandboxInfo> {
        let slot = self.slot(sandbox_id).await.ok()?;
        Some(self.info(&slot))
    }

    /// Lists sandboxes ordered by creation time, one page at a time.
    ///
    /// `page_id` is the token from a previous page. Unknown tokens restart
    /// from the first page.
    pub async fn list(&self, page_id: Option<&str>) -> SandboxPage {
        let mut slots: Vec<Arc<Slot>> = self.sandboxes.read().await.values().cloned().collect();
        slots.sort_by(|a, b| {
            a.meta
                .created_at
                .cmp(&b.meta.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let offset = page_id
            .and_then(|token| token.parse::<usize>().ok())
            .filter(|offset| *offset < slots.len())
            .unwrap_or(0);
        let page_size = self.config.page_size.max(1);
        let end = (offset + page_size).min(slots.len());

        let items = slots[offset..end]
            .iter()
            .map(|slot| self.info(slot))
            .collect();

        SandboxPage {
            items,
            next_page_id: (end < slots.len()).then(|| end.to_string()),
        }
    }

    /// Finds the sandbox created with `session_api_key`.
    pub async fn find_by_credential(&self, session_api_key: &str) -> Option<SandboxInfo> {
        let slot = self
            .sandboxes
            .read()
            .await
            .values()
            .find(|slot| slot.meta.session_api_key == session_api_key)
            .cloned()?;
        Some(self.info(&slot))
    }

    /// Stops and removes a sandbox. Always returns true.
    ///
    /// An id with no registered sandbox still has any leftover worktree of
    /// that name removed. Distinct valid ids never share a worktree, so this
    /// cannot reach a registered sandbox's workspace.
    pub async fn delete(&self, sandbox_id: &str) -> bool {
        let slot = self.sandboxes.write().await.remove(sandbox_id);
        match slot {
            Some(slot) => {
                slot.runtime.lock().await.close().await;
                tracing::info!(sandbox_id = %sandbox_id, "sandbox deleted");
            }
            None => {
                tracing::debug!(sandbox_id = %sandbox_id, "delete of unknown sandbox, removing orphaned worktree if any");
                self.provisioner.remove_by_sandbox_id(sandbox_id).await;
            }
        }
        true
    }

    /// Deletes every registered sandbox.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sandboxes.read().await.keys().cloned().collect();
        for id in ids {
            self.delete(&id).await;
        }
    }

    /// Stops a sandbox's worker, keeping its workspace.
    pub async fn pause(&self, sandbox_id: &str) -> Result<()> {
        let slot = self.slot(sandbox_id).await?;
        let mut runtime = slot.runtime.lock().await;
        runtime.pause().await
    }

    /// Restarts a paused sandbox's worker in the same workspace.
    pub async fn resume(&self, sandbox_id: &str) -> Result<()> {
        let slot = self.slot(sandbox_id).await?;
        let mut runtime = slot.runtime.lock().await;
        runtime.resume().await
    }

    async fn workspace_of(&self, sandbox_id: &str) -> Result<PathBuf> {
        let slot = self.slot(sandbox_id).await?;
        let runtime = slot.runtime.lock().await;
        let workspace = runtime
            .workspace_path()
            .ok_or_else(|| Error::NotFound(format!("workspace of sandbox {}", sandbox_id)))?;
        if !workspace.exists() {
            return Err(Error::NotFound(format!(
                "workspace {} of sandbox {}",
                workspace.display(),
                sandbox_id
            )));
        }
        Ok(workspace.to_path_buf())
    }

    /// Reads a file relative to the sandbox workspace.
    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        let target = resolve_in_workspace(&self.workspace_of(sandbox_id).await?, path)?;
        tokio::fs::read(&target).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("{} in sandbox {}", path, sandbox_id))
            }
            _ => Error::Io(e),
        })
    }

    /// Writes a file relative to the sandbox workspace, creating parent
    /// directories.
    pub async fn write_file(&self, sandbox_id: &str, path: &str, content: &[u8]) -> Result<()> {
        let target = resolve_in_workspace(&self.workspace_of(sandbox_id).await?, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        tracing::debug!(sandbox_id = %sandbox_id, path = %path, bytes = content.len(), "wrote sandbox file");
        Ok(())
    }

    /// Command execution belongs to the worker's own API.
    pub async fn execute(&self, sandbox_id: &str, _command: &str) -> Result<String> {
        Err(Error::UnsupportedOperation(format!(
            "command execution in sandbox {} goes through the worker API",
            sandbox_id
        )))
    }

    /// Captured worker output.
    pub async fn logs(&self, sandbox_id: &str) -> Result<Vec<LogLine>> {
        let slot = self.slot(sandbox_id).await?;
        let runtime = slot.runtime.lock().await;
        Ok(runtime.logs())
    }
}

/// Joins a caller-supplied relative path onto the workspace.
///
/// Absolute paths and `..` components are rejected.
pub fn resolve_in_workspace(workspace: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let mut resolved = workspace.to_path_buf();
    let mut depth = 0usize;

    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(rel.to_path_buf()));
            }
        }
    }

    if depth == 0 {
        return Err(Error::InvalidPath(rel.to_path_buf()));
    }
    Ok(resolved)
}
