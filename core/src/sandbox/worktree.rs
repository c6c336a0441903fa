//! Git worktree provisioning for sandbox workspaces.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::GitIdentity;
use crate::error::{Error, Result};

/// Prefix of every worktree directory name.
pub const WORKTREE_NAME_PREFIX: &str = "sandbox-worktree-";

/// Longest sandbox id accepted as a worktree name.
pub const MAX_SANDBOX_ID_LEN: usize = 128;

/// Checks that `sandbox_id` can be used verbatim as a directory name.
///
/// Only ASCII alphanumerics, `-` and `_` are accepted, so distinct ids always
/// map to distinct worktrees.
pub fn validate_sandbox_id(sandbox_id: &str) -> Result<()> {
    if sandbox_id.is_empty() {
        return Err(Error::InvalidSandboxId("sandbox id is empty".to_string()));
    }
    if sandbox_id.len() > MAX_SANDBOX_ID_LEN {
        return Err(Error::InvalidSandboxId(format!(
            "sandbox id is longer than {} characters",
            MAX_SANDBOX_ID_LEN
        )));
    }
    if let Some(c) = sandbox_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::InvalidSandboxId(format!(
            "sandbox id {:?} contains {:?}; only [A-Za-z0-9_-] is allowed",
            sandbox_id, c
        )));
    }
    Ok(())
}

/// Worktree directory name for a validated sandbox id.
pub fn worktree_name(sandbox_id: &str) -> String {
    format!("{}{}", WORKTREE_NAME_PREFIX, sandbox_id)
}

/// Creates and removes detached worktrees off a shared base repository.
///
/// Every workspace shares the base repository's history but has its own
/// working directory, so changes stay isolated per sandbox.
#[derive(Debug, Clone)]
pub struct WorktreeProvisioner {
    /// Path to the base git repository.
    base_repo: PathBuf,
    /// Directory holding all worktrees.
    worktree_base: PathBuf,
    /// Identity configured in the base repo and each worktree.
    identity: GitIdentity,
    /// Serializes git commands that mutate the shared repository metadata.
    git_lock: Arc<Mutex<()>>,
}

async fn git(cwd: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .current_dir(cwd)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Provisioning(format!("failed to run git {}: {}", args.join(" "), e)))
}

/// Runs git and fails with the command's stderr on a non-zero exit.
async fn git_checked(cwd: &Path, args: &[&str]) -> Result<Output> {
    let output = git(cwd, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Provisioning(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(output)
}

/// Parses `git worktree list --porcelain` into worktree paths.
pub fn parse_worktree_list(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}

impl WorktreeProvisioner {
    /// Creates a provisioner for `base_repo`, placing worktrees under
    /// `worktree_base`.
    pub fn new(base_repo: PathBuf, worktree_base: PathBuf, identity: GitIdentity) -> Self {
        Self {
            base_repo,
            worktree_base,
            identity,
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Path to the base repository.
    pub fn base_repo(&self) -> &Path {
        &self.base_repo
    }

    /// Directory holding all worktrees.
    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Where the worktree for `sandbox_id` lives.
    pub fn worktree_path(&self, sandbox_id: &str) -> PathBuf {
        self.worktree_base.join(worktree_name(sandbox_id))
    }

    /// Returns true if `path` is inside a git repository.
    pub async fn is_git_repository(path: &Path) -> bool {
        match Command::new("git")
            .arg("-C")
            .arg(path)
            .args(["rev-parse", "--git-dir"])
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn configure_identity(&self, dir: &Path) -> Result<()> {
        git_checked(dir, &["config", "user.email", &self.identity.user_email]).await?;
        git_checked(dir, &["config", "user.name", &self.identity.user_name]).await?;
        Ok(())
    }

    /// Initializes the base repository if it is not under version control.
    ///
    /// Existing contents are committed; an empty commit is made otherwise so
    /// worktrees always have a HEAD to detach from.
    pub async fn ensure_base_repository(&self) -> Result<()> {
        if Self::is_git_repository(&self.base_repo).await {
            return Ok(());
        }

        tracing::info!(path = ?self.base_repo, "base path is not a git repository, initializing");

        tokio::fs::create_dir_all(&self.base_repo)
            .await
            .map_err(|e| Error::Provisioning(format!("failed to create base repository: {}", e)))?;
        git_checked(&self.base_repo, &["init"]).await?;
        self.configure_identity(&self.base_repo).await?;

        let add = git(&self.base_repo, &["add", "-A"]).await?;
        if !add.status.success() {
            tracing::warn!(path = ?self.base_repo, "git add failed while bootstrapping base repository");
        }
        let commit = git(
            &self.base_repo,
            &["commit", "-m", "Initial commit", "--allow-empty"],
        )
        .await?;
        if !commit.status.success() {
            tracing::warn!(
                path = ?self.base_repo,
                stderr = %String::from_utf8_lossy(&commit.stderr).trim(),
                "initial commit failed while bootstrapping base repository"
            );
        }

        Ok(())
    }

    /// Creates a fresh detached worktree for `sandbox_id`.
    ///
    /// A stale worktree left by a previous crash is removed first.
    pub async fn create_workspace(&self, sandbox_id: &str) -> Result<PathBuf> {
        validate_sandbox_id(sandbox_id)?;
        let _guard = self.git_lock.lock().await;
        self.ensure_base_repository().await?;

        tokio::fs::create_dir_all(&self.worktree_base)
            .await
            .map_err(|e| {
                Error::Provisioning(format!(
                    "failed to create worktree base {}: {}",
                    self.worktree_base.display(),
                    e
                ))
            })?;

        let path = self.worktree_path(sandbox_id);
        if path.exists() {
            tracing::warn!(path = ?path, "worktree already exists, removing");
            self.remove_unlocked(&path).await;
        }
        // Forget worktrees whose directories vanished, or re-adding the path fails
        let _ = git(&self.base_repo, &["worktree", "prune"]).await;

        let path_arg = path.to_string_lossy().to_string();
        git_checked(&self.base_repo, &["worktree", "add", "--detach", &path_arg]).await?;

        if let Err(e) = self.configure_identity(&path).await {
            self.remove_unlocked(&path).await;
            return Err(e);
        }

        tracing::info!(sandbox_id = %sandbox_id, path = ?path, "created sandbox worktree");
        Ok(path)
    }

    /// Removes a worktree. Best-effort and idempotent.
    ///
    /// A failing `git worktree remove` is logged, then the directory is
    /// force-deleted if it is still there.
    pub async fn remove_workspace(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        let _guard = self.git_lock.lock().await;
        self.remove_unlocked(path).await;
    }

    async fn remove_unlocked(&self, path: &Path) {
        if !path.exists() {
            return;
        }

        let path_arg = path.to_string_lossy().to_string();
        match git(&self.base_repo, &["worktree", "remove", "--force", &path_arg]).await {
            Ok(output) if !output.status.success() => {
                tracing::warn!(
                    path = ?path,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "git worktree remove failed, deleting directory"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(path = ?path, error = %e, "could not run git worktree remove"),
        }

        if path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                tracing::warn!(path = ?path, error = %e, "failed to delete worktree directory");
            }
        }
        let _ = git(&self.base_repo, &["worktree", "prune"]).await;

        tracing::info!(path = ?path, "removed sandbox worktree");
    }

    /// Lists worktrees registered with the base repository.
    pub async fn list_worktrees(&self) -> Result<Vec<PathBuf>> {
        let output = git_checked(&self.base_repo, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Removes the worktree for `sandbox_id` without a coordinator.
    ///
    /// The worktree is located by name in the base repository's worktree list,
    /// falling back to the conventional path.
    /// Ids that could never have been provisioned are ignored.
    pub async fn remove_by_sandbox_id(&self, sandbox_id: &str) {
        if validate_sandbox_id(sandbox_id).is_err() {
            tracing::debug!(sandbox_id = %sandbox_id, "not a valid sandbox id, nothing to remove");
            return;
        }
        let name = worktree_name(sandbox_id);
        let registered = match self.list_worktrees().await {
            Ok(paths) => paths
                .into_iter()
                .find(|p| p.file_name().is_some_and(|n| n.to_string_lossy() == name)),
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox_id, error = %e, "failed to list worktrees");
                None
            }
        };

        let path = registered.unwrap_or_else(|| self.worktree_path(sandbox_id));
        self.remove_workspace(&path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    /// Helper to create a temp git repo for testing.
    fn create_temp_git_repo() -> TempDir {
        let temp_dir = TempDir::new().expect("failed to create temp dir");

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            StdCommand::new("git")
                .args(&args)
                .current_dir(temp_dir.path())
                .output()
                .expect("failed to configure git repo");
        }

        std::fs::write(temp_dir.path().join("README.md"), "# Test Repo\n")
            .expect("failed to write README");

        StdCommand::new("git")
            .args(["add", "."])
            .current_dir(temp_dir.path())
            .output()
            .expect("failed to add files");

        StdCommand::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(temp_dir.path())
            .output()
            .expect("failed to create initial commit");

        temp_dir
    }

    fn provisioner(repo: &Path, base: &Path) -> WorktreeProvisioner {
        WorktreeProvisioner::new(repo.to_path_buf(), base.to_path_buf(), GitIdentity::default())
    }

    #[test]
    fn worktree_name_keeps_valid_id_verbatim() {
        assert_eq!(worktree_name("abc-123"), "sandbox-worktree-abc-123");
        assert_eq!(worktree_name("A_b"), "sandbox-worktree-A_b");
        assert!(validate_sandbox_id("abc-123").is_ok());
        assert!(validate_sandbox_id("0f8e2c1a-9b7d-4e6f-a1b2-c3d4e5f60718").is_ok());
    }

    #[test]
    fn ids_that_would_collide_are_rejected() {
        for bad in ["a/b", "a b", "a.b", "../x", "", "tab\there", "ümlaut"] {
            assert!(
                matches!(validate_sandbox_id(bad), Err(Error::InvalidSandboxId(_))),
                "{:?} should be rejected",
                bad
            );
        }
        let long = "x".repeat(MAX_SANDBOX_ID_LEN + 1);
        assert!(validate_sandbox_id(&long).is_err());
        assert!(validate_sandbox_id(&"x".repeat(MAX_SANDBOX_ID_LEN)).is_ok());
    }

    #[tokio::test]
    async fn invalid_id_is_never_provisioned() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let err = provisioner.create_workspace("a/b").await.unwrap_err();
        assert!(matches!(err, Error::InvalidSandboxId(_)));
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn removing_by_similar_id_leaves_other_workspace() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let path = provisioner.create_workspace("a-b").await.unwrap();
        provisioner.remove_by_sandbox_id("a/b").await;
        provisioner.remove_by_sandbox_id("a b").await;
        provisioner.remove_by_sandbox_id("a_b").await;

        assert!(path.join("README.md").exists());
        provisioner.remove_workspace(&path).await;
    }

    #[tokio::test]
    async fn concurrent_workspaces_share_one_repository() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let (a, b, c) = tokio::join!(
            provisioner.create_workspace("c1"),
            provisioner.create_workspace("c2"),
            provisioner.create_workspace("c3"),
        );
        let paths = [a.unwrap(), b.unwrap(), c.unwrap()];
        for path in &paths {
            assert!(path.join("README.md").exists());
        }

        let (_, _, _) = tokio::join!(
            provisioner.remove_workspace(&paths[0]),
            provisioner.remove_workspace(&paths[1]),
            provisioner.remove_workspace(&paths[2]),
        );
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn parses_porcelain_worktree_list() {
        let porcelain = "worktree /srv/repo\nHEAD abc\nbranch refs/heads/main\n\n\
                         worktree /tmp/sandbox-worktree-s1\nHEAD abc\ndetached\n";
        let paths = parse_worktree_list(porcelain);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/srv/repo"),
                PathBuf::from("/tmp/sandbox-worktree-s1")
            ]
        );
    }

    #[tokio::test]
    async fn creates_and_removes_workspace() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let path = provisioner.create_workspace("s1").await.expect("create failed");

        assert_eq!(path, base.path().join("sandbox-worktree-s1"));
        assert!(path.join("README.md").exists());

        provisioner.remove_workspace(&path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn workspace_changes_stay_isolated() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let a = provisioner.create_workspace("a").await.unwrap();
        let b = provisioner.create_workspace("b").await.unwrap();

        std::fs::write(a.join("only-in-a.txt"), "a").unwrap();
        assert!(!b.join("only-in-a.txt").exists());
        assert!(!repo.path().join("only-in-a.txt").exists());

        provisioner.remove_workspace(&a).await;
        provisioner.remove_workspace(&b).await;
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let path = provisioner.create_workspace("twice").await.unwrap();
        provisioner.remove_workspace(&path).await;
        provisioner.remove_workspace(&path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_workspace_is_replaced() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let path = provisioner.create_workspace("stale").await.unwrap();
        std::fs::write(path.join("leftover.txt"), "old").unwrap();

        let again = provisioner.create_workspace("stale").await.unwrap();
        assert_eq!(path, again);
        assert!(!again.join("leftover.txt").exists());
        assert!(again.join("README.md").exists());

        provisioner.remove_workspace(&again).await;
    }

    #[tokio::test]
    async fn manually_deleted_workspace_can_be_recreated() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let path = provisioner.create_workspace("gone").await.unwrap();
        std::fs::remove_dir_all(&path).unwrap();

        let again = provisioner.create_workspace("gone").await.unwrap();
        assert!(again.join("README.md").exists());
        provisioner.remove_workspace(&again).await;
    }

    #[tokio::test]
    async fn bootstraps_plain_directory_as_base_repository() {
        let plain = TempDir::new().unwrap();
        std::fs::write(plain.path().join("seed.txt"), "seed").unwrap();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(plain.path(), base.path());

        assert!(!WorktreeProvisioner::is_git_repository(plain.path()).await);

        let path = provisioner.create_workspace("boot").await.expect("create failed");

        assert!(WorktreeProvisioner::is_git_repository(plain.path()).await);
        assert!(path.join("seed.txt").exists());
        provisioner.remove_workspace(&path).await;
    }

    #[tokio::test]
    async fn bootstraps_empty_directory_with_empty_commit() {
        let empty = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(empty.path(), base.path());

        let path = provisioner.create_workspace("empty").await.expect("create failed");
        assert!(path.exists());
        provisioner.remove_workspace(&path).await;
    }

    #[tokio::test]
    async fn unusable_base_path_fails_with_provisioning_error() {
        let dir = TempDir::new().unwrap();
        let not_a_dir = dir.path().join("file.txt");
        std::fs::write(&not_a_dir, "plain file").unwrap();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(&not_a_dir, base.path());

        let err = provisioner.create_workspace("broken").await.unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
        assert!(!provisioner.worktree_path("broken").exists());
    }

    #[tokio::test]
    async fn remove_by_sandbox_id_finds_registered_worktree() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provisioner = provisioner(repo.path(), base.path());

        let path = provisioner.create_workspace("orphan").await.unwrap();
        let listed = provisioner.list_worktrees().await.unwrap();
        assert!(listed.iter().any(|p| p.ends_with("sandbox-worktree-orphan")));

        provisioner.remove_by_sandbox_id("orphan").await;
        assert!(!path.exists());
        let listed = provisioner.list_worktrees().await.unwrap();
        assert!(!listed.iter().any(|p| p.ends_with("sandbox-worktree-orphan")));
    }
}
