use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use ghw_core::{
    error::DeployError,
    models::{RepoKey, RepositoryConfig},
    util::join_normalized,
};
use ghw_github::SourceHost;
use tokio::{
    fs,
    sync::{Mutex, OwnedMutexGuard},
};

use crate::command::{CommandRunner, Invocation, Step, execute};

/// Fetches, extracts, builds and (re)starts one repository.
pub struct Pipeline {
    host: Arc<dyn SourceHost>,
    runner: Arc<dyn CommandRunner>,
    repo_dir: PathBuf,
    locks: RepoLocks,
}

/// One async mutex per repository. The working directory and the pm2
/// process name are shared by every branch, so the key omits the branch.
#[derive(Default)]
struct RepoLocks {
    locks: Mutex<HashMap<RepoKey, Arc<Mutex<()>>>>,
}

impl RepoLocks {
    async fn lock(&self, key: RepoKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Only the map references an idle lock; holders and waiters own a clone.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Exclusive access to one repository's working directory and pm2 process.
pub struct RepoGuard {
    key: RepoKey,
    _guard: OwnedMutexGuard<()>,
}

impl Pipeline {
    pub fn new(
        host: Arc<dyn SourceHost>,
        runner: Arc<dyn CommandRunner>,
        repo_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { host, runner, repo_dir: repo_dir.into(), locks: RepoLocks::default() }
    }

    /// Directory `owner/repo` is extracted into.
    pub fn target_dir(&self, owner: &str, repo: &str) -> PathBuf {
        join_normalized(&self.repo_dir, Path::new(owner).join(repo))
    }

    /// Wait for exclusive access to `owner/repo`. [`Pipeline::run`] takes
    /// this itself; callers that must do more under the same lock hold it
    /// and use [`Pipeline::run_locked`].
    pub async fn lock(&self, owner: &str, repo: &str) -> RepoGuard {
        let key = RepoKey::new(owner, repo);
        let guard = self.locks.lock(key.clone()).await;
        tracing::debug!("Acquired deployment lock for {key}");
        RepoGuard { key, _guard: guard }
    }

    /// Deploy `branch` of `owner_slash_repo`. Steps run strictly in order and
    /// the first failure aborts the run.
    pub async fn run(
        &self,
        owner_slash_repo: &str,
        branch: &str,
        config: &RepositoryConfig,
        already_deployed: bool,
    ) -> Result<(), DeployError> {
        let (owner, repo) = parse_full_name(owner_slash_repo)?;
        let tarball = self.fetch(owner_slash_repo, branch).await?;
        let guard = self.lock(owner, repo).await;
        self.install(&guard, owner_slash_repo, branch, config, already_deployed, tarball).await
    }

    /// [`Pipeline::run`] for a caller already holding the repository's lock.
    pub async fn run_locked(
        &self,
        guard: &RepoGuard,
        owner_slash_repo: &str,
        branch: &str,
        config: &RepositoryConfig,
        already_deployed: bool,
    ) -> Result<(), DeployError> {
        let tarball = self.fetch(owner_slash_repo, branch).await?;
        self.install(guard, owner_slash_repo, branch, config, already_deployed, tarball).await
    }

    async fn fetch(&self, owner_slash_repo: &str, branch: &str) -> Result<Bytes, DeployError> {
        let (owner, repo) = parse_full_name(owner_slash_repo)?;
        tracing::info!("Downloading {owner_slash_repo}@{branch}");
        self.host.fetch_tarball(owner, repo, branch).await
    }

    async fn install(
        &self,
        guard: &RepoGuard,
        owner_slash_repo: &str,
        branch: &str,
        config: &RepositoryConfig,
        already_deployed: bool,
        tarball: Bytes,
    ) -> Result<(), DeployError> {
        let (owner, repo) = parse_full_name(owner_slash_repo)?;
        if RepoKey::new(owner, repo) != guard.key {
            return Err(DeployError::Fetch(format!(
                "{owner_slash_repo} deployed under the lock for {}",
                guard.key
            )));
        }

        let target = self.target_dir(owner, repo);
        fs::create_dir_all(&target)
            .await
            .map_err(|e| DeployError::Fetch(format!("creating {}: {e}", target.display())))?;
        let archive = archive_path(&target);
        fs::write(&archive, &tarball)
            .await
            .map_err(|e| DeployError::Fetch(format!("writing {}: {e}", archive.display())))?;

        tracing::info!("Extracting {owner_slash_repo} to {}", target.display());
        let extract = Invocation::new("tar")
            .arg("-xzf")
            .arg(archive.to_string_lossy())
            .arg("-C")
            .arg(target.to_string_lossy())
            .args(["--strip-components", "1"]);
        execute(self.runner.as_ref(), Step::Extract, &extract).await?;
        fs::remove_file(&archive)
            .await
            .map_err(|e| DeployError::Extraction(format!("removing {}: {e}", archive.display())))?;
        tracing::info!("Extracted {owner_slash_repo}, deleted tar archive");

        if !config.build_command.trim().is_empty() {
            if config.needs_install {
                let manager = if config.is_bun { "bun" } else { "npm" };
                let install = Invocation::new(manager).arg("install").current_dir(&target);
                execute(self.runner.as_ref(), Step::Install, &install).await?;
                tracing::info!("{manager} install complete");
            }
            let build =
                Invocation::new("sh").arg("-c").arg(&config.build_command).current_dir(&target);
            execute(self.runner.as_ref(), Step::Build, &build).await?;
            tracing::info!("Build completed");
        }

        if !config.pm2_command.trim().is_empty() {
            if already_deployed {
                tracing::info!("{} already deployed in pm2, restarting", config.name);
                let restart = Invocation::new("pm2").arg("restart").arg(&config.name);
                execute(self.runner.as_ref(), Step::Restart, &restart).await?;
            } else {
                let start = Invocation::new("pm2")
                    .args(config.pm2_command.split_whitespace())
                    .arg("--name")
                    .arg(&config.name)
                    .current_dir(&target);
                execute(self.runner.as_ref(), Step::Start, &start).await?;
            }
        }

        tracing::info!("Repository {owner_slash_repo}@{branch} updated successfully");
        Ok(())
    }
}

fn parse_full_name(owner_slash_repo: &str) -> Result<(&str, &str), DeployError> {
    RepoKey::parse(owner_slash_repo)
        .ok_or_else(|| DeployError::Fetch(format!("invalid repository name {owner_slash_repo:?}")))
}

/// `{target}.tar.gz`, next to the target directory.
fn archive_path(target: &Path) -> PathBuf {
    let mut path = OsString::from(target.as_os_str());
    path.push(".tar.gz");
    PathBuf::from(path)
}
