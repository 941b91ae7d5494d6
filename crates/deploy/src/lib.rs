pub mod command;
pub mod pipeline;
pub mod proxy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use anyhow::anyhow;
use ghw_core::{
    config::DeployConfig,
    error::DeployError,
    models::{RepoKey, RepositoryConfig},
};
use ghw_db::Database;
use ghw_github::{SourceHost, registrar::Registrar};

use crate::{command::CommandRunner, pipeline::Pipeline, proxy::ProxyConfigWriter};

/// Decides, per trigger, which of registration, pipeline and proxy update run.
pub struct Deployer {
    db: Arc<Database>,
    registrar: Registrar,
    pipeline: Pipeline,
    proxy: ProxyConfigWriter,
}

/// What an administrator submission did besides running the pipeline.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Submission {
    /// The repository had no webhook record, so one was registered and its
    /// proxy block appended.
    pub first_deployment: bool,
}

impl Deployer {
    pub fn new(
        db: Arc<Database>,
        host: Arc<dyn SourceHost>,
        runner: Arc<dyn CommandRunner>,
        config: &DeployConfig,
    ) -> Self {
        Self {
            registrar: Registrar::new(db.clone(), host.clone()),
            pipeline: Pipeline::new(host, runner.clone(), &config.repo_dir),
            proxy: ProxyConfigWriter::new(&config.caddyfile, runner),
            db,
        }
    }

    /// Handle a verified administrator submission.
    ///
    /// The config row is saved first. A repository without a webhook record
    /// gets a webhook registered before the pipeline runs and its proxy block
    /// applied only after the pipeline succeeds. The repository lock is held
    /// from the webhook check to the proxy reload, so overlapping first
    /// submissions register and append once.
    pub async fn submit(&self, request: RepositoryConfig) -> Result<Submission, DeployError> {
        tracing::info!("Setting up repo: {}. Branch: {}", request.full_name(), request.branch);
        self.db.upsert_repo_config(&request).await?;
        tracing::info!("Config saved");

        // Owner and name match case-insensitively; deploy under the stored
        // spelling so pushes find the same directory and pm2 process.
        let stored = self
            .db
            .get_repo_config(&request.owner, &request.name, &request.branch)
            .await?
            .ok_or_else(|| anyhow!("config for {} vanished after saving", request.full_name()))?;
        let config = RepositoryConfig { already_deployed: request.already_deployed, ..stored };

        let guard = self.pipeline.lock(&config.owner, &config.name).await;
        let first_deployment = !self.db.has_webhook(&config.owner, &config.name).await?;
        if first_deployment {
            self.registrar.ensure(&config.owner, &config.name).await?;
        } else {
            tracing::info!("Repo already has an active webhook");
        }

        self.pipeline
            .run_locked(&guard, &config.full_name(), &config.branch, &config, config.already_deployed)
            .await?;

        if first_deployment {
            self.proxy.apply(&config.caddy_config).await?;
        }
        Ok(Submission { first_deployment })
    }

    /// Handle a verified push to `branch` of `full_name`. The process is
    /// assumed to be running already, so pm2 restarts it.
    pub async fn redeploy(&self, full_name: &str, branch: &str) -> Result<(), DeployError> {
        let (owner, name) = RepoKey::parse(full_name).unwrap_or(("", full_name));
        let Some(config) = self.db.get_repo_config(owner, name, branch).await? else {
            return Err(DeployError::NotConfigured {
                owner: owner.to_string(),
                name: name.to_string(),
                branch: branch.to_string(),
            });
        };
        self.pipeline.run(&config.full_name(), branch, &config, true).await
    }
}
