use thiserror::Error;

/// Failure classes for authentication and deployment.
///
/// Pipeline variants carry the failing command (or I/O operation) and its
/// captured diagnostics, and abort the remainder of a run.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid webhook signature")]
    Authentication,
    #[error("invalid command signature")]
    Authorization,
    #[error("{owner}/{name}@{branch} is not configured for deployment")]
    NotConfigured { owner: String, name: String, branch: String },
    #[error("failed to fetch repository snapshot: {0}")]
    Fetch(String),
    #[error("failed to extract repository snapshot: {0}")]
    Extraction(String),
    #[error("dependency install failed: {0}")]
    Install(String),
    #[error("build failed: {0}")]
    Build(String),
    #[error("process supervisor command failed: {0}")]
    ProcessLifecycle(String),
    #[error("webhook registration failed: {0}")]
    Registration(String),
    #[error("proxy configuration failed: {0}")]
    ProxyConfig(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
