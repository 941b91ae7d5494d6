use std::sync::Arc;

use ghw_core::error::DeployError;
use ghw_db::Database;

use crate::SourceHost;

/// Makes sure exactly one push webhook exists per repository.
#[derive(Clone)]
pub struct Registrar {
    db: Arc<Database>,
    host: Arc<dyn SourceHost>,
}

impl Registrar {
    pub fn new(db: Arc<Database>, host: Arc<dyn SourceHost>) -> Self { Self { db, host } }

    /// Register a push webhook for `owner/name` unless one is already
    /// recorded. Returns whether a registration call was made.
    ///
    /// The record is only written after the platform accepts the hook, so a
    /// failed registration is retried by the next request for the repository.
    pub async fn ensure(&self, owner: &str, name: &str) -> Result<bool, DeployError> {
        if self.db.has_webhook(owner, name).await? {
            tracing::info!("{owner}/{name} already has an active webhook");
            return Ok(false);
        }
        if let Err(e) = self.host.create_push_webhook(owner, name).await {
            tracing::error!("Webhook creation failed for {owner}/{name}: {e}");
            return Err(e);
        }
        self.db.record_webhook(owner, name).await?;
        tracing::info!("Webhook created for {owner}/{name}");
        Ok(true)
    }
}
