pub mod registrar;
pub mod webhook;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use ghw_core::{config::GitHubConfig, error::DeployError, util::tail};
use reqwest::{
    Client, Response,
    header::{ACCEPT, AUTHORIZATION},
};
use serde::{Deserialize, Serialize};
use url::Url;

/// The remote platform repositories are fetched from and webhooks are
/// registered with.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Download the gzipped tarball snapshot of `branch`.
    async fn fetch_tarball(&self, owner: &str, repo: &str, branch: &str)
    -> Result<Bytes, DeployError>;

    /// Subscribe this server to push events for `owner/repo`.
    async fn create_push_webhook(&self, owner: &str, repo: &str) -> Result<(), DeployError>;
}

#[derive(Clone)]
pub struct GitHub {
    client: Client,
    api_url: Url,
    token: String,
    webhook_url: Url,
    webhook_secret: String,
}

#[derive(Serialize)]
struct CreateHook<'a> {
    name: &'static str,
    active: bool,
    events: &'static [&'static str],
    config: CreateHookConfig<'a>,
}

#[derive(Serialize)]
struct CreateHookConfig<'a> {
    url: &'a str,
    content_type: &'static str,
    secret: &'a str,
    insecure_ssl: &'static str,
}

#[derive(Deserialize)]
struct User {
    login: String,
}

impl GitHub {
    pub fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let client = Client::builder()
            .user_agent(concat!("ghw/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create GitHub client")?;
        Ok(Arc::new(Self {
            client,
            api_url: config.api_url.clone(),
            token: config.token.clone(),
            webhook_url: config.webhook_url.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url.as_str().trim_end_matches('/'), path)
    }

    /// Login of the account the API token belongs to.
    pub async fn current_user(&self) -> Result<String> {
        let user: User = self
            .client
            .get(self.endpoint("user"))
            .header(ACCEPT, "application/vnd.github+json")
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse user")?;
        Ok(user.login)
    }
}

async fn describe_failure(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("{status}: {}", tail(&body, 512))
}

#[async_trait]
impl SourceHost for GitHub {
    async fn fetch_tarball(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Bytes, DeployError> {
        let url = self.endpoint(&format!("repos/{owner}/{repo}/tarball/{branch}"));
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(ACCEPT, "application/vnd.github.v3+json")
            .send()
            .await
            .map_err(|e| DeployError::Fetch(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(DeployError::Fetch(describe_failure(response).await));
        }
        response.bytes().await.map_err(|e| DeployError::Fetch(format!("reading {url}: {e}")))
    }

    async fn create_push_webhook(&self, owner: &str, repo: &str) -> Result<(), DeployError> {
        let url = self.endpoint(&format!("repos/{owner}/{repo}/hooks"));
        let body = CreateHook {
            name: "web",
            active: true,
            events: &["push"],
            config: CreateHookConfig {
                url: self.webhook_url.as_str(),
                content_type: "json",
                secret: &self.webhook_secret,
                insecure_ssl: "0",
            },
        };
        let response = self
            .client
            .post(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeployError::Registration(format!("POST {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(DeployError::Registration(describe_failure(response).await));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github(api_url: &str) -> Arc<GitHub> {
        GitHub::new(&GitHubConfig {
            token: "t".into(),
            webhook_secret: "s".into(),
            webhook_url: Url::parse("https://ghw.example.dev").unwrap(),
            api_url: Url::parse(api_url).unwrap(),
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            github("https://api.github.com").endpoint("repos/a/b/hooks"),
            "https://api.github.com/repos/a/b/hooks"
        );
        assert_eq!(
            github("https://ghe.example.com/api/v3/").endpoint("repos/a/b/tarball/main"),
            "https://ghe.example.com/api/v3/repos/a/b/tarball/main"
        );
    }

    #[test]
    fn test_create_hook_body() {
        let body = serde_json::to_value(CreateHook {
            name: "web",
            active: true,
            events: &["push"],
            config: CreateHookConfig {
                url: "https://ghw.example.dev/",
                content_type: "json",
                secret: "s",
                insecure_ssl: "0",
            },
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "name": "web",
                "active": true,
                "events": ["push"],
                "config": {
                    "url": "https://ghw.example.dev/",
                    "content_type": "json",
                    "secret": "s",
                    "insecure_ssl": "0",
                },
            })
        );
    }
}
