use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub github: GitHubConfig,
    pub deploy: DeployConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Upper bound on a single request, including the deployment it triggers.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 { 900 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: String,
    /// Shared secret used both to verify push deliveries and to sign the
    /// webhooks this server registers.
    pub webhook_secret: String,
    /// Public address GitHub should deliver push events to.
    pub webhook_url: Url,
    #[serde(default = "default_api_url")]
    pub api_url: Url,
}

fn default_api_url() -> Url {
    Url::parse("https://api.github.com").expect("default API URL is valid")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeployConfig {
    /// Root directory repositories are extracted under, as `{owner}/{repo}`.
    pub repo_dir: PathBuf,
    /// Administrator public key (raw SEC1 point or PEM).
    pub public_key: PathBuf,
    pub caddyfile: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "server": { "port": 3000 },
            "db": { "url": "sqlite://githubWatcher.sqlite" },
            "github": {
                "token": "ghp_x",
                "webhook_secret": "s3cret",
                "webhook_url": "https://ghw.example.dev",
            },
            "deploy": {
                "repo_dir": "/srv/repos",
                "public_key": "public_key.bin",
                "caddyfile": "/etc/caddy/Caddyfile",
            },
        }))
        .unwrap();
        assert_eq!(config.server.request_timeout_secs, 900);
        assert_eq!(config.github.api_url.as_str(), "https://api.github.com/");
        assert_eq!(config.deploy.repo_dir, PathBuf::from("/srv/repos"));
    }
}
