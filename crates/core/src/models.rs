use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Deployment settings for one (owner, name, branch).
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    pub owner: String,
    pub name: String,
    pub branch: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub pm2_command: String,
    #[serde(default)]
    pub caddy_config: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub needs_install: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_bun: bool,
    /// Whether pm2 already manages this repository. Never persisted.
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "is_false")]
    pub already_deployed: bool,
}

fn is_false(value: &bool) -> bool { !*value }

/// Accepts `true`/`false` as well as the `0`/`1` integers older clients send.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where D: Deserializer<'de> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Null(()),
    }
    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Int(value) => Ok(value != 0),
        Flag::Null(()) => Ok(false),
    }
}

impl RepositoryConfig {
    /// `owner/name`, as used by the GitHub API.
    pub fn full_name(&self) -> String { format!("{}/{}", self.owner, self.name) }

    /// Reject identities that could escape the repository root once used as
    /// path components.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        for (field, value) in [("owner", &self.owner), ("name", &self.name), ("branch", &self.branch)]
        {
            if value.is_empty() {
                return Err(InvalidConfig { field, reason: "must not be empty" });
            }
        }
        for (field, value) in [("owner", &self.owner), ("name", &self.name)] {
            if value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
                return Err(InvalidConfig { field, reason: "must be a single path component" });
            }
        }
        // All three are interpolated into GitHub API paths unescaped.
        for (field, value) in [("owner", &self.owner), ("name", &self.name), ("branch", &self.branch)]
        {
            if value.chars().any(|c| c.is_whitespace() || c.is_control() || "#?%".contains(c)) {
                return Err(InvalidConfig {
                    field,
                    reason: "contains characters not allowed in a URL path",
                });
            }
        }
        if self.branch.split('/').any(|c| c == "..") {
            return Err(InvalidConfig { field: "branch", reason: "is not a valid branch name" });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InvalidConfig {
    pub field: &'static str,
    pub reason: &'static str,
}

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.reason)
    }
}

impl std::error::Error for InvalidConfig {}

/// Records that GitHub delivers push events for a repository to this server.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct WebhookRecord {
    pub owner: String,
    pub name: String,
}

/// Identifies a repository independent of branch.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RepoKey {
    pub owner: String,
    pub name: String,
}

impl RepoKey {
    pub fn new(owner: &str, name: &str) -> Self {
        Self { owner: owner.to_ascii_lowercase(), name: name.to_ascii_lowercase() }
    }

    /// Split a `owner/name` full name.
    pub fn parse(full_name: &str) -> Option<(&str, &str)> {
        let (owner, name) = full_name.split_once('/')?;
        (!owner.is_empty() && !name.is_empty() && !name.contains('/')).then_some((owner, name))
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}
