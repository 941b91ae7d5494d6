use ghw_core::error::DeployError;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";

fn mac(secret: &str) -> Hmac<Sha256> {
    Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}

/// Verify an `X-Hub-Signature-256` value (`sha256=<hex>`) against the raw body.
/// The digest comparison is constant-time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> Result<(), DeployError> {
    let signature_sha256 = header.trim().strip_prefix("sha256=").ok_or_else(|| {
        tracing::warn!("{SIGNATURE_HEADER} sha256= prefix missing");
        DeployError::Authentication
    })?;
    let signature = hex::decode(signature_sha256).map_err(|_| {
        tracing::warn!("{SIGNATURE_HEADER} malformed");
        DeployError::Authentication
    })?;
    let mut mac = mac(secret);
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| {
        tracing::warn!("{SIGNATURE_HEADER} signature mismatch");
        DeployError::Authentication
    })
}

/// Compute the `X-Hub-Signature-256` value GitHub would send for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = mac(secret);
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: PushRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub full_name: String,
}

impl PushEvent {
    /// The pushed branch, or `None` for tag pushes.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/").filter(|b| !b.is_empty())
    }
}

/// A verified delivery, classified by its `X-GitHub-Event` kind.
#[derive(Debug, Clone)]
pub enum Delivery {
    Push(PushEvent),
    /// Anything else, e.g. the `ping` sent right after a hook is created.
    Other(String),
}

impl Delivery {
    /// A missing event header is treated as a push.
    pub fn parse(kind: Option<&str>, body: &[u8]) -> serde_json::Result<Self> {
        match kind {
            None | Some("push") => serde_json::from_slice(body).map(Self::Push),
            Some(other) => Ok(Self::Other(other.to_string())),
        }
    }
}
