//! Administrator command authentication.
//!
//! Commands are JSON strings signed with ECDSA over P-256 / SHA-256. The
//! server holds only the public key; administrators sign with the matching
//! PKCS#8 private key (see `ghw-cli sign`).

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ghw_core::{error::DeployError, models::RepositoryConfig};
use p256::{
    ecdsa::{
        Signature, SigningKey, VerifyingKey,
        signature::{Signer, Verifier},
    },
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey},
};
use rand::{TryRngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};

/// The administrator request body: a JSON-encoded [`RepositoryConfig`] and a
/// hex signature over its exact bytes.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignedCommand {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub signature: String,
}

impl SignedCommand {
    pub fn is_complete(&self) -> bool { !self.data.is_empty() && !self.signature.is_empty() }
}

#[derive(Clone)]
pub struct AdminKey {
    key: VerifyingKey,
}

impl AdminKey {
    /// Load the public key, either as a raw SEC1 point (the WebCrypto `raw`
    /// export) or a PEM SubjectPublicKeyInfo.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read public key {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("Failed to parse public key {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = if bytes.starts_with(b"-----BEGIN") {
            let pem = std::str::from_utf8(bytes).context("PEM key is not UTF-8")?;
            VerifyingKey::from_public_key_pem(pem).map_err(|e| anyhow!("{e}"))?
        } else {
            VerifyingKey::from_sec1_bytes(bytes).map_err(|e| anyhow!("{e}"))?
        };
        Ok(Self { key })
    }

    /// Uncompressed SEC1 point, the format [`AdminKey::load`] reads back.
    pub fn to_sec1_bytes(&self) -> Vec<u8> { self.key.to_encoded_point(false).as_bytes().to_vec() }

    /// Verify `signature_hex` (raw `r || s` or DER) over `data`.
    pub fn verify(&self, data: &str, signature_hex: &str) -> Result<(), DeployError> {
        let bytes = hex::decode(signature_hex.trim()).map_err(|_| DeployError::Authorization)?;
        let signature = Signature::from_slice(&bytes)
            .or_else(|_| Signature::from_der(&bytes))
            .map_err(|_| DeployError::Authorization)?;
        self.key.verify(data.as_bytes(), &signature).map_err(|_| DeployError::Authorization)
    }

    /// Verify a command and decode the configuration it carries.
    pub fn open(&self, command: &SignedCommand) -> Result<RepositoryConfig, CommandError> {
        if !command.is_complete() {
            return Err(CommandError::Incomplete);
        }
        self.verify(&command.data, &command.signature)?;
        let config: RepositoryConfig =
            serde_json::from_str(&command.data).map_err(|e| CommandError::Invalid(e.to_string()))?;
        config.validate().map_err(|e| CommandError::Invalid(e.to_string()))?;
        Ok(config)
    }
}

/// Why an administrator command was not accepted.
#[derive(Debug)]
pub enum CommandError {
    Incomplete,
    Unauthorized(DeployError),
    Invalid(String),
}

impl From<DeployError> for CommandError {
    fn from(value: DeployError) -> Self { Self::Unauthorized(value) }
}

pub struct AdminSigner {
    key: SigningKey,
}

impl AdminSigner {
    /// Load a PKCS#8 private key, DER (the WebCrypto `pkcs8` export) or PEM.
    pub fn from_pkcs8(bytes: &[u8]) -> Result<Self> {
        let key = if bytes.starts_with(b"-----BEGIN") {
            let pem = std::str::from_utf8(bytes).context("PEM key is not UTF-8")?;
            SigningKey::from_pkcs8_pem(pem).map_err(|e| anyhow!("{e}"))?
        } else {
            SigningKey::from_pkcs8_der(bytes).map_err(|e| anyhow!("{e}"))?
        };
        Ok(Self { key })
    }

    pub fn from_signing_key(key: SigningKey) -> Self { Self { key } }

    /// Fresh keypair from the OS random source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 32];
        loop {
            OsRng.try_fill_bytes(&mut bytes)?;
            // Rejects zero and values at or above the curve order.
            if let Ok(key) = SigningKey::from_slice(&bytes) {
                return Ok(Self { key });
            }
        }
    }

    /// PKCS#8 DER, the format [`AdminSigner::from_pkcs8`] reads back.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let document = self.key.to_pkcs8_der().map_err(|e| anyhow!("{e}"))?;
        Ok(document.as_bytes().to_vec())
    }

    pub fn public_key(&self) -> AdminKey { AdminKey { key: VerifyingKey::from(&self.key) } }

    /// Hex raw `r || s` signature over `data`.
    pub fn sign(&self, data: &str) -> String {
        let signature: Signature = self.key.sign(data.as_bytes());
        hex::encode(signature.to_bytes())
    }

    pub fn sign_config(&self, config: &RepositoryConfig) -> Result<SignedCommand> {
        let data = serde_json::to_string(config).context("Failed to serialize config")?;
        let signature = self.sign(&data);
        tracing::debug!("Signed command for {}@{}", config.full_name(), config.branch);
        Ok(SignedCommand { data, signature })
    }
}
