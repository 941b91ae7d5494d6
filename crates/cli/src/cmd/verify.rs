use anyhow::{Context, Result};
use argp::FromArgs;
use ghw_auth::{AdminKey, CommandError, SignedCommand};
use ghw_core::models::RepositoryConfig;
use typed_path::Utf8NativePathBuf;

use crate::util::{native_path, read_file};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Check a signed request body against the server's public key.
#[argp(subcommand, name = "verify")]
pub struct Args {
    #[argp(option, short = 'k', from_str_fn(native_path))]
    /// public key (raw SEC1 or PEM)
    key: Utf8NativePathBuf,
    #[argp(option, short = 'e', from_str_fn(native_path))]
    /// request body JSON, as printed by `sign`
    envelope: Utf8NativePathBuf,
}

pub fn run(args: Args) -> Result<()> {
    let key = read_file(&args.key)?;
    let envelope = read_file(&args.envelope)?;
    let config = verify(&key, &envelope)
        .with_context(|| format!("Failed to verify {}", args.envelope))?;
    println!("Valid command for {}@{}", config.full_name(), config.branch);
    Ok(())
}

fn verify(key: &[u8], envelope: &[u8]) -> Result<RepositoryConfig> {
    let key = AdminKey::from_bytes(key).context("Failed to parse public key")?;
    let command: SignedCommand =
        serde_json::from_slice(envelope).context("Failed to parse request body")?;
    key.open(&command).map_err(|e| match e {
        CommandError::Incomplete => anyhow::anyhow!("missing data or signature"),
        CommandError::Unauthorized(e) => e.into(),
        CommandError::Invalid(detail) => anyhow::anyhow!("invalid repository config: {detail}"),
    })
}

#[cfg(test)]
mod tests {
    use ghw_auth::AdminSigner;

    use super::*;

    #[test]
    fn test_verify_envelope() {
        let signer = AdminSigner::generate().unwrap();
        let key = signer.public_key().to_sec1_bytes();
        let config = RepositoryConfig {
            owner: "a".into(),
            name: "b".into(),
            branch: "main".into(),
            ..Default::default()
        };
        let envelope = serde_json::to_vec(&signer.sign_config(&config).unwrap()).unwrap();
        assert_eq!(verify(&key, &envelope).unwrap(), config);

        let other = AdminSigner::generate().unwrap().public_key().to_sec1_bytes();
        assert!(verify(&other, &envelope).is_err());
        assert!(verify(&key, br#"{"data":"{}"}"#).is_err());
    }
}
