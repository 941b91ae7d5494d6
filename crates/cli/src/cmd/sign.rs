use anyhow::{Context, Result};
use argp::FromArgs;
use ghw_auth::{AdminSigner, SignedCommand};
use ghw_core::models::RepositoryConfig;
use typed_path::Utf8NativePathBuf;

use crate::util::{native_path, read_file, write_output};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Sign a repository config, printing the request body to POST.
#[argp(subcommand, name = "sign")]
pub struct Args {
    #[argp(option, short = 'k', from_str_fn(native_path))]
    /// PKCS#8 private key (DER or PEM)
    key: Utf8NativePathBuf,
    #[argp(option, short = 'c', from_str_fn(native_path))]
    /// repository config JSON
    config: Utf8NativePathBuf,
    #[argp(switch)]
    /// restart the existing pm2 process instead of starting it
    already_deployed: bool,
    #[argp(option, short = 'o', from_str_fn(native_path))]
    /// write the request body to output file
    output: Option<Utf8NativePathBuf>,
}

pub fn run(args: Args) -> Result<()> {
    let key = read_file(&args.key)?;
    let config = read_file(&args.config)?;
    let command = sign(&key, &config, args.already_deployed)
        .with_context(|| format!("Failed to sign {}", args.config))?;
    write_output(args.output.as_ref(), &serde_json::to_string_pretty(&command)?)
}

fn sign(key: &[u8], config: &[u8], already_deployed: bool) -> Result<SignedCommand> {
    let signer = AdminSigner::from_pkcs8(key).context("Failed to parse private key")?;
    let mut config: RepositoryConfig =
        serde_json::from_slice(config).context("Failed to parse repository config")?;
    config.validate()?;
    config.already_deployed |= already_deployed;
    signer.sign_config(&config)
}
