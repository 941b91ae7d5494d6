use anyhow::{Result, bail};
use argp::FromArgs;
use ghw_auth::AdminSigner;
use typed_path::Utf8NativePathBuf;

use crate::util::native_path;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Generate an administrator P-256 keypair.
#[argp(subcommand, name = "keygen")]
pub struct Args {
    #[argp(
        option,
        from_str_fn(native_path),
        default = "Utf8NativePathBuf::from(\"public_key.bin\")"
    )]
    /// raw public key output, read by the server (default: public_key.bin)
    public: Utf8NativePathBuf,
    #[argp(
        option,
        from_str_fn(native_path),
        default = "Utf8NativePathBuf::from(\"private_key.bin\")"
    )]
    /// PKCS#8 private key output, used by `sign` (default: private_key.bin)
    private: Utf8NativePathBuf,
    #[argp(switch, short = 'f')]
    /// overwrite existing key files
    force: bool,
}

pub fn run(args: Args) -> Result<()> {
    for path in [&args.public, &args.private] {
        if !args.force && std::path::Path::exists(path.with_platform_encoding().as_ref()) {
            bail!("{} already exists, pass --force to overwrite", path);
        }
    }
    let signer = AdminSigner::generate()?;
    std::fs::write(args.private.with_platform_encoding(), signer.to_pkcs8_der()?)?;
    std::fs::write(args.public.with_platform_encoding(), signer.public_key().to_sec1_bytes())?;
    tracing::info!("Keys generated and saved to {} and {}", args.public, args.private);
    Ok(())
}
