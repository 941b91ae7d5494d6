use anyhow::{Context, Result};
use typed_path::Utf8NativePathBuf;

// For argp::FromArgs
pub fn native_path(value: &str) -> Result<Utf8NativePathBuf, String> {
    Ok(Utf8NativePathBuf::from(value))
}

pub fn read_file(path: &Utf8NativePathBuf) -> Result<Vec<u8>> {
    std::fs::read(path.with_platform_encoding())
        .with_context(|| format!("Failed to read {}", path))
}

/// Write `contents` to `path`, or print it when no path is given.
pub fn write_output(path: Option<&Utf8NativePathBuf>, contents: &str) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path.with_platform_encoding(), contents)
            .with_context(|| format!("Failed to write output file '{}'", path)),
        None => {
            println!("{}", contents);
            Ok(())
        }
    }
}
