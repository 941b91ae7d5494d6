use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use ghw_core::error::DeployError;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use crate::command::{CommandRunner, Invocation, Step, execute};

/// Appends site blocks to the Caddyfile and reloads Caddy.
pub struct ProxyConfigWriter {
    caddyfile: PathBuf,
    runner: Arc<dyn CommandRunner>,
    lock: Mutex<()>,
}

impl ProxyConfigWriter {
    pub fn new(caddyfile: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { caddyfile: caddyfile.into(), runner, lock: Mutex::new(()) }
    }

    /// Append `block` and reload, holding the writer lock throughout. An empty
    /// block leaves the proxy untouched.
    pub async fn apply(&self, block: &str) -> Result<(), DeployError> {
        if block.trim().is_empty() {
            tracing::info!("No Caddy config provided, skipping proxy update");
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        self.append(block).await?;
        self.reload().await
    }

    /// Append `block` verbatim, separated from existing content by a newline.
    pub async fn append(&self, block: &str) -> Result<(), DeployError> {
        let io_err = |e: std::io::Error| {
            DeployError::ProxyConfig(format!("appending to {}: {e}", self.caddyfile.display()))
        };
        let needs_separator = match fs::read(&self.caddyfile).await {
            Ok(existing) => existing.last().is_some_and(|&b| b != b'\n'),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(io_err(e)),
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.caddyfile)
            .await
            .map_err(io_err)?;
        if needs_separator {
            file.write_all(b"\n").await.map_err(io_err)?;
        }
        file.write_all(block.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        tracing::info!("Caddyfile appended");
        Ok(())
    }

    /// Format, validate, then reload. Reload never runs against a config that
    /// failed validation.
    pub async fn reload(&self) -> Result<(), DeployError> {
        let path = self.caddyfile.to_string_lossy();
        let path = &*path;
        let steps = [
            (Step::ProxyFormat, Invocation::new("caddy").args(["fmt", "--overwrite", path])),
            (Step::ProxyValidate, Invocation::new("caddy").args(["validate", "--config", path])),
            (Step::ProxyReload, Invocation::new("caddy").args(["reload", "--config", path])),
        ];
        for (step, invocation) in &steps {
            execute(self.runner.as_ref(), *step, invocation).await?;
        }
        tracing::info!("Caddy reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    fn writer(dir: &tempfile::TempDir) -> (Arc<RecordingRunner>, ProxyConfigWriter) {
        let runner = Arc::new(RecordingRunner::default());
        (runner.clone(), ProxyConfigWriter::new(dir.path().join("Caddyfile"), runner))
    }

    #[tokio::test]
    async fn test_append_creates_and_separates() {
        let dir = tempfile::tempdir().unwrap();
        let (_, writer) = writer(&dir);
        writer.append("a.example.dev {\n\treverse_proxy :3001\n}").await.unwrap();
        writer.append("b.example.dev {\n\treverse_proxy :3002\n}\n").await.unwrap();
        let contents = std::fs::read_to_string(dir.path().join("Caddyfile")).unwrap();
        assert_eq!(
            contents,
            "a.example.dev {\n\treverse_proxy :3001\n}\nb.example.dev {\n\treverse_proxy :3002\n}\n"
        );
    }

    #[tokio::test]
    async fn test_reload_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, writer) = writer(&dir);
        writer.reload().await.unwrap();
        let path = dir.path().join("Caddyfile");
        assert_eq!(runner.commands(), vec![
            format!("caddy fmt --overwrite {}", path.display()),
            format!("caddy validate --config {}", path.display()),
            format!("caddy reload --config {}", path.display()),
        ]);
    }

    #[tokio::test]
    async fn test_validate_failure_prevents_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, writer) = writer(&dir);
        runner.fail_on("caddy", Some("validate"));
        let err = writer.apply("x {\n}\n").await.unwrap_err();
        assert!(matches!(err, DeployError::ProxyConfig(_)));
        let args: Vec<_> = runner.invocations().into_iter().map(|i| i.args[0].clone()).collect();
        assert_eq!(args, vec!["fmt", "validate"]);
    }

    #[tokio::test]
    async fn test_format_failure_prevents_validate_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, writer) = writer(&dir);
        runner.fail_on("caddy", Some("fmt"));
        let err = writer.apply("x {\n}\n").await.unwrap_err();
        assert!(matches!(err, DeployError::ProxyConfig(_)));
        let args: Vec<_> = runner.invocations().into_iter().map(|i| i.args[0].clone()).collect();
        assert_eq!(args, vec!["fmt"]);
    }

    #[tokio::test]
    async fn test_empty_block_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, writer) = writer(&dir);
        writer.apply("  \n").await.unwrap();
        assert!(runner.invocations().is_empty());
        assert!(!dir.path().join("Caddyfile").exists());
    }
}
