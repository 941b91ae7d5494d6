use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use ghw_core::{error::DeployError, util::tail};

/// An external tool invocation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), cwd: None }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Output {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool { self.code == Some(0) }
}

/// Spawns an external tool and waits for it to exit.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<Output>;
}

/// Runs invocations as child processes of the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<Output> {
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        let output = command.output().await?;
        Ok(Output {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Which stage an invocation belongs to; selects the error class on failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Step {
    Extract,
    Install,
    Build,
    Start,
    Restart,
    ProxyFormat,
    ProxyValidate,
    ProxyReload,
}

impl Step {
    fn error(self, detail: String) -> DeployError {
        match self {
            Self::Extract => DeployError::Extraction(detail),
            Self::Install => DeployError::Install(detail),
            Self::Build => DeployError::Build(detail),
            Self::Start | Self::Restart => DeployError::ProcessLifecycle(detail),
            Self::ProxyFormat | Self::ProxyValidate | Self::ProxyReload => {
                DeployError::ProxyConfig(detail)
            }
        }
    }
}

const OUTPUT_TAIL: usize = 2048;

/// Run one invocation to completion, mapping a spawn failure or non-zero exit
/// to the error class of `step`.
pub async fn execute(
    runner: &dyn CommandRunner,
    step: Step,
    invocation: &Invocation,
) -> Result<Output, DeployError> {
    tracing::info!(?step, "Running `{invocation}`");
    let output = runner
        .run(invocation)
        .await
        .map_err(|e| step.error(format!("failed to spawn `{invocation}`: {e}")))?;
    if !output.stdout.is_empty() {
        tracing::debug!(?step, "stdout:\n{}", tail(&output.stdout, OUTPUT_TAIL));
    }
    if !output.stderr.is_empty() {
        tracing::debug!(?step, "stderr:\n{}", tail(&output.stderr, OUTPUT_TAIL));
    }
    if !output.success() {
        let code = output.code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
        let stderr = tail(&output.stderr, OUTPUT_TAIL);
        return Err(step.error(if stderr.is_empty() {
            format!("`{invocation}` exited with {code}")
        } else {
            format!("`{invocation}` exited with {code}: {stderr}")
        }));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let invocation = Invocation::new("tar").args(["-xzf", "a.tar.gz"]).arg("-C").arg("a");
        assert_eq!(invocation.to_string(), "tar -xzf a.tar.gz -C a");
    }

    #[tokio::test]
    async fn test_process_runner_success() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("sh").args(["-c", "pwd; echo oops >&2"]).current_dir(&dir);
        let output = execute(&ProcessRunner, Step::Build, &invocation).await.unwrap();
        assert!(output.success());
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(output.stdout.trim(), cwd.to_str().unwrap());
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_non_zero_exit_maps_to_step_error() {
        let invocation = Invocation::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = execute(&ProcessRunner, Step::Install, &invocation).await.unwrap_err();
        let DeployError::Install(detail) = err else { panic!("expected an install error") };
        assert!(detail.contains("code 3"), "{detail}");
        assert!(detail.contains("broken"), "{detail}");

        let err = execute(&ProcessRunner, Step::ProxyValidate, &Invocation::new("false"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ProxyConfig(_)));
    }

    #[tokio::test]
    async fn test_spawn_failure_maps_to_step_error() {
        let invocation = Invocation::new("/nonexistent/ghw-test-binary");
        let err = execute(&ProcessRunner, Step::Restart, &invocation).await.unwrap_err();
        assert!(matches!(err, DeployError::ProcessLifecycle(_)));
    }
}
