//! In-memory stand-ins for the source host and the command runner.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use ghw_core::error::DeployError;
use ghw_github::SourceHost;

use crate::command::{CommandRunner, Invocation, Output};

#[derive(Default)]
pub struct FakeSourceHost {
    pub fail_fetch: AtomicBool,
    pub fail_registration: AtomicBool,
    fetches: Mutex<Vec<String>>,
    registrations: Mutex<Vec<String>>,
}

impl FakeSourceHost {
    /// `owner/repo@branch` for every tarball request.
    pub fn fetches(&self) -> Vec<String> { self.fetches.lock().unwrap().clone() }

    /// `owner/repo` for every webhook registration request.
    pub fn registrations(&self) -> Vec<String> { self.registrations.lock().unwrap().clone() }
}

#[async_trait]
impl SourceHost for FakeSourceHost {
    async fn fetch_tarball(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Bytes, DeployError> {
        self.fetches.lock().unwrap().push(format!("{owner}/{repo}@{branch}"));
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(DeployError::Fetch("404 Not Found".into()));
        }
        Ok(Bytes::from_static(b"\x1f\x8bfake tarball"))
    }

    async fn create_push_webhook(&self, owner: &str, repo: &str) -> Result<(), DeployError> {
        self.registrations.lock().unwrap().push(format!("{owner}/{repo}"));
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(DeployError::Registration("422 Unprocessable Entity".into()));
        }
        Ok(())
    }
}

/// Records invocations instead of spawning them. Everything exits 0 unless
/// configured with [`RecordingRunner::fail_on`].
#[derive(Default)]
pub struct RecordingRunner {
    invocations: Mutex<Vec<Invocation>>,
    failures: Mutex<Vec<(String, Option<String>)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingRunner {
    /// Each invocation takes `delay` to complete.
    pub fn with_delay(delay: Duration) -> Self { Self { delay: Some(delay), ..Default::default() } }

    /// Exit non-zero for `program`, optionally only when its first argument
    /// is `first_arg`.
    pub fn fail_on(&self, program: &str, first_arg: Option<&str>) {
        self.failures.lock().unwrap().push((program.to_string(), first_arg.map(str::to_string)));
    }

    pub fn invocations(&self) -> Vec<Invocation> { self.invocations.lock().unwrap().clone() }

    /// Rendered command lines, in invocation order.
    pub fn commands(&self) -> Vec<String> {
        self.invocations().iter().map(ToString::to_string).collect()
    }

    pub fn programs(&self) -> Vec<String> {
        self.invocations().into_iter().map(|i| i.program).collect()
    }

    /// Highest number of invocations that were running at the same time.
    pub fn max_in_flight(&self) -> usize { self.max_in_flight.load(Ordering::SeqCst) }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<Output> {
        self.invocations.lock().unwrap().push(invocation.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let failed = self.failures.lock().unwrap().iter().any(|(program, arg)| {
            *program == invocation.program
                && arg.as_deref().is_none_or(|a| invocation.args.first().map(String::as_str) == Some(a))
        });
        Ok(Output {
            code: Some(if failed { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if failed { format!("{} failed", invocation.program) } else { String::new() },
        })
    }
}
