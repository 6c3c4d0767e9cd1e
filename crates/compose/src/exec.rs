//! How commands actually run. The client only builds [`Invocation`]s; an [`Executor`]
//! turns them into processes, so tests can substitute an instrumented fake.

#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// One fully-specified command line. Built fresh for every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Fed to the process on stdin, then stdin is closed.
    pub stdin: Option<String>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        let mut s = self.program.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completed {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A running process: its stdout, and a future resolving once it exits
/// (with stderr captured). Dropping `wait` kills the process.
pub struct Spawned {
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub wait: BoxFuture<'static, io::Result<Completed>>,
}

#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Run to completion, capturing stdout and stderr.
    async fn output(&self, inv: &Invocation) -> io::Result<Completed>;

    /// Start a long-lived process whose stdout is consumed incrementally.
    fn spawn(&self, inv: &Invocation) -> io::Result<Spawned>;
}

/// Runs invocations as real subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    fn command(inv: &Invocation) -> Command {
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .envs(inv.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if inv.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn feed_stdin(child: &mut tokio::process::Child, inv: &Invocation) {
        if let (Some(mut w), Some(input)) = (child.stdin.take(), inv.stdin.clone()) {
            tokio::spawn(async move {
                if let Err(e) = w.write_all(input.as_bytes()).await {
                    debug!(error = %e, "writing compose stdin");
                }
                // dropping `w` closes stdin
            });
        }
    }
}

#[async_trait::async_trait]
impl Executor for ProcessExecutor {
    async fn output(&self, inv: &Invocation) -> io::Result<Completed> {
        let mut child = Self::command(inv).spawn()?;
        Self::feed_stdin(&mut child, inv);
        let out = child.wait_with_output().await?;
        Ok(Completed { code: out.status.code(), success: out.status.success(), stdout: out.stdout, stderr: out.stderr })
    }

    fn spawn(&self, inv: &Invocation) -> io::Result<Spawned> {
        let mut child = Self::command(inv).spawn()?;
        Self::feed_stdin(&mut child, inv);
        let stdout = child.stdout.take().ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdout not captured"))?;
        let mut stderr = child.stderr.take();
        let wait = async move {
            let mut err = Vec::new();
            if let Some(s) = stderr.as_mut() {
                s.read_to_end(&mut err).await?;
            }
            let status = child.wait().await?;
            Ok(Completed { code: status.code(), success: status.success(), stdout: Vec::new(), stderr: err })
        }
        .boxed();
        Ok(Spawned { stdout: Box::pin(stdout), wait })
    }
}
