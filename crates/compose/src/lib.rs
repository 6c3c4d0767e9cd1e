//! drydock compose: drive the `docker-compose` CLI.
//!
//! Compose keeps its network and container bookkeeping outside any transaction, so two
//! concurrent `up`s against the same project race on network creation. Every command
//! therefore goes through one reader/writer guard: verbs that mutate project state hold it
//! exclusively, everything else shares it. Streaming verbs hold it only while the process
//! is being started.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

use bytes::Bytes;
use drydock_core::stream::queue_cap;
use drydock_core::{CancelHandle, ComposeProjectSpec, ComposeService, StreamHandle};
use futures::{Future, StreamExt};
use metrics::{counter, histogram};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod error;
pub mod exec;
pub mod project;
pub mod version;

pub use error::ComposeError;
pub use exec::{Completed, Executor, Invocation, ProcessExecutor, Spawned};
pub use project::{parse_project, Project, ServiceConfig};
pub use version::{parse_version_output, ComposeVersion};

/// Environment override for the compose executable.
pub const COMPOSE_CMD_ENV: &str = "DRYDOCK_DOCKER_COMPOSE_CMD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Up,
    Down,
    Rm,
    Build,
    Logs,
    Events,
    Config,
    Ps,
    Version,
}

impl Verb {
    /// Verbs that need the guard exclusively. Opt-in: a verb not listed here runs shared.
    pub fn is_mutating(self) -> bool { matches!(self, Verb::Up | Verb::Down | Verb::Rm) }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Up => "up",
            Verb::Down => "down",
            Verb::Rm => "rm",
            Verb::Build => "build",
            Verb::Logs => "logs",
            Verb::Events => "events",
            Verb::Config => "config",
            Verb::Ps => "ps",
            Verb::Version => "version",
        }
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn append(&mut self, c: &Completed) {
        self.stdout.push_str(&String::from_utf8_lossy(&c.stdout));
        self.stderr.push_str(&String::from_utf8_lossy(&c.stderr));
    }
}

#[async_trait::async_trait]
pub trait DockerComposeClient: Send + Sync {
    /// Optionally build, then start one service detached without its dependencies.
    async fn up(&self, spec: &ComposeService, should_build: bool) -> Result<CommandOutput, ComposeError>;
    async fn down(&self, project: &ComposeProjectSpec) -> Result<CommandOutput, ComposeError>;
    /// Stop and remove the given services' containers. All specs must share a project.
    async fn rm(&self, specs: &[ComposeService]) -> Result<CommandOutput, ComposeError>;
    /// Follow a service's logs. Returns immediately; a failed exit arrives as the final item.
    fn stream_logs(&self, spec: &ComposeService) -> StreamHandle<Result<Bytes, ComposeError>>;
    /// Follow project events as JSON lines. Returns immediately; a failed exit arrives as the final item.
    fn stream_events(&self, project: &ComposeProjectSpec) -> StreamHandle<Result<String, ComposeError>>;
    async fn project(&self, project: &ComposeProjectSpec) -> Result<Project, ComposeError>;
    async fn container_id(&self, spec: &ComposeService) -> Result<String, ComposeError>;
    async fn version(&self) -> Result<ComposeVersion, ComposeError>;
}

/// Compose client that shells out through an [`Executor`].
pub struct CmdComposeClient<E: Executor = ProcessExecutor> {
    exec: Arc<E>,
    compose_path: PathBuf,
    env: Vec<(String, String)>,
    guard: Arc<RwLock<()>>,
    version: StdRwLock<Option<ComposeVersion>>,
}

impl CmdComposeClient<ProcessExecutor> {
    pub fn new(env: Vec<(String, String)>) -> Self { Self::with_executor(ProcessExecutor, compose_executable_path(), env) }
}

impl<E: Executor> CmdComposeClient<E> {
    pub fn with_executor(exec: E, compose_path: PathBuf, env: Vec<(String, String)>) -> Self {
        Self { exec: Arc::new(exec), compose_path, env, guard: Arc::new(RwLock::new(())), version: StdRwLock::new(None) }
    }

    pub fn compose_path(&self) -> &PathBuf { &self.compose_path }

    pub fn executor(&self) -> &E { &self.exec }

    /// The version seen by the last successful [`DockerComposeClient::version`] call.
    pub fn cached_version(&self) -> Option<ComposeVersion> {
        self.version.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn is_v2_or_newer(&self) -> bool { self.cached_version().map(|v| v.is_v2_or_newer()).unwrap_or(false) }

    fn invocation(&self, args: Vec<String>, project: Option<&ComposeProjectSpec>) -> Invocation {
        let stdin = project.filter(|p| !p.yaml.is_empty()).map(|p| p.yaml.clone());
        Invocation { program: self.compose_path.clone(), args, stdin, env: self.env.clone() }
    }

    /// Run one command to completion under the guard. Nonzero exit is an error.
    async fn run(&self, verb: Verb, inv: Invocation) -> Result<Completed, ComposeError> {
        let command = inv.command_line();
        debug!(verb = verb.as_str(), %command, "compose command");
        let t0 = Instant::now();
        let res = guarded(&self.guard, verb, self.exec.output(&inv)).await;
        let ms = t0.elapsed().as_millis() as f64;
        histogram!("compose_command_ms", ms, "verb" => verb.as_str());
        let completed = res.map_err(|source| {
            counter!("compose_commands", 1, "verb" => verb.as_str(), "result" => "spawn_error");
            ComposeError::Spawn { command: command.clone(), source }
        })?;
        if !completed.success {
            counter!("compose_commands", 1, "verb" => verb.as_str(), "result" => "error");
            warn!(verb = verb.as_str(), code = ?completed.code, "compose command failed");
            return Err(ComposeError::exited(command, &completed));
        }
        counter!("compose_commands", 1, "verb" => verb.as_str(), "result" => "ok");
        Ok(completed)
    }

    fn stream<T, P, Fut>(&self, verb: Verb, inv: Invocation, pump: P) -> StreamHandle<Result<T, ComposeError>>
    where
        T: Send + 'static,
        P: FnOnce(Pin<Box<dyn AsyncRead + Send>>, mpsc::Sender<Result<T, ComposeError>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_cap());
        let cancel = CancelHandle::new();
        let token = cancel.token();
        let exec = self.exec.clone();
        let guard = self.guard.clone();
        tokio::spawn(run_stream(exec, guard, verb, inv, tx, token, pump));
        StreamHandle::new(rx, cancel)
    }
}

/// Hold the guard in the mode `verb` requires for the duration of `fut`.
async fn guarded<F: Future>(guard: &RwLock<()>, verb: Verb, fut: F) -> F::Output {
    if verb.is_mutating() {
        let _w = guard.write().await;
        fut.await
    } else {
        let _r = guard.read().await;
        fut.await
    }
}

async fn run_stream<E, T, P, Fut>(
    exec: Arc<E>,
    guard: Arc<RwLock<()>>,
    verb: Verb,
    inv: Invocation,
    tx: mpsc::Sender<Result<T, ComposeError>>,
    token: CancellationToken,
    pump: P,
) where
    E: Executor,
    T: Send + 'static,
    P: FnOnce(Pin<Box<dyn AsyncRead + Send>>, mpsc::Sender<Result<T, ComposeError>>) -> Fut,
    Fut: Future<Output = ()>,
{
    let command = inv.command_line();
    counter!("compose_commands", 1, "verb" => verb.as_str(), "result" => "started");
    let spawned = guarded(&guard, verb, async { exec.spawn(&inv) }).await;
    let Spawned { stdout, wait } = match spawned {
        Ok(s) => s,
        Err(source) => {
            let _ = tx.send(Err(ComposeError::Spawn { command, source })).await;
            return;
        }
    };
    debug!(verb = verb.as_str(), %command, "compose stream started");

    let pump = pump(stdout, tx.clone());
    let done = tokio::select! {
        _ = token.cancelled() => None,
        _ = tx.closed() => None,
        (_, done) = async { tokio::join!(pump, wait) } => Some(done),
    };
    match done {
        None => debug!(verb = verb.as_str(), "compose stream stopped"),
        Some(Ok(c)) if c.success => debug!(verb = verb.as_str(), "compose stream exited"),
        Some(Ok(c)) => {
            let _ = tx.send(Err(ComposeError::exited(command, &c))).await;
        }
        Some(Err(source)) => {
            let _ = tx.send(Err(ComposeError::Spawn { command, source })).await;
        }
    }
}

async fn pump_bytes(stdout: Pin<Box<dyn AsyncRead + Send>>, tx: mpsc::Sender<Result<Bytes, ComposeError>>) {
    let mut chunks = ReaderStream::new(stdout);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(b) => {
                if tx.send(Ok(b)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "compose stdout read");
                break;
            }
        }
    }
}

async fn pump_lines(stdout: Pin<Box<dyn AsyncRead + Send>>, tx: mpsc::Sender<Result<String, ComposeError>>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(Ok(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "compose stdout read");
                break;
            }
        }
    }
}

/// Arguments selecting the project: name, directory, env file, then config sources.
/// Inline YAML is read from stdin (`-f -`) and comes first; config paths follow it in order.
pub fn project_args(p: &ComposeProjectSpec) -> Vec<String> {
    let mut args = Vec::new();
    if !p.name.is_empty() {
        args.push("--project-name".to_string());
        args.push(p.name.clone());
    }
    if let Some(dir) = &p.project_path {
        args.push("--project-directory".to_string());
        args.push(dir.display().to_string());
    }
    if let Some(env) = &p.env_file {
        args.push("--env-file".to_string());
        args.push(env.display().to_string());
    }
    if !p.yaml.is_empty() {
        args.push("-f".to_string());
        args.push("-".to_string());
    }
    for path in &p.config_paths {
        args.push("-f".to_string());
        args.push(path.display().to_string());
    }
    args
}

fn verbose_args(mut args: Vec<String>) -> Vec<String> {
    if tracing::enabled!(tracing::Level::DEBUG) {
        args.push("--verbose".to_string());
    }
    args
}

fn with<I: IntoIterator<Item = S>, S: Into<String>>(mut base: Vec<String>, extra: I) -> Vec<String> {
    base.extend(extra.into_iter().map(Into::into));
    base
}

#[async_trait::async_trait]
impl<E: Executor> DockerComposeClient for CmdComposeClient<E> {
    async fn up(&self, spec: &ComposeService, should_build: bool) -> Result<CommandOutput, ComposeError> {
        let general = verbose_args(project_args(&spec.project));
        let mut out = CommandOutput::default();
        if should_build {
            let args = with(general.clone(), ["build", spec.service.as_str()]);
            let c = self.run(Verb::Build, self.invocation(args, Some(&spec.project))).await?;
            out.append(&c);
        }
        // Images are already built (above, or by drydock); v1 would otherwise rebuild on up.
        let mut args = with(general, ["up", "--no-deps"]);
        if !self.is_v2_or_newer() {
            args.push("--no-build".to_string());
        }
        args = with(args, ["-d", spec.service.as_str()]);
        let c = self.run(Verb::Up, self.invocation(args, Some(&spec.project))).await?;
        out.append(&c);
        info!(project = %spec.project.name, service = %spec.service, built = should_build, "compose service up");
        Ok(out)
    }

    async fn down(&self, project: &ComposeProjectSpec) -> Result<CommandOutput, ComposeError> {
        let args = with(verbose_args(project_args(project)), ["down"]);
        let c = self.run(Verb::Down, self.invocation(args, Some(project))).await?;
        let mut out = CommandOutput::default();
        out.append(&c);
        info!(project = %project.name, "compose project down");
        Ok(out)
    }

    async fn rm(&self, specs: &[ComposeService]) -> Result<CommandOutput, ComposeError> {
        let Some(first) = specs.first() else { return Ok(CommandOutput::default()) };
        let project = &first.project;
        let mut args = with(verbose_args(project_args(project)), ["rm", "--stop", "--force"]);
        args.extend(specs.iter().map(|s| s.service.clone()));
        let c = self.run(Verb::Rm, self.invocation(args, Some(project))).await?;
        let mut out = CommandOutput::default();
        out.append(&c);
        info!(project = %project.name, services = specs.len(), "compose services removed");
        Ok(out)
    }

    fn stream_logs(&self, spec: &ComposeService) -> StreamHandle<Result<Bytes, ComposeError>> {
        let args = with(
            project_args(&spec.project),
            ["logs", "--no-color", "--no-log-prefix", "--timestamps", "--follow", spec.service.as_str()],
        );
        let inv = self.invocation(args, Some(&spec.project));
        self.stream(Verb::Logs, inv, pump_bytes)
    }

    fn stream_events(&self, project: &ComposeProjectSpec) -> StreamHandle<Result<String, ComposeError>> {
        let args = with(project_args(project), ["events", "--json"]);
        let inv = self.invocation(args, Some(project));
        self.stream(Verb::Events, inv, pump_lines)
    }

    async fn project(&self, project: &ComposeProjectSpec) -> Result<Project, ComposeError> {
        let args = with(project_args(project), ["config"]);
        let c = self.run(Verb::Config, self.invocation(args, Some(project))).await?;
        parse_project(&String::from_utf8_lossy(&c.stdout), &project.name)
    }

    async fn container_id(&self, spec: &ComposeService) -> Result<String, ComposeError> {
        let args = with(project_args(&spec.project), ["ps", "-q", spec.service.as_str()]);
        let c = self.run(Verb::Ps, self.invocation(args, Some(&spec.project))).await?;
        Ok(String::from_utf8_lossy(&c.stdout).trim().to_string())
    }

    async fn version(&self) -> Result<ComposeVersion, ComposeError> {
        let c = self.run(Verb::Version, self.invocation(vec!["version".to_string()], None)).await?;
        let v = parse_version_output(&c.stdout)?;
        *self.version.write().unwrap_or_else(|p| p.into_inner()) = Some(v.clone());
        Ok(v)
    }
}

/// `DRYDOCK_DOCKER_COMPOSE_CMD` if set, else `docker-compose` from `PATH`,
/// else the bare name (the spawn error then names it).
pub fn compose_executable_path() -> PathBuf {
    if let Some(cmd) = std::env::var_os(COMPOSE_CMD_ENV).filter(|s| !s.is_empty()) {
        return PathBuf::from(cmd);
    }
    let exe = if cfg!(windows) { "docker-compose.exe" } else { "docker-compose" };
    std::env::var_os("PATH")
        .and_then(|paths| std::env::split_paths(&paths).map(|dir| dir.join(exe)).find(|p| p.is_file()))
        .unwrap_or_else(|| PathBuf::from(exe))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ComposeProjectSpec {
        ComposeProjectSpec {
            name: "shop".into(),
            project_path: Some("/src/shop".into()),
            config_paths: vec!["a.yml".into(), "b.yml".into()],
            yaml: String::new(),
            env_file: Some("/src/shop/.env".into()),
        }
    }

    #[test]
    fn project_args_with_paths() {
        assert_eq!(
            project_args(&spec()),
            vec![
                "--project-name",
                "shop",
                "--project-directory",
                "/src/shop",
                "--env-file",
                "/src/shop/.env",
                "-f",
                "a.yml",
                "-f",
                "b.yml"
            ]
        );
    }

    #[test]
    fn inline_yaml_reads_stdin() {
        let mut p = spec();
        p.yaml = "services: {}".into();
        p.project_path = None;
        p.env_file = None;
        p.config_paths = vec!["docker-compose.yml".into(), "override.yml".into()];
        assert_eq!(
            project_args(&p),
            vec!["--project-name", "shop", "-f", "-", "-f", "docker-compose.yml", "-f", "override.yml"]
        );
    }

    #[test]
    fn only_up_down_rm_are_exclusive() {
        let mutating: Vec<Verb> = [
            Verb::Up,
            Verb::Down,
            Verb::Rm,
            Verb::Build,
            Verb::Logs,
            Verb::Events,
            Verb::Config,
            Verb::Ps,
            Verb::Version,
        ]
        .into_iter()
        .filter(|v| v.is_mutating())
        .collect();
        assert_eq!(mutating, vec![Verb::Up, Verb::Down, Verb::Rm]);
    }

    #[test]
    fn env_override_wins() {
        std::env::set_var(COMPOSE_CMD_ENV, "/opt/bin/my-compose");
        assert_eq!(compose_executable_path(), PathBuf::from("/opt/bin/my-compose"));
        std::env::remove_var(COMPOSE_CMD_ENV);
    }
}
