use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drydock_compose::{
    Completed, ComposeError, CmdComposeClient, DockerComposeClient, Executor, Invocation, Spawned,
};
use drydock_core::{ComposeProjectSpec, ComposeService};
use futures::FutureExt;

type SpawnFn = Box<dyn Fn(&Invocation) -> io::Result<Spawned> + Send + Sync>;

const VERBS: &[&str] = &["up", "down", "rm", "build", "logs", "events", "config", "ps", "version"];

fn verb_of(inv: &Invocation) -> &'static str {
    inv.args.iter().find_map(|a| VERBS.iter().copied().find(|v| *v == a.as_str())).unwrap_or("?")
}

struct FakeExec {
    delay: Duration,
    calls: Mutex<Vec<Invocation>>,
    responses: Mutex<HashMap<&'static str, Completed>>,
    active: AtomicUsize,
    active_mutating: AtomicUsize,
    max_active: AtomicUsize,
    violations: AtomicUsize,
    spawn_fn: SpawnFn,
}

impl FakeExec {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            active_mutating: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            spawn_fn: Box::new(|_| Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))),
        }
    }

    fn with_spawn(mut self, f: impl Fn(&Invocation) -> io::Result<Spawned> + Send + Sync + 'static) -> Self {
        self.spawn_fn = Box::new(f);
        self
    }

    fn respond(self, verb: &'static str, c: Completed) -> Self {
        self.responses.lock().unwrap().insert(verb, c);
        self
    }
}

fn ok(stdout: &str) -> Completed {
    Completed { code: Some(0), success: true, stdout: stdout.as_bytes().to_vec(), stderr: Vec::new() }
}

fn failed(code: i32, stderr: &str) -> Completed {
    Completed { code: Some(code), success: false, stdout: Vec::new(), stderr: stderr.as_bytes().to_vec() }
}

#[async_trait::async_trait]
impl Executor for FakeExec {
    async fn output(&self, inv: &Invocation) -> io::Result<Completed> {
        let verb = verb_of(inv);
        let mutating = matches!(verb, "up" | "down" | "rm");
        if mutating && self.active.load(Ordering::SeqCst) > 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        if self.active_mutating.load(Ordering::SeqCst) > 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if mutating {
            self.active_mutating.fetch_add(1, Ordering::SeqCst);
        }

        tokio::time::sleep(self.delay).await;

        if mutating {
            self.active_mutating.fetch_sub(1, Ordering::SeqCst);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(inv.clone());
        Ok(self.responses.lock().unwrap().get(verb).cloned().unwrap_or_else(|| ok("")))
    }

    fn spawn(&self, inv: &Invocation) -> io::Result<Spawned> {
        self.calls.lock().unwrap().push(inv.clone());
        (self.spawn_fn)(inv)
    }
}

fn project() -> ComposeProjectSpec {
    ComposeProjectSpec { name: "shop".into(), config_paths: vec!["docker-compose.yml".into()], ..Default::default() }
}

fn service(name: &str) -> ComposeService { ComposeService { project: project(), service: name.into() } }

fn client(exec: FakeExec) -> Arc<CmdComposeClient<FakeExec>> {
    Arc::new(CmdComposeClient::with_executor(exec, PathBuf::from("docker-compose"), Vec::new()))
}

fn finished_stream(stdout: &'static [u8], exit: Completed) -> Spawned {
    Spawned {
        stdout: Box::pin(std::io::Cursor::new(stdout.to_vec())),
        wait: futures::future::ready(Ok(exit)).boxed(),
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) { self.0.store(true, Ordering::SeqCst); }
}

#[tokio::test]
async fn mutating_commands_never_overlap_anything() {
    let c = client(FakeExec::new(Duration::from_millis(10)));
    let mut tasks = Vec::new();
    for i in 0..3 {
        let c = c.clone();
        tasks.push(tokio::spawn(async move { c.container_id(&service(&format!("read{i}"))).await.map(|_| ()) }));
    }
    for i in 0..3 {
        let c = c.clone();
        tasks.push(tokio::spawn(async move { c.up(&service(&format!("svc{i}")), false).await.map(|_| ()) }));
    }
    {
        let c = c.clone();
        tasks.push(tokio::spawn(async move { c.down(&project()).await.map(|_| ()) }));
    }
    for i in 0..3 {
        let c = c.clone();
        tasks.push(tokio::spawn(async move { c.project(&service(&format!("late{i}")).project).await.map(|_| ()) }));
    }
    for t in futures::future::join_all(tasks).await {
        t.expect("join").expect("command");
    }

    let exec = c.executor();
    assert_eq!(exec.violations.load(Ordering::SeqCst), 0);
    assert_eq!(exec.calls.lock().unwrap().len(), 10);
    assert!(exec.max_active.load(Ordering::SeqCst) >= 2, "reads should share the guard");
}

#[tokio::test]
async fn up_builds_then_starts_and_skips_no_build_on_v2() {
    let c = client(FakeExec::new(Duration::ZERO).respond("version", ok("Docker Compose version v2.3.3\n")));

    c.up(&service("web"), true).await.expect("up v1");
    let v = c.version().await.expect("version");
    assert_eq!(v.canonical, "v2.3.3");
    assert_eq!(c.cached_version().map(|v| v.canonical), Some("v2.3.3".to_string()));
    c.up(&service("web"), false).await.expect("up v2");

    let calls: Vec<Vec<String>> = c.executor().calls.lock().unwrap().iter().map(|i| i.args.clone()).collect();
    let base = ["--project-name", "shop", "-f", "docker-compose.yml"];
    let expect = |tail: &[&str]| -> Vec<String> { base.iter().chain(tail).map(|s| s.to_string()).collect() };
    assert_eq!(calls[0], expect(&["build", "web"]));
    assert_eq!(calls[1], expect(&["up", "--no-deps", "--no-build", "-d", "web"]));
    assert_eq!(calls[2], vec!["version".to_string()]);
    assert_eq!(calls[3], expect(&["up", "--no-deps", "-d", "web"]));
}

#[tokio::test]
async fn failed_command_carries_output() {
    let c = client(FakeExec::new(Duration::ZERO).respond("rm", failed(2, "no such service: api")));
    let err = c.rm(&[service("api"), service("db")]).await.expect_err("rm fails");
    match &err {
        ComposeError::Exec { command, code, stderr, .. } => {
            assert!(command.ends_with("rm --stop --force api db"), "{command}");
            assert_eq!(*code, Some(2));
            assert_eq!(stderr, "no such service: api");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.to_string().contains("exit status: 2"));
}

#[tokio::test]
async fn rm_with_no_services_runs_nothing() {
    let c = client(FakeExec::new(Duration::ZERO));
    c.rm(&[]).await.expect("noop");
    assert!(c.executor().calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn inline_yaml_goes_to_stdin() {
    let c = client(FakeExec::new(Duration::ZERO).respond("ps", ok("abc123\n")));
    let mut svc = service("web");
    svc.project.yaml = "services:\n  web:\n    image: nginx\n".into();
    let id = c.container_id(&svc).await.expect("ps");
    assert_eq!(id, "abc123");
    let calls = c.executor().calls.lock().unwrap().clone();
    assert_eq!(calls[0].stdin.as_deref(), Some("services:\n  web:\n    image: nginx\n"));
    assert_eq!(calls[0].args, vec!["--project-name", "shop", "-f", "-", "-f", "docker-compose.yml", "ps", "-q", "web"]);
}

#[tokio::test]
async fn unparseable_version_is_parse_error() {
    let c = client(FakeExec::new(Duration::ZERO).respond("version", ok("something else entirely")));
    let err = c.version().await.expect_err("parse");
    assert!(err.is_parse_error());
    assert!(c.cached_version().is_none());
}

#[tokio::test]
async fn log_stream_ends_with_exit_error() {
    let exec = FakeExec::new(Duration::ZERO)
        .with_spawn(|_| Ok(finished_stream(b"line1\nline2\n", failed(1, "service \"web\" is not running"))));
    let c = client(exec);
    let mut h = c.stream_logs(&service("web"));

    let mut data = Vec::new();
    let mut terminal = None;
    while let Some(item) = h.rx.recv().await {
        match item {
            Ok(b) => data.extend_from_slice(&b),
            Err(e) => terminal = Some(e),
        }
    }
    assert_eq!(data, b"line1\nline2\n");
    match terminal {
        Some(ComposeError::Exec { code, stderr, .. }) => {
            assert_eq!(code, Some(1));
            assert!(stderr.contains("not running"));
        }
        other => panic!("expected exit error, got {other:?}"),
    }
    let args = &c.executor().calls.lock().unwrap()[0].args;
    assert!(args.ends_with(&[
        "logs".to_string(),
        "--no-color".to_string(),
        "--no-log-prefix".to_string(),
        "--timestamps".to_string(),
        "--follow".to_string(),
        "web".to_string(),
    ]));
}

#[tokio::test]
async fn event_stream_yields_lines_and_closes_cleanly() {
    let exec = FakeExec::new(Duration::ZERO).with_spawn(|_| {
        Ok(finished_stream(
            b"{\"service\":\"web\",\"action\":\"start\"}\n{\"service\":\"db\",\"action\":\"die\"}\n",
            ok(""),
        ))
    });
    let c = client(exec);
    let mut h = c.stream_events(&project());
    let mut lines = Vec::new();
    while let Some(item) = h.rx.recv().await {
        lines.push(item.expect("no error on clean exit"));
    }
    assert_eq!(lines, vec![r#"{"service":"web","action":"start"}"#, r#"{"service":"db","action":"die"}"#]);
}

#[tokio::test]
async fn stream_spawn_failure_is_first_item() {
    let c = client(FakeExec::new(Duration::ZERO));
    let mut h = c.stream_events(&project());
    match h.rx.recv().await {
        Some(Err(ComposeError::Spawn { command, .. })) => assert!(command.contains("events --json")),
        other => panic!("expected spawn error, got {other:?}"),
    }
    assert!(h.rx.recv().await.is_none());
}

#[tokio::test]
async fn cancel_kills_stream_and_guard_is_not_held() {
    let killed = Arc::new(AtomicBool::new(false));
    let flag = killed.clone();
    let (_writer, reader) = tokio::io::duplex(64);
    let reader = Mutex::new(Some(reader));
    let exec = FakeExec::new(Duration::ZERO).with_spawn(move |_| {
        let stdout = reader.lock().unwrap().take().expect("spawned once");
        let guard = DropFlag(flag.clone());
        let wait = async move {
            let _guard = guard;
            futures::future::pending::<io::Result<Completed>>().await
        }
        .boxed();
        Ok(Spawned { stdout: Box::pin(stdout), wait })
    });
    let c = client(exec);
    let mut h = c.stream_logs(&service("web"));

    // A long-lived stream must not starve mutating commands.
    tokio::time::timeout(Duration::from_secs(5), c.up(&service("web"), false))
        .await
        .expect("up not blocked by stream")
        .expect("up");

    h.cancel.cancel();
    assert!(h.rx.recv().await.is_none());
    assert!(killed.load(Ordering::SeqCst));
}
