//! Newline-delimited JSON protocol spoken by external engine processes.
//!
//! A worker is spawned once and kept alive. Its first stdout line is the
//! ready signal; afterwards every request line `{"id", "op", "params"}` is
//! answered by exactly one line `{"id", "ok", "result" | "error"}`.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::render::{EngineError, EngineFactory, Fragment, MathEngine};
use crate::domain::formula::FormulaInput;
use crate::domain::options::EngineOptions;

const SOURCE: &str = "mathgate::infra::engines::worker";

/// Program plus fixed arguments used to launch a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[derive(Serialize)]
struct WorkerRequest<'a> {
    id: u64,
    op: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct WorkerReply {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

struct WorkerIo {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

/// Handle to one running worker process.
///
/// Calls are serialized on the I/O mutex, so a caller that stopped waiting
/// still consumes its own reply before the next request is written.
pub struct WorkerProcess {
    label: String,
    child: Mutex<Child>,
    io: Mutex<WorkerIo>,
    ready: AtomicBool,
    next_id: AtomicU64,
}

impl WorkerProcess {
    pub fn spawn(command: &WorkerCommand, extra_args: &[String]) -> Result<Self, EngineError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                EngineError::startup(format!("failed to spawn `{}`: {err}", command.program))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::startup("worker stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::startup("worker stdout is not piped"))?;

        info!(
            target = SOURCE,
            program = %command.program,
            args = ?extra_args,
            pid = child.id().unwrap_or_default(),
            "worker spawned"
        );

        Ok(Self {
            label: command.program.clone(),
            child: Mutex::new(child),
            io: Mutex::new(WorkerIo {
                stdin,
                lines: BufReader::new(stdout).lines(),
            }),
            ready: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    /// Wait for the ready line. Later calls return immediately.
    pub async fn wait_ready(&self) -> Result<(), EngineError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut io = self.io.lock().await;
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let line = read_line(&mut io, &self.label).await?;
        if let Ok(reply) = serde_json::from_str::<WorkerReply>(&line)
            && let Some(error) = reply.error
        {
            return Err(EngineError::startup(format!(
                "worker `{}` failed to start: {error}",
                self.label
            )));
        }

        self.ready.store(true, Ordering::Release);
        debug!(target = SOURCE, worker = %self.label, "worker ready");
        Ok(())
    }

    /// Send one request and wait for its reply.
    pub async fn call(&self, op: &str, params: Value) -> Result<Value, EngineError> {
        self.wait_ready().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&WorkerRequest {
            id,
            op,
            params: &params,
        })
        .map_err(|err| EngineError::protocol(format!("failed to encode request: {err}")))?;
        line.push('\n');

        let mut io = self.io.lock().await;
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| EngineError::disconnected(format!("write to `{}`: {err}", self.label)))?;
        io.stdin
            .flush()
            .await
            .map_err(|err| EngineError::disconnected(format!("flush `{}`: {err}", self.label)))?;

        loop {
            let raw = read_line(&mut io, &self.label).await?;
            let reply: WorkerReply = serde_json::from_str(&raw).map_err(|err| {
                EngineError::protocol(format!("malformed reply from `{}`: {err}", self.label))
            })?;
            match reply.id {
                Some(reply_id) if reply_id < id => {
                    warn!(
                        target = SOURCE,
                        worker = %self.label,
                        stale_id = reply_id,
                        expected_id = id,
                        "discarding stale worker reply"
                    );
                    continue;
                }
                Some(reply_id) if reply_id != id => {
                    return Err(EngineError::protocol(format!(
                        "reply id {reply_id} does not match request id {id}"
                    )));
                }
                _ => {}
            }
            return if reply.ok {
                Ok(reply.result)
            } else {
                Err(EngineError::render(
                    reply
                        .error
                        .unwrap_or_else(|| format!("`{op}` failed without a message")),
                ))
            };
        }
    }

    /// Kill the process. Safe to call more than once.
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        match child.kill().await {
            Ok(()) => info!(target = SOURCE, worker = %self.label, "worker stopped"),
            Err(err) => debug!(
                target = SOURCE,
                worker = %self.label,
                error = %err,
                "worker already exited"
            ),
        }
    }
}

async fn read_line(io: &mut WorkerIo, label: &str) -> Result<String, EngineError> {
    loop {
        match io.lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => return Ok(line),
            Ok(None) => {
                return Err(EngineError::disconnected(format!(
                    "worker `{label}` closed its output"
                )));
            }
            Err(err) => {
                return Err(EngineError::disconnected(format!(
                    "read from `{label}`: {err}"
                )));
            }
        }
    }
}

/// Rendering engine backed by a worker process.
pub struct WorkerEngine {
    process: WorkerProcess,
}

#[async_trait]
impl MathEngine for WorkerEngine {
    async fn ready(&self) -> Result<(), EngineError> {
        self.process.wait_ready().await
    }

    async fn render_svg(
        &self,
        input: &FormulaInput,
        options: &EngineOptions,
    ) -> Result<Vec<Fragment>, EngineError> {
        let result = self
            .process
            .call(
                "svg",
                json!({
                    "input": input.input_type().as_str(),
                    "text": input.text(),
                    "display": options.display,
                    "em": options.em,
                    "ex": options.ex,
                    "containerWidth": options.container_width,
                }),
            )
            .await?;

        let documents: Vec<String> = match result {
            Value::String(svg) => vec![svg],
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(svg) => Ok(svg),
                    other => Err(EngineError::protocol(format!(
                        "expected SVG string, got {other}"
                    ))),
                })
                .collect::<Result<_, _>>()?,
            other => {
                return Err(EngineError::protocol(format!(
                    "expected SVG fragments, got {other}"
                )));
            }
        };

        documents.into_iter().map(Fragment::from_svg).collect()
    }

    async fn to_mathml(&self, input: &FormulaInput) -> Result<String, EngineError> {
        let result = self
            .process
            .call(
                "mathml",
                json!({
                    "input": input.input_type().as_str(),
                    "text": input.text(),
                }),
            )
            .await?;
        match result {
            Value::String(mathml) => Ok(mathml),
            other => Err(EngineError::protocol(format!(
                "expected MathML string, got {other}"
            ))),
        }
    }

    async fn shutdown(&self) {
        self.process.kill().await;
    }
}

/// Launches one worker per capability list, passed as `--packages a,b,c`.
pub struct WorkerEngineFactory {
    command: WorkerCommand,
}

impl WorkerEngineFactory {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl EngineFactory for WorkerEngineFactory {
    async fn create(&self, capabilities: &[String]) -> Result<Arc<dyn MathEngine>, EngineError> {
        let extra = vec!["--packages".to_string(), capabilities.join(",")];
        let process = WorkerProcess::spawn(&self.command, &extra)?;
        Ok(Arc::new(WorkerEngine { process }))
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::domain::formula::InputType;

    const SVG: &str = r#"<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"2ex\" height=\"1ex\" viewBox=\"0 -500 1000 500\"><g></g></svg>"#;

    #[tokio::test]
    async fn worker_receives_packages_and_answers_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("calls.log");
        let path = script(&dir, "engine.sh", &echo_worker(&log, &format!("[\"{SVG}\"]")));

        let factory = WorkerEngineFactory::new(WorkerCommand::new(
            path.display().to_string(),
            Vec::new(),
        ));
        let engine = factory
            .create(&["base".to_string(), "mhchem".to_string()])
            .await
            .expect("spawn");
        engine.ready().await.expect("ready");

        let input = FormulaInput::new(InputType::Tex, "x", 100).expect("input");
        let fragments = engine
            .render_svg(&input, &EngineOptions::default())
            .await
            .expect("render");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].metrics.width_ex, 2.0);

        engine.shutdown().await;
        let calls = read_log(&log);
        assert_eq!(calls[0], "--packages base,mhchem");
        assert_eq!(calls[1], "svg");
    }

    #[tokio::test]
    async fn error_replies_become_render_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = script(
            &dir,
            "failing.sh",
            r#"echo '{"ready":true}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"id":%s,"ok":false,"error":"Undefined control sequence"}\n' "$id"
done
"#,
        );
        let process =
            WorkerProcess::spawn(&WorkerCommand::new(path.display().to_string(), Vec::new()), &[])
                .expect("spawn");
        let err = process.call("svg", json!({})).await.expect_err("failure");
        assert!(matches!(err, EngineError::Render { .. }));
        assert!(err.to_string().contains("Undefined control sequence"));
        process.kill().await;
    }

    #[tokio::test]
    async fn startup_error_line_fails_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = script(&dir, "broken.sh", "echo '{\"error\":\"unknown package foo\"}'\n");
        let process =
            WorkerProcess::spawn(&WorkerCommand::new(path.display().to_string(), Vec::new()), &[])
                .expect("spawn");
        let err = process.wait_ready().await.expect_err("startup failure");
        assert!(matches!(err, EngineError::Startup { .. }));
    }

    #[tokio::test]
    async fn exited_worker_is_disconnected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = script(&dir, "quiet.sh", "exit 0\n");
        let process =
            WorkerProcess::spawn(&WorkerCommand::new(path.display().to_string(), Vec::new()), &[])
                .expect("spawn");
        let err = process.wait_ready().await.expect_err("closed");
        assert!(err.is_disconnected());
    }

    #[tokio::test]
    async fn worker_exiting_after_ready_is_disconnected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = script(&dir, "short.sh", "echo '{\"ready\":true}'\nexit 0\n");
        let process =
            WorkerProcess::spawn(&WorkerCommand::new(path.display().to_string(), Vec::new()), &[])
                .expect("spawn");
        process.wait_ready().await.expect("ready line");

        let err = process.call("svg", json!({})).await.expect_err("worker is gone");
        assert!(err.is_disconnected(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn missing_program_is_a_startup_error() {
        let result = WorkerProcess::spawn(
            &WorkerCommand::new("/nonexistent/mathgate-worker", Vec::new()),
            &[],
        );
        assert!(matches!(result, Err(EngineError::Startup { .. })));
    }
}
