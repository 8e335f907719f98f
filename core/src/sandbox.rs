//! Subprocess sandbox for model-chosen action blocks.
//!
//! One interpreter process per session, reused across turns so state
//! persists; sub-sessions get a fresh process. The host talks to the
//! worker over newline-delimited JSON frames on the child's stdin/stdout.
//! Builtin and module restrictions are enforced inside the worker; path
//! policy is enforced host-side in the navigation facade before any read.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::debug;
use tracing::warn;

use crate::config::Policy;
use crate::error::NavErr;
use crate::error::Result;
use crate::error::RlmErr;
use crate::error::SandboxErr;
use crate::error::ViolationKind;
use crate::nav::Nav;
use crate::protocol::CodeSpan;
use crate::protocol::ContextBlobs;
use crate::protocol::Observation;
use crate::protocol::Relation;
use crate::protocol::SpanKind;

/// The interpreter side of the sandbox, embedded at build time.
const WORKER_SOURCE: &str = include_str!("sandbox_worker.py");

/// Interpreter the worker runs under. A deployment that swaps in a
/// containerised backend replaces [`Sandbox`] behind the same contract.
const INTERPRETER: &str = "python3";

/// Grace period for the handshake after spawning the interpreter.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostFrame<'a> {
    Handshake {
        blocked_builtins: &'a [String],
        allowed_modules: &'a [String],
        context: &'a ContextBlobs,
        max_stream_bytes: usize,
    },
    Exec {
        code: &'a str,
    },
    NavResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    SubResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        ok: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameError {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    violation: Option<ViolationKind>,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerFrame {
    Ready,
    NavCall {
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    SubCall {
        task: String,
        #[serde(default)]
        context: ContextBlobs,
    },
    ExecResult {
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        return_repr: Option<String>,
        #[serde(default)]
        runtime_ms: u64,
        #[serde(default)]
        stdout_bytes: u64,
        #[serde(default)]
        stderr_bytes: u64,
        #[serde(default)]
        truncated: bool,
        #[serde(default)]
        error: Option<FrameError>,
    },
}

/// What the session sees while an action block runs.
#[derive(Debug)]
pub enum ActionEvent {
    /// The action called `sub_session(...)`; the interpreter is parked on
    /// the reply. Answer with [`Sandbox::resume_with_sub_result`].
    SubcallRequested { task: String, context: ContextBlobs },
    /// The action finished. `failed` covers violations, navigation errors,
    /// and ordinary exceptions, all already rendered into the observation.
    Completed { observation: Observation, failed: bool },
}

pub struct Sandbox {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    action_timeout: Duration,
    deadline: Instant,
    nav_fault: Option<NavErr>,
}

impl Sandbox {
    /// Spawn a fresh interpreter, hand it the restriction policy and the
    /// injected context blobs, and wait for it to come up.
    pub async fn spawn(policy: &Policy, context: &ContextBlobs) -> Result<Sandbox> {
        let mut child = Command::new(INTERPRETER)
            .arg("-c")
            .arg(WORKER_SOURCE)
            .env_clear()
            // PATH must survive env_clear or the interpreter cannot be
            // resolved at all; nothing else leaks through.
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxErr::Crash(format!("failed to spawn interpreter: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxErr::Crash("stdin pipe unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxErr::Crash("stdout pipe unavailable".to_string()))?;

        let mut sandbox = Sandbox {
            child,
            stdin,
            reader: BufReader::new(stdout),
            action_timeout: policy.sandbox_timeout,
            deadline: Instant::now() + HANDSHAKE_TIMEOUT,
            nav_fault: None,
        };

        sandbox
            .send(&HostFrame::Handshake {
                blocked_builtins: &policy.blocked_builtins,
                allowed_modules: &policy.allowed_modules,
                context,
                max_stream_bytes: policy.max_stream_bytes,
            })
            .await?;

        match sandbox.read_frame().await? {
            WorkerFrame::Ready => Ok(sandbox),
            other => Err(SandboxErr::Crash(format!(
                "unexpected frame during handshake: {other:?}"
            ))
            .into()),
        }
    }

    /// Submit one action block. Events are then pulled with
    /// [`Sandbox::next_event`] until `Completed` arrives.
    pub async fn begin_action(&mut self, code: &str) -> Result<()> {
        self.deadline = Instant::now() + self.action_timeout;
        self.send(&HostFrame::Exec { code }).await
    }

    /// Answer a pending `sub_session` call and let the action resume. The
    /// wall-clock allowance restarts: the child session was governed by
    /// its own budget while the interpreter was parked.
    pub async fn resume_with_sub_result(
        &mut self,
        result: std::result::Result<&str, String>,
    ) -> Result<()> {
        self.deadline = Instant::now() + self.action_timeout;
        let frame = match result {
            Ok(answer) => HostFrame::SubResult {
                ok: Some(answer),
                error: None,
            },
            Err(message) => HostFrame::SubResult {
                ok: None,
                error: Some(FrameError {
                    kind: "subcall".to_string(),
                    violation: None,
                    message,
                }),
            },
        };
        self.send(&frame).await
    }

    /// Drive the running action forward. Navigation calls are served
    /// inline; sub-calls and completion surface to the session.
    pub async fn next_event(&mut self, nav: &Nav, cancel: &Arc<Notify>) -> Result<ActionEvent> {
        loop {
            let frame = tokio::select! {
                frame = self.read_frame() => frame?,
                _ = cancel.notified() => {
                    self.kill().await;
                    return Err(RlmErr::Cancelled);
                }
            };
            match frame {
                WorkerFrame::NavCall { method, args } => {
                    let reply = match self.dispatch_nav(nav, &method, &args) {
                        Ok(value) => HostFrame::NavResult {
                            ok: Some(value),
                            error: None,
                        },
                        Err(error) => HostFrame::NavResult {
                            ok: None,
                            error: Some(error),
                        },
                    };
                    self.send(&reply).await?;
                }
                WorkerFrame::SubCall { task, context } => {
                    return Ok(ActionEvent::SubcallRequested { task, context });
                }
                WorkerFrame::ExecResult {
                    stdout,
                    stderr,
                    return_repr,
                    runtime_ms,
                    stdout_bytes,
                    stderr_bytes,
                    truncated,
                    error,
                } => {
                    let mut observation = Observation {
                        stdout,
                        stderr,
                        return_repr,
                        runtime_ms,
                        truncated,
                        stdout_bytes,
                        stderr_bytes,
                    };
                    let failed = error.is_some();
                    if let Some(error) = error {
                        let rendered = render_frame_error(&error);
                        if !observation.stderr.is_empty() {
                            observation.stderr.push('\n');
                        }
                        observation.stderr.push_str(&rendered);
                    }
                    return Ok(ActionEvent::Completed {
                        observation,
                        failed,
                    });
                }
                WorkerFrame::Ready => {
                    debug!("ignoring duplicate ready frame");
                }
            }
        }
    }

    /// A stale or unavailable-index fault observed while serving nav calls
    /// for the last action. The session uses this for the refresh-once and
    /// fatality rules.
    pub fn take_nav_fault(&mut self) -> Option<NavErr> {
        self.nav_fault.take()
    }

    /// Orderly teardown; falls back to SIGKILL via `kill_on_drop`.
    pub async fn shutdown(mut self) {
        if self.send(&HostFrame::Shutdown).await.is_err() {
            self.kill().await;
            return;
        }
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "sandbox exited"),
            _ => self.kill().await,
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("failed to kill sandbox interpreter: {e}");
        }
    }

    async fn send(&mut self, frame: &HostFrame<'_>) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        if let Err(e) = self.stdin.write_all(line.as_bytes()).await {
            self.kill().await;
            return Err(SandboxErr::Crash(format!("failed to write to interpreter: {e}")).into());
        }
        if let Err(e) = self.stdin.flush().await {
            self.kill().await;
            return Err(SandboxErr::Crash(format!("failed to flush to interpreter: {e}")).into());
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<WorkerFrame> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.kill().await;
            return Err(SandboxErr::Timeout(self.action_timeout).into());
        }
        let mut line = String::new();
        let read = tokio::time::timeout(remaining, self.reader.read_line(&mut line)).await;
        match read {
            Ok(Ok(0)) => {
                let status = self.child.try_wait().ok().flatten();
                Err(SandboxErr::Crash(format!(
                    "interpreter closed its pipe (exit: {status:?})"
                ))
                .into())
            }
            Ok(Ok(_)) => serde_json::from_str(line.trim_end()).map_err(|e| {
                SandboxErr::Crash(format!("unparseable frame from interpreter: {e}")).into()
            }),
            Ok(Err(e)) => {
                self.kill().await;
                Err(SandboxErr::Crash(format!("failed to read from interpreter: {e}")).into())
            }
            Err(_) => {
                self.kill().await;
                Err(SandboxErr::Timeout(self.action_timeout).into())
            }
        }
    }

    fn dispatch_nav(
        &mut self,
        nav: &Nav,
        method: &str,
        args: &[Value],
    ) -> std::result::Result<Value, FrameError> {
        match method {
            "get_function" => {
                let name = required_str(args, 0)?;
                nav_value(nav.get_function(name), self)
            }
            "get_class" => {
                let name = required_str(args, 0)?;
                nav_value(nav.get_class(name), self)
            }
            "get_method" => {
                let class_name = required_str(args, 0)?;
                let method_name = required_str(args, 1)?;
                nav_value(nav.get_method(class_name, method_name), self)
            }
            "list_symbols" => {
                let path = optional_str(args, 0);
                let kind = match optional_str(args, 1) {
                    Some(raw) => Some(parse_kind(raw)?),
                    None => None,
                };
                nav_value(nav.list_symbols(path, kind), self)
            }
            "search_pattern" => {
                let pattern = required_str(args, 0)?;
                let scope = optional_str(args, 1);
                nav_value(nav.search_pattern(pattern, scope), self)
            }
            "neighbors" => {
                let name = required_str(args, 0)?;
                let relation_raw = required_str(args, 1)?;
                let Some(relation) = Relation::parse(relation_raw) else {
                    return Err(usage_error(format!(
                        "unknown relation `{relation_raw}`; expected calls, called_by, \
                         imports, imported_by, inherits, or inherited_by"
                    )));
                };
                nav_value(nav.neighbors(name, relation), self)
            }
            "read_span" => {
                let Some(raw) = args.first() else {
                    return Err(usage_error("read_span expects a span".to_string()));
                };
                let span: CodeSpan = serde_json::from_value(raw.clone())
                    .map_err(|e| usage_error(format!("read_span expects a span: {e}")))?;
                match nav.read_span(&span) {
                    Ok(text) => Ok(Value::String(text)),
                    Err(RlmErr::Sandbox(SandboxErr::Violation { kind, detail })) => {
                        Err(FrameError {
                            kind: "violation".to_string(),
                            violation: Some(kind),
                            message: detail,
                        })
                    }
                    Err(RlmErr::Nav(err)) => Err(self.nav_error(err)),
                    Err(other) => Err(usage_error(other.to_string())),
                }
            }
            "repo_overview" => nav_value(nav.repo_overview(), self),
            other => Err(usage_error(format!("unknown nav method `{other}`"))),
        }
    }

    fn nav_error(&mut self, err: NavErr) -> FrameError {
        let (kind, message) = match &err {
            NavErr::BadPattern(detail) => ("bad_pattern", detail.clone()),
            NavErr::IndexUnavailable(detail) => ("index_unavailable", detail.clone()),
            NavErr::Stale { path } => ("stale", path.clone()),
        };
        // Stale and unavailable faults also go to the session, which owns
        // the refresh-once and fatality rules.
        if !matches!(err, NavErr::BadPattern(_)) {
            self.nav_fault = Some(err);
        }
        FrameError {
            kind: kind.to_string(),
            violation: None,
            message,
        }
    }
}

fn nav_value<T: Serialize>(
    result: std::result::Result<T, NavErr>,
    sandbox: &mut Sandbox,
) -> std::result::Result<Value, FrameError> {
    match result {
        Ok(value) => serde_json::to_value(value).map_err(|e| usage_error(e.to_string())),
        Err(err) => Err(sandbox.nav_error(err)),
    }
}

fn usage_error(message: String) -> FrameError {
    FrameError {
        kind: "exception".to_string(),
        violation: None,
        message,
    }
}

fn required_str<'a>(args: &'a [Value], idx: usize) -> std::result::Result<&'a str, FrameError> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| usage_error(format!("argument {idx} must be a string")))
}

fn optional_str(args: &[Value], idx: usize) -> Option<&str> {
    args.get(idx).and_then(Value::as_str)
}

fn parse_kind(raw: &str) -> std::result::Result<SpanKind, FrameError> {
    serde_json::from_value::<SpanKind>(Value::String(raw.to_string()))
        .map_err(|_| usage_error(format!("unknown symbol kind `{raw}`")))
}

fn render_frame_error(error: &FrameError) -> String {
    match error.kind.as_str() {
        "violation" => {
            let kind = error
                .violation
                .map(|k| k.to_string())
                .unwrap_or_else(|| "policy".to_string());
            format!("SandboxViolation({kind}): {}", error.message)
        }
        "bad_pattern" => format!("NavError(BadPattern): {}", error.message),
        "stale" => format!("NavError(Stale): {}", error.message),
        "index_unavailable" => format!("NavError(IndexUnavailable): {}", error.message),
        _ => error.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn host_frames_serialize_as_tagged_jsonl() {
        let frame = HostFrame::Exec { code: "print(1)" };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"exec","code":"print(1)"}"#
        );

        let frame = HostFrame::SubResult {
            ok: Some("answer"),
            error: None,
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"sub_result","ok":"answer"}"#
        );
    }

    #[test]
    fn worker_frames_deserialize() {
        let frame: WorkerFrame =
            serde_json::from_str(r#"{"type":"nav_call","method":"get_function","args":["run"]}"#)
                .unwrap();
        assert!(matches!(
            frame,
            WorkerFrame::NavCall { ref method, .. } if method == "get_function"
        ));

        let frame: WorkerFrame = serde_json::from_str(
            r#"{"type":"exec_result","stdout":"hi","stderr":"","runtime_ms":2,
                "stdout_bytes":2,"stderr_bytes":0,"truncated":false}"#,
        )
        .unwrap();
        assert!(matches!(frame, WorkerFrame::ExecResult { ref stdout, .. } if stdout == "hi"));
    }

    #[test]
    fn violation_errors_render_with_kind() {
        let error = FrameError {
            kind: "violation".to_string(),
            violation: Some(ViolationKind::Module),
            message: "import of `os` is not permitted".to_string(),
        };
        assert_eq!(
            render_frame_error(&error),
            "SandboxViolation(module): import of `os` is not permitted"
        );
    }

    #[test]
    fn worker_source_is_embedded() {
        assert!(WORKER_SOURCE.contains("def main()"));
        assert!(WORKER_SOURCE.contains("sub_session"));
    }
}
