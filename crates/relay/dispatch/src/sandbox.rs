//! Sandboxed code execution.
//!
//! Each [`CodeUnit`] runs in a fresh OS process:
//!
//! - environment cleared, only `SandboxConfig::env` passed through
//! - working directory is a new empty temporary directory, removed afterwards
//! - isolation wrapper prefix (for example `bwrap` or `unshare -rn`), required
//!   unless explicitly waived; `{workdir}` in its arguments names the run's directory
//! - optional address-space bound applied with `ulimit -v` on unix
//! - hard wall-clock timeout, after which the process is killed
//! - stdout read up to `max_output_bytes`
//!
//! Data crosses the boundary only as JSON. The request `{"code", "input"}`
//! is written to stdin; the interpreter answers on stdout with
//! `{"ok": true, "result": ...}` or `{"ok": false, "error": "..."}`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use relay_types::{DispatchError, FaultKind};

use crate::backend::CodeUnit;

const STDERR_PREVIEW_BYTES: u64 = 4 * 1024;
const WORKDIR_PLACEHOLDER: &str = "{workdir}";

/// Python harness: runs the unit with a minimal builtins allow-list.
///
/// The unit reads its argument from `input` and publishes its answer by
/// assigning `result`.
pub const PYTHON_HARNESS: &str = r#"
import builtins, json, sys
_ALLOWED = (
    "abs", "all", "any", "bool", "dict", "divmod", "enumerate", "filter", "float",
    "int", "isinstance", "len", "list", "map", "max", "min", "pow", "range", "repr",
    "reversed", "round", "set", "sorted", "str", "sum", "tuple", "zip",
    "Exception", "KeyError", "TypeError", "ValueError", "ZeroDivisionError",
)
_request = json.loads(sys.stdin.read())
_scope = {"__builtins__": {n: getattr(builtins, n) for n in _ALLOWED}, "input": _request.get("input")}
try:
    exec(compile(_request["code"], "<unit>", "exec"), _scope)
    _reply = {"ok": True, "result": _scope.get("result")}
except BaseException as exc:
    _reply = {"ok": False, "error": "%s: %s" % (type(exc).__name__, exc)}
try:
    _text = json.dumps(_reply)
except (TypeError, ValueError) as exc:
    _text = json.dumps({"ok": False, "kind": "non_serializable", "error": str(exc)})
sys.stdout.write(_text)
"#;

/// How to start the interpreter for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl InterpreterSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Sandbox runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter per language name.
    pub interpreters: BTreeMap<String, InterpreterSpec>,
    /// Command prefix the interpreter runs under.
    pub wrapper: Vec<String>,
    /// Refuse to run units when `wrapper` is empty.
    pub require_isolation: bool,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    /// Address-space ceiling in KiB.
    pub memory_limit_kb: Option<u64>,
    /// The only environment variables the process sees.
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut interpreters = BTreeMap::new();
        interpreters.insert(
            "python".to_string(),
            InterpreterSpec::new("python3", ["-I", "-S", "-c", PYTHON_HARNESS]),
        );
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());
        Self {
            interpreters,
            wrapper: Vec::new(),
            require_isolation: true,
            timeout: Duration::from_secs(5),
            max_output_bytes: 1024 * 1024,
            memory_limit_kb: Some(512 * 1024),
            env,
        }
    }
}

impl SandboxConfig {
    pub fn with_interpreter(mut self, language: impl Into<String>, spec: InterpreterSpec) -> Self {
        self.interpreters.insert(language.into(), spec);
        self
    }

    pub fn with_wrapper(mut self, wrapper: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.wrapper = wrapper.into_iter().map(Into::into).collect();
        self
    }

    /// Run units without an isolation wrapper. They keep the host's filesystem and network.
    pub fn without_isolation(mut self) -> Self {
        self.require_isolation = false;
        self
    }

    /// Use `bwrap` (filesystem, network and process namespaces) or, failing
    /// that, `unshare` (network only) when found on the host `PATH`.
    pub fn with_detected_isolation(mut self) -> Self {
        if let Some(bwrap) = find_on_path("bwrap") {
            let mut wrapper = vec![bwrap];
            wrapper.extend(
                [
                    "--unshare-all",
                    "--die-with-parent",
                    "--ro-bind", "/usr", "/usr",
                    "--ro-bind-try", "/bin", "/bin",
                    "--ro-bind-try", "/lib", "/lib",
                    "--ro-bind-try", "/lib64", "/lib64",
                    "--proc", "/proc",
                    "--dev", "/dev",
                    "--bind", WORKDIR_PLACEHOLDER, WORKDIR_PLACEHOLDER,
                    "--chdir", WORKDIR_PLACEHOLDER,
                ]
                .map(String::from),
            );
            self.wrapper = wrapper;
        } else if let Some(unshare) = find_on_path("unshare") {
            self.wrapper = vec![unshare, "--map-root-user".into(), "--net".into()];
        } else {
            warn!("No isolation wrapper found on PATH");
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_limit_kb(mut self, limit: Option<u64>) -> Self {
        self.memory_limit_kb = limit;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

/// Sandbox failures, before they are mapped into [`DispatchError`].
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no interpreter configured for language '{0}'")]
    UnsupportedLanguage(String),

    #[error("no isolation wrapper configured")]
    Unisolated,

    #[error("failed to prepare sandbox: {0}")]
    Setup(String),

    #[error("failed to spawn interpreter: {0}")]
    Spawn(String),

    #[error("execution exceeded {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Exception(String),

    #[error("output is not a valid result envelope: {0}")]
    NonSerializable(String),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

impl SandboxError {
    /// Map into the dispatch taxonomy for the named target.
    pub fn into_dispatch_error(self, target: &str) -> DispatchError {
        let kind = match &self {
            SandboxError::UnsupportedLanguage(_) | SandboxError::Unisolated => {
                return DispatchError::Validation(self.to_string())
            }
            SandboxError::Setup(_) | SandboxError::Spawn(_) => FaultKind::Spawn,
            SandboxError::Timeout(_) => FaultKind::Timeout,
            SandboxError::Exception(_) => FaultKind::Exception,
            SandboxError::NonSerializable(_) => FaultKind::NonSerializable,
        };
        DispatchError::ExecutionFault {
            target: target.to_string(),
            kind,
            reason: self.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

/// Runs code units in isolated processes.
#[derive(Debug, Clone, Default)]
pub struct SandboxRunner {
    config: SandboxConfig,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `unit` with `input`, bounded by the smaller of `timeout` and the configured timeout.
    #[instrument(skip(self, unit, input), fields(language = %unit.language))]
    pub async fn run(
        &self,
        unit: &CodeUnit,
        input: &Value,
        timeout: Option<Duration>,
    ) -> SandboxResult<Value> {
        let interpreter = self
            .config
            .interpreters
            .get(&unit.language)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(unit.language.clone()))?;
        if self.config.require_isolation && self.config.wrapper.is_empty() {
            warn!("Refusing to run unit without an isolation wrapper");
            return Err(SandboxError::Unisolated);
        }
        let timeout = timeout
            .map(|t| t.min(self.config.timeout))
            .unwrap_or(self.config.timeout);

        let workdir = tempfile::tempdir().map_err(|e| SandboxError::Setup(e.to_string()))?;
        let argv = self.command_line(interpreter, &workdir.path().to_string_lossy());
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Setup("empty command line".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&self.config.env)
            .current_dir(workdir.path())
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let request = json!({"code": unit.source, "input": input}).to_string();

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Setup("stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Setup("stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Setup("stderr unavailable".into()))?;

        let limit = self.config.max_output_bytes as u64;
        let exchange = async {
            // A unit that exits without reading stdin closes the pipe early.
            let _ = stdin.write_all(request.as_bytes()).await;
            drop(stdin);

            let mut out = Vec::new();
            let mut err = Vec::new();
            let mut bounded_out = (&mut stdout).take(limit + 1);
            let mut bounded_err = (&mut stderr).take(STDERR_PREVIEW_BYTES);
            let (read_out, read_err) = tokio::join!(
                bounded_out.read_to_end(&mut out),
                bounded_err.read_to_end(&mut err),
            );
            read_out.map_err(|e| SandboxError::Exception(format!("reading stdout: {e}")))?;
            read_err.map_err(|e| SandboxError::Exception(format!("reading stderr: {e}")))?;
            if out.len() as u64 > limit {
                return Err(SandboxError::NonSerializable(format!(
                    "output exceeds {limit} bytes"
                )));
            }
            let status = child
                .wait()
                .await
                .map_err(|e| SandboxError::Exception(format!("waiting for process: {e}")))?;
            Ok((status, out, err))
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        let (status, out, err) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Sandboxed unit timed out");
                let _ = child.start_kill();
                return Err(SandboxError::Timeout(timeout));
            }
        };
        debug!(exit = ?status.code(), bytes = out.len(), "Sandboxed unit exited");

        let stdout = String::from_utf8_lossy(&out);
        match serde_json::from_str::<Envelope>(stdout.trim()) {
            Ok(envelope) if envelope.ok => Ok(envelope.result),
            Ok(envelope) => {
                let message = envelope
                    .error
                    .unwrap_or_else(|| "unit reported failure".to_string());
                if envelope.kind.as_deref() == Some("non_serializable") {
                    Err(SandboxError::NonSerializable(message))
                } else {
                    Err(SandboxError::Exception(message))
                }
            }
            Err(parse) if !status.success() => Err(SandboxError::Exception(format!(
                "process exited with {status}: {}",
                preview(&String::from_utf8_lossy(&err)).unwrap_or_else(|| parse.to_string())
            ))),
            Err(parse) => Err(SandboxError::NonSerializable(parse.to_string())),
        }
    }

    fn command_line(&self, interpreter: &InterpreterSpec, workdir: &str) -> Vec<String> {
        let mut argv: Vec<String> = self
            .config
            .wrapper
            .iter()
            .map(|arg| arg.replace(WORKDIR_PLACEHOLDER, workdir))
            .collect();
        if let (Some(kb), true) = (self.config.memory_limit_kb, cfg!(unix)) {
            argv.push("/bin/sh".to_string());
            argv.push("-c".to_string());
            argv.push(format!("ulimit -v {kb} && exec \"$0\" \"$@\""));
        }
        argv.push(interpreter.program.clone());
        argv.extend(interpreter.args.iter().cloned());
        argv
    }
}

fn find_on_path(program: &str) -> Option<String> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .map(|candidate| candidate.to_string_lossy().into_owned())
}

fn preview(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.chars().take(500).collect())
    }
}
