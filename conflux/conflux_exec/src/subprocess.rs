//! Subprocess execution.
//!
//! [`run`] starts an external command, optionally feeds it input, waits for
//! it under an optional timeout and returns a [`ProcessResult`]. The timeout
//! covers the exit of the command and the close of its output streams. A
//! command that outlives it is killed and reaped before [`Error::Timeout`]
//! is returned; descendants it started are not signalled.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// The command to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A command string interpreted by the platform shell
    Shell(String),

    /// A program followed by its arguments, run without a shell
    Argv(Vec<String>),
}

impl CommandLine {
    /// A shell command
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell(command.into())
    }

    /// A program and its arguments
    pub fn argv<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Self {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    fn to_command(&self) -> Result<Command> {
        match self {
            Self::Shell(line) => {
                let mut cmd = if cfg!(windows) {
                    let mut cmd = Command::new("cmd");
                    cmd.arg("/C");
                    cmd
                } else {
                    let mut cmd = Command::new("sh");
                    cmd.arg("-c");
                    cmd
                };
                cmd.arg(line);
                Ok(cmd)
            }
            Self::Argv(args) => {
                let (program, rest) = args.split_first().ok_or_else(|| Error::LaunchFailure {
                    command: String::new(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "empty argument vector",
                    ),
                })?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                Ok(cmd)
            }
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

/// Where a child's output stream goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capture {
    /// Collect the stream into the result
    #[default]
    Pipe,

    /// Share the parent's stream
    Inherit,

    /// Discard the stream
    Null,
}

impl Capture {
    fn stdio(self) -> Stdio {
        match self {
            Self::Pipe => Stdio::piped(),
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
        }
    }
}

/// Options for [`run`]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Bytes written to the child's stdin, which is then closed
    pub input: Option<Vec<u8>>,

    /// Destination of stdout
    pub stdout: Capture,

    /// Destination of stderr
    pub stderr: Capture,

    /// Kill the child if it runs longer than this
    pub timeout: Option<Duration>,

    /// Environment variables for the child
    pub env: Option<HashMap<String, String>>,

    /// Overlay `env` on the inherited environment instead of replacing it
    pub inherit_env: bool,

    /// Working directory for the child
    pub cwd: Option<PathBuf>,
}

/// Outcome of a finished subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// The command that was run
    pub args: CommandLine,

    /// Exit code; `-N` when the process was killed by signal `N`
    pub exit_code: i32,

    /// Captured stdout, `None` unless captured
    pub stdout: Option<Vec<u8>>,

    /// Captured stderr, `None` unless captured
    pub stderr: Option<Vec<u8>>,
}

impl ProcessResult {
    /// Whether the process exited with code zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Return `self` on success, [`Error::NonZeroExit`] otherwise
    pub fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::NonZeroExit {
                command: self.args.to_string(),
                code: self.exit_code,
            })
        }
    }

    /// Captured stdout decoded lossily as UTF-8
    pub fn stdout_lossy(&self) -> Option<String> {
        self.stdout
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Captured stderr decoded lossily as UTF-8
    pub fn stderr_lossy(&self) -> Option<String> {
        self.stderr
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

/// The environment the child will see, or `None` to leave it untouched.
///
/// With `inherit_env` the caller's variables are laid over the current
/// environment and win on collisions. Without it the caller's variables,
/// if any, are the whole environment.
pub fn effective_env(options: &RunOptions) -> Option<HashMap<String, String>> {
    match (&options.env, options.inherit_env) {
        (Some(env), true) => {
            let mut merged: HashMap<String, String> = std::env::vars().collect();
            merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
            Some(merged)
        }
        (Some(env), false) => Some(env.clone()),
        (None, _) => None,
    }
}

/// Run a command to completion.
pub async fn run(command: CommandLine, options: RunOptions) -> Result<ProcessResult> {
    let display = command.to_string();
    let mut cmd = command.to_command()?;

    cmd.stdin(if options.input.is_some() {
        Stdio::piped()
    } else {
        Stdio::inherit()
    })
    .stdout(options.stdout.stdio())
    .stderr(options.stderr.stdio())
    .kill_on_drop(true);

    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    if let Some(env) = effective_env(&options) {
        cmd.env_clear();
        cmd.envs(env);
    }

    debug!("Launching `{}`", display);
    let mut child = cmd.spawn().map_err(|source| Error::LaunchFailure {
        command: display.clone(),
        source,
    })?;

    let mut stdin_task = match (child.stdin.take(), options.input) {
        (Some(mut stdin), Some(input)) => Some(tokio::spawn(async move {
            // A child that exits without reading its input is not an error
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        })),
        _ => None,
    };
    let mut stdout_task = child.stdout.take().map(|out| tokio::spawn(read_all(out)));
    let mut stderr_task = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

    // One deadline for the exit and for both output streams reaching EOF
    let finish = async {
        let status = child.wait().await?;
        if let Some(task) = stdin_task.as_mut() {
            let _ = task.await;
        }
        let (stdout, stderr) = tokio::join!(
            collect(stdout_task.as_mut()),
            collect(stderr_task.as_mut())
        );
        Ok::<_, Error>((status, stdout?, stderr?))
    };

    let finished = match options.timeout {
        Some(limit) => tokio::time::timeout(limit, finish).await.ok(),
        None => Some(finish.await),
    };

    let Some(finished) = finished else {
        let limit = options.timeout.unwrap_or_default();
        warn!("`{}` timed out after {:?}; killing it", display, limit);
        // The command itself may have exited while a descendant kept a pipe open
        if !matches!(child.try_wait(), Ok(Some(_))) {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill `{}`: {}", display, e);
            }
        }
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            task.abort();
        }
        if let Some(task) = stdin_task {
            task.abort();
        }
        return Err(Error::Timeout {
            command: display,
            after: limit,
        });
    };
    let (status, stdout, stderr) = finished?;

    let exit_code = exit_code(status);
    debug!("`{}` exited with code {}", display, exit_code);

    Ok(ProcessResult {
        args: command,
        exit_code,
        stdout,
        stderr,
    })
}

/// [`run`] on a private current-thread runtime, for synchronous callers.
///
/// Must not be called from inside an async context.
pub fn run_blocking(command: CommandLine, options: RunOptions) -> Result<ProcessResult> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(command, options))
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect(
    task: Option<&mut tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Result<Option<Vec<u8>>> {
    let Some(task) = task else {
        return Ok(None);
    };
    let bytes = task
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
    Ok(Some(bytes))
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    -1
}
