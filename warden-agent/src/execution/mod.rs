//! Command execution for kernel requests
//!
//! Handles:
//! - Buffered runs with timeout and a per-stream output ceiling
//! - Streamed runs forwarding output as it is produced
//! - Cancellation (the child's whole process group is killed)
//! - Cross-platform shell (`bash -c` / `cmd /C`)

use crate::protocol::StreamName;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a command produced no exit status
#[derive(Debug, thiserror::Error)]
pub enum ExecFailure {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] io::Error),
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("command cancelled")]
    Cancelled,
    #[error("failed to read command output: {0}")]
    Io(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

struct Capture {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl Capture {
    fn new(cap: usize) -> Self {
        Self { buf: Vec::new(), cap, truncated: false }
    }

    fn push(&mut self, data: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).to_string()
    }
}

/// Cross-platform command executor
pub struct CommandExecutor {
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    fn shell_command(command: &str, workdir: Option<&str>) -> AsyncCommand {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = AsyncCommand::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = AsyncCommand::new("bash");
            c.arg("-c").arg(command);
            c
        };
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Run to completion, capturing both streams
    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
        workdir: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecFailure> {
        debug!("Executing command: {} (timeout: {:?})", command, timeout);
        let mut child = Self::shell_command(command, workdir).spawn().map_err(ExecFailure::Spawn)?;

        let mut stdout = Capture::new(self.max_output_bytes);
        let mut stderr = Capture::new(self.max_output_bytes);
        let deadline = Instant::now() + timeout;
        let exit_code = pump(&mut child, Some((deadline, timeout)), cancel, |stream, data| match stream {
            StreamName::Stdout => stdout.push(data),
            StreamName::Stderr => stderr.push(data),
        })
        .await?;

        if stdout.truncated || stderr.truncated {
            warn!("Output of '{}' truncated to {} bytes per stream", command, self.max_output_bytes);
        }
        Ok(CommandOutput { stdout: stdout.into_string(), stderr: stderr.into_string(), exit_code })
    }

    /// Run until exit or cancellation, handing every chunk to `on_chunk`
    pub async fn stream<F>(
        &self,
        command: &str,
        workdir: Option<&str>,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<i32, ExecFailure>
    where
        F: FnMut(StreamName, String),
    {
        debug!("Streaming command: {}", command);
        let mut child = Self::shell_command(command, workdir).spawn().map_err(ExecFailure::Spawn)?;
        let mut stdout = Utf8Chunker::default();
        let mut stderr = Utf8Chunker::default();
        let exit_code = pump(&mut child, None, cancel, |stream, data| {
            let decoder = match stream {
                StreamName::Stdout => &mut stdout,
                StreamName::Stderr => &mut stderr,
            };
            let text = decoder.push(data);
            if !text.is_empty() {
                on_chunk(stream, text);
            }
        })
        .await?;

        for (stream, decoder) in [(StreamName::Stdout, stdout), (StreamName::Stderr, stderr)] {
            if let Some(rest) = decoder.finish() {
                on_chunk(stream, rest);
            }
        }
        Ok(exit_code)
    }
}

async fn read_some<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match pipe {
        Some(p) => p.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn expire_at(deadline: Option<(Instant, Duration)>) {
    match deadline {
        Some((at, _)) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Incremental UTF-8 decoding: a character split across reads is held back
/// until the rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| String::from_utf8_lossy(&self.pending).into_owned())
    }
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("Process group {} already gone: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

async fn stop(child: &mut Child) {
    kill_group(child);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill command: {}", e);
    }
}

async fn pump<F>(
    child: &mut Child,
    deadline: Option<(Instant, Duration)>,
    cancel: &CancellationToken,
    mut on_chunk: F,
) -> Result<i32, ExecFailure>
where
    F: FnMut(StreamName, &[u8]),
{
    let limit = deadline.map(|(_, d)| d).unwrap_or_default();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf) => match read {
                Ok(0) => stdout = None,
                Ok(n) => on_chunk(StreamName::Stdout, &out_buf[..n]),
                Err(e) => return Err(ExecFailure::Io(e)),
            },
            read = read_some(&mut stderr, &mut err_buf) => match read {
                Ok(0) => stderr = None,
                Ok(n) => on_chunk(StreamName::Stderr, &err_buf[..n]),
                Err(e) => return Err(ExecFailure::Io(e)),
            },
            _ = expire_at(deadline) => {
                stop(child).await;
                return Err(ExecFailure::TimedOut(limit));
            }
            _ = cancel.cancelled() => {
                stop(child).await;
                return Err(ExecFailure::Cancelled);
            }
        }
    }

    tokio::select! {
        status = child.wait() => status.map(|s| s.code().unwrap_or(-1)).map_err(ExecFailure::Io),
        _ = expire_at(deadline) => {
            stop(child).await;
            Err(ExecFailure::TimedOut(limit))
        }
        _ = cancel.cancelled() => {
            stop(child).await;
            Err(ExecFailure::Cancelled)
        }
    }
}
