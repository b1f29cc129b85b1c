//! Transport shell : `ssh` non interactif vers l'hôte, ou `bash -c` local
//! quand l'hôte désigne la machine du kernel.
//!
//! Chaque appel lance un processus enfant ; stdout et stderr sont lus en
//! parallèle jusqu'à la fin du processus, l'échéance ou l'annulation. Le
//! processus est tué dans les deux derniers cas (et s'il est abandonné).
//!
//! L'enfant est chef de son propre groupe de processus : l'arrêt tue tout le
//! groupe, pipelines et sous-shells compris. En flux, ssh alloue un pty
//! (`-tt`) pour que sshd envoie SIGHUP à la commande distante quand la
//! session tombe.

use super::{OutputSink, Transport, Utf8Chunker};
use crate::config::KernelConfig;
use crate::errors::ExecError;
use crate::models::{is_local_host, ExecOutput, StreamName, TransportKind};
use async_trait::async_trait;
use std::future::pending;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub connect_timeout_secs: u64,
    /// Plafond stdout + stderr d'une exécution bufferisée
    pub max_output_bytes: usize,
}

impl From<&KernelConfig> for ShellOptions {
    fn from(cfg: &KernelConfig) -> Self {
        Self {
            user: cfg.ssh.user.clone(),
            port: cfg.ssh.port,
            identity_file: cfg.ssh.identity_file.clone(),
            connect_timeout_secs: cfg.ssh.connect_timeout_secs,
            max_output_bytes: cfg.exec.max_output_bytes,
        }
    }
}

pub struct ShellTransport {
    options: ShellOptions,
}

enum PumpEnd {
    Exited(i32),
    TimedOut,
    Cancelled,
    Overflow,
}

impl ShellTransport {
    pub fn new(options: ShellOptions) -> Self {
        Self { options }
    }

    fn kind_for(host: &str) -> TransportKind {
        if is_local_host(host) {
            TransportKind::Local
        } else {
            TransportKind::Ssh
        }
    }

    fn build_command(&self, host: &str, command: &str, streaming: bool) -> Command {
        let mut cmd = if is_local_host(host) {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(command);
            cmd
        } else {
            let opts = &self.options;
            let mut cmd = Command::new("ssh");
            if streaming {
                cmd.arg("-tt");
            }
            cmd.args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"])
                .arg("-o")
                .arg(format!("ConnectTimeout={}", opts.connect_timeout_secs))
                .arg("-p")
                .arg(opts.port.to_string());
            if let Some(identity) = &opts.identity_file {
                cmd.arg("-i").arg(identity);
            }
            cmd.arg(format!("{}@{}", opts.user, host)).arg("--").arg(command);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn spawn(&self, host: &str, command: &str, streaming: bool) -> Result<Child, ExecError> {
        debug!(host = %host, command = %command, streaming, "spawning shell command");
        self.build_command(host, command, streaming).spawn().map_err(|e| ExecError::Transport {
            host: host.to_string(),
            transport: Self::kind_for(host),
            exit_code: None,
            message: format!("failed to spawn: {e}"),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => pending().await,
    }
}

async fn expire_at(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "process group already gone");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

async fn stop(child: &mut Child, end: PumpEnd) -> io::Result<PumpEnd> {
    kill_group(child);
    let _ = child.start_kill();
    let _ = child.wait().await;
    Ok(end)
}

/// Lit stdout et stderr jusqu'à la fin du processus.
/// `on_chunk` retourne false pour interrompre (dépassement de plafond).
async fn pump<F>(
    child: &mut Child,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    mut on_chunk: F,
) -> io::Result<PumpEnd>
where
    F: FnMut(StreamName, &[u8]) -> bool,
{
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let expiry = expire_at(deadline);
    tokio::pin!(expiry);

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf) => match read? {
                0 => stdout = None,
                n => {
                    if !on_chunk(StreamName::Stdout, &out_buf[..n]) {
                        return stop(child, PumpEnd::Overflow).await;
                    }
                }
            },
            read = read_some(&mut stderr, &mut err_buf) => match read? {
                0 => stderr = None,
                n => {
                    if !on_chunk(StreamName::Stderr, &err_buf[..n]) {
                        return stop(child, PumpEnd::Overflow).await;
                    }
                }
            },
            _ = &mut expiry => return stop(child, PumpEnd::TimedOut).await,
            _ = cancel.cancelled() => return stop(child, PumpEnd::Cancelled).await,
        }
    }

    tokio::select! {
        status = child.wait() => Ok(PumpEnd::Exited(status?.code().unwrap_or(-1))),
        _ = &mut expiry => stop(child, PumpEnd::TimedOut).await,
        _ = cancel.cancelled() => stop(child, PumpEnd::Cancelled).await,
    }
}

#[async_trait]
impl Transport for ShellTransport {
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError> {
        let transport = Self::kind_for(host);
        let mut child = self.spawn(host, command, false)?;

        let cap = self.options.max_output_bytes;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut total = 0usize;
        let never = CancellationToken::new();

        let end = pump(&mut child, Some(Instant::now() + timeout), &never, |stream, bytes| {
            total += bytes.len();
            match stream {
                StreamName::Stdout => stdout.extend_from_slice(bytes),
                StreamName::Stderr => stderr.extend_from_slice(bytes),
            }
            total <= cap
        })
        .await;

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        match end {
            Ok(PumpEnd::Exited(exit_code)) => Ok(ExecOutput { stdout, stderr, exit_code, transport }),
            Ok(PumpEnd::TimedOut) => {
                warn!(host = %host, transport = %transport, timeout_ms = timeout.as_millis() as u64, "shell command timed out");
                Err(ExecError::Timeout { host: host.to_string(), transport, timeout, stdout, stderr })
            }
            Ok(PumpEnd::Overflow) => Err(ExecError::Transport {
                host: host.to_string(),
                transport,
                exit_code: None,
                message: format!("output exceeded {cap} bytes"),
                stdout,
                stderr,
            }),
            Ok(PumpEnd::Cancelled) => Err(ExecError::Cancelled { host: host.to_string() }),
            Err(e) => Err(ExecError::Transport {
                host: host.to_string(),
                transport,
                exit_code: None,
                message: format!("read failed: {e}"),
                stdout,
                stderr,
            }),
        }
    }

    async fn stream(
        &self,
        host: &str,
        command: &str,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError> {
        let transport = Self::kind_for(host);
        let mut child = self.spawn(host, command, true)?;

        let mut stdout = Utf8Chunker::default();
        let mut stderr = Utf8Chunker::default();
        let end = pump(&mut child, None, &cancel, |stream, bytes| {
            let decoder = match stream {
                StreamName::Stdout => &mut stdout,
                StreamName::Stderr => &mut stderr,
            };
            let text = decoder.push(bytes);
            if !text.is_empty() {
                sink.on_chunk(stream, &text);
            }
            true
        })
        .await;

        match end {
            Ok(PumpEnd::Exited(code)) => {
                for (stream, decoder) in [(StreamName::Stdout, stdout), (StreamName::Stderr, stderr)] {
                    if let Some(rest) = decoder.finish() {
                        sink.on_chunk(stream, &rest);
                    }
                }
                Ok(code)
            }
            Ok(PumpEnd::Cancelled) => {
                debug!(host = %host, "streamed shell command cancelled");
                Err(ExecError::Cancelled { host: host.to_string() })
            }
            Ok(PumpEnd::TimedOut) | Ok(PumpEnd::Overflow) => Err(ExecError::Transport {
                host: host.to_string(),
                transport,
                exit_code: None,
                message: "stream interrupted".into(),
                stdout: String::new(),
                stderr: String::new(),
            }),
            Err(e) => Err(ExecError::Transport {
                host: host.to_string(),
                transport,
                exit_code: None,
                message: format!("read failed: {e}"),
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelSink, StreamEvent};
    use tokio::sync::mpsc;

    fn options() -> ShellOptions {
        ShellOptions {
            user: "steam".into(),
            port: 2222,
            identity_file: Some("/etc/warden/id_ed25519".into()),
            connect_timeout_secs: 7,
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn test_remote_command_line() {
        let transport = ShellTransport::new(options());
        let cmd = transport.build_command("gs-eu-1", "uptime", false);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "ssh");
        let args: Vec<String> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/etc/warden/id_ed25519"));
        assert_eq!(&args[args.len() - 3..], ["steam@gs-eu-1", "--", "uptime"]);
        assert!(!args.contains(&"-tt".to_string()));

        let streamed = transport.build_command("gs-eu-1", "tail -f log", true);
        assert_eq!(streamed.as_std().get_args().next().and_then(|a| a.to_str()), Some("-tt"));
    }

    #[test]
    fn test_localhost_runs_local_shell() {
        let transport = ShellTransport::new(options());
        for host in ["localhost", "127.0.0.1", "::1"] {
            let cmd = transport.build_command(host, "uptime", false);
            assert_eq!(cmd.as_std().get_program(), "bash");
        }
        assert_eq!(ShellTransport::kind_for("localhost"), TransportKind::Local);
        assert_eq!(ShellTransport::kind_for("gs-eu-1"), TransportKind::Ssh);
    }

    #[tokio::test]
    async fn test_local_run_captures_both_streams() {
        let transport = ShellTransport::new(options());
        let out = transport
            .run("localhost", "echo hello; echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.transport, TransportKind::Local);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let transport = ShellTransport::new(options());
        let err = transport
            .run("localhost", "echo started; sleep 10", Duration::from_millis(500))
            .await
            .unwrap_err();
        match err {
            ExecError::Timeout { stdout, transport, .. } => {
                assert_eq!(stdout, "started\n");
                assert_eq!(transport, TransportKind::Local);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_ceiling() {
        let transport = ShellTransport::new(options());
        let err = transport
            .run("localhost", "head -c 100000 /dev/zero", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Transport { exit_code: None, ref message, .. } if message.contains("1024")));
    }

    #[tokio::test]
    async fn test_stream_forwards_chunks() {
        let transport = ShellTransport::new(options());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        let code = transport
            .stream("localhost", "echo one; echo two >&2; exit 1", &mut sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 1);
        drop(sink);

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Chunk { stream, data } = event {
                match stream {
                    StreamName::Stdout => stdout.push_str(&data),
                    StreamName::Stderr => stderr.push_str(&data),
                }
            }
        }
        assert_eq!(stdout, "one\n");
        assert_eq!(stderr, "two\n");
    }

    #[tokio::test]
    async fn test_stream_cancel_kills_process() {
        let transport = ShellTransport::new(options());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.stream("localhost", "echo ready; sleep 30", &mut sink, cancel),
        )
        .await
        .expect("cancel should end the stream quickly");
        assert!(matches!(result, Err(ExecError::Cancelled { .. })));
    }

    async fn collect_stdout(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> String {
        let mut stdout = String::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Chunk { stream: StreamName::Stdout, data } = event {
                stdout.push_str(&data);
            }
        }
        stdout
    }

    #[tokio::test]
    async fn test_stream_keeps_characters_split_across_reads() {
        let transport = ShellTransport::new(options());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        // 8191 octets puis un "é" à cheval sur la frontière de lecture
        let command = format!("head -c {} /dev/zero | tr '\\0' a; printf '\\xc3\\xa9\\n'", READ_CHUNK - 1);
        transport.stream("localhost", &command, &mut sink, CancellationToken::new()).await.unwrap();
        drop(sink);

        let stdout = collect_stdout(rx).await;
        assert_eq!(stdout.len(), READ_CHUNK + 2);
        assert!(stdout.ends_with("aé\n"));
        assert!(!stdout.contains(char::REPLACEMENT_CHARACTER));
    }

    /// Vivant au sens du noyau : présent et pas zombie
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat.rsplit(')').next().map_or(false, |rest| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stream_cancel_kills_whole_process_group() {
        let transport = ShellTransport::new(options());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let stream_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut sink = ChannelSink::new(tx);
            transport.stream("localhost", "sleep 77 & echo $!; wait", &mut sink, stream_cancel).await
        });

        let pid: u32 = match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(StreamEvent::Chunk { data, .. }) => data.trim().parse().unwrap(),
            other => panic!("expected pid chunk, got {other:?}"),
        };
        assert!(process_alive(pid));

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ExecError::Cancelled { .. })));

        let mut alive = true;
        for _ in 0..20 {
            alive = process_alive(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "background child {pid} survived cancellation");
    }
}
