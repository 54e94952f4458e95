//! SSH sessions driven by the system `ssh` client.
//!
//! huorn does not speak the SSH protocol. An interactive session is a
//! long-lived `ssh -tt` child whose stdin/stdout become a [`Duplex`]; each
//! [`SshSession::execute`] call spawns its own short-lived `ssh` child so
//! one-shot commands never interleave with the interactive stream.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use super::buffer::{BufferLimits, OutputBuffer, Utf8Decoder};
use super::{Duplex, DuplexTransport, Subscription, lock};
use crate::error::{Error, Result};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;
/// Default login user.
pub const DEFAULT_USERNAME: &str = "admin";
/// How long the interactive client must stay alive to count as connected.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(1);

/// First liveness poll interval; doubles up to [`MAX_POLL`].
const FIRST_POLL: Duration = Duration::from_millis(10);
/// Upper bound on the liveness poll interval.
const MAX_POLL: Duration = Duration::from_millis(200);
/// Cap on stderr kept from the interactive client.
const STDERR_LIMIT: usize = 16 * 1024;

/// Connection parameters for [`SshSession::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SshOptions {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Client executable.
    pub program: PathBuf,
    /// `ConnectTimeout` for the interactive session, in seconds.
    pub connect_timeout_secs: u32,
    /// `ConnectTimeout` for one-shot commands, in seconds.
    pub execute_timeout_secs: u32,
    /// Upper bound of the readiness wait.
    pub liveness_window: Duration,
    /// History kept for the interactive stream.
    pub buffer: BufferLimits,
}

impl SshOptions {
    /// Options for `host` with every other field at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_owned(),
            program: PathBuf::from("ssh"),
            connect_timeout_secs: 10,
            execute_timeout_secs: 5,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            buffer: BufferLimits::default(),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the login user.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Uses a different client executable.
    #[must_use]
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Sets the readiness wait bound.
    #[must_use]
    pub const fn liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    /// Client arguments shared by both modes, up to and including the
    /// destination.
    fn base_args(&self, connect_timeout: u32) -> Vec<OsString> {
        [
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            "UserKnownHostsFile=/dev/null".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={connect_timeout}"),
        ]
        .into_iter()
        .map(OsString::from)
        .collect()
    }

    /// Arguments for the long-lived interactive client.
    pub fn interactive_args(&self) -> Vec<OsString> {
        let mut args = self.base_args(self.connect_timeout_secs);
        args.push("-tt".into());
        args.extend(self.target_args());
        args
    }

    /// Arguments for a one-shot command (no pseudo-terminal).
    pub fn execute_args(&self, command: &str) -> Vec<OsString> {
        let mut args = self.base_args(self.execute_timeout_secs);
        args.extend(self.target_args());
        args.push(command.into());
        args
    }

    /// `-p PORT user@host`.
    fn target_args(&self) -> [OsString; 3] {
        [
            "-p".into(),
            self.port.to_string().into(),
            format!("{}@{}", self.username, self.host).into(),
        ]
    }
}

/// Connection state of an [`SshSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionState {
    /// The interactive client is running.
    Connected,
    /// The session has been torn down.
    Disconnected,
}

/// Interactive SSH session plus one-shot command execution.
#[derive(Debug)]
pub struct SshSession {
    /// Connection parameters.
    options: SshOptions,
    /// Interactive client stdin/stdout.
    duplex: Duplex,
    /// Interactive client; `None` after disconnect.
    child: Mutex<Option<Child>>,
    /// Drains the interactive client's stderr.
    stderr_task: Mutex<Option<JoinHandle<String>>>,
}

impl SshSession {
    /// Spawns the interactive client and waits until it looks connected.
    ///
    /// The client counts as connected once it prints anything on stdout or
    /// stays alive for the liveness window, whichever comes first. If it
    /// exits earlier, its stderr becomes the error.
    pub async fn connect(options: SshOptions) -> Result<Self> {
        let mut child = Command::new(&options.program)
            .args(options.interactive_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ConnectionFailed(format!("cannot run {}: {e}", options.program.display()))
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(Error::ConnectionFailed("client stdio unavailable".into()));
        };

        let duplex = Duplex::spawn("ssh", stdout, stdin, options.buffer);
        let stderr_task = tokio::spawn(drain_stderr(stderr));
        let probe = duplex.attach();

        match wait_ready(&mut child, probe, options.liveness_window).await? {
            Readiness::Ready => {}
            Readiness::Exited => {
                duplex.close();
                let stderr = stderr_task.await.unwrap_or_default();
                return Err(connect_error(&stderr));
            }
        }
        duplex.detach();

        tracing::info!(host = %options.host, port = options.port, user = %options.username, "ssh connected");
        Ok(Self {
            options,
            duplex,
            child: Mutex::new(Some(child)),
            stderr_task: Mutex::new(Some(stderr_task)),
        })
    }

    /// Connection parameters.
    pub const fn options(&self) -> &SshOptions {
        &self.options
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        if lock(&self.child).is_some() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    /// Returns `true` while the interactive client is running.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Runs `command` in a separate, non-interactive client.
    ///
    /// Returns stdout on success. A nonzero exit yields
    /// [`Error::CommandFailed`] carrying the command's stderr.
    pub async fn execute(&self, command: &str) -> Result<String> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let output = Command::new(&self.options.program)
            .args(self.options.execute_args(command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = without_host_key_notices(&String::from_utf8_lossy(&output.stderr));
            tracing::debug!(host = %self.options.host, status = %output.status, "ssh command failed");
            Err(Error::CommandFailed(stderr))
        }
    }

    /// Writes raw bytes to the interactive session.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.duplex.send(bytes).await
    }

    /// Writes text to the interactive session.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    /// Attaches a subscriber to the interactive output.
    pub fn attach(&self) -> Subscription {
        self.duplex.attach()
    }

    /// Detaches the current subscriber.
    pub fn detach(&self) {
        self.duplex.detach();
    }

    /// Copy of the buffered interactive output.
    pub fn output(&self) -> String {
        self.duplex.snapshot()
    }

    /// Kills the interactive client and closes the transport. Idempotent.
    pub fn disconnect(&self) {
        let Some(mut child) = lock(&self.child).take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "ssh client already gone");
        }
        self.duplex.close();
        if let Some(task) = lock(&self.stderr_task).take() {
            task.abort();
        }
        tracing::info!(host = %self.options.host, "ssh disconnected");
    }
}

impl DuplexTransport for SshSession {
    fn duplex(&self) -> &Duplex {
        &self.duplex
    }

    fn close(&self) {
        self.disconnect();
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Outcome of the readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// Client printed output or outlived the window.
    Ready,
    /// Client exited first.
    Exited,
}

/// Polls `child` with exponential backoff until it produces output, exits,
/// or survives `window`.
async fn wait_ready(child: &mut Child, mut probe: Subscription, window: Duration) -> Result<Readiness> {
    let deadline = Instant::now() + window;
    let mut interval = FIRST_POLL;

    loop {
        if child.try_wait()?.is_some() {
            return Ok(Readiness::Exited);
        }
        if probe.try_recv().is_some() {
            return Ok(Readiness::Ready);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(Readiness::Ready);
        }
        sleep(interval.min(deadline - now)).await;
        interval = (interval * 2).min(MAX_POLL);
    }
}

/// Reads stderr to completion, keeping the most recent [`STDERR_LIMIT`] bytes.
async fn drain_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = OutputBuffer::new(BufferLimits::new(STDERR_LIMIT, 0));
    let mut decoder = Utf8Decoder::default();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => kept.append(&decoder.decode(&buf[..n])),
        }
    }
    kept.as_str().to_owned()
}

/// Maps the stderr of a client that died during connect to an error.
fn connect_error(stderr: &str) -> Error {
    let stderr = without_host_key_notices(stderr);
    let reason = stderr.trim();
    if reason.to_ascii_lowercase().contains("timed out") {
        Error::Timeout
    } else if reason.is_empty() {
        Error::ConnectionFailed("ssh exited before connecting".into())
    } else {
        Error::ConnectionFailed(reason.to_owned())
    }
}

/// Drops the client's `Warning: Permanently added ...` lines; every other
/// line is kept verbatim.
fn without_host_key_notices(stderr: &str) -> String {
    stderr
        .split_inclusive('\n')
        .filter(|line| !line.trim_start().starts_with(HOST_KEY_NOTICE))
        .collect()
}

/// Prefix of the notice printed when a host key is recorded.
const HOST_KEY_NOTICE: &str = "Warning: Permanently added";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_args_force_tty_and_skip_host_keys() {
        let opts = SshOptions::new("10.0.0.5").port(2222).username("dev");
        let args: Vec<String> = opts
            .interactive_args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            [
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ConnectTimeout=10",
                "-tt",
                "-p",
                "2222",
                "dev@10.0.0.5",
            ]
        );
    }

    #[test]
    fn execute_args_omit_tty_and_end_with_command() {
        let opts = SshOptions::new("host");
        let args: Vec<String> = opts
            .execute_args("uname -a")
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert!(!args.iter().any(|a| a == "-tt"));
        assert!(args.contains(&"ConnectTimeout=5".to_owned()));
        assert_eq!(args.last().map(String::as_str), Some("uname -a"));
        assert!(args.contains(&"admin@host".to_owned()));
        assert!(args.contains(&"22".to_owned()));
    }

    #[test]
    fn connect_errors_from_stderr() {
        assert!(matches!(
            connect_error("ssh: connect to host x port 22: Connection timed out\n"),
            Error::Timeout
        ));
        match connect_error("Connection refused\n") {
            Error::ConnectionFailed(msg) => assert_eq!(msg, "Connection refused"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(connect_error(""), Error::ConnectionFailed(_)));
    }

    #[test]
    fn host_key_notices_are_not_reported() {
        let stderr = "Warning: Permanently added '10.0.0.5' (ED25519) to the list of known hosts.\r\n\
                      admin@10.0.0.5: Permission denied (publickey).\r\n";
        match connect_error(stderr) {
            Error::ConnectionFailed(msg) => {
                assert_eq!(msg, "admin@10.0.0.5: Permission denied (publickey).");
            }
            other => panic!("unexpected {other:?}"),
        }

        let notice_only = "Warning: Permanently added 'vm' (ED25519) to the list of known hosts.\n";
        match connect_error(notice_only) {
            Error::ConnectionFailed(msg) => assert_eq!(msg, "ssh exited before connecting"),
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            without_host_key_notices("first\nWarning: Permanently added 'x'.\nlast"),
            "first\nlast"
        );
    }

    /// Stand-in client: `-tt` echoes stdin, `@refused`/`@slow` hosts fail,
    /// one-shot commands starting with `fail` exit 1.
    #[cfg(unix)]
    const FAKE_SSH: &str = r#"#!/bin/sh
for arg in "$@"; do last="$arg"; done
case "$*" in
  *@refused*)
    echo "Warning: Permanently added 'refused' (ED25519) to the list of known hosts." >&2
    echo "ssh: connect to host refused port 22: Connection refused" >&2; exit 255 ;;
  *@slow*) echo "ssh: connect to host slow port 22: Operation timed out" >&2; exit 255 ;;
esac
case " $* " in
  *" -tt "*) exec cat ;;
esac
case "$last" in
  fail*)
    echo "Warning: Permanently added 'vm.local' (ED25519) to the list of known hosts." >&2
    echo "no such command" >&2; exit 1 ;;
  *) printf 'ran: %s\n' "$last" ;;
esac
"#;

    // One test so the script is written before any client is spawned.
    #[cfg(unix)]
    #[tokio::test]
    async fn fake_client_session() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let program = tmp.path().join("ssh");
        std::fs::write(&program, FAKE_SSH).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Failing clients get the full window to exit; the healthy one only
        // needs to outlive a short one.
        let opts = |host: &str, window_ms: u64| {
            SshOptions::new(host)
                .program(&program)
                .liveness_window(Duration::from_millis(window_ms))
        };

        match SshSession::connect(opts("refused", 3000)).await {
            Err(Error::ConnectionFailed(msg)) => {
                assert!(msg.contains("Connection refused"));
                assert!(!msg.contains("Warning"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            SshSession::connect(opts("slow", 3000)).await,
            Err(Error::Timeout)
        ));

        let session = SshSession::connect(opts("vm.local", 200)).await.unwrap();
        assert!(session.is_connected());

        let mut sub = session.attach();
        session.send_text("hello\n").await.unwrap();
        let mut got = Vec::new();
        while !String::from_utf8_lossy(&got).contains("hello") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            got.extend(chunk);
        }
        assert!(session.output().contains("hello"));

        assert_eq!(session.execute("uptime").await.unwrap(), "ran: uptime\n");
        match session.execute("fail now").await {
            Err(Error::CommandFailed(stderr)) => assert_eq!(stderr, "no such command\n"),
            other => panic!("unexpected {other:?}"),
        }

        session.disconnect();
        session.disconnect();
        assert!(!session.is_connected());
        assert!(matches!(session.execute("uptime").await, Err(Error::NotConnected)));
        assert!(matches!(session.send(b"x").await, Err(Error::NotConnected)));
    }
}
