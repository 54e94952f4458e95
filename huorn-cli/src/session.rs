//! Guest session commands: ssh, exec.

use std::path::PathBuf;

use anyhow::{Context, Result};
use huorn::{SshOptions, SshSession};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Where and as whom to connect.
#[derive(clap::Args)]
pub struct SshTarget {
    /// Guest host name or address.
    pub host: String,

    /// SSH port.
    #[arg(short = 'p', long, default_value_t = huorn::transport::ssh::DEFAULT_PORT)]
    pub port: u16,

    /// Login user.
    #[arg(short = 'l', long = "login", default_value = huorn::transport::ssh::DEFAULT_USERNAME)]
    pub username: String,

    /// SSH client executable.
    #[arg(long, value_name = "PATH", default_value = "ssh")]
    pub ssh_program: PathBuf,
}

impl SshTarget {
    fn options(&self) -> SshOptions {
        SshOptions::new(&self.host)
            .port(self.port)
            .username(&self.username)
            .program(&self.ssh_program)
    }

    async fn connect(&self) -> Result<SshSession> {
        SshSession::connect(self.options())
            .await
            .with_context(|| format!("cannot reach {}@{}:{}", self.username, self.host, self.port))
    }
}

/// Arguments for `huorn ssh`.
#[derive(clap::Args)]
pub struct SshArgs {
    #[command(flatten)]
    pub target: SshTarget,
}

/// Arguments for `huorn exec`.
#[derive(clap::Args)]
pub struct ExecArgs {
    #[command(flatten)]
    pub target: SshTarget,

    /// Command and arguments, run by the guest's shell.
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

/// Bridges local stdin/stdout to an interactive session until either side
/// closes.
pub async fn ssh(args: SshArgs) -> Result<()> {
    let session = args.target.connect().await?;
    let mut output = session.attach();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 1024];

    stdout.write_all(output.snapshot().as_bytes()).await?;
    stdout.flush().await?;

    loop {
        tokio::select! {
            chunk = output.recv() => {
                let Some(chunk) = chunk else { break };
                stdout.write_all(&chunk).await?;
                stdout.flush().await?;
            }
            read = stdin.read(&mut buf) => {
                let n = read.context("cannot read stdin")?;
                if n == 0 {
                    break;
                }
                session.send(&buf[..n]).await?;
            }
        }
    }

    session.disconnect();
    Ok(())
}

/// Runs one command and prints its stdout.
pub async fn exec(args: ExecArgs) -> Result<()> {
    let session = args.target.connect().await?;
    let command = args.command.join(" ");
    let result = session.execute(&command).await;
    session.disconnect();

    let stdout = result.with_context(|| format!("`{command}` failed on {}", args.target.host))?;
    let mut out = tokio::io::stdout();
    out.write_all(stdout.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}
