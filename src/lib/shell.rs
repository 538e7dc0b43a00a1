//! Running external commands, locally or over an SSH session.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{ProvisionError, ShellError};
use crate::ssh::SshConnection;

pub type OutputSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

#[async_trait]
pub trait ShellExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs `command` with `args` to completion, streaming its output into
    /// the given sinks. Nothing is retried.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
        command: &str,
        args: &[String],
    ) -> Result<(), ShellError>;
}

/// Quotes `arg` for a POSIX shell when it needs it.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// `command` and `args` joined into a single command line.
pub fn command_line(command: &str, args: &[String]) -> String {
    let mut line = shell_quote(command);
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

/// Spawns `command`, feeds it `stdin`, pumps its output into the sinks and
/// reaps it. The child is killed if the token is cancelled or the future is
/// dropped.
pub(crate) async fn run_command(
    mut command: Command,
    line: &str,
    cancel: &CancellationToken,
    stdin: Option<&[u8]>,
    stdout: OutputSink<'_>,
    stderr: OutputSink<'_>,
) -> Result<(), ShellError> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ShellError::Start {
        command: line.to_string(),
        source,
    })?;
    let child_in = child.stdin.take();
    let child_out = child.stdout.take();
    let child_err = child.stderr.take();

    let feed = async move {
        if let (Some(mut pipe), Some(bytes)) = (child_in, stdin) {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let pump_out = async move {
        if let Some(mut out) = child_out {
            tokio::io::copy(&mut out, stdout).await?;
            stdout.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let pump_err = async move {
        if let Some(mut err) = child_err {
            tokio::io::copy(&mut err, stderr).await?;
            stderr.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let session = async {
        let (fed, out, err) = tokio::join!(feed, pump_out, pump_err);
        let status = child.wait().await;
        (fed.and(out).and(err), status)
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            warn!("cancelled '{line}'");
            Err(ShellError::Cancelled { command: line.to_string() })
        }
        (streams, status) = session => {
            let status = status.map_err(|source| ShellError::Close {
                command: line.to_string(),
                source,
            })?;
            if !status.success() {
                return Err(ShellError::Run {
                    command: line.to_string(),
                    status: status.to_string(),
                });
            }
            match streams {
                Err(e) if e.kind() != std::io::ErrorKind::UnexpectedEof => Err(ShellError::Close {
                    command: line.to_string(),
                    source: e,
                }),
                _ => Ok(()),
            }
        }
    }
}

/// Runs a tool, capturing its stderr into the error on failure.
pub async fn run_tool(
    shell: &dyn ShellExecutor,
    cancel: &CancellationToken,
    tool: &str,
    args: &[String],
) -> crate::error::Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    let mut err: Vec<u8> = Vec::new();
    match shell.execute(cancel, &mut out, &mut err, tool, args).await {
        Ok(()) => Ok(out),
        Err(source) => {
            let stderr = String::from_utf8_lossy(&err).trim().to_string();
            error!("{tool} failed: {stderr}");
            Err(ProvisionError::ExternalTool {
                tool: tool.to_string(),
                stderr,
                source,
            })
        }
    }
}

/// Child processes on this host.
#[derive(Debug, Default, Clone)]
pub struct LocalShell;

impl LocalShell {
    pub fn new() -> Self {
        LocalShell
    }
}

#[async_trait]
impl ShellExecutor for LocalShell {
    fn name(&self) -> &'static str {
        "local-shell"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
        command: &str,
        args: &[String],
    ) -> Result<(), ShellError> {
        let line = command_line(command, args);
        info!("executing command '{line}' locally");
        let mut cmd = Command::new(command);
        cmd.args(args);
        run_command(cmd, &line, cancel, None, stdout, stderr).await
    }
}

/// One SSH session per command on a shared connection.
#[derive(Clone)]
pub struct SecureShell {
    conn: Arc<SshConnection>,
}

impl SecureShell {
    pub fn new(conn: Arc<SshConnection>) -> Self {
        SecureShell { conn }
    }
}

#[async_trait]
impl ShellExecutor for SecureShell {
    fn name(&self) -> &'static str {
        "secure-shell"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
        command: &str,
        args: &[String],
    ) -> Result<(), ShellError> {
        let line = command_line(command, args);
        info!("executing command '{line}' via SSH on {}", self.conn.destination());
        let session = self.conn.session(&line);
        run_command(session, &line, cancel, None, stdout, stderr).await
    }
}
