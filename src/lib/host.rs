use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::contract::HypervisorConnectionConfig;
use crate::error::Result;
use crate::files::{FileTransfer, LocalFiles};
use crate::shell::{LocalShell, SecureShell, ShellExecutor};
use crate::ssh::{SecureFileTransfer, SshConnection};

/// Shell and file access to the hypervisor host, chosen once per request.
#[derive(Clone)]
pub struct HostAccess {
    pub shell: Arc<dyn ShellExecutor>,
    pub files: Arc<dyn FileTransfer>,
    ssh: Option<Arc<SshConnection>>,
}

impl HostAccess {
    pub fn local() -> Self {
        HostAccess {
            shell: Arc::new(LocalShell::new()),
            files: Arc::new(LocalFiles::new()),
            ssh: None,
        }
    }

    pub fn secure(conn: SshConnection) -> Self {
        let conn = Arc::new(conn);
        HostAccess {
            shell: Arc::new(SecureShell::new(conn.clone())),
            files: Arc::new(SecureFileTransfer::new(conn.clone())),
            ssh: Some(conn),
        }
    }

    /// Any pair of capabilities, for callers that bring their own.
    pub fn custom(shell: Arc<dyn ShellExecutor>, files: Arc<dyn FileTransfer>) -> Self {
        HostAccess {
            shell,
            files,
            ssh: None,
        }
    }

    pub async fn connect(
        config: &HypervisorConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if config.is_local_shell {
            debug!("using local shell");
            return Ok(Self::local());
        }
        let conn = SshConnection::open(&config.ssh, cancel).await?;
        Ok(Self::secure(conn))
    }

    /// Closes the SSH connection, if any. Failures are logged only.
    pub async fn close(&self) {
        if let Some(conn) = &self.ssh {
            let _ = conn.close().await;
        }
    }
}
