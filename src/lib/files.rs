use std::os::unix::fs::PermissionsExt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ProvisionError, Result};

pub const PERMISSIVE_MODE: u32 = 0o777;

/// Writing files on the host that runs the hypervisor.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates `path` and its parents with a permissive mode.
    async fn mkdir_all(&self, cancel: &CancellationToken, path: &str) -> Result<()>;

    async fn write_file(&self, cancel: &CancellationToken, path: &str, data: &[u8]) -> Result<()>;

    /// Recursively deletes `path`. A missing path is not an error.
    async fn remove_all(&self, cancel: &CancellationToken, path: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct LocalFiles;

impl LocalFiles {
    pub fn new() -> Self {
        LocalFiles
    }
}

async fn set_permissive(path: &str) -> Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(PERMISSIVE_MODE))
        .await
        .map_err(|e| ProvisionError::io(path, e))
}

#[async_trait]
impl FileTransfer for LocalFiles {
    fn name(&self) -> &'static str {
        "local-files"
    }

    async fn mkdir_all(&self, _cancel: &CancellationToken, path: &str) -> Result<()> {
        debug!("creating directory {path}");
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| ProvisionError::io(path, e))?;
        set_permissive(path).await
    }

    async fn write_file(&self, _cancel: &CancellationToken, path: &str, data: &[u8]) -> Result<()> {
        debug!("writing {} bytes to {path}", data.len());
        tokio::fs::write(path, data)
            .await
            .map_err(|e| ProvisionError::io(path, e))?;
        set_permissive(path).await
    }

    async fn remove_all(&self, _cancel: &CancellationToken, path: &str) -> Result<()> {
        debug!("removing {path}");
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProvisionError::io(path, e)),
        }
    }
}
