//! Secure-shell access to a remote hypervisor host.
//!
//! One OpenSSH control-master connection is opened per request; every
//! command and file transfer then runs as its own session multiplexed over
//! that connection.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::contract::SshConfig;
use crate::error::{ProvisionError, Result};
use crate::files::FileTransfer;
use crate::required::RequiredFieldSet;
use crate::shell::{run_command, shell_quote};
use crate::structs::DEFAULT_SSH_PORT;

const SSH: &str = "ssh";
const SSHPASS: &str = "sshpass";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    Strict,
    Ignore,
}

impl HostKeyPolicy {
    pub fn from_callback_name(name: &str) -> Result<Self> {
        match name {
            "" | "KnownHosts" => Ok(HostKeyPolicy::Strict),
            "InsecureIgnoreHostKey" => Ok(HostKeyPolicy::Ignore),
            other => Err(ProvisionError::Connection(format!(
                "unsupported host key callback '{other}'"
            ))),
        }
    }

    fn options(self) -> Vec<String> {
        match self {
            HostKeyPolicy::Strict => vec!["-o".into(), "StrictHostKeyChecking=yes".into()],
            HostKeyPolicy::Ignore => vec![
                "-o".into(),
                "StrictHostKeyChecking=no".into(),
                "-o".into(),
                "UserKnownHostsFile=/dev/null".into(),
            ],
        }
    }
}

#[derive(Debug)]
pub struct SshConnection {
    program: PathBuf,
    destination: String,
    port: u16,
    control_path: PathBuf,
    auth_options: Vec<String>,
    password: Option<String>,
}

impl SshConnection {
    /// Validates `config` without touching the network.
    pub fn from_config(config: &SshConfig) -> Result<Self> {
        let mut required = RequiredFieldSet::new(["ssh host", "ssh user"]);
        if !config.host.is_empty() {
            required.mark("ssh host");
        }
        if !config.user.is_empty() {
            required.mark("ssh user");
        }
        required.verify("ssh connection")?;

        let mut auth_options =
            HostKeyPolicy::from_callback_name(&config.hostkey_callback_name)?.options();
        let mut password = None;
        let key = &config.privkey_auth_config;
        if !key.path.is_empty() {
            if !key.passphrase.is_empty() {
                return Err(ProvisionError::Connection(format!(
                    "private key {} is passphrase protected; load it into ssh-agent instead",
                    key.path
                )));
            }
            auth_options.extend([
                "-i".to_string(),
                key.path.clone(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
            ]);
        } else if !config.password_auth_config.password.is_empty() {
            password = Some(config.password_auth_config.password.clone());
        }
        if password.is_none() {
            auth_options.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }

        let control_path = std::env::temp_dir().join(format!(
            "virt-provisioner-{}.sock",
            uuid::Uuid::new_v4().simple()
        ));

        Ok(SshConnection {
            program: PathBuf::from(SSH),
            destination: format!("{}@{}", config.user, config.host),
            port: if config.port == 0 {
                DEFAULT_SSH_PORT
            } else {
                config.port
            },
            control_path,
            auth_options,
            password,
        })
    }

    /// Starts the control master in the background.
    pub async fn open(config: &SshConfig, cancel: &CancellationToken) -> Result<Self> {
        let conn = Self::from_config(config)?;
        info!("opening SSH connection to {}:{}", conn.destination, conn.port);

        let mut cmd = match &conn.password {
            Some(password) => {
                let mut cmd = Command::new(SSHPASS);
                cmd.arg("-e").env("SSHPASS", password).arg(&conn.program);
                cmd
            }
            None => Command::new(&conn.program),
        };
        cmd.args(conn.master_args());

        let line = format!("{SSH} -N -f {}", conn.destination);
        let mut out: Vec<u8> = Vec::new();
        let mut err: Vec<u8> = Vec::new();
        if let Err(e) = run_command(cmd, &line, cancel, None, &mut out, &mut err).await {
            let stderr = String::from_utf8_lossy(&err).trim().to_string();
            error!("could not open SSH connection to {}: {e}: {stderr}", conn.destination);
            return Err(ProvisionError::Connection(format!(
                "ssh {}: {e}: {stderr}",
                conn.destination
            )));
        }
        Ok(conn)
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn master_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-N".to_string(),
            "-f".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        args.extend(self.auth_options.iter().cloned());
        args.push(self.destination.clone());
        args
    }

    fn session_args(&self, remote_command: &str) -> Vec<String> {
        vec![
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.destination.clone(),
            "--".to_string(),
            remote_command.to_string(),
        ]
    }

    /// A session running `remote_command` on the shared connection.
    pub fn session(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.session_args(remote_command));
        cmd
    }

    pub async fn close(&self) -> Result<()> {
        debug!("closing SSH connection to {}", self.destination);
        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(&self.destination);
        let mut out: Vec<u8> = Vec::new();
        let mut err: Vec<u8> = Vec::new();
        run_command(
            cmd,
            "ssh -O exit",
            &CancellationToken::new(),
            None,
            &mut out,
            &mut err,
        )
        .await
        .map_err(|e| {
            warn!("failed to close SSH connection to {}: {e}", self.destination);
            ProvisionError::Connection(e.to_string())
        })
    }
}

/// File transfer through sessions on an [`SshConnection`].
#[derive(Clone)]
pub struct SecureFileTransfer {
    conn: std::sync::Arc<SshConnection>,
}

impl SecureFileTransfer {
    pub fn new(conn: std::sync::Arc<SshConnection>) -> Self {
        SecureFileTransfer { conn }
    }

    async fn remote(
        &self,
        cancel: &CancellationToken,
        path: &str,
        script: String,
        stdin: Option<&[u8]>,
    ) -> Result<()> {
        let mut out: Vec<u8> = Vec::new();
        let mut err: Vec<u8> = Vec::new();
        let session = self.conn.session(&script);
        if let Err(e) = run_command(session, &script, cancel, stdin, &mut out, &mut err).await {
            let stderr = String::from_utf8_lossy(&err).trim().to_string();
            return Err(ProvisionError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::Other, format!("{e}: {stderr}")),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl FileTransfer for SecureFileTransfer {
    fn name(&self) -> &'static str {
        "secure-file-transfer"
    }

    async fn mkdir_all(&self, cancel: &CancellationToken, path: &str) -> Result<()> {
        let p = shell_quote(path);
        debug!("creating directory {path} on {}", self.conn.destination());
        self.remote(cancel, path, format!("mkdir -p {p} && chmod 0777 {p}"), None)
            .await
    }

    async fn write_file(
        &self,
        cancel: &CancellationToken,
        path: &str,
        data: &[u8],
    ) -> Result<()> {
        let p = shell_quote(path);
        debug!("writing {} bytes to {path} on {}", data.len(), self.conn.destination());
        self.remote(cancel, path, format!("cat > {p} && chmod 0777 {p}"), Some(data))
            .await
    }

    async fn remove_all(&self, cancel: &CancellationToken, path: &str) -> Result<()> {
        debug!("removing {path} on {}", self.conn.destination());
        self.remote(cancel, path, format!("rm -rf {}", shell_quote(path)), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{PasswordAuthConfig, PrivateKeyAuthConfig};
    use crate::error::ShellError;
    use crate::shell::{SecureShell, ShellExecutor};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    /// Runs the remote command on this host instead of dialing out.
    const LOOPBACK_SSH: &str = "#!/bin/sh
case \" $* \" in *\" -O exit \"*) exit 0 ;; esac
for last; do :; done
exec sh -c \"$last\"
";

    fn config() -> SshConfig {
        SshConfig {
            user: "ops".to_string(),
            host: "hv1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn host_and_user_are_required() {
        let err = SshConnection::from_config(&SshConfig::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "ssh connection is missing required fields: [ssh host, ssh user]"
        );
    }

    #[test]
    fn key_auth_builds_batch_session() {
        let mut cfg = config();
        cfg.port = 2222;
        cfg.hostkey_callback_name = "InsecureIgnoreHostKey".to_string();
        cfg.privkey_auth_config = PrivateKeyAuthConfig {
            path: "/keys/id_ed25519".to_string(),
            passphrase: String::new(),
        };
        let conn = SshConnection::from_config(&cfg).unwrap();
        assert_eq!(conn.destination(), "ops@hv1");
        assert!(conn.password.is_none());

        let master = conn.master_args();
        assert!(master.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(master.contains(&"/keys/id_ed25519".to_string()));
        assert!(master.contains(&"BatchMode=yes".to_string()));
        assert_eq!(master.last().unwrap(), "ops@hv1");

        let session = conn.session_args("mkdir -p /x");
        assert_eq!(&session[session.len() - 3..], ["ops@hv1", "--", "mkdir -p /x"]);
        assert!(session.contains(&"2222".to_string()));
    }

    #[test]
    fn password_auth_goes_through_sshpass() {
        let mut cfg = config();
        cfg.password_auth_config = PasswordAuthConfig {
            password: "hunter2".to_string(),
        };
        let conn = SshConnection::from_config(&cfg).unwrap();
        assert_eq!(conn.password.as_deref(), Some("hunter2"));
        assert_eq!(conn.port, DEFAULT_SSH_PORT);
        assert!(!conn.master_args().contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn rejects_unknown_policy_and_encrypted_keys() {
        let mut cfg = config();
        cfg.hostkey_callback_name = "FixedHostKey".to_string();
        assert!(matches!(
            SshConnection::from_config(&cfg),
            Err(ProvisionError::Connection(_))
        ));

        let mut cfg = config();
        cfg.privkey_auth_config.path = "/keys/id_rsa".to_string();
        cfg.privkey_auth_config.passphrase = "secret".to_string();
        assert!(matches!(
            SshConnection::from_config(&cfg),
            Err(ProvisionError::Connection(_))
        ));
    }

    fn loopback(scratch: &std::path::Path) -> SshConnection {
        let program = scratch.join("ssh");
        std::fs::write(&program, LOOPBACK_SSH).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut conn = SshConnection::from_config(&config()).unwrap();
        conn.program = program;
        conn
    }

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn secure_shell_reports_each_stage() {
        let scratch = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let mut out: Vec<u8> = Vec::new();
        let mut err: Vec<u8> = Vec::new();

        let shell = SecureShell::new(Arc::new(loopback(scratch.path())));
        shell
            .execute(&token, &mut out, &mut err, "echo", &args(&["hello world"]))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out), "hello world\n");

        let failed = shell
            .execute(&token, &mut out, &mut err, "sh", &args(&["-c", "echo gone >&2; exit 3"]))
            .await;
        match failed {
            Err(ShellError::Run { command, status }) => {
                assert_eq!(command, "sh -c 'echo gone >&2; exit 3'");
                assert!(status.contains('3'));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(String::from_utf8_lossy(&err), "gone\n");

        let mut missing = loopback(scratch.path());
        missing.program = scratch.path().join("no-such-ssh");
        let unstarted = SecureShell::new(Arc::new(missing))
            .execute(&token, &mut out, &mut err, "true", &[])
            .await;
        assert!(matches!(unstarted, Err(ShellError::Start { .. })));
    }

    #[tokio::test]
    async fn file_transfer_round_trips_through_sessions() {
        let scratch = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let conn = Arc::new(loopback(scratch.path()));
        let files = SecureFileTransfer::new(conn.clone());

        let dir = scratch.path().join("ci").join("web 1");
        let dir = dir.to_str().unwrap().to_string();
        let file = format!("{dir}/user-data");
        files.mkdir_all(&token, &dir).await.unwrap();
        files
            .write_file(&token, &file, b"#cloud-config\nhostname: web-1\n")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "#cloud-config\nhostname: web-1\n"
        );
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        files.remove_all(&token, &dir).await.unwrap();
        assert!(!std::path::Path::new(&dir).exists());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_remote_write_is_an_io_error() {
        let scratch = tempfile::tempdir().unwrap();
        let files = SecureFileTransfer::new(Arc::new(loopback(scratch.path())));
        let target = scratch.path().join("missing-dir").join("meta-data");
        let res = files
            .write_file(&CancellationToken::new(), target.to_str().unwrap(), b"{}")
            .await;
        assert!(matches!(res, Err(ProvisionError::Io { .. })));
    }
}
