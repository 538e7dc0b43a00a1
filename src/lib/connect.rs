//! Assembly of libvirt connection URIs.

use std::fmt;

use crate::contract::LibvirtConfig;
use crate::error::{ProvisionError, Result};
use crate::required::RequiredFieldSet;
use crate::structs::{DEFAULT_CONNECT_HOST, DEFAULT_CONNECT_PATH, DEFAULT_HYPERVISOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectField {
    Hypervisor,
    Transport,
    Host,
    User,
    Keyfile,
    Path,
}

impl fmt::Display for ConnectField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectField::Hypervisor => "hypervisor",
            ConnectField::Transport => "transport",
            ConnectField::Host => "host",
            ConnectField::User => "user",
            ConnectField::Keyfile => "keyfile",
            ConnectField::Path => "path",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    hypervisor: String,
    transport: String,
    host: String,
    user: String,
    keyfile: String,
    path: String,
    required: RequiredFieldSet<ConnectField>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        ConnectionBuilder {
            hypervisor: DEFAULT_HYPERVISOR.to_string(),
            transport: String::new(),
            host: DEFAULT_CONNECT_HOST.to_string(),
            user: String::new(),
            keyfile: String::new(),
            path: DEFAULT_CONNECT_PATH.to_string(),
            required: RequiredFieldSet::default(),
        }
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields the caller insists on; `finalize` fails until each is set.
    pub fn requiring(mut self, fields: impl IntoIterator<Item = ConnectField>) -> Self {
        for field in fields {
            self.required.require(field);
        }
        self
    }

    fn set(&mut self, field: ConnectField, value: &str) -> String {
        if value.is_empty() {
            self.required.unmark(field);
        } else {
            self.required.mark(field);
        }
        value.to_string()
    }

    pub fn with_hypervisor(mut self, hypervisor: &str) -> Self {
        self.hypervisor = self.set(ConnectField::Hypervisor, hypervisor);
        self
    }

    pub fn with_transport(mut self, transport: &str) -> Self {
        self.transport = self.set(ConnectField::Transport, transport);
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = self.set(ConnectField::Host, host);
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = self.set(ConnectField::User, user);
        self
    }

    pub fn with_keyfile(mut self, keyfile: &str) -> Self {
        self.keyfile = self.set(ConnectField::Keyfile, keyfile);
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = self.set(ConnectField::Path, path);
        self
    }

    pub fn connect_as_root(self, as_root: bool) -> Self {
        self.with_path(if as_root { "system" } else { "session" })
    }

    pub fn finalize(&self) -> Result<String> {
        self.required.verify("libvirt connection")?;

        let mut uri = self.hypervisor.clone();
        if !self.transport.is_empty() {
            uri.push('+');
            uri.push_str(&self.transport);
        }
        uri.push_str("://");
        if !self.host.is_empty() {
            if !self.user.is_empty() {
                uri.push_str(&self.user);
                uri.push('@');
            }
            uri.push_str(&self.host);
        }
        uri.push('/');
        uri.push_str(self.path.trim_start_matches('/'));
        if !self.keyfile.is_empty() {
            uri.push_str("?keyfile=");
            uri.push_str(&query_escape(&self.keyfile));
        }
        Ok(uri)
    }
}

/// Escapes a query value the way HTML form encoding does.
pub fn query_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Resolves the libvirt URI for a request's connection block.
pub fn resolve_uri(config: &LibvirtConfig) -> Result<String> {
    if !config.connection_url.is_empty() {
        if !config.connection_url.contains("://") {
            return Err(ProvisionError::InvalidRequest(format!(
                "invalid connection url '{}'",
                config.connection_url
            )));
        }
        let mut uri = config.connection_url.clone();
        if !config.keyfile_path.is_empty() {
            uri.push(if uri.contains('?') { '&' } else { '?' });
            uri.push_str("keyfile=");
            uri.push_str(&query_escape(&config.keyfile_path));
        }
        return Ok(uri);
    }

    let mut builder = ConnectionBuilder::new();
    if config.transport == "ssh" {
        builder = builder.requiring([ConnectField::Host, ConnectField::User]);
    }
    if !config.hypervisor.is_empty() {
        builder = builder.with_hypervisor(&config.hypervisor);
    }
    if !config.path.is_empty() {
        builder = builder.with_path(&config.path);
    }
    builder
        .with_transport(&config.transport)
        .with_host(&config.host)
        .with_user(&config.user)
        .with_keyfile(&config.keyfile_path)
        .finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn ssh_uri_with_keyfile() {
        let uri = ConnectionBuilder::new()
            .with_hypervisor("qemu")
            .with_transport("ssh")
            .with_user("u")
            .with_host("h")
            .with_keyfile("/k")
            .finalize()
            .unwrap();
        assert_eq!(uri, "qemu+ssh://u@h/system?keyfile=%2Fk");
    }

    #[test]
    fn defaults_to_local_system() {
        let uri = ConnectionBuilder::new().finalize().unwrap();
        assert_eq!(uri, "qemu://localhost/system");
        let uri = ConnectionBuilder::new()
            .with_host("")
            .connect_as_root(false)
            .finalize()
            .unwrap();
        assert_eq!(uri, "qemu:///session");
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![ConnectField::Host], vec!["host"])]
    #[case(vec![ConnectField::Host, ConnectField::Keyfile], vec!["host", "keyfile"])]
    #[case(
        vec![ConnectField::User, ConnectField::Keyfile, ConnectField::Transport],
        vec!["transport", "user", "keyfile"]
    )]
    fn names_exactly_the_unset_fields(
        #[case] unset: Vec<ConnectField>,
        #[case] expected: Vec<&str>,
    ) {
        let all = [
            ConnectField::Transport,
            ConnectField::Host,
            ConnectField::User,
            ConnectField::Keyfile,
        ];
        let mut builder = ConnectionBuilder::new().requiring(all);
        if !unset.contains(&ConnectField::Transport) {
            builder = builder.with_transport("ssh");
        }
        if !unset.contains(&ConnectField::Host) {
            builder = builder.with_host("h");
        }
        if !unset.contains(&ConnectField::User) {
            builder = builder.with_user("u");
        }
        if !unset.contains(&ConnectField::Keyfile) {
            builder = builder.with_keyfile("/k");
        }
        match builder.finalize() {
            Ok(_) => assert!(expected.is_empty()),
            Err(ProvisionError::Configuration { missing, .. }) => assert_eq!(missing, expected),
            Err(e) => panic!("unexpected {e}"),
        }
    }

    #[test]
    fn verbatim_url_gets_keyfile_appended() {
        let config = LibvirtConfig {
            connection_url: "qemu+ssh://root@10.0.0.2/system".to_string(),
            keyfile_path: "/root/.ssh/id ed".to_string(),
            ..Default::default()
        };
        assert_eq!(
            resolve_uri(&config).unwrap(),
            "qemu+ssh://root@10.0.0.2/system?keyfile=%2Froot%2F.ssh%2Fid+ed"
        );
    }

    #[test]
    fn ssh_components_require_host_and_user() {
        let config = LibvirtConfig {
            transport: "ssh".to_string(),
            host: String::new(),
            ..Default::default()
        };
        let err = resolve_uri(&config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "libvirt connection is missing required fields: [host, user]"
        );
    }
}
