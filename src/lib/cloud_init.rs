//! Cloud-init seed documents and their packaging into an ISO image.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::contract::UserVmConfig;
use crate::error::{ProvisionError, Result};
use crate::host::HostAccess;
use crate::shell::run_tool;

pub const META_DATA_FILE: &str = "meta-data";
pub const USER_DATA_FILE: &str = "user-data";
pub const NETWORK_CONFIG_FILE: &str = "network-config";
pub const SEED_VOLUME_ID: &str = "cidata";
pub const SUDO_ALL: &str = "ALL=(ALL) NOPASSWD:ALL";
const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";
const INTERFACE: &str = "eth0";

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MetaData {
    #[serde(rename = "instance-id")]
    pub instance_id: String,
    #[serde(rename = "local-hostname")]
    pub local_hostname: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CloudUser {
    pub name: String,
    pub sudo: String,
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct UserData {
    pub hostname: String,
    pub manage_etc_hosts: bool,
    pub disable_root_pw: bool,
    pub users: Vec<CloudUser>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MacMatch {
    pub macaddress: String,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct Nameservers {
    pub addresses: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Ethernet {
    pub dhcp4: bool,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub mac_match: Option<MacMatch>,
    #[serde(rename = "set-name", skip_serializing_if = "Option::is_none")]
    pub set_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub gateway4: String,
    pub nameservers: Nameservers,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Network {
    pub version: u8,
    pub ethernets: BTreeMap<String, Ethernet>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub network: Network,
}

/// Everything the seed documents are generated from.
#[derive(Debug, Clone, Default)]
pub struct CloudInitParams {
    pub name: String,
    pub instance_id: String,
    pub user: String,
    pub authorized_keys: Vec<String>,
    pub disable_root_pw: bool,
    pub ip_address: String,
    pub gateway_address: String,
    pub mac_address: String,
    pub nameservers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudInitDocumentSet {
    pub meta_data: MetaData,
    pub user_data: UserData,
    pub network_config: NetworkConfig,
}

impl CloudInitDocumentSet {
    pub fn new(params: &CloudInitParams) -> Self {
        let meta_data = MetaData {
            instance_id: params.instance_id.clone(),
            local_hostname: params.name.clone(),
        };

        let user_data = UserData {
            hostname: params.name.clone(),
            manage_etc_hosts: true,
            disable_root_pw: params.disable_root_pw,
            users: vec![CloudUser {
                name: params.user.clone(),
                sudo: SUDO_ALL.to_string(),
                ssh_authorized_keys: params.authorized_keys.clone(),
            }],
        };

        let (mac_match, set_name) = if params.mac_address.is_empty() {
            (None, None)
        } else {
            (
                Some(MacMatch {
                    macaddress: params.mac_address.to_lowercase(),
                }),
                Some(INTERFACE.to_string()),
            )
        };
        let addresses = if params.ip_address.is_empty() {
            vec![]
        } else {
            vec![format!("{}/24", params.ip_address)]
        };
        let eth0 = Ethernet {
            dhcp4: false,
            mac_match,
            set_name,
            addresses,
            gateway4: params.gateway_address.clone(),
            nameservers: Nameservers {
                addresses: params.nameservers.clone(),
            },
        };
        let network_config = NetworkConfig {
            network: Network {
                version: 2,
                ethernets: BTreeMap::from([(INTERFACE.to_string(), eth0)]),
            },
        };

        CloudInitDocumentSet {
            meta_data,
            user_data,
            network_config,
        }
    }

    fn yaml<T: Serialize>(what: &str, value: &T) -> Result<String> {
        serde_yaml::to_string(value).map_err(|e| ProvisionError::Serialize {
            what: what.to_string(),
            reason: e.to_string(),
        })
    }

    /// The three documents under their fixed file names.
    pub fn documents(&self) -> Result<Vec<(&'static str, Vec<u8>)>> {
        let meta =
            serde_json::to_vec_pretty(&self.meta_data).map_err(|e| ProvisionError::Serialize {
                what: META_DATA_FILE.to_string(),
                reason: e.to_string(),
            })?;
        let user = format!(
            "{CLOUD_CONFIG_HEADER}{}",
            Self::yaml(USER_DATA_FILE, &self.user_data)?
        );
        let network = Self::yaml(NETWORK_CONFIG_FILE, &self.network_config)?;
        Ok(vec![
            (META_DATA_FILE, meta),
            (USER_DATA_FILE, user.into_bytes()),
            (NETWORK_CONFIG_FILE, network.into_bytes()),
        ])
    }
}

fn join(dir: &str, file: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file)
}

/// Millisecond timestamp used in instance ids and scratch paths.
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S%3f").to_string()
}

pub fn instance_id(name: &str, timestamp: &str) -> String {
    format!("{name}-{timestamp}")
}

pub fn scratch_dir(root: &str, name: &str, timestamp: &str) -> String {
    join(&join(root, name), timestamp)
}

/// Key contents from the request plus the trimmed contents of each key
/// file, without duplicates.
pub async fn resolve_authorized_keys(user: &UserVmConfig) -> Result<Vec<String>> {
    let mut keys: Vec<String> = Vec::new();
    let mut push = |key: &str| {
        let key = key.trim();
        if !key.is_empty() && !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    };
    for key in &user.authorized_key_contents {
        push(key);
    }
    for path in &user.authorized_key_paths {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProvisionError::io(path.as_str(), e))?;
        push(&contents);
    }
    Ok(keys)
}

/// Writes a [`CloudInitDocumentSet`] to the hypervisor host and packages it.
pub struct CloudInitGenerator<'a> {
    documents: &'a CloudInitDocumentSet,
    host: &'a HostAccess,
    iso_tool: &'a str,
}

impl<'a> CloudInitGenerator<'a> {
    pub fn new(
        documents: &'a CloudInitDocumentSet,
        host: &'a HostAccess,
        iso_tool: &'a str,
    ) -> Self {
        CloudInitGenerator {
            documents,
            host,
            iso_tool,
        }
    }

    /// Writes the documents under `base_path` and packages them into
    /// `base_path/filename`. On failure the directory is removed again, even
    /// when `cancel` has already fired.
    pub async fn write_to_disk(
        &self,
        cancel: &CancellationToken,
        base_path: &str,
        filename: &str,
    ) -> Result<String> {
        if filename.is_empty() {
            return Err(ProvisionError::InvalidRequest(
                "cloud-init image file name is empty".to_string(),
            ));
        }
        self.host.files.mkdir_all(cancel, base_path).await?;

        match self.package(cancel, base_path, filename).await {
            Ok(iso) => {
                info!("cloud-init seed written to {iso}");
                Ok(iso)
            }
            Err(e) => {
                warn!("cloud-init packaging in {base_path} failed, removing it: {e}");
                let cleanup_token = CancellationToken::new();
                if let Err(cleanup) = self.remove_from_disk(&cleanup_token, base_path).await {
                    error!("could not remove {base_path}: {cleanup}");
                }
                Err(e)
            }
        }
    }

    async fn package(
        &self,
        cancel: &CancellationToken,
        base_path: &str,
        filename: &str,
    ) -> Result<String> {
        let iso = join(base_path, filename);
        let mut args = vec![
            "-output".to_string(),
            iso.clone(),
            "-volid".to_string(),
            SEED_VOLUME_ID.to_string(),
            "-joliet".to_string(),
            "-r".to_string(),
        ];
        for (name, data) in self.documents.documents()? {
            let path = join(base_path, name);
            self.host.files.write_file(cancel, &path, &data).await?;
            args.push(path);
        }
        run_tool(self.host.shell.as_ref(), cancel, self.iso_tool, &args).await?;
        Ok(iso)
    }

    pub async fn remove_from_disk(
        &self,
        cancel: &CancellationToken,
        base_path: &str,
    ) -> Result<()> {
        self.host.files.remove_all(cancel, base_path).await
    }
}
