//! Request and response bodies of the HTTP surface.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GeneralVmConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_vm_name: String,
    #[serde(default)]
    pub vcpu: u32,
    #[serde(default)]
    pub memory_gb: f64,
    #[serde(default)]
    pub disk_gb: f64,
    #[serde(default)]
    pub cow_clone: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UserVmConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub authorized_key_paths: Vec<String>,
    #[serde(default)]
    pub authorized_key_contents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_root_pw: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NetworkVmConfig {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub gateway_address: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub nameservers: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LibvirtConfig {
    /// Used verbatim when set; otherwise the URI is built from the components.
    #[serde(default)]
    pub connection_url: String,
    #[serde(default)]
    pub keyfile_path: String,
    #[serde(default)]
    pub hypervisor: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PasswordAuthConfig {
    #[serde(default)]
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PrivateKeyAuthConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub passphrase: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SshConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub hostkey_callback_name: String,
    #[serde(default)]
    pub password_auth_config: PasswordAuthConfig,
    #[serde(default)]
    pub privkey_auth_config: PrivateKeyAuthConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HypervisorConnectionConfig {
    #[serde(default)]
    pub libvirt: LibvirtConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub is_local_shell: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct VirtualMachineConfig {
    #[serde(flatten)]
    pub general: GeneralVmConfig,
    #[serde(flatten)]
    pub user: UserVmConfig,
    #[serde(flatten)]
    pub network: NetworkVmConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor_connection: Option<HypervisorConnectionConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GeneralSharedConfig {
    #[serde(default)]
    pub base_vm_name: String,
    #[serde(default)]
    pub fleet_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SshSharedConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub authorized_key_paths: Vec<String>,
    #[serde(default)]
    pub authorized_key_contents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_root_pw: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NetworkSharedConfig {
    #[serde(default)]
    pub nameservers: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FleetSharedConfig {
    #[serde(default)]
    pub general: GeneralSharedConfig,
    #[serde(default)]
    pub ssh: SshSharedConfig,
    #[serde(default)]
    pub cloud_init: NetworkSharedConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor_connection: Option<HypervisorConnectionConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FleetConfig {
    #[serde(default)]
    pub shared_config: FleetSharedConfig,
    #[serde(default)]
    pub virtual_machines: Vec<VirtualMachineConfig>,
}

/// Outcome of one VM creation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProvisioningResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ProvisioningResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FleetResult {
    pub sub_results: Vec<ProvisioningResult>,
    pub failed: usize,
    pub success: usize,
    pub total: usize,
}

#[derive(Serialize, Debug, Clone)]
pub struct GenericResponse<T: Serialize> {
    pub body: T,
    pub message: String,
}

impl<T: Serialize> GenericResponse<T> {
    pub fn new(body: T, message: impl Into<String>) -> Self {
        GenericResponse {
            body,
            message: message.into(),
        }
    }
}

/// Canonical shape of a named contract, for the format debug endpoint.
pub fn canonical_contract(name: &str) -> Option<serde_json::Value> {
    let connection = Some(HypervisorConnectionConfig::default());
    let value = match name {
        "virtual_machine" => serde_json::to_value(VirtualMachineConfig {
            hypervisor_connection: connection,
            ..Default::default()
        }),
        "virtual_machine_fleet" => serde_json::to_value(FleetConfig {
            shared_config: FleetSharedConfig {
                hypervisor_connection: connection,
                ..Default::default()
            },
            virtual_machines: vec![VirtualMachineConfig::default()],
        }),
        "virtual_machine_result" => serde_json::to_value(ProvisioningResult::default()),
        "virtual_machine_fleet_result" => serde_json::to_value(FleetResult {
            sub_results: vec![ProvisioningResult::default()],
            ..Default::default()
        }),
        _ => return None,
    };
    value.ok()
}
