use serde::Deserialize;

pub const DEFAULT_HYPERVISOR: &str = "qemu";
pub const DEFAULT_CONNECT_HOST: &str = "localhost";
pub const DEFAULT_CONNECT_PATH: &str = "system";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:15000";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_CLOUD_INIT_DIR: &str = "/var/lib/libvirt/cloud-init";
pub const DEFAULT_CLOUD_INIT_ISO_NAME: &str = "cloud-init.iso";
pub const DEFAULT_ISO_TOOL: &str = "mkisofs";
pub const DEFAULT_DISK_TOOL: &str = "qemu-img";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Service settings, read from `SETTINGS`.
#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_cloud_init_dir")]
    pub cloud_init_dir: String,
    #[serde(default = "default_cloud_init_iso_name")]
    pub cloud_init_iso_name: String,
    #[serde(default = "default_iso_tool")]
    pub iso_tool: String,
    #[serde(default = "default_disk_tool")]
    pub disk_tool: String,
    #[serde(default)]
    pub provision_timeout_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            cloud_init_dir: default_cloud_init_dir(),
            cloud_init_iso_name: default_cloud_init_iso_name(),
            iso_tool: default_iso_tool(),
            disk_tool: default_disk_tool(),
            provision_timeout_secs: None,
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_cloud_init_dir() -> String {
    DEFAULT_CLOUD_INIT_DIR.to_string()
}

fn default_cloud_init_iso_name() -> String {
    DEFAULT_CLOUD_INIT_ISO_NAME.to_string()
}

fn default_iso_tool() -> String {
    DEFAULT_ISO_TOOL.to_string()
}

fn default_disk_tool() -> String {
    DEFAULT_DISK_TOOL.to_string()
}
