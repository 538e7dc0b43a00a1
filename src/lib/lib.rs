#[macro_use]
extern crate tracing;
pub mod cloud_init;
pub mod connect;
pub mod contract;
pub mod domain_builder;
pub mod error;
pub mod files;
pub mod fleet;
pub mod host;
pub mod libvirt;
pub mod provisioner;
pub mod required;
pub mod server;
pub mod shell;
pub mod ssh;
pub mod structs;
pub mod vm_xml;

use config::Config;
use lazy_static::lazy_static;
use std::sync::RwLock;

use crate::structs::AppConfig;

pub const ENV_PREFIX: &str = "VIRT_PROVISIONER";

/// Layers the optional settings file under `VIRT_PROVISIONER_*` variables.
pub fn load_settings() -> Result<Config, config::ConfigError> {
    let cfg_file = match std::env::var("CONFIG_FILE_PATH") {
        Ok(s) => s,
        Err(_e) => "./config.toml".to_string(),
    };
    Config::builder()
        .add_source(config::File::with_name(&cfg_file).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(","),
        )
        .build()
}

lazy_static! {
    pub static ref SETTINGS: RwLock<Config> = RwLock::new(match load_settings() {
        Ok(s) => s,
        Err(e) => {
            error!("Settings could not be loaded, using defaults: {e}");
            Config::default()
        }
    });
}

/// Typed view of `SETTINGS`.
pub fn app_config() -> Result<AppConfig, config::ConfigError> {
    match SETTINGS.read() {
        Ok(settings) => settings.clone().try_deserialize(),
        Err(e) => Err(config::ConfigError::Message(format!(
            "settings lock poisoned: {e}"
        ))),
    }
}
