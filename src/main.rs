#[macro_use]
extern crate tracing;

use std::env;
use virt_provisioner::server::serve;
use virt_provisioner::{app_config, load_settings, SETTINGS};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let settings = load_settings()?;
    match settings.get_string("log_level") {
        Ok(s) => env::set_var("RUST_LOG", s),
        Err(_) => env::set_var("RUST_LOG", "info"),
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Ok(mut global) = SETTINGS.write() {
        *global = settings;
    }
    let config = app_config()?;

    info!(
        "virt_provisioner {} {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );
    serve(config).await
}
