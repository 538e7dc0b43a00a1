//! HTTP surface of the provisioner.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::contract::{
    canonical_contract, FleetConfig, GenericResponse, ProvisioningResult, VirtualMachineConfig,
};
use crate::error::{ProvisionError, Result};
use crate::fleet::FleetOrchestrator;
use crate::libvirt::{Hypervisor, LibvirtHypervisor};
use crate::provisioner::{ConnectingProvisioner, Provision};
use crate::structs::AppConfig;

const LOCAL_URI: &str = "qemu:///system";

pub type ProvisionerFactory = Arc<dyn Fn() -> Box<dyn Provision> + Send + Sync>;
pub type HypervisorFactory = Arc<dyn Fn(&str) -> Result<Box<dyn Hypervisor>> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    settings: AppConfig,
    provisioner: ProvisionerFactory,
    hypervisor: HypervisorFactory,
}

impl AppState {
    /// State backed by libvirt and the connections named in each request.
    pub fn new(settings: AppConfig) -> Self {
        let provisioner_settings = settings.clone();
        AppState {
            settings,
            provisioner: Arc::new(move || {
                let settings = provisioner_settings.clone();
                Box::new(ConnectingProvisioner::new(settings)) as Box<dyn Provision>
            }),
            hypervisor: Arc::new(|uri: &str| {
                LibvirtHypervisor::open(uri).map(|h| Box::new(h) as Box<dyn Hypervisor>)
            }),
        }
    }

    pub fn with_backends(
        settings: AppConfig,
        provisioner: ProvisionerFactory,
        hypervisor: HypervisorFactory,
    ) -> Self {
        AppState {
            settings,
            provisioner,
            hypervisor,
        }
    }

    /// A token cancelled after `provision_timeout_secs`, if configured.
    fn deadline(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(secs) = self.settings.provision_timeout_secs {
            let timer = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        warn!("provisioning exceeded {secs}s, cancelling");
                        timer.cancel();
                    }
                }
            });
        }
        token
    }
}

fn respond<T: Serialize>(status: StatusCode, body: T, message: impl Into<String>) -> Response {
    (status, Json(GenericResponse::new(body, message))).into_response()
}

pub fn status_for(err: &ProvisionError) -> StatusCode {
    if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[derive(Serialize)]
struct ParseErrors {
    errors: Vec<String>,
}

/// Request bodies may be JSON or YAML.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, Response> {
    let json_err = match serde_json::from_slice(body) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    let yaml_err = match serde_yaml::from_slice(body) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    debug!("rejecting request body: json: {json_err}; yaml: {yaml_err}");
    Err(respond(
        StatusCode::BAD_REQUEST,
        ParseErrors {
            errors: vec![format!("json: {json_err}"), format!("yaml: {yaml_err}")],
        },
        "could not parse request body",
    ))
}

/// Runs libvirt-bound work on the blocking pool.
async fn run_blocking<T, F>(work: F) -> std::result::Result<T, Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        error!("provisioning task failed: {e}");
        respond(StatusCode::INTERNAL_SERVER_ERROR, (), e.to_string())
    })
}

async fn heartbeat() -> Response {
    respond(
        StatusCode::OK,
        serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
        "alive",
    )
}

async fn create_virtual_machine(State(state): State<AppState>, body: Bytes) -> Response {
    let config: VirtualMachineConfig = match parse_body(&body) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = config.general.name.clone();
    let token = state.deadline();
    let _guard = token.clone().drop_guard();
    let factory = state.provisioner.clone();

    let outcome = run_blocking(move || {
        let provisioner = factory();
        Handle::current().block_on(provisioner.provision(&token, &config))
    })
    .await;

    match outcome {
        Err(resp) => resp,
        Ok(Ok(uuid)) => respond(
            StatusCode::OK,
            ProvisioningResult {
                uuid,
                name,
                error: String::new(),
            },
            "created",
        ),
        Ok(Err(e)) => respond(
            status_for(&e),
            ProvisioningResult {
                uuid: String::new(),
                name,
                error: e.to_string(),
            },
            "failed",
        ),
    }
}

async fn create_fleet(State(state): State<AppState>, body: Bytes) -> Response {
    let fleet: FleetConfig = match parse_body(&body) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let token = state.deadline();
    let _guard = token.clone().drop_guard();
    let factory = state.provisioner.clone();

    let outcome = run_blocking(move || {
        let orchestrator = FleetOrchestrator::new(factory());
        Handle::current().block_on(orchestrator.create(&token, &fleet))
    })
    .await;

    match outcome {
        Err(resp) => resp,
        Ok(result) => {
            let status = if result.failed == 0 {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let message = result.status().message();
            respond(status, result, message)
        }
    }
}

#[derive(Deserialize, Debug)]
struct FormatParams {
    #[serde(default)]
    contract: String,
    #[serde(default = "default_serializer")]
    serializer: String,
}

fn default_serializer() -> String {
    "json".to_string()
}

async fn format_contract(Query(params): Query<FormatParams>) -> Response {
    let value = match canonical_contract(&params.contract) {
        Some(v) => v,
        None => {
            return respond(
                StatusCode::NOT_FOUND,
                (),
                format!("unknown contract '{}'", params.contract),
            )
        }
    };
    let rendered = match params.serializer.as_str() {
        "json" => serde_json::to_string_pretty(&value)
            .map(|s| (s, "application/json"))
            .map_err(|e| e.to_string()),
        "yaml" => serde_yaml::to_string(&value)
            .map(|s| (s, "application/yaml"))
            .map_err(|e| e.to_string()),
        other => {
            return respond(
                StatusCode::NOT_FOUND,
                (),
                format!("unknown serializer '{other}'"),
            )
        }
    };
    match rendered {
        Ok((text, content_type)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], text).into_response()
        }
        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, (), e),
    }
}

#[derive(Deserialize, Debug)]
struct ListParams {
    #[serde(default)]
    uri: String,
}

async fn list_virtual_machines(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    let uri = if params.uri.is_empty() {
        LOCAL_URI.to_string()
    } else {
        params.uri
    };
    let factory = state.hypervisor.clone();
    let outcome = run_blocking(move || factory(&uri)?.list_domains(true)).await;
    match outcome {
        Err(resp) => resp,
        Ok(Ok(domains)) => respond(StatusCode::OK, domains, "listed"),
        Ok(Err(e)) => respond(status_for(&e), (), e.to_string()),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat))
        .route(
            "/api/v1/virtual-machine",
            post(create_virtual_machine).get(list_virtual_machines),
        )
        .route("/api/v1/virtual-machine/fleet", post(create_fleet))
        .route("/api/v1/format", post(format_contract))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutting down");
}

pub async fn serve(settings: AppConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&settings.listen_addr).await?;
    info!("listening on {}", settings.listen_addr);
    let app = router(AppState::new(settings));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let not_found = ProvisionError::NotFound {
            domain: "base".to_string(),
            reason: "gone".to_string(),
        };
        assert_eq!(status_for(&not_found), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ProvisionError::InvalidRequest("x".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ProvisionError::AlreadyExists {
                domain: "web-1".to_string()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ProvisionError::Definition("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn yaml_is_accepted_after_json() {
        let config: VirtualMachineConfig = parse_body(b"name: web-1\nvcpu: 2\n").ok().unwrap();
        assert_eq!(config.general.name, "web-1");
        assert_eq!(config.general.vcpu, 2);
        assert!(parse_body::<VirtualMachineConfig>(b"[not: valid").is_err());
    }
}
