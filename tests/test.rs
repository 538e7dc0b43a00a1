mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use common::{base_xml, Fixture};
use virt_provisioner::error::ProvisionError;
use virt_provisioner::libvirt::Hypervisor;
use virt_provisioner::provisioner::Provision;
use virt_provisioner::server::{router, AppState};

fn app(fx: &Fixture) -> Router {
    let for_provisioner = fx.clone();
    let for_listing = fx.clone();
    router(AppState::with_backends(
        Fixture::settings(),
        Arc::new(move || Box::new(for_provisioner.provisioner()) as Box<dyn Provision>),
        Arc::new(move |_uri: &str| {
            let hypervisor = Box::new(for_listing.hypervisor.clone()) as Box<dyn Hypervisor>;
            Ok::<_, ProvisionError>(hypervisor)
        }),
    ))
}

async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn heartbeat_is_alive() {
    let (status, body) = call(app(&Fixture::new()), "GET", "/heartbeat", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["message"], "alive");
}

#[tokio::test]
async fn format_echoes_known_contracts() {
    let fx = Fixture::new();
    let (status, body) = call(
        app(&fx),
        "POST",
        "/api/v1/format?contract=virtual_machine&serializer=json",
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let shape = json(&body);
    assert!(shape.get("base_vm_name").is_some());
    assert!(shape.get("hypervisor_connection").is_some());

    let (status, body) = call(
        app(&fx),
        "POST",
        "/api/v1/format?contract=virtual_machine_fleet&serializer=yaml",
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let shape: serde_yaml::Value = serde_yaml::from_slice(&body).unwrap();
    assert!(shape.get("shared_config").is_some());
}

#[tokio::test]
async fn format_rejects_unknown_names() {
    let fx = Fixture::new();
    let uri = "/api/v1/format?contract=nope&serializer=json";
    let (status, _) = call(app(&fx), "POST", uri, "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(
        app(&fx),
        "POST",
        "/api/v1/format?contract=virtual_machine&serializer=toml",
        "",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let svc = app(&Fixture::new());
    let (status, body) = call(svc, "POST", "/api/v1/virtual-machine", "{name: [").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body = json(&body);
    assert_eq!(body["message"], "could not parse request body");
    assert_eq!(body["body"]["errors"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn creates_a_virtual_machine() {
    let fx = Fixture::new();
    let request = r#"{
        "name": "web-1", "base_vm_name": "base-01", "vcpu": 2, "memory_gb": 4,
        "disk_gb": 20, "cow_clone": true, "user": "ops",
        "ip_address": "10.0.0.5", "gateway_address": "10.0.0.1"
    }"#;
    let (status, body) = call(app(&fx), "POST", "/api/v1/virtual-machine", request).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["message"], "created");
    assert_eq!(body["body"]["name"], "web-1");
    assert!(!body["body"]["uuid"].as_str().unwrap().is_empty());
    assert_eq!(fx.hypervisor.started(), vec!["web-1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn yaml_request_with_missing_base_is_not_found() {
    let fx = Fixture::new();
    let request = "name: web-1\nbase_vm_name: base-99\nvcpu: 1\nmemory_gb: 1\n";
    let (status, body) = call(app(&fx), "POST", "/api/v1/virtual-machine", request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body = json(&body);
    assert_eq!(body["message"], "failed");
    assert!(body["body"]["error"].as_str().unwrap().contains("base-99"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_domain_is_a_conflict() {
    let fx = Fixture::new();
    fx.hypervisor.add_domain("web-1", &base_xml("web-1", "/images/web-1.qcow2"));
    let request = r#"{"name": "web-1", "base_vm_name": "base-01", "vcpu": 1, "memory_gb": 1}"#;
    let (status, body) = call(app(&fx), "POST", "/api/v1/virtual-machine", request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let body = json(&body);
    assert_eq!(body["message"], "failed");
    assert!(body["body"]["error"].as_str().unwrap().contains("already exists"));
    assert!(fx.shell.lines().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incomplete_request_is_a_bad_request() {
    let (status, body) = call(app(&Fixture::new()), "POST", "/api/v1/virtual-machine", "{}").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json(&body)["body"]["error"]
        .as_str()
        .unwrap()
        .contains("missing required fields"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_fleet_reports_every_member() {
    let fx = Fixture::new();
    let request = r#"
shared_config:
  general:
    base_vm_name: base-01
  ssh:
    user: ops
virtual_machines:
  - {name: web-1, vcpu: 1, memory_gb: 1}
  - {name: web-2, vcpu: 1, memory_gb: 1, base_vm_name: missing-base}
  - {name: web-3, vcpu: 1, memory_gb: 1}
"#;
    let (status, body) = call(app(&fx), "POST", "/api/v1/virtual-machine/fleet", request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body = json(&body);
    assert_eq!(body["message"], "partial");
    assert_eq!(body["body"]["total"], 3);
    assert_eq!(body["body"]["success"], 2);
    assert_eq!(body["body"]["failed"], 1);
    assert_eq!(body["body"]["sub_results"].as_array().unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lists_domains() {
    let fx = Fixture::new();
    let (status, body) = call(
        app(&fx),
        "GET",
        "/api/v1/virtual-machine?uri=qemu%3A%2F%2F%2Fsystem",
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["body"][0]["name"], "base-01");
}
