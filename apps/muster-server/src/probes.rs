//! `/ready` and `/healthz` endpoints, the gRPC health service and gRPC
//! server reflection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State as AxumState, http::StatusCode, routing::get, Json, Router};
use edge_server::RegisterGrpcServiceFn;
use musterkit::ServiceManager;
use serde::Serialize;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

#[derive(Clone)]
struct EndpointState {
    manager: ServiceManager,
    shutdown_requested: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub shutdown_requested: bool,
    /// Number of services per state, only reported when not ready.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, usize>,
}

/// Ready once every service is running and no shutdown was requested.
pub fn readiness(manager: &ServiceManager, shutdown_requested: bool) -> (StatusCode, Readiness) {
    if manager.is_healthy() && !shutdown_requested {
        return (
            StatusCode::OK,
            Readiness {
                ready: true,
                shutdown_requested,
                services: BTreeMap::new(),
            },
        );
    }

    let services = manager
        .services_by_state()
        .into_iter()
        .map(|(state, services)| (state.to_string(), services.len()))
        .collect();
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Readiness {
            ready: false,
            shutdown_requested,
            services,
        },
    )
}

async fn ready(AxumState(state): AxumState<EndpointState>) -> (StatusCode, Json<Readiness>) {
    let (status, body) = readiness(
        &state.manager,
        state.shutdown_requested.load(Ordering::SeqCst),
    );
    (status, Json(body))
}

async fn healthz(AxumState(state): AxumState<EndpointState>) -> StatusCode {
    if state.manager.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn routes(manager: ServiceManager, shutdown_requested: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/healthz", get(healthz))
        .with_state(EndpointState {
            manager,
            shutdown_requested,
        })
}

/// The standard gRPC health service. Starts out not serving.
pub async fn grpc_health() -> (HealthReporter, RegisterGrpcServiceFn) {
    let (reporter, service) = tonic_health::server::health_reporter();
    reporter.set_service_status("", ServingStatus::NotServing).await;

    let installer = RegisterGrpcServiceFn::new("grpc.health.v1.Health", move |routes| {
        routes.add_service(service.clone());
    });
    (reporter, installer)
}

/// gRPC server reflection describing the health service.
pub fn grpc_reflection() -> anyhow::Result<RegisterGrpcServiceFn> {
    let service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| anyhow::anyhow!("building gRPC reflection: {e}"))?;

    Ok(RegisterGrpcServiceFn::new(
        "grpc.reflection.v1.ServerReflection",
        move |routes| {
            routes.add_service(service.clone());
        },
    ))
}
