use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::server::state::AppState;

/// Liveness endpoint
pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Last sync outcome as JSON
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.snapshot().await)
}

/// Text dump of the routes of the last successful sync
pub async fn urlmap(State(state): State<AppState>) -> Response {
    match state.snapshot().await.last_report {
        Some(report) => report.url_map_dump().into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no sync has completed yet\n").into_response(),
    }
}

/// Instance health behind the backend for a service port
pub async fn backend_health(State(state): State<AppState>, Path(port): Path<u16>) -> Response {
    match state.manager.backend_status(port).await {
        Ok(health) => Json(health).into_response(),
        Err(e) if e.is_not_found() => {
            (StatusCode::NOT_FOUND, format!("no backend for port {}\n", port)).into_response()
        }
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/urlmap", get(urlmap))
        .route("/backends/{port}", get(backend_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tower::ServiceExt;

    use crate::cloud::fake::FakeCloud;
    use crate::cluster::{
        ClusterManager, DesiredState, IngressSpec, ManagerOptions, RoutingRule, SyncContext,
    };

    fn create_test_state() -> AppState {
        let manager = ClusterManager::new(
            Arc::new(FakeCloud::new()),
            ManagerOptions {
                cluster_name: "uid1".into(),
                zone: "zone-a".into(),
                default_backend_port: None,
                health_check_path: "/".into(),
            },
        );
        AppState::new(Arc::new(manager))
    }

    async fn synced_state() -> AppState {
        let state = create_test_state();
        let desired = DesiredState {
            nodes: ["n1".to_string()].into_iter().collect(),
            ingresses: vec![IngressSpec {
                name: "default/foo".into(),
                rules: vec![RoutingRule {
                    host: "foo.bar.com".into(),
                    path: "/foo".into(),
                    port: 80,
                }],
                default_port: None,
                ip: None,
                static_ip: false,
            }],
        };
        let report = state
            .manager
            .sync(&desired, &SyncContext::unbounded())
            .await
            .unwrap();
        state.record_success(report).await;
        state
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_endpoint() {
        let (status, _) = get(create_router(create_test_state()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (status, body) = get(create_router(synced_state().await), "/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["cycles"], 1);
        assert_eq!(
            json["last_report"]["load_balancers"][0]["name"],
            "default-foo--uid1"
        );
    }

    #[tokio::test]
    async fn test_urlmap_before_first_sync() {
        let (status, _) = get(create_router(create_test_state()), "/urlmap").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_urlmap_dump() {
        let (status, body) = get(create_router(synced_state().await), "/urlmap").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("foo.bar.com\n\t/foo: k8s-be-80--uid1"));
    }

    #[tokio::test]
    async fn test_backend_health() {
        let app = create_router(synced_state().await);
        let (status, body) = get(app.clone(), "/backends/80").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("HEALTHY"));

        let (status, _) = get(app, "/backends/81").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
