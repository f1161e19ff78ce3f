//! Read-only status endpoint and health probes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use kube::runtime::reflector::{ObjectRef, Store};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::{ClusterStatus, StratusCluster};
use crate::error::{OperatorError, Result};
use crate::runtime::InformerSynced;

/// Where cluster status is read from.
pub trait StatusSource: Send + Sync + 'static {
    /// `Ok(None)` when the cluster does not exist.
    fn cluster_status(&self, namespace: &str, name: &str) -> Result<Option<ClusterStatus>>;
}

impl StatusSource for Store<StratusCluster> {
    fn cluster_status(&self, namespace: &str, name: &str) -> Result<Option<ClusterStatus>> {
        let obj_ref = ObjectRef::new(name).within(namespace);
        Ok(self
            .get(&obj_ref)
            .map(|cluster| cluster.status.clone().unwrap_or_default()))
    }
}

#[derive(Clone)]
struct ServerState {
    source: Arc<dyn StatusSource>,
    ready: InformerSynced,
}

impl IntoResponse for OperatorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OperatorError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn cluster_status(
    State(state): State<ServerState>,
    Path((namespace, name)): Path<(String, String)>,
) -> std::result::Result<Json<ClusterStatus>, OperatorError> {
    match state.source.cluster_status(&namespace, &name) {
        Ok(Some(status)) => Ok(Json(status)),
        Ok(None) => Err(OperatorError::NotFound(format!(
            "cluster {}/{} not found",
            namespace, name
        ))),
        Err(e) => {
            warn!(namespace = %namespace, name = %name, error = %e, "Status lookup failed");
            Err(e)
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ServerState>) -> (StatusCode, &'static str) {
    if (state.ready)() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "cache not synced")
    }
}

pub fn router(source: Arc<dyn StatusSource>, ready: InformerSynced) -> Router {
    Router::new()
        .route(
            "/namespaces/:namespace/clusters/:name/status",
            get(cluster_status),
        )
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ServerState { source, ready })
}

/// Serve `router` on `addr` until `token` is cancelled.
pub async fn serve(addr: SocketAddr, router: Router, token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| OperatorError::Configuration(format!("binding {}: {}", addr, e)))?;
    info!(address = %addr, "Status server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| OperatorError::Configuration(format!("status server: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterPhase, ClusterSpec};
    use axum::body::Body;
    use axum::http::Request;
    use kube::runtime::reflector;
    use kube::runtime::watcher::Event;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    struct Broken;

    impl StatusSource for Broken {
        fn cluster_status(&self, _namespace: &str, _name: &str) -> Result<Option<ClusterStatus>> {
            Err(OperatorError::InvalidState("cache poisoned".to_string()))
        }
    }

    fn store() -> Store<StratusCluster> {
        let (store, mut writer) = reflector::store();
        let mut running = StratusCluster::new("running", ClusterSpec::default());
        running.metadata.namespace = Some("default".to_string());
        running.status = Some(ClusterStatus {
            phase: ClusterPhase::Running,
            observed_generation: Some(3),
            ..Default::default()
        });
        let mut fresh = StratusCluster::new("fresh", ClusterSpec::default());
        fresh.metadata.namespace = Some("default".to_string());
        writer.apply_watcher_event(&Event::Apply(running));
        writer.apply_watcher_event(&Event::Apply(fresh));
        store
    }

    fn always(ready: bool) -> InformerSynced {
        Arc::new(move || ready)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_status_of_existing_cluster() {
        let router = router(Arc::new(store()), always(true));
        let (code, body) = get_json(router, "/namespaces/default/clusters/running/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["phase"], "Running");
        assert_eq!(body["observedGeneration"], 3);
    }

    #[tokio::test]
    async fn test_cluster_without_status_reports_default() {
        let router = router(Arc::new(store()), always(true));
        let (code, body) = get_json(router, "/namespaces/default/clusters/fresh/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["phase"], "Initializing");
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_404() {
        let router = router(Arc::new(store()), always(true));
        let (code, body) = get_json(router, "/namespaces/other/clusters/running/status").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("other/running"));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_500() {
        let router = router(Arc::new(Broken), always(true));
        let (code, body) = get_json(router, "/namespaces/default/clusters/x/status").await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_probes() {
        let synced = Arc::new(AtomicBool::new(false));
        let ready: InformerSynced = {
            let synced = synced.clone();
            Arc::new(move || synced.load(Ordering::SeqCst))
        };
        let router = router(Arc::new(store()), ready);

        let (code, _) = get_json(router.clone(), "/healthz").await;
        assert_eq!(code, StatusCode::OK);
        let (code, _) = get_json(router.clone(), "/readyz").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        synced.store(true, Ordering::SeqCst);
        let (code, _) = get_json(router, "/readyz").await;
        assert_eq!(code, StatusCode::OK);
    }
}
