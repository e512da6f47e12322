use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use axum::{extract::State, routing::get, Json, Router};
use axum_server::Handle;
use tracing::info;

use crate::{data_model::ResourceReport, registry::ContainerRegistry};

/// In-process HTTP endpoint serving the live resource report. Started
/// before the resource manager handshake so the tracking URL exists when
/// the application master registers.
pub struct TrackerService {
    handle: Handle,
    bind_address: SocketAddr,
    url: String,
}

#[derive(Clone)]
struct RouteState {
    registry: Arc<ContainerRegistry>,
}

fn create_routes(state: RouteState) -> Router {
    Router::new()
        .route("/", get(resource_report))
        .route("/containers", get(containers))
        .with_state(state)
}

async fn resource_report(State(state): State<RouteState>) -> Json<ResourceReport> {
    Json(state.registry.resource_report().await)
}

async fn containers(State(state): State<RouteState>) -> Json<Vec<String>> {
    let mut ids: Vec<String> = state.registry.container_ids().await.into_iter().collect();
    ids.sort();
    Json(ids)
}

impl TrackerService {
    /// Binds (an ephemeral port when the configured port is 0) and starts
    /// serving. `host` is the externally reachable name of the AM's host,
    /// used to form the tracking URL.
    pub async fn start(
        registry: Arc<ContainerRegistry>,
        listen_addr: SocketAddr,
        host: &str,
    ) -> Result<TrackerService> {
        let handle = Handle::new();
        let routes = create_routes(RouteState { registry });

        let server_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = axum_server::bind(listen_addr)
                .handle(server_handle)
                .serve(routes.into_make_service())
                .await
            {
                tracing::error!("tracker server failed: {err}");
            }
        });

        let bind_address = handle
            .listening()
            .await
            .ok_or_else(|| anyhow!("tracker failed to bind {listen_addr}"))?;
        let url = format!("http://{}:{}/", host, bind_address.port());
        info!(%bind_address, url = %url, "tracker started");
        Ok(TrackerService {
            handle,
            bind_address,
            url,
        })
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn stop(&self) {
        self.handle.graceful_shutdown(Some(Duration::from_secs(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::RunResources;

    fn registry() -> Arc<ContainerRegistry> {
        Arc::new(ContainerRegistry::new(
            "application_1364543201964_0001",
            RunResources {
                instance_id: 0,
                container_id: "container_am".to_string(),
                vcores: 1,
                memory_mb: 512,
                host: "am-host".to_string(),
            },
        ))
    }

    #[tokio::test]
    async fn test_report_endpoint_serves_registry_view() -> Result<()> {
        let registry = registry();
        let state = RouteState {
            registry: registry.clone(),
        };
        let Json(report) = resource_report(State(state)).await;
        assert_eq!(report.app_id, "application_1364543201964_0001");
        assert_eq!(report.app_master_resources.memory_mb, 512);
        assert!(report.resources.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_tracker_binds_ephemeral_port() -> Result<()> {
        let tracker = TrackerService::start(
            registry(),
            "127.0.0.1:0".parse().unwrap(),
            "am-host",
        )
        .await?;
        assert_ne!(tracker.bind_address().port(), 0);
        assert_eq!(
            tracker.url(),
            &format!("http://am-host:{}/", tracker.bind_address().port())
        );
        tracker.stop().await;
        Ok(())
    }
}
