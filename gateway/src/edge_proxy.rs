//! Reconciles the desired set of routes against Caddy's admin API.
//!
//! `EdgeProxyController` is the only thing in this process that speaks
//! to Caddy. It tracks which mapping ids it believes have a live route
//! (`known`) so that a `ConfigSync` reconcile and the router's self-heal
//! path can both call the same idempotent `upsert`/`remove`
//! without redundant admin-API round trips.

use std::sync::Arc;

use dashmap::DashSet;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::warn;
use tunnel_protocol::PortMapping;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EdgeProxyError {
    #[error("edge proxy admin API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("edge proxy admin API returned {status}: {body}")]
    Status { status: u16, body: String },
}

pub struct EdgeProxyController {
    client: Client,
    admin_url: String,
    gateway_dial_address: String,
    known: DashSet<Uuid>,
}

impl EdgeProxyController {
    pub fn new(admin_url: String, gateway_dial_address: String, timeout: std::time::Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client with only a timeout never fails to build");

        Self {
            client,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            gateway_dial_address,
            known: DashSet::new(),
        }
    }

    fn route_id(mapping_id: Uuid) -> String {
        format!("octoporty-{}", mapping_id.simple())
    }

    fn route_object(&self, mapping: &PortMapping) -> serde_json::Value {
        json!({
            "@id": mapping.route_id(),
            "match": [{ "host": [mapping.external_domain] }],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": self.gateway_dial_address }],
                "headers": {
                    "request": {
                        "set": {
                            "X-Octoporty-Mapping-Id": [mapping.id.to_string()]
                        }
                    }
                }
            }]
        })
    }

    /// Idempotent upsert: try `PATCH /id/<id>` first (updates an existing
    /// route in place), falling back to `POST .../routes` when it doesn't
    /// exist yet. A 404 from the PATCH is the only error that triggers
    /// the fallback; any other error propagates.
    async fn upsert_route(&self, mapping: &PortMapping) -> Result<(), EdgeProxyError> {
        let route = self.route_object(mapping);
        let patch_url = format!("{}/id/{}", self.admin_url, mapping.route_id());

        let patch_resp = self.client.patch(&patch_url).json(&route).send().await?;
        if patch_resp.status().is_success() {
            self.known.insert(mapping.id);
            return Ok(());
        }
        if patch_resp.status().as_u16() != 404 {
            let status = patch_resp.status().as_u16();
            let body = patch_resp.text().await.unwrap_or_default();
            return Err(EdgeProxyError::Status { status, body });
        }

        let post_url = format!("{}/config/apps/http/servers/srv0/routes", self.admin_url);
        let post_resp = self.client.post(&post_url).json(&route).send().await?;
        if !post_resp.status().is_success() {
            let status = post_resp.status().as_u16();
            let body = post_resp.text().await.unwrap_or_default();
            return Err(EdgeProxyError::Status { status, body });
        }

        self.known.insert(mapping.id);
        Ok(())
    }

    /// Idempotent delete: a 404 means the route is already gone, which is
    /// the success case for "this mapping should have no route".
    pub async fn remove_route(&self, mapping_id: Uuid) -> Result<(), EdgeProxyError> {
        let id = Self::route_id(mapping_id);
        let url = format!("{}/id/{}", self.admin_url, id);
        let resp = self.client.delete(&url).send().await?;

        if resp.status().is_success() || resp.status().as_u16() == 404 {
            self.known.remove(&mapping_id);
            return Ok(());
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(EdgeProxyError::Status { status, body })
    }

    /// Reconcile the edge proxy's routes against the enabled mappings in
    /// a fresh `ConfigSync`. Upserts every enabled mapping, then removes
    /// any previously-known mapping id no longer present. Errors on
    /// individual routes are logged and retried on the next sync rather
    /// than aborting the whole reconcile: a route error gets a warning
    /// log and another attempt on the next sync.
    pub async fn reconcile(&self, desired: &[PortMapping]) {
        let desired_ids: std::collections::HashSet<Uuid> = desired.iter().map(|m| m.id).collect();

        for mapping in desired {
            if let Err(e) = self.upsert_route(mapping).await {
                warn!(mapping_id = %mapping.id, error = %e, "failed to upsert edge-proxy route");
            }
        }

        let stale: Vec<Uuid> = self
            .known
            .iter()
            .map(|id| *id)
            .filter(|id| !desired_ids.contains(id))
            .collect();

        for mapping_id in stale {
            if let Err(e) = self.remove_route(mapping_id).await {
                warn!(mapping_id = %mapping_id, error = %e, "failed to remove stale edge-proxy route");
            }
        }
    }

    /// Whether the admin API is reachable at all, for a health check.
    pub async fn healthy(&self) -> bool {
        let url = format!("{}/config/", self.admin_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }

    /// The full live Caddy config, for the Agent UI's diagnostic view.
    pub async fn get_config(&self) -> Result<serde_json::Value, EdgeProxyError> {
        let url = format!("{}/config/", self.admin_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(EdgeProxyError::Status { status, body });
        }
        Ok(resp.json().await?)
    }
}

pub type SharedEdgeProxy = Arc<EdgeProxyController>;

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mapping(id: Uuid, domain: &str) -> PortMapping {
        PortMapping {
            id,
            external_domain: domain.to_string(),
            internal_host: "10.0.0.1".to_string(),
            internal_port: 8080,
            internal_use_tls: false,
            allow_self_signed: false,
            enabled: true,
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn reconcile_falls_back_to_post_when_patch_404s() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path_regex(r"^/id/.*"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/config/apps/http/servers/srv0/routes$"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let controller = EdgeProxyController::new(
            server.uri(),
            "gateway:8443".to_string(),
            std::time::Duration::from_secs(5),
        );
        let m = mapping(Uuid::new_v4(), "app.test");
        controller.reconcile(&[m.clone()]).await;
        assert!(controller.known.contains(&m.id));
    }

    #[tokio::test]
    async fn reconcile_removes_stale_known_routes() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path_regex(r"^/id/.*"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/id/.*"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let controller = EdgeProxyController::new(
            server.uri(),
            "gateway:8443".to_string(),
            std::time::Duration::from_secs(5),
        );
        let m = mapping(Uuid::new_v4(), "app.test");
        controller.reconcile(&[m.clone()]).await;
        assert!(controller.known.contains(&m.id));

        controller.reconcile(&[]).await;
        assert!(!controller.known.contains(&m.id));
    }

    #[tokio::test]
    async fn second_reconcile_of_same_set_is_a_noop_on_known_routes() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path_regex(r"^/id/.*"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let controller = EdgeProxyController::new(
            server.uri(),
            "gateway:8443".to_string(),
            std::time::Duration::from_secs(5),
        );
        let m = mapping(Uuid::new_v4(), "app.test");
        controller.reconcile(&[m.clone()]).await;
        controller.reconcile(&[m.clone()]).await;
        assert_eq!(controller.known.len(), 1);
    }
}
