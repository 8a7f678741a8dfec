//! Apiserver fallback for pod-UID lookups
//!
//! When the pod-resources response cannot be tied to a container ID, the
//! resolver falls back to listing pods from the apiserver and matching
//! by pod UID. TLS verification is disabled on purpose: the exporter
//! runs with hostNetwork on nodes that may not have the cluster CA
//! mounted, and the only data read is pod metadata the kubelet already
//! hands out locally.

use crate::models::PodIdentity;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    uid: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<PodContainer>,
}

#[derive(Debug, Deserialize)]
struct PodContainer {
    #[serde(default)]
    name: String,
}

pub struct ApiServerClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl ApiServerClient {
    /// Build a client from the in-cluster environment. Returns `None`
    /// when no service-account token is mounted.
    pub fn in_cluster() -> Option<Self> {
        let token = std::fs::read_to_string(TOKEN_PATH).ok()?;
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .unwrap_or_else(|_| "kubernetes.default.svc".to_string());
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .ok()?;

        debug!("Apiserver client initialized");
        Some(Self {
            client,
            token: token.trim().to_string(),
            base_url: format!("https://{host}:{port}"),
        })
    }

    /// List all pods and index their identity by pod UID. The first
    /// container's name is used, matching the kubelet's reporting order.
    pub async fn pods_by_uid(&self) -> Result<HashMap<String, PodIdentity>> {
        let url = format!("{}/api/v1/pods", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("apiserver request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("apiserver returned {}", response.status());
        }

        let list: PodList = response.json().await.context("failed to parse pod list")?;

        let mut by_uid = HashMap::with_capacity(list.items.len());
        for pod in list.items {
            let container_name = pod
                .spec
                .containers
                .first()
                .map(|c| c.name.clone())
                .unwrap_or_default();
            by_uid.insert(
                pod.metadata.uid,
                PodIdentity {
                    pod_name: pod.metadata.name,
                    pod_namespace: pod.metadata.namespace,
                    container_name,
                },
            );
        }

        debug!(pods = by_uid.len(), "Refreshed pod UID index");
        Ok(by_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_list_parses_sparse_manifests() {
        let raw = r#"{
            "items": [
                {
                    "metadata": {"name": "trainer-a", "namespace": "default", "uid": "u-1"},
                    "spec": {"containers": [{"name": "train"}, {"name": "sidecar"}]}
                },
                {
                    "metadata": {"uid": "u-2"}
                }
            ]
        }"#;

        let list: PodList = serde_json::from_str(raw).unwrap();
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[0].metadata.name, "trainer-a");
        assert_eq!(list.items[0].spec.containers[0].name, "train");
        assert!(list.items[1].spec.containers.is_empty());
    }
}
