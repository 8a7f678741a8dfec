//! Pod identity resolution
//!
//! Maps container IDs to workload identity using the kubelet
//! pod-resources endpoint, with a pod-UID keyed apiserver fallback.
//! Lookups are served from short-lived caches; a refresh builds a new
//! map and swaps it atomically so readers see either the old state or
//! the new one, never a partial one.

mod apiserver;
pub mod podresources;

use crate::models::PodIdentity;
use anyhow::Context;
use podresources::{ListPodResourcesRequest, PodResourcesListerClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CACHE_TTL: Duration = Duration::from_secs(30);
const CALL_DEADLINE: Duration = Duration::from_secs(10);

/// Resource classes that mark a container as holding a GPU.
const GPU_RESOURCE_PREFIXES: [&str; 2] = ["nvidia.com/gpu", "nvidia.com/mig"];

pub struct PodResolver {
    socket_path: PathBuf,
    by_container: RwLock<Arc<HashMap<String, PodIdentity>>>,
    by_pod_uid: RwLock<Arc<HashMap<String, PodIdentity>>>,
    last_refresh: RwLock<Option<Instant>>,
    apiserver: Option<apiserver::ApiServerClient>,
}

impl PodResolver {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let apiserver = apiserver::ApiServerClient::in_cluster();
        if apiserver.is_none() {
            debug!("No service account token found, pod UID fallback disabled");
        }
        Self {
            socket_path: socket_path.into(),
            by_container: RwLock::new(Arc::new(HashMap::new())),
            by_pod_uid: RwLock::new(Arc::new(HashMap::new())),
            last_refresh: RwLock::new(None),
            apiserver,
        }
    }

    /// Resolve a container ID to pod identity. Refreshes the cache when
    /// it is stale or was never filled; a failed refresh degrades to
    /// whatever the cache holds.
    pub async fn resolve(&self, container_id: &str) -> Option<PodIdentity> {
        if self.cache_stale() {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "Failed to refresh pod cache");
            }
        }

        let cache = self.by_container.read().unwrap().clone();
        cache.get(container_id).cloned()
    }

    /// Resolve by pod UID through the apiserver fallback.
    pub async fn resolve_by_uid(&self, pod_uid: &str) -> Option<PodIdentity> {
        {
            let cache = self.by_pod_uid.read().unwrap().clone();
            if let Some(identity) = cache.get(pod_uid) {
                return Some(identity.clone());
            }
        }

        let apiserver = self.apiserver.as_ref()?;
        match tokio::time::timeout(CALL_DEADLINE, apiserver.pods_by_uid()).await {
            Ok(Ok(by_uid)) => {
                let found = by_uid.get(pod_uid).cloned();
                *self.by_pod_uid.write().unwrap() = Arc::new(by_uid);
                found
            }
            Ok(Err(e)) => {
                warn!(pod_uid, error = %e, "Pod UID lookup failed");
                None
            }
            Err(_) => {
                warn!(pod_uid, "Pod UID lookup timed out");
                None
            }
        }
    }

    /// Record a mapping the collection engine resolved itself, so later
    /// cycles hit the container-id cache directly.
    pub fn supply_mapping(&self, container_id: &str, identity: PodIdentity) {
        let mut guard = self.by_container.write().unwrap();
        let mut next: HashMap<String, PodIdentity> = guard.as_ref().clone();
        next.insert(container_id.to_string(), identity);
        *guard = Arc::new(next);
    }

    fn cache_stale(&self) -> bool {
        match *self.last_refresh.read().unwrap() {
            Some(refreshed_at) => refreshed_at.elapsed() > CACHE_TTL,
            None => true,
        }
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        let channel = podresources::connect(&self.socket_path, CALL_DEADLINE)
            .await
            .context("failed to connect to the pod-resources socket")?;
        let mut client = PodResourcesListerClient::new(channel);

        let response = match tokio::time::timeout(
            CALL_DEADLINE,
            client.list(ListPodResourcesRequest {}),
        )
        .await
        {
            Ok(result) => result.context("pod-resources List failed")?,
            Err(_) => anyhow::bail!("pod-resources List timed out after {CALL_DEADLINE:?}"),
        };

        let mut by_container = HashMap::new();
        for pod in response.into_inner().pod_resources {
            for container in pod.containers {
                let holds_gpu = container.devices.iter().any(|device| {
                    GPU_RESOURCE_PREFIXES
                        .iter()
                        .any(|prefix| device.resource_name.starts_with(prefix))
                });
                if !holds_gpu {
                    continue;
                }

                let identity = PodIdentity {
                    pod_name: pod.name.clone(),
                    pod_namespace: pod.namespace.clone(),
                    container_name: container.name.clone(),
                };

                // Some device plugins embed the container scope in their
                // device IDs; index those directly.
                for device in &container.devices {
                    for device_id in &device.device_ids {
                        if let Some(container_id) = container_id_from_device_id(device_id) {
                            by_container.insert(container_id, identity.clone());
                        }
                    }
                }

                debug!(
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    container = %container.name,
                    "Cached pod identity"
                );
            }
        }

        debug!(entries = by_container.len(), "Refreshed pod cache");
        *self.by_container.write().unwrap() = Arc::new(by_container);
        *self.last_refresh.write().unwrap() = Some(Instant::now());

        Ok(())
    }
}

/// Best-effort container ID extraction from a device-plugin device ID.
fn container_id_from_device_id(device_id: &str) -> Option<String> {
    let start = device_id.find("cri-containerd-")? + "cri-containerd-".len();
    let rest = &device_id[start..];
    let end = rest.find(['-', '/', '.']).unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_from_device_id() {
        assert_eq!(
            container_id_from_device_id("gpu0/cri-containerd-abc123.scope"),
            Some("abc123".to_string())
        );
        assert_eq!(
            container_id_from_device_id("cri-containerd-feedface"),
            Some("feedface".to_string())
        );
        assert_eq!(container_id_from_device_id("GPU-5ccab8f5"), None);
    }

    #[tokio::test]
    async fn test_supplied_mapping_is_served_from_cache() {
        let resolver = PodResolver::new("/nonexistent/kubelet.sock");
        // Pretend a refresh just happened so resolve() goes straight to
        // the cache.
        *resolver.last_refresh.write().unwrap() = Some(Instant::now());

        let identity = PodIdentity {
            pod_name: "trainer-a".to_string(),
            pod_namespace: "default".to_string(),
            container_name: "train".to_string(),
        };
        resolver.supply_mapping("c1", identity.clone());

        assert_eq!(resolver.resolve("c1").await, Some(identity));
        assert_eq!(resolver.resolve("unknown").await, None);
    }

    #[tokio::test]
    async fn test_resolve_degrades_when_socket_is_missing() {
        let resolver = PodResolver::new("/nonexistent/kubelet.sock");
        // Refresh fails, the empty cache answers.
        assert_eq!(resolver.resolve("c1").await, None);
    }

    #[test]
    fn test_cache_staleness() {
        let resolver = PodResolver::new("/nonexistent/kubelet.sock");
        assert!(resolver.cache_stale());

        *resolver.last_refresh.write().unwrap() = Some(Instant::now());
        assert!(!resolver.cache_stale());

        *resolver.last_refresh.write().unwrap() =
            Some(Instant::now() - Duration::from_secs(31));
        assert!(resolver.cache_stale());
    }
}
