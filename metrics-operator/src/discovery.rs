//! Translation of a declared Group/Version/Kind into the resource to list.
use std::{
    collections::HashMap,
    future::Future,
    time::{Duration, Instant},
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::{
    Client,
    api::{ApiResource, GroupVersionKind},
};
use tokio::sync::RwLock;

use crate::errors::ExtKubeApiError;

/// How long a resolved resource is cached.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Source of the resources served for an API group version.
pub(crate) trait ServerResources: Send + Sync {
    /// Returns `None` if the group version is not served at all.
    fn server_resources(
        &self,
        group_version: &str,
    ) -> impl Future<Output = Result<Option<APIResourceList>, kube::Error>> + Send;
}

impl ServerResources for Client {
    async fn server_resources(
        &self,
        group_version: &str,
    ) -> Result<Option<APIResourceList>, kube::Error> {
        let result = match group_version.split_once('/') {
            None => self.list_core_api_resources(group_version).await,
            Some(_) => self.list_api_group_resources(group_version).await,
        };
        match result {
            Ok(list) => Ok(Some(list)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Find the resource of `gvk` among the served resources, matching the kind
/// case-insensitively and skipping subresources.
pub(crate) fn find_resource(gvk: &GroupVersionKind, list: &APIResourceList) -> Option<ApiResource> {
    list.resources
        .iter()
        .filter(|r| !r.name.contains('/'))
        .find(|r| r.kind.eq_ignore_ascii_case(gvk.kind.as_str()))
        .map(|r| ApiResource {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            api_version: gvk.api_version(),
            kind: r.kind.clone(),
            plural: r.name.clone(),
        })
}

/// Caches resolved resources per cluster and GVK. Unresolved kinds are not
/// cached, so newly installed CustomResourceDefinitions are picked up on the
/// next measurement.
#[derive(Default)]
pub(crate) struct GvrResolver {
    cache: RwLock<HashMap<(String, GroupVersionKind), (Instant, ApiResource)>>,
}

impl GvrResolver {
    pub(crate) async fn resolve<S: ServerResources>(
        &self,
        cluster: &str,
        gvk: &GroupVersionKind,
        server: &S,
    ) -> Result<Option<ApiResource>, kube::Error> {
        if gvk.version.is_empty() || gvk.kind.is_empty() {
            return Ok(None);
        }
        let key = (cluster.to_string(), gvk.clone());
        {
            let cache = self.cache.read().await;
            if let Some((resolved_at, resource)) = cache.get(&key) {
                if resolved_at.elapsed() < CACHE_TTL {
                    return Ok(Some(resource.clone()));
                }
            }
        }
        let resource = server
            .server_resources(gvk.api_version().as_str())
            .await?
            .and_then(|list| find_resource(gvk, &list));
        let mut cache = self.cache.write().await;
        match &resource {
            Some(resource) => {
                cache.insert(key, (Instant::now(), resource.clone()));
            }
            None => {
                cache.remove(&key);
            }
        }
        Ok(resource)
    }

    #[cfg(test)]
    pub(crate) async fn insert(&self, cluster: &str, gvk: &GroupVersionKind, resource: ApiResource) {
        self.cache
            .write()
            .await
            .insert((cluster.to_string(), gvk.clone()), (Instant::now(), resource));
    }
}
