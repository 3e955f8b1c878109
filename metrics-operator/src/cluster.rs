//! Read access to the cluster a metric measures.
use std::{
    future::Future,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    Api, Client,
    api::{ApiResource, DynamicObject, GroupVersionKind, ListParams},
};

use crate::{discovery::GvrResolver, utils::with_deadline};

/// Page size used to list target resources.
const PAGE_SIZE: u32 = 500;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ClusterError {
    #[error("{0}")]
    Kube(#[from] kube::Error),
    #[error("{0} did not complete within {1:?}")]
    Timeout(&'static str, Duration),
}

/// The operations metric handlers perform against a target cluster.
pub(crate) trait TargetCluster: Send + Sync {
    /// Resolve `gvk` to a listable resource, `None` if the cluster does not serve it.
    fn resolve(
        &self,
        gvk: &GroupVersionKind,
    ) -> impl Future<Output = Result<Option<ApiResource>, ClusterError>> + Send;

    /// List all objects of `resource` across namespaces.
    fn list(
        &self,
        resource: &ApiResource,
        lp: &ListParams,
    ) -> impl Future<Output = Result<Vec<DynamicObject>, ClusterError>> + Send;

    fn list_crds(
        &self,
    ) -> impl Future<Output = Result<Vec<CustomResourceDefinition>, ClusterError>> + Send;
}

/// A [`TargetCluster`] backed by a Kubernetes API server.
#[derive(Clone)]
pub(crate) struct KubeCluster {
    client: Client,
    /// Identifies the cluster in the discovery cache.
    key: String,
    /// Fingerprint of the credentials `client` authenticates with.
    credentials: u64,
    resolver: Arc<GvrResolver>,
    deadline: Duration,
}

impl KubeCluster {
    pub(crate) fn new(
        client: Client,
        key: String,
        resolver: Arc<GvrResolver>,
        deadline: Duration,
    ) -> Self {
        Self {
            client,
            key,
            credentials: 0,
            resolver,
            deadline,
        }
    }

    /// Remember which credentials the client was built from, so that
    /// long-lived users of the client notice rotated credentials.
    pub(crate) fn with_credentials(mut self, credentials: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        credentials.hash(&mut hasher);
        self.credentials = hasher.finish();
        self
    }

    pub(crate) fn credentials(&self) -> u64 {
        self.credentials
    }

    pub(crate) fn client(&self) -> Client {
        self.client.clone()
    }

    pub(crate) fn key(&self) -> &str {
        self.key.as_str()
    }

    async fn list_all<F>(
        &self,
        what: &'static str,
        api: Api<F>,
        lp: &ListParams,
    ) -> Result<Vec<F>, ClusterError>
    where
        F: Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    {
        let mut lp = lp.clone();
        lp.limit = Some(PAGE_SIZE);
        let list = async {
            let mut items = Vec::new();
            loop {
                let page = api.list(&lp).await?;
                items.extend(page.items);
                match page.metadata.continue_.filter(|v| !v.is_empty()) {
                    Some(token) => lp.continue_token = Some(token),
                    None => break,
                }
            }
            Ok::<_, kube::Error>(items)
        };
        with_deadline(self.deadline, list)
            .await
            .map_err(|e| ClusterError::Timeout(what, e.0))?
            .map_err(ClusterError::from)
    }
}

impl TargetCluster for KubeCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ApiResource>, ClusterError> {
        with_deadline(
            self.deadline,
            self.resolver.resolve(self.key.as_str(), gvk, &self.client),
        )
        .await
        .map_err(|e| ClusterError::Timeout("discovery", e.0))?
        .map_err(ClusterError::from)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        lp: &ListParams,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let api: Api<DynamicObject> = Api::all_with(self.client(), resource);
        self.list_all("list", api, lp).await
    }

    async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>, ClusterError> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client());
        self.list_all("list CustomResourceDefinitions", api, &ListParams::default())
            .await
    }
}
