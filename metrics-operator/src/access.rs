//! Resolution of the cluster(s) a metric measures.
//!
//! Secrets are always read from the operator's own cluster, so resolving the
//! access of one cluster never requires access to another remote cluster.
use std::{
    collections::HashMap,
    fmt::Debug,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        authentication::v1::{TokenRequest, TokenRequestSpec},
        core::v1::ServiceAccount,
    },
    chrono::{self, DateTime, Utc},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DynamicObject, GroupVersionKind, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
};
use metrics_operator_apis::{
    AccessSource, ClusterAccessSpec, ObjectReference, ProjectionType, ValidationError,
    v1alpha1::{FederatedAccessPath, FederatedClusterAccess, RemoteClusterAccess},
    v1beta1::ClusterAccess,
};
use secrecy::SecretString;
use serde::{Deserialize, de::DeserializeOwned};

use crate::{
    cluster::{ClusterError, KubeCluster, TargetCluster},
    discovery::GvrResolver,
    handlers::reason,
    projection::{ProjectionError, project},
    secrets::{SecretError, read_secret, secret_value, utf8},
    utils::with_deadline,
};

/// Discovery cache key of the operator's own cluster.
const LOCAL_CLUSTER: &str = "";

/// Lifetime requested for service account tokens.
const TOKEN_EXPIRATION_SECONDS: i64 = 3600;

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 300;

#[derive(thiserror::Error, Debug)]
pub(crate) enum AccessError {
    #[error("{kind} {reference} not found")]
    NotFound {
        kind: &'static str,
        reference: String,
    },
    #[error("{0}")]
    Secret(#[from] SecretError),
    #[error("invalid kubeconfig: {0}")]
    InvalidKubeConfig(String),
    #[error("invalid cluster secret: {0}")]
    InvalidClusterSecret(String),
    #[error("TokenRequest for service account {service_account} failed: {message}")]
    TokenRequest {
        service_account: String,
        message: String,
    },
    #[error("field path {path:?} not found on {object}")]
    PathNotFound { path: String, object: String },
    #[error("invalid secret reference on {object}: {message}")]
    InvalidSecretRef { object: String, message: String },
    #[error("{0}")]
    InvalidSpec(#[from] ValidationError),
    #[error("{0}")]
    Projection(#[from] ProjectionError),
    #[error("{0}")]
    Cluster(#[from] ClusterError),
    #[error("{0}")]
    Kube(#[from] kube::Error),
    #[error("{0} did not complete within {1:?}")]
    Timeout(&'static str, Duration),
}

impl AccessError {
    /// The operation and deadline if resolution was aborted by a deadline.
    pub(crate) fn deadline_exceeded(&self) -> Option<(&'static str, Duration)> {
        match self {
            AccessError::Timeout(what, deadline)
            | AccessError::Cluster(ClusterError::Timeout(what, deadline)) => Some((what, *deadline)),
            _ => None,
        }
    }

    pub(crate) fn reason(&self) -> &'static str {
        match self {
            AccessError::InvalidSpec(_) => reason::INVALID_SPEC,
            _ => reason::CLUSTER_UNAVAILABLE,
        }
    }
}

/// A cluster discovered through a FederatedClusterAccess.
pub(crate) struct FederatedCluster {
    /// `namespace/name` of the object representing the cluster, just the
    /// name if it is cluster scoped.
    pub name: String,
    pub cluster: Result<KubeCluster, AccessError>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TokenKey {
    /// `{namespace}/{name}` of the service account.
    pub service_account: String,
    pub audience: String,
}

#[derive(Clone, Debug)]
pub(crate) struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECONDS) > now
    }
}

/// Service account tokens keyed by service account and audience. Concurrent
/// lookups of the same key wait for a single refresh.
#[derive(Default)]
pub(crate) struct TokenCache {
    entries: Mutex<HashMap<TokenKey, Arc<tokio::sync::Mutex<Option<CachedToken>>>>>,
}

impl TokenCache {
    pub(crate) async fn get_or_refresh<F, Fut>(
        &self,
        key: TokenKey,
        refresh: F,
    ) -> Result<String, AccessError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken, AccessError>>,
    {
        let slot = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.entry(key).or_default().clone()
        };
        let mut cached = slot.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.token.clone());
        }
        let token = refresh().await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }
}

/// Names federated clusters uniquely, as objects of namespaced kinds may
/// share their name.
fn federated_cluster_name(object: &DynamicObject) -> String {
    match object.namespace().filter(|v| !v.is_empty()) {
        Some(namespace) => format!("{}/{}", namespace, object.name_any()),
        None => object.name_any(),
    }
}

/// Secret reference found on a federation object.
#[derive(Deserialize, Debug, PartialEq)]
struct FederatedSecretRef {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

pub(crate) async fn config_from_kubeconfig(kubeconfig: &str) -> Result<kube::Config, AccessError> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| AccessError::InvalidKubeConfig(e.to_string()))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| AccessError::InvalidKubeConfig(e.to_string()))
}

/// REST config authenticating with a service account token.
pub(crate) fn service_account_config(
    host: &str,
    ca_data: &str,
    token: String,
) -> Result<kube::Config, AccessError> {
    let uri: hyper::Uri = host
        .trim()
        .parse()
        .map_err(|e| AccessError::InvalidClusterSecret(format!("invalid host {:?}: {}", host, e)))?;
    let mut config = kube::Config::new(uri);
    config.root_cert = Some(ca_certificates(ca_data)?);
    config.auth_info.token = Some(SecretString::from(token));
    Ok(config)
}

/// DER encoded certificates of a PEM bundle, which might be base64 encoded once more.
fn ca_certificates(ca_data: &str) -> Result<Vec<Vec<u8>>, AccessError> {
    let trimmed = ca_data.trim();
    let pem = if trimmed.contains("-----BEGIN") {
        trimmed.as_bytes().to_vec()
    } else {
        STANDARD
            .decode(trimmed)
            .map_err(|e| AccessError::InvalidClusterSecret(format!("invalid caData: {}", e)))?
    };
    let certificates = rustls_pemfile::certs(&mut pem.as_slice())
        .map(|c| c.map(|c| c.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AccessError::InvalidClusterSecret(format!("invalid caData: {}", e)))?;
    if certificates.is_empty() {
        Err(AccessError::InvalidClusterSecret(
            "caData contains no certificate".to_string(),
        ))
    } else {
        Ok(certificates)
    }
}

/// Turns cluster access references into clients of the referenced clusters.
pub(crate) struct AccessResolver {
    /// Client of the operator's own cluster.
    client: Client,
    resolver: Arc<GvrResolver>,
    tokens: TokenCache,
}

impl AccessResolver {
    pub(crate) fn new(client: Client, resolver: Arc<GvrResolver>) -> Self {
        Self {
            client,
            resolver,
            tokens: Default::default(),
        }
    }

    /// The operator's own cluster.
    pub(crate) fn local(&self, deadline: Duration) -> KubeCluster {
        KubeCluster::new(
            self.client.clone(),
            LOCAL_CLUSTER.to_string(),
            self.resolver.clone(),
            deadline,
        )
    }

    pub(crate) async fn remote_cluster_access(
        &self,
        reference: &ObjectReference,
        deadline: Duration,
    ) -> Result<KubeCluster, AccessError> {
        let access: RemoteClusterAccess = self
            .get("RemoteClusterAccess", reference, deadline)
            .await?;
        self.cluster(
            access.spec.source()?,
            format!("RemoteClusterAccess/{}", reference),
            deadline,
        )
        .await
    }

    pub(crate) async fn cluster_access(
        &self,
        reference: &ObjectReference,
        deadline: Duration,
    ) -> Result<KubeCluster, AccessError> {
        let access: ClusterAccess = self.get("ClusterAccess", reference, deadline).await?;
        self.cluster(
            access.spec.source()?,
            format!("ClusterAccess/{}", reference),
            deadline,
        )
        .await
    }

    /// All clusters of a FederatedClusterAccess. Clusters whose credentials
    /// cannot be resolved are returned with their error.
    pub(crate) async fn federated_clusters(
        &self,
        reference: &ObjectReference,
        deadline: Duration,
    ) -> Result<Vec<FederatedCluster>, AccessError> {
        let access: FederatedClusterAccess = self
            .get("FederatedClusterAccess", reference, deadline)
            .await?;
        let path = access.spec.path()?;
        let target = &access.spec.target;
        target.validate()?;
        let local = self.local(deadline);
        let gvk = GroupVersionKind::gvk(&target.group, &target.version, &target.kind);
        let resource = local
            .resolve(&gvk)
            .await?
            .ok_or_else(|| AccessError::NotFound {
                kind: "resource kind",
                reference: format!("{}/{}", gvk.api_version(), gvk.kind),
            })?;
        let mut lp = ListParams::default();
        lp.label_selector = access.spec.label_selector.clone();
        lp.field_selector = access.spec.field_selector.clone();
        let objects = local.list(&resource, &lp).await?;
        let mut clusters = Vec::with_capacity(objects.len());
        for object in objects {
            let name = federated_cluster_name(&object);
            let cluster = self
                .federated_cluster(reference, &object, path, deadline)
                .await;
            if let Err(e) = &cluster {
                warn!("cannot access federated cluster {} of {}: {}", name, reference, e);
            }
            clusters.push(FederatedCluster { name, cluster });
        }
        Ok(clusters)
    }

    async fn federated_cluster(
        &self,
        reference: &ObjectReference,
        object: &DynamicObject,
        path: FederatedAccessPath<'_>,
        deadline: Duration,
    ) -> Result<KubeCluster, AccessError> {
        let namespace = object.namespace().unwrap_or_default();
        let id = format!("{}/{}", namespace, object.name_any());
        let value = serde_json::to_value(object).map_err(|e| AccessError::InvalidSecretRef {
            object: id.clone(),
            message: e.to_string(),
        })?;
        let not_found = |path: &str| AccessError::PathNotFound {
            path: path.to_string(),
            object: id.clone(),
        };
        let kubeconfig = match path {
            FederatedAccessPath::KubeConfig(path) => {
                project(&value, path, ProjectionType::Primitive, None)?
                    .ok_or_else(|| not_found(path))?
            }
            FederatedAccessPath::SecretRef(path) => {
                let raw = project(&value, path, ProjectionType::Map, None)?
                    .ok_or_else(|| not_found(path))?;
                let secret_ref: FederatedSecretRef =
                    serde_json::from_str(raw.as_str()).map_err(|e| {
                        AccessError::InvalidSecretRef {
                            object: id.clone(),
                            message: e.to_string(),
                        }
                    })?;
                let namespace = secret_ref
                    .namespace
                    .filter(|v| !v.is_empty())
                    .unwrap_or(namespace);
                let key = secret_ref
                    .key
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| metrics_operator_apis::DEFAULT_KUBECONFIG_KEY.to_string());
                self.read_text(&namespace, &secret_ref.name, &key, deadline)
                    .await?
            }
        };
        let config = config_from_kubeconfig(&kubeconfig).await?;
        Ok(KubeCluster::new(
            Client::try_from(config)?,
            format!("FederatedClusterAccess/{}/{}", reference, id),
            self.resolver.clone(),
            deadline,
        )
        .with_credentials(&kubeconfig))
    }

    async fn get<K>(
        &self,
        kind: &'static str,
        reference: &ObjectReference,
        deadline: Duration,
    ) -> Result<K, AccessError>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), reference.namespace.as_str());
        with_deadline(deadline, api.get_opt(reference.name.as_str()))
            .await
            .map_err(|e| AccessError::Timeout("get cluster access", e.0))??
            .ok_or_else(|| AccessError::NotFound {
                kind,
                reference: reference.to_string(),
            })
    }

    async fn read_text(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        deadline: Duration,
    ) -> Result<String, AccessError> {
        let secret = with_deadline(deadline, read_secret(self.client.clone(), namespace, name))
            .await
            .map_err(|e| AccessError::Timeout("read secret", e.0))??;
        let value = secret_value(&secret, key)?;
        utf8(key, value).map_err(AccessError::InvalidKubeConfig)
    }

    async fn cluster(
        &self,
        source: AccessSource<'_>,
        key: String,
        deadline: Duration,
    ) -> Result<KubeCluster, AccessError> {
        let (config, credentials) = match source {
            AccessSource::KubeConfig(secret_ref) => {
                let kubeconfig = self
                    .read_text(
                        &secret_ref.namespace,
                        &secret_ref.name,
                        secret_ref.key(),
                        deadline,
                    )
                    .await?;
                (config_from_kubeconfig(&kubeconfig).await?, kubeconfig)
            }
            AccessSource::ServiceAccount(access) => {
                let cluster_secret = &access.cluster_secret_ref;
                let secret = with_deadline(
                    deadline,
                    read_secret(
                        self.client.clone(),
                        &cluster_secret.namespace,
                        &cluster_secret.name,
                    ),
                )
                .await
                .map_err(|e| AccessError::Timeout("read secret", e.0))??;
                let text = |key: &str| -> Result<String, AccessError> {
                    utf8(key, secret_value(&secret, key)?).map_err(AccessError::InvalidClusterSecret)
                };
                let (host, audience, ca_data) = (text("host")?, text("audience")?, text("caData")?);
                let token_key = TokenKey {
                    service_account: format!(
                        "{}/{}",
                        access.service_account_namespace, access.service_account_name
                    ),
                    audience: audience.trim().to_string(),
                };
                let token = self
                    .tokens
                    .get_or_refresh(token_key.clone(), || {
                        self.request_token(
                            &access.service_account_namespace,
                            &access.service_account_name,
                            token_key.audience.as_str(),
                            deadline,
                        )
                    })
                    .await?;
                (service_account_config(&host, &ca_data, token.clone())?, token)
            }
        };
        Ok(KubeCluster::new(
            Client::try_from(config)?,
            key,
            self.resolver.clone(),
            deadline,
        )
        .with_credentials(&credentials))
    }

    async fn request_token(
        &self,
        namespace: &str,
        name: &str,
        audience: &str,
        deadline: Duration,
    ) -> Result<CachedToken, AccessError> {
        let service_account = format!("{}/{}", namespace, name);
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: vec![audience.to_string()],
                expiration_seconds: Some(TOKEN_EXPIRATION_SECONDS),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = with_deadline(
            deadline,
            api.create_token_request(name, &PostParams::default(), &request),
        )
        .await
        .map_err(|e| AccessError::Timeout("TokenRequest", e.0))?
        .map_err(|e| AccessError::TokenRequest {
            service_account: service_account.clone(),
            message: e.to_string(),
        })?;
        let status = response.status.ok_or_else(|| AccessError::TokenRequest {
            service_account: service_account.clone(),
            message: "response carries no token".to_string(),
        })?;
        debug!(
            "requested token for service account {} valid until {}",
            service_account, status.expiration_timestamp.0
        );
        Ok(CachedToken {
            token: status.token,
            expires_at: status.expiration_timestamp.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBCgKCAQEA\n-----END CERTIFICATE-----\n";

    #[test]
    fn ca_certificates_from_pem_and_base64() {
        let plain = ca_certificates(PEM).unwrap();
        assert_eq!(1, plain.len());
        let wrapped = ca_certificates(STANDARD.encode(PEM).as_str()).unwrap();
        assert_eq!(plain, wrapped);
        assert!(matches!(
            ca_certificates("not base64!"),
            Err(AccessError::InvalidClusterSecret(_))
        ));
        assert!(matches!(
            ca_certificates(STANDARD.encode("no pem").as_str()),
            Err(AccessError::InvalidClusterSecret(_))
        ));
    }

    #[test]
    fn service_account_rest_config() {
        let config =
            service_account_config("https://10.0.0.1:6443", PEM, "token".to_string()).unwrap();
        assert_eq!(Some("10.0.0.1"), config.cluster_url.host());
        assert_eq!(Some(6443), config.cluster_url.port_u16());
        assert_eq!(1, config.root_cert.as_ref().unwrap().len());
        assert!(config.auth_info.token.is_some());
        assert!(matches!(
            service_account_config("not a host", PEM, "token".to_string()),
            Err(AccessError::InvalidClusterSecret(_))
        ));
    }

    #[tokio::test]
    async fn kubeconfig_rest_config() {
        let kubeconfig = r#"
apiVersion: v1
kind: Config
clusters:
- name: remote
  cluster:
    server: https://remote.example:6443
    insecure-skip-tls-verify: true
users:
- name: metrics
  user:
    token: abc
contexts:
- name: remote
  context:
    cluster: remote
    user: metrics
    namespace: monitoring
current-context: remote
"#;
        let config = config_from_kubeconfig(kubeconfig).await.unwrap();
        assert_eq!(Some("remote.example"), config.cluster_url.host());
        assert_eq!("monitoring", config.default_namespace);
        assert!(matches!(
            config_from_kubeconfig("clusters: [").await,
            Err(AccessError::InvalidKubeConfig(_))
        ));
    }

    fn key() -> TokenKey {
        TokenKey {
            service_account: "ops/metrics".to_string(),
            audience: "remote".to_string(),
        }
    }

    #[tokio::test]
    async fn concurrent_token_lookups_refresh_once() {
        let cache = TokenCache::default();
        let counter = AtomicUsize::new(0);
        let refreshes = &counter;
        let refresh = move || async move {
            refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(CachedToken {
                token: "t1".to_string(),
                expires_at: Utc::now() + chrono::Duration::seconds(3600),
            })
        };
        let (a, b) = tokio::join!(
            cache.get_or_refresh(key(), refresh),
            cache.get_or_refresh(key(), refresh)
        );
        assert_eq!("t1", a.unwrap());
        assert_eq!("t1", b.unwrap());
        assert_eq!(1, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn expiring_tokens_are_refreshed() {
        let cache = TokenCache::default();
        let token = cache
            .get_or_refresh(key(), || async {
                Ok(CachedToken {
                    token: "short-lived".to_string(),
                    expires_at: Utc::now() + chrono::Duration::seconds(60),
                })
            })
            .await
            .unwrap();
        assert_eq!("short-lived", token);
        let token = cache
            .get_or_refresh(key(), || async {
                Ok(CachedToken {
                    token: "renewed".to_string(),
                    expires_at: Utc::now() + chrono::Duration::seconds(3600),
                })
            })
            .await
            .unwrap();
        assert_eq!("renewed", token);
        let failed = cache
            .get_or_refresh(
                TokenKey {
                    audience: "other".to_string(),
                    ..key()
                },
                || async {
                    Err(AccessError::TokenRequest {
                        service_account: "ops/metrics".to_string(),
                        message: "forbidden".to_string(),
                    })
                },
            )
            .await;
        assert!(failed.is_err());
    }

    #[test]
    fn federated_cluster_names() {
        let object = |value: serde_json::Value| -> DynamicObject {
            serde_json::from_value(value).unwrap()
        };
        let east = object(serde_json::json!({
            "apiVersion": "clusters.example/v1",
            "kind": "Cluster",
            "metadata": {"name": "east", "namespace": "team-a"},
        }));
        let other_east = object(serde_json::json!({
            "apiVersion": "clusters.example/v1",
            "kind": "Cluster",
            "metadata": {"name": "east", "namespace": "team-b"},
        }));
        let global = object(serde_json::json!({
            "apiVersion": "clusters.example/v1",
            "kind": "Cluster",
            "metadata": {"name": "global"},
        }));
        assert_eq!("team-a/east", federated_cluster_name(&east));
        assert_ne!(federated_cluster_name(&east), federated_cluster_name(&other_east));
        assert_eq!("global", federated_cluster_name(&global));
    }

    #[test]
    fn federated_secret_ref() {
        let r: FederatedSecretRef =
            serde_json::from_str(r#"{"name":"kubeconfig-a","key":"value"}"#).unwrap();
        assert_eq!(
            FederatedSecretRef {
                name: "kubeconfig-a".to_string(),
                namespace: None,
                key: Some("value".to_string()),
            },
            r
        );
    }

    #[test]
    fn reasons() {
        assert_eq!(
            reason::INVALID_SPEC,
            AccessError::InvalidSpec(ValidationError::AmbiguousClusterAccess).reason()
        );
        let e = AccessError::Timeout("TokenRequest", Duration::from_secs(30));
        assert_eq!(Some(("TokenRequest", Duration::from_secs(30))), e.deadline_exceeded());
        assert_eq!(
            None,
            AccessError::InvalidKubeConfig("x".to_string()).deadline_exceeded()
        );
        assert_eq!(reason::CLUSTER_UNAVAILABLE, e.reason());
    }
}
