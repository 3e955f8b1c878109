//! `metrics.openmcp.cloud/v1alpha1` kinds.
use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    ClusterAccessConfig, ClusterAccessSpec, DataSinkReference, KubeConfigSecretRef,
    MetricStatus, ObjectReference, Projection, SUPPORTED_SCHEMES, SecretKeyReference,
    TargetResource, ValidationError, default_frequency, default_interval,
};

/// Counts resources of a Group/Version/Kind, optionally grouped by projected fields.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1alpha1",
    kind = "Metric",
    derive = "PartialEq",
    status = "MetricStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Value","type":"string","jsonPath":".status.observation.latestValue"}"#,
    printcolumn = r#"{"name":"Observed","type":"string","jsonPath":".status.observation.timestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    /// Metric name as exported to the data sink.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The resources to measure.
    pub target: TargetResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    /// Measurement interval as duration (e.g. `10m`), at least one minute.
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Deprecated measurement frequency in minutes, superseded by `interval`.
    #[serde(default = "default_frequency")]
    pub frequency: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sink_ref: Option<DataSinkReference>,
    /// Measure resources of a remote cluster instead of the operator's own cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_cluster_access_ref: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projections: Vec<Projection>,
}

/// Counts Crossplane managed resources, one data point per resource.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1alpha1",
    kind = "ManagedMetric",
    derive = "PartialEq",
    status = "MetricStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Value","type":"string","jsonPath":".status.observation.latestValue"}"#,
    printcolumn = r#"{"name":"Observed","type":"string","jsonPath":".status.observation.timestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedMetricSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Managed resource kind, empty matches all kinds.
    #[serde(default)]
    pub kind: String,
    /// Managed resource API group, empty matches all groups.
    #[serde(default)]
    pub group: String,
    /// Managed resource version, empty selects the storage version.
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_frequency")]
    pub frequency: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sink_ref: Option<DataSinkReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_cluster_access_ref: Option<ObjectReference>,
    /// Dimension name to field path, evaluated against each managed resource.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
}

impl ManagedMetricSpec {
    pub fn target(&self) -> TargetResource {
        TargetResource {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// Like a Metric, measured in every cluster a FederatedClusterAccess discovers.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1alpha1",
    kind = "FederatedMetric",
    derive = "PartialEq",
    status = "MetricStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Value","type":"string","jsonPath":".status.observation.latestValue"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedMetricSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub target: TargetResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_frequency")]
    pub frequency: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sink_ref: Option<DataSinkReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projections: Vec<Projection>,
    pub federate_cluster_access_ref: ObjectReference,
}

/// Like a ManagedMetric, measured in every cluster a FederatedClusterAccess discovers.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1alpha1",
    kind = "FederatedManagedMetric",
    derive = "PartialEq",
    status = "MetricStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Value","type":"string","jsonPath":".status.observation.latestValue"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedManagedMetricSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_frequency")]
    pub frequency: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sink_ref: Option<DataSinkReference>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
    pub federate_cluster_access_ref: ObjectReference,
}

impl FederatedManagedMetricSpec {
    pub fn target(&self) -> TargetResource {
        TargetResource {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl_metric_object!(Metric, ManagedMetric, FederatedMetric, FederatedManagedMetric);

/// Connection and authentication details of an OTLP compatible metrics endpoint.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1alpha1",
    kind = "DataSink",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.connection.endpoint"}"#
)]
pub struct DataSinkSpec {
    pub connection: Connection,
    pub authentication: Authentication,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct Connection {
    /// Endpoint URL, the scheme must be one of `http`, `https`, `grpc` or `grpcs`.
    pub endpoint: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeyAuthentication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateAuthentication>,
}

/// Authentication with an `Authorization: Api-Token <token>` header.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyAuthentication {
    pub secret_key_ref: SecretKeyReference,
}

/// Mutual TLS authentication.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthentication {
    pub client_cert: SecretKeyReference,
    pub client_key: SecretKeyReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<SecretKeyReference>,
}

/// The validated authentication variant of a [`DataSink`].
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SinkAuthentication<'a> {
    ApiKey(&'a ApiKeyAuthentication),
    Certificate(&'a CertificateAuthentication),
}

impl DataSinkSpec {
    pub fn validate(&self) -> Result<SinkAuthentication<'_>, ValidationError> {
        let endpoint = self.connection.endpoint.trim();
        let (scheme, rest) = endpoint
            .split_once("://")
            .ok_or_else(|| ValidationError::InvalidEndpoint(endpoint.to_string()))?;
        if rest.is_empty() {
            return Err(ValidationError::InvalidEndpoint(endpoint.to_string()));
        }
        if !SUPPORTED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
            return Err(ValidationError::UnsupportedScheme(scheme.to_string()));
        }
        match (&self.authentication.api_key, &self.authentication.certificate) {
            (Some(api_key), None) => Ok(SinkAuthentication::ApiKey(api_key)),
            (None, Some(certificate)) => Ok(SinkAuthentication::Certificate(certificate)),
            _ => Err(ValidationError::AmbiguousAuthentication),
        }
    }
}

/// Credentials to access a remote cluster.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1alpha1",
    kind = "RemoteClusterAccess",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteClusterAccessSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config_secret_ref: Option<KubeConfigSecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_access_config: Option<ClusterAccessConfig>,
}

impl ClusterAccessSpec for RemoteClusterAccessSpec {
    fn kube_config_secret_ref(&self) -> Option<&KubeConfigSecretRef> {
        self.kube_config_secret_ref.as_ref()
    }

    fn cluster_access_config(&self) -> Option<&ClusterAccessConfig> {
        self.cluster_access_config.as_ref()
    }
}

/// Describes the objects in the operator's cluster which carry credentials of
/// federated clusters, and where on those objects the credentials are found.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1alpha1",
    kind = "FederatedClusterAccess",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedClusterAccessSpec {
    /// Kind of the objects representing federated clusters.
    pub target: TargetResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    /// Field path of an inline kubeconfig string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config_path: Option<String>,
    /// Field path of a `{name, namespace, key}` Secret reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref_path: Option<String>,
}

/// Where a federated cluster's credentials are found on its federation object.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum FederatedAccessPath<'a> {
    KubeConfig(&'a str),
    SecretRef(&'a str),
}

impl FederatedClusterAccessSpec {
    pub fn path(&self) -> Result<FederatedAccessPath<'_>, ValidationError> {
        fn non_empty(v: &Option<String>) -> Option<&str> {
            v.as_deref().filter(|v| !v.trim().is_empty())
        }
        match (
            non_empty(&self.kube_config_path),
            non_empty(&self.secret_ref_path),
        ) {
            (Some(path), None) => Ok(FederatedAccessPath::KubeConfig(path)),
            (None, Some(path)) => Ok(FederatedAccessPath::SecretRef(path)),
            _ => Err(ValidationError::AmbiguousFederatedAccess),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessSource, MetricObject};

    #[test]
    fn metric_spec_defaults() {
        let spec: MetricSpec = serde_json::from_str(
            r#"{"name":"pods","target":{"version":"v1","kind":"Pod"}}"#,
        )
        .unwrap();
        assert_eq!("10m", spec.interval);
        assert_eq!(720, spec.frequency);
        assert_eq!("", spec.target.group);
        assert!(spec.projections.is_empty());
        assert_eq!(
            r#"{"name":"pods","target":{"group":"","version":"v1","kind":"Pod"},"interval":"10m","frequency":720}"#,
            serde_json::to_string(&spec).unwrap()
        );
    }

    #[test]
    fn metric_object_accessors() {
        let spec: MetricSpec = serde_json::from_str(
            r#"{"name":"pods","target":{"kind":"Pod"},"interval":"1h","dataSinkRef":{}}"#,
        )
        .unwrap();
        let mut metric = Metric::new("pods", spec);
        assert_eq!("pods", metric.metric_name());
        assert_eq!("1h", metric.interval());
        assert_eq!("default", metric.data_sink_ref().unwrap().name);
        assert!(metric.metric_status().is_none());
        metric.metric_status_mut().ready = Some("True".to_string());
        assert_eq!(
            Some("True"),
            metric.metric_status().unwrap().ready.as_deref()
        );
    }

    #[test]
    fn federated_spec_defaults() {
        let spec: FederatedMetricSpec = serde_json::from_str(
            r#"{"name":"pods","target":{"kind":"Pod"},"federateClusterAccessRef":{"name":"fleet","namespace":"ops"}}"#,
        )
        .unwrap();
        assert_eq!("10m", spec.interval);
        assert_eq!(720, spec.frequency);
        let spec: FederatedManagedMetricSpec = serde_json::from_str(
            r#"{"name":"managed","frequency":30,"federateClusterAccessRef":{"name":"fleet","namespace":"ops"}}"#,
        )
        .unwrap();
        assert_eq!(30, spec.frequency);
        assert_eq!("10m", spec.interval);
    }

    fn data_sink(auth: Authentication, endpoint: &str) -> DataSinkSpec {
        DataSinkSpec {
            connection: Connection {
                endpoint: endpoint.to_string(),
            },
            authentication: auth,
        }
    }

    fn api_key() -> ApiKeyAuthentication {
        ApiKeyAuthentication {
            secret_key_ref: SecretKeyReference {
                name: "token".to_string(),
                key: "api-key".to_string(),
            },
        }
    }

    fn certificate() -> CertificateAuthentication {
        CertificateAuthentication {
            client_cert: SecretKeyReference {
                name: "tls".to_string(),
                key: "tls.crt".to_string(),
            },
            client_key: SecretKeyReference {
                name: "tls".to_string(),
                key: "tls.key".to_string(),
            },
            ca_cert: None,
        }
    }

    #[test]
    fn data_sink_requires_exactly_one_authentication() {
        let none = data_sink(Authentication::default(), "https://otlp.example.com");
        assert_eq!(
            Err(ValidationError::AmbiguousAuthentication),
            none.validate()
        );
        let both = data_sink(
            Authentication {
                api_key: Some(api_key()),
                certificate: Some(certificate()),
            },
            "https://otlp.example.com",
        );
        assert_eq!(
            Err(ValidationError::AmbiguousAuthentication),
            both.validate()
        );
        let key = api_key();
        let only_key = data_sink(
            Authentication {
                api_key: Some(key.clone()),
                certificate: None,
            },
            "https://otlp.example.com/api/v2/otlp",
        );
        assert_eq!(Ok(SinkAuthentication::ApiKey(&key)), only_key.validate());
        let only_cert = data_sink(
            Authentication {
                api_key: None,
                certificate: Some(certificate()),
            },
            "grpcs://otlp.example.com:4317",
        );
        assert!(matches!(
            only_cert.validate(),
            Ok(SinkAuthentication::Certificate(_))
        ));
    }

    #[test]
    fn data_sink_decoded_with_both_variants_is_rejected() {
        let spec: DataSinkSpec = serde_json::from_value(serde_json::json!({
            "connection": {"endpoint": "https://otlp.example.com"},
            "authentication": {
                "apiKey": {"secretKeyRef": {"name": "a", "key": "b"}},
                "certificate": {
                    "clientCert": {"name": "c", "key": "tls.crt"},
                    "clientKey": {"name": "c", "key": "tls.key"}
                }
            }
        }))
        .unwrap();
        assert_eq!(
            Err(ValidationError::AmbiguousAuthentication),
            spec.validate()
        );
    }

    #[test]
    fn data_sink_endpoint_scheme() {
        let auth = Authentication {
            api_key: Some(api_key()),
            certificate: None,
        };
        assert_eq!(
            Err(ValidationError::UnsupportedScheme("ftp".to_string())),
            data_sink(auth.clone(), "ftp://otlp.example.com").validate()
        );
        assert_eq!(
            Err(ValidationError::InvalidEndpoint("otlp.example.com".to_string())),
            data_sink(auth.clone(), "otlp.example.com").validate()
        );
        assert!(data_sink(auth, "HTTP://localhost:4318").validate().is_ok());
    }

    #[test]
    fn remote_cluster_access_requires_exactly_one_source() {
        let secret = KubeConfigSecretRef {
            name: "kubeconfig".to_string(),
            namespace: "ns".to_string(),
            key: None,
        };
        let config = ClusterAccessConfig {
            service_account_name: "metrics".to_string(),
            service_account_namespace: "ns".to_string(),
            cluster_secret_ref: ObjectReference {
                name: "cluster".to_string(),
                namespace: "ns".to_string(),
            },
        };
        let mut spec = RemoteClusterAccessSpec {
            kube_config_secret_ref: None,
            cluster_access_config: None,
        };
        assert_eq!(Err(ValidationError::AmbiguousClusterAccess), spec.source());
        spec.kube_config_secret_ref = Some(secret.clone());
        assert_eq!(Ok(AccessSource::KubeConfig(&secret)), spec.source());
        spec.cluster_access_config = Some(config.clone());
        assert_eq!(Err(ValidationError::AmbiguousClusterAccess), spec.source());
        spec.kube_config_secret_ref = None;
        assert_eq!(Ok(AccessSource::ServiceAccount(&config)), spec.source());
    }

    #[test]
    fn federated_cluster_access_requires_exactly_one_path() {
        let mut spec = FederatedClusterAccessSpec {
            target: TargetResource {
                group: "core.openmcp.cloud".to_string(),
                version: "v1alpha1".to_string(),
                kind: "ControlPlane".to_string(),
            },
            label_selector: None,
            field_selector: None,
            kube_config_path: Some("status.kubeconfig".to_string()),
            secret_ref_path: Some("  ".to_string()),
        };
        assert_eq!(
            Ok(FederatedAccessPath::KubeConfig("status.kubeconfig")),
            spec.path()
        );
        spec.secret_ref_path = Some("status.secretRef".to_string());
        assert_eq!(Err(ValidationError::AmbiguousFederatedAccess), spec.path());
        spec.kube_config_path = None;
        assert_eq!(
            Ok(FederatedAccessPath::SecretRef("status.secretRef")),
            spec.path()
        );
        spec.secret_ref_path = None;
        assert_eq!(Err(ValidationError::AmbiguousFederatedAccess), spec.path());
    }
}
