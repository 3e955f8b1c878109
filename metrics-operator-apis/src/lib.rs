use std::collections::BTreeMap;

use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    chrono::{SecondsFormat, Utc},
};
use kube::{
    CustomResourceExt,
    core::crd::{MergeError, merge_crds},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "metrics.openmcp.cloud";

/// Name of the [`DataSinkReference`] used when a metric does not name one.
pub const DEFAULT_DATA_SINK: &str = "default";

/// Key looked up in a kubeconfig secret when the reference does not name one.
pub const DEFAULT_KUBECONFIG_KEY: &str = "kubeconfig";

pub const DEFAULT_INTERVAL: &str = "10m";

pub const DEFAULT_FREQUENCY: i64 = 720;

/// Implements [`MetricObject`] for metric kinds, which all share the same
/// `spec.name`, `spec.interval`, `spec.dataSinkRef` and [`MetricStatus`] layout.
macro_rules! impl_metric_object {
    ($($kind:ty),* $(,)?) => {
        $(
            impl $crate::MetricObject for $kind {
                fn metric_name(&self) -> &str {
                    self.spec.name.as_str()
                }

                fn interval(&self) -> &str {
                    self.spec.interval.as_str()
                }

                fn data_sink_ref(&self) -> Option<&$crate::DataSinkReference> {
                    self.spec.data_sink_ref.as_ref()
                }

                fn metric_status(&self) -> Option<&$crate::MetricStatus> {
                    self.status.as_ref()
                }

                fn metric_status_mut(&mut self) -> &mut $crate::MetricStatus {
                    self.status.get_or_insert_with(Default::default)
                }
            }
        )*
    };
}

pub mod v1alpha1;
pub mod v1beta1;

/// Storage version of kinds served in more than one version.
pub const STORAGE_VERSION: &str = "v1alpha1";

/// All CustomResourceDefinitions of the operator, kinds served in several
/// versions merged into a single definition.
pub fn crds() -> Result<Vec<CustomResourceDefinition>, MergeError> {
    Ok(vec![
        v1alpha1::Metric::crd(),
        v1alpha1::ManagedMetric::crd(),
        v1alpha1::DataSink::crd(),
        v1alpha1::RemoteClusterAccess::crd(),
        v1beta1::SingleMetric::crd(),
        v1beta1::CompoundMetric::crd(),
        v1beta1::ClusterAccess::crd(),
        merge_crds(
            vec![
                v1alpha1::FederatedMetric::crd(),
                v1beta1::FederatedMetric::crd(),
            ],
            STORAGE_VERSION,
        )?,
        merge_crds(
            vec![
                v1alpha1::FederatedManagedMetric::crd(),
                v1beta1::FederatedManagedMetric::crd(),
            ],
            STORAGE_VERSION,
        )?,
        merge_crds(
            vec![
                v1alpha1::FederatedClusterAccess::crd(),
                v1beta1::FederatedClusterAccess::crd(),
            ],
            STORAGE_VERSION,
        )?,
    ])
}

/// Common accessors of all metric kinds.
pub trait MetricObject {
    /// The metric name as exported to the data sink (`spec.name`).
    fn metric_name(&self) -> &str;
    /// The measurement interval as Go-style duration string (e.g. `10m`).
    fn interval(&self) -> &str;
    fn data_sink_ref(&self) -> Option<&DataSinkReference>;
    fn metric_status(&self) -> Option<&MetricStatus>;
    fn metric_status_mut(&mut self) -> &mut MetricStatus;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("target kind must not be empty")]
    MissingKind,
    #[error("endpoint {0:?} is not a valid URL")]
    InvalidEndpoint(String),
    #[error("endpoint scheme {0:?} is not supported, expected one of http, https, grpc, grpcs")]
    UnsupportedScheme(String),
    #[error("exactly one of authentication.apiKey or authentication.certificate must be set")]
    AmbiguousAuthentication,
    #[error("exactly one of kubeConfigSecretRef or clusterAccessConfig must be set")]
    AmbiguousClusterAccess,
    #[error("exactly one of kubeConfigPath or secretRefPath must be set")]
    AmbiguousFederatedAccess,
    #[error("projection {0:?} must have a unique, non-empty name and field path")]
    InvalidProjection(String),    #[error("at least one projection is required")]
    MissingProjections,
}

pub const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "grpc", "grpcs"];

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: tri_state(status).to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }
}

/// Render an optional boolean the way Kubernetes renders condition states.
pub fn tri_state(status: Option<bool>) -> &'static str {
    status
        .map(|v| if v { "True" } else { "False" })
        .unwrap_or("Unknown")
}

/// The Group/Version/Kind of the resources a metric measures.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Default, JsonSchema)]
pub struct TargetResource {
    /// The Kubernetes API Group name (without the version part), empty for the core group.
    #[serde(default)]
    pub group: String,
    /// The Kubernetes API version.
    #[serde(default)]
    pub version: String,
    /// The Kubernetes API Kind name.
    pub kind: String,
}

impl TargetResource {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kind.trim().is_empty() {
            Err(ValidationError::MissingKind)
        } else {
            Ok(())
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// How a projected value is coerced into a dimension value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionType {
    /// A single string, number, boolean or null.
    #[default]
    Primitive,
    /// A JSON array.
    Slice,
    /// A JSON object.
    Map,
}

/// A named extraction of a field from a target resource, used as metric dimension.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    /// The dimension name.
    pub name: String,
    /// JSONPath expression, e.g. `metadata.namespace` or
    /// `status.conditions[?(@.type=='Ready')].status`.
    pub field_path: String,
    /// Type the projected value must have, defaults to `primitive`.
    #[serde(default, rename = "type")]
    pub type_: ProjectionType,
    /// Value used if the field path does not match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Projections must carry unique names and non-empty field paths.
pub fn validate_projections(projections: &[Projection]) -> Result<(), ValidationError> {
    let mut names = std::collections::HashSet::new();
    for p in projections {
        if p.name.trim().is_empty() || p.field_path.trim().is_empty() || !names.insert(&p.name) {
            return Err(ValidationError::InvalidProjection(p.name.clone()));
        }
    }
    Ok(())
}

/// Reference to a [`v1alpha1::DataSink`] in the operator namespace.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct DataSinkReference {
    #[serde(default = "default_data_sink")]
    pub name: String,
}

impl Default for DataSinkReference {
    fn default() -> Self {
        Self {
            name: default_data_sink(),
        }
    }
}

fn default_data_sink() -> String {
    DEFAULT_DATA_SINK.to_string()
}

pub(crate) fn default_interval() -> String {
    DEFAULT_INTERVAL.to_string()
}

pub(crate) fn default_frequency() -> i64 {
    DEFAULT_FREQUENCY
}

/// Reference to a namespaced object.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Default, JsonSchema)]
pub struct ObjectReference {
    pub name: String,
    pub namespace: String,
}

impl std::fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Selects a key of a Secret in the same namespace as the referencing object.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Reference to a Secret holding a kubeconfig.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct KubeConfigSecretRef {
    pub name: String,
    pub namespace: String,
    /// Secret key holding the kubeconfig, defaults to `kubeconfig`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl KubeConfigSecretRef {
    pub fn key(&self) -> &str {
        self.key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(DEFAULT_KUBECONFIG_KEY)
    }
}

/// Service account based access to a remote cluster.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAccessConfig {
    pub service_account_name: String,
    pub service_account_namespace: String,
    /// Secret with the keys `host`, `audience` and `caData` of the remote cluster.
    pub cluster_secret_ref: ObjectReference,
}

/// The validated credential source of a cluster access object.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum AccessSource<'a> {
    KubeConfig(&'a KubeConfigSecretRef),
    ServiceAccount(&'a ClusterAccessConfig),
}

/// Common view on `RemoteClusterAccess` and `ClusterAccess` specs.
pub trait ClusterAccessSpec {
    fn kube_config_secret_ref(&self) -> Option<&KubeConfigSecretRef>;
    fn cluster_access_config(&self) -> Option<&ClusterAccessConfig>;

    fn source(&self) -> Result<AccessSource<'_>, ValidationError> {
        match (self.kube_config_secret_ref(), self.cluster_access_config()) {
            (Some(secret), None) => Ok(AccessSource::KubeConfig(secret)),
            (None, Some(config)) => Ok(AccessSource::ServiceAccount(config)),
            _ => Err(ValidationError::AmbiguousClusterAccess),
        }
    }
}

/// A single metric dimension.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// The most recent successful measurement.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricObservation {
    /// RFC3339 timestamp of the measurement.
    pub timestamp: String,
    pub latest_value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
}

impl MetricObservation {
    pub fn new(latest_value: String, dimensions: BTreeMap<String, String>) -> Self {
        Self {
            timestamp: now(),
            latest_value,
            dimensions: dimensions
                .into_iter()
                .map(|(name, value)| Dimension { name, value })
                .collect(),
        }
    }
}

/// Status shared by all metric kinds.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<MetricObservation>,
    /// One of `True`, `False` or `Unknown`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// RFC3339 timestamp of the last successful reconciliation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,
}

impl MetricStatus {
    pub fn update_condition(&mut self, mut c: Condition) {
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_default();
        match conditions.iter().find(|existing| existing.type_ == c.type_) {
            Some(existing)
                if existing.status == c.status
                    && existing.reason == c.reason
                    && existing.message == c.message
                    && existing.observed_generation == c.observed_generation => {}
            Some(existing) => {
                // Only a status change counts as transition.
                c.last_transition_time = if existing.status == c.status {
                    existing.last_transition_time.clone()
                } else {
                    Some(now())
                };
                conditions.retain(|v| v.type_ != c.type_);
                conditions.push(c);
            }
            None => {
                c.last_transition_time = Some(now());
                conditions.push(c);
            }
        }
        self.conditions = Some(conditions);
    }

    pub fn remove_condition(&mut self, tpe: &str) {
        if let Some(conditions) = self.conditions.as_mut() {
            conditions.retain(|c| c.type_ != tpe);
        }
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions
            .as_ref()
            .and_then(|v| v.iter().find(|c| c.type_ == tpe))
    }
}

pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
