//! `metrics.openmcp.cloud/v1beta1` kinds.
//!
//! `FederatedMetric`, `FederatedManagedMetric` and `FederatedClusterAccess` are
//! served in both versions with identical schemas, `v1alpha1` being the storage
//! version.
use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    ClusterAccessConfig, ClusterAccessSpec as AccessSpec, DataSinkReference,
    KubeConfigSecretRef, MetricStatus, ObjectReference, Projection, TargetResource,
    default_frequency, default_interval,
};

/// Counts resources of a Group/Version/Kind.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1beta1",
    kind = "SingleMetric",
    derive = "PartialEq",
    status = "MetricStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Value","type":"string","jsonPath":".status.observation.latestValue"}"#,
    printcolumn = r#"{"name":"Observed","type":"string","jsonPath":".status.observation.timestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SingleMetricSpec {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sink_ref: Option<DataSinkReference>,
    /// Reference to a [`ClusterAccess`], defaults to the operator's own cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_access_ref: Option<ObjectReference>,
}

/// Counts resources of a Group/Version/Kind grouped by the tuple of all projections.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1beta1",
    kind = "CompoundMetric",
    derive = "PartialEq",
    status = "MetricStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Value","type":"string","jsonPath":".status.observation.latestValue"}"#,
    printcolumn = r#"{"name":"Observed","type":"string","jsonPath":".status.observation.timestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompoundMetricSpec {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sink_ref: Option<DataSinkReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_access_ref: Option<ObjectReference>,
    pub projections: Vec<Projection>,
}

/// Like a Metric, measured in every cluster a FederatedClusterAccess discovers.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1beta1",
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
    version = "v1beta1",
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

impl_metric_object!(
    SingleMetric,
    CompoundMetric,
    FederatedMetric,
    FederatedManagedMetric
);

/// Credentials to access a remote cluster.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metrics.openmcp.cloud",
    version = "v1beta1",
    kind = "ClusterAccess",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAccessSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config_secret_ref: Option<KubeConfigSecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_access_config: Option<ClusterAccessConfig>,
}

impl AccessSpec for ClusterAccessSpec {
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
    version = "v1beta1",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessSource, MetricObject, ProjectionType, v1alpha1};
    use kube::CustomResourceExt;

    #[test]
    fn compound_metric_spec() {
        let spec: CompoundMetricSpec = serde_json::from_value(serde_json::json!({
            "name": "pods-by-namespace",
            "target": {"version": "v1", "kind": "Pod"},
            "projections": [
                {"name": "namespace", "fieldPath": "metadata.namespace"},
                {"name": "labels", "fieldPath": "metadata.labels", "type": "map"}
            ]
        }))
        .unwrap();
        assert_eq!(2, spec.projections.len());
        assert_eq!(ProjectionType::Map, spec.projections[1].type_);
        let metric = CompoundMetric::new("x", spec);
        assert_eq!("10m", metric.interval());
        assert!(metric.data_sink_ref().is_none());
    }

    #[test]
    fn cluster_access_source() {
        let spec: ClusterAccessSpec = serde_json::from_value(serde_json::json!({
            "kubeConfigSecretRef": {"name": "remote", "namespace": "ns"}
        }))
        .unwrap();
        assert!(matches!(spec.source(), Ok(AccessSource::KubeConfig(r)) if r.key() == "kubeconfig"));
    }

    #[test]
    fn federated_kinds_share_the_schema_of_the_storage_version() {
        let alpha = serde_json::to_value(
            v1alpha1::FederatedMetric::crd().spec.versions[0]
                .schema
                .as_ref()
                .unwrap(),
        )
        .unwrap();
        let beta = serde_json::to_value(
            FederatedMetric::crd().spec.versions[0]
                .schema
                .as_ref()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(alpha, beta);
    }
}
