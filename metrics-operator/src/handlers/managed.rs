//! Crossplane managed resources.
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ApiResource, ObjectMeta};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use super::*;
use crate::orchestrator::QueryConfig;

const CROSSPLANE_CATEGORY: &str = "crossplane";
const MANAGED_CATEGORY: &str = "managed";

/// The fields of a Crossplane managed resource dimensions are projected from.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Managed {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ManagedSpec,
    #[serde(default)]
    pub status: ManagedStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManagedSpec {
    #[serde(default)]
    pub for_provider: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManagedStatus {
    #[serde(default)]
    pub conditions: Vec<ManagedCondition>,
    #[serde(default)]
    pub at_provider: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManagedCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// The resource to list for `crd` if it defines managed resources matching
/// `target`. Empty target fields match any value.
pub(crate) fn managed_resource(
    crd: &CustomResourceDefinition,
    target: &TargetResource,
) -> Option<ApiResource> {
    let spec = &crd.spec;
    let categories = spec.names.categories.as_deref().unwrap_or_default();
    let is_category = |c: &str| categories.iter().any(|v| v == c);
    if !is_category(CROSSPLANE_CATEGORY) || !is_category(MANAGED_CATEGORY) {
        return None;
    }
    if !target.group.is_empty() && spec.group != target.group {
        return None;
    }
    if !target.kind.is_empty() && !spec.names.kind.eq_ignore_ascii_case(&target.kind) {
        return None;
    }
    let version = if target.version.is_empty() {
        spec.versions
            .iter()
            .find(|v| v.storage)
            .or_else(|| spec.versions.iter().find(|v| v.served))?
    } else {
        spec.versions
            .iter()
            .find(|v| v.served && v.name == target.version)?
    };
    Some(ApiResource {
        group: spec.group.clone(),
        version: version.name.clone(),
        api_version: format!("{}/{}", spec.group, version.name),
        kind: spec.names.kind.clone(),
        plural: spec.names.plural.clone(),
    })
}

/// Managed resources of one cluster.
pub(crate) struct ManagedMeasurement {
    pub measurement: Measurement,
    /// Matching CustomResourceDefinitions.
    pub definitions: usize,
}

/// One data point of value 1 per managed resource of `cluster`.
pub(crate) async fn measure_managed<C: TargetCluster>(
    cluster: &C,
    cluster_name: Option<&str>,
    query: &ManagedQuery<'_>,
) -> Result<ManagedMeasurement, Interrupt> {
    let crds = cluster.list_crds().await.map_err(|e| {
        Interrupt::cluster(
            e,
            GET_RESOURCES_FAILED,
            "failed to list CustomResourceDefinitions",
        )
    })?;
    let resources: Vec<ApiResource> = crds
        .iter()
        .filter_map(|crd| managed_resource(crd, &query.target))
        .collect();
    let lp = list_params(query.label_selector, query.field_selector);
    let mut measurement = Measurement::default();
    for resource in &resources {
        let items = cluster.list(resource, &lp).await.map_err(|e| {
            Interrupt::cluster(
                e,
                GET_RESOURCES_FAILED,
                &format!("failed to list {}.{}", resource.plural, resource.group),
            )
        })?;
        for item in &items {
            match managed_point(item, cluster_name, query.dimensions) {
                Ok(point) => {
                    measurement.points.push(point);
                    measurement.resources += 1;
                }
                Err(e) => measurement
                    .errors
                    .push(format!("{}: {}", object_id(item), e)),
            }
        }
    }
    Ok(ManagedMeasurement {
        measurement,
        definitions: resources.len(),
    })
}

fn managed_point(
    item: &DynamicObject,
    cluster_name: Option<&str>,
    dimensions: &BTreeMap<String, String>,
) -> Result<DataPoint, String> {
    let value = serde_json::to_value(item).map_err(|e| e.to_string())?;
    let managed: Managed = serde_json::from_value(value)
        .map_err(|e| format!("not a managed resource: {}", e))?;
    let decoded = serde_json::to_value(&managed).map_err(|e| e.to_string())?;
    let mut dimensions = project_dimensions(&decoded, dimensions)?;
    if let Some(cluster) = cluster_name.filter(|v| !v.is_empty()) {
        dimensions.insert(CLUSTER_DIMENSION.to_string(), cluster.to_string());
    }
    dimensions.insert(
        UUID_DIMENSION.to_string(),
        dimension_value(managed.metadata.uid.clone()),
    );
    Ok(DataPoint {
        dimensions,
        value: 1,
    })
}

/// Counts the Crossplane managed resources of a single cluster.
pub(crate) struct ManagedHandler<'a, C, R> {
    pub query: ManagedQuery<'a>,
    pub target: &'a QueryConfig<C>,
    pub recorder: &'a R,
}

impl<C: TargetCluster, R: Recorder> ManagedHandler<'_, C, R> {
    pub(crate) async fn monitor(&self) -> Result<MonitorResult, HandlerError> {
        settle(self.measure().await)
    }

    async fn measure(&self) -> Result<MonitorResult, Interrupt> {
        let cluster_name = self.target.cluster_name.as_deref();
        let ManagedMeasurement {
            measurement,
            definitions,
        } = measure_managed(&self.target.cluster, cluster_name, &self.query).await?;
        if definitions == 0 {
            return Ok(MonitorResult::pending(format!(
                "no managed resource definition matches {}",
                describe(&self.query.target)
            )));
        }
        if let Some(failure) = measurement.projection_failure() {
            return Ok(failure);
        }
        measurement.record(self.recorder)?;
        Ok(MonitorResult::ready(
            measurement.resources,
            base_dimensions(&self.query.target, cluster_name),
            format!(
                "measured {} managed resource(s) of {} kind(s)",
                measurement.resources, definitions
            ),
        ))
    }
}

/// Human readable target, wildcards shown as `*`.
pub(crate) fn describe(target: &TargetResource) -> String {
    let or_any = |v: &str| if v.is_empty() { "*".to_string() } else { v.to_string() };
    format!(
        "{}/{} {}",
        or_any(&target.group),
        or_any(&target.version),
        or_any(&target.kind)
    )
}
