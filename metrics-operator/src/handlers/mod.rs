//! Measurement strategies, one per metric flavor.
//!
//! A handler lists the target resources of its cluster(s), turns them into
//! [`DataPoint`]s, records them on the metric's gauge and reports the outcome
//! as [`MonitorResult`]. Problems caused by the metric's configuration or its
//! target are encoded in the result, `Err` is reserved for internal failures.
use std::{collections::BTreeMap, time::Duration};

use kube::{
    ResourceExt,
    api::{DynamicObject, GroupVersionKind, ListParams},
};
use metrics_operator_apis::{MetricObservation, Projection, TargetResource};
use serde_json::Value;

use crate::{
    cluster::{ClusterError, TargetCluster},
    projection::project,
    sink::Recorder,
};

mod federated;
mod federated_managed;
mod managed;
mod metric;

pub(crate) use federated::FederatedHandler;
pub(crate) use federated_managed::FederatedManagedHandler;
pub(crate) use managed::ManagedHandler;
pub(crate) use metric::MetricHandler;

/// Status condition reasons.
pub(crate) mod reason {
    pub(crate) const INVALID_SPEC: &str = "InvalidSpec";
    pub(crate) const RESOURCE_NOT_FOUND: &str = "ResourceNotFound";
    pub(crate) const CLUSTER_UNAVAILABLE: &str = "ClusterUnavailable";
    pub(crate) const GET_RESOURCES_FAILED: &str = "GetResourcesFailed";
    pub(crate) const RECORD_METRIC_FAILED: &str = "RecordMetricFailed";
    pub(crate) const SEND_METRIC_FAILED: &str = "SendMetricFailed";
    pub(crate) const MONITORING_ACTIVE: &str = "MonitoringActive";
    pub(crate) const METRICS_CREATING: &str = "MetricsCreating";
}

use reason::*;

/// Dimension value used for missing or empty projected values.
pub(crate) const NOT_AVAILABLE: &str = "n/a";

pub(crate) const RESOURCE_DIMENSION: &str = "resource";
pub(crate) const GROUP_DIMENSION: &str = "group";
pub(crate) const VERSION_DIMENSION: &str = "version";
pub(crate) const CLUSTER_DIMENSION: &str = "cluster";
pub(crate) const UUID_DIMENSION: &str = "UUID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Ready,
    Failed,
    Pending,
}

/// Outcome of one measurement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MonitorResult {
    pub phase: Phase,
    pub reason: &'static str,
    /// One-line human readable summary.
    pub message: String,
    pub error: Option<String>,
    pub observation: Option<MetricObservation>,
}

impl MonitorResult {
    pub(crate) fn ready(
        value: usize,
        dimensions: BTreeMap<String, String>,
        message: String,
    ) -> Self {
        Self {
            phase: Phase::Ready,
            reason: MONITORING_ACTIVE,
            message,
            error: None,
            observation: Some(MetricObservation::new(value.to_string(), dimensions)),
        }
    }

    pub(crate) fn failed(reason: &'static str, context: &str, error: impl ToString) -> Self {
        let error = error.to_string();
        Self {
            phase: Phase::Failed,
            reason,
            message: format!("{}: {}", context, error),
            error: Some(error),
            observation: None,
        }
    }

    pub(crate) fn pending(message: String) -> Self {
        Self {
            phase: Phase::Pending,
            reason: METRICS_CREATING,
            message,
            error: None,
            observation: None,
        }
    }
}

/// A single gauge value and its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DataPoint {
    pub dimensions: BTreeMap<String, String>,
    pub value: i64,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum HandlerError {
    #[error("{0} did not complete within {1:?}")]
    DeadlineExceeded(&'static str, Duration),
}

/// Early exit of a measurement.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// Reported in the metric's status.
    Failed(MonitorResult),
    Internal(HandlerError),
}

impl From<HandlerError> for Interrupt {
    fn from(e: HandlerError) -> Self {
        Interrupt::Internal(e)
    }
}

impl Interrupt {
    pub(crate) fn failed(reason: &'static str, context: &str, error: impl ToString) -> Self {
        Interrupt::Failed(MonitorResult::failed(reason, context, error))
    }

    /// Deadlines abort the reconciliation, API errors are reported as `reason`.
    pub(crate) fn cluster(e: ClusterError, reason: &'static str, context: &str) -> Self {
        match e {
            ClusterError::Timeout(what, deadline) => {
                Interrupt::Internal(HandlerError::DeadlineExceeded(what, deadline))
            }
            ClusterError::Kube(e) => Interrupt::failed(reason, context, e),
        }
    }
}

pub(crate) fn settle(
    result: Result<MonitorResult, Interrupt>,
) -> Result<MonitorResult, HandlerError> {
    match result {
        Ok(result) | Err(Interrupt::Failed(result)) => Ok(result),
        Err(Interrupt::Internal(e)) => Err(e),
    }
}

/// The resources a metric counts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResourceQuery<'a> {
    pub target: &'a TargetResource,
    pub label_selector: Option<&'a str>,
    pub field_selector: Option<&'a str>,
    pub projections: &'a [Projection],
}

/// The Crossplane managed resources a metric counts.
#[derive(Debug, Clone)]
pub(crate) struct ManagedQuery<'a> {
    /// Empty fields match any value.
    pub target: TargetResource,
    pub label_selector: Option<&'a str>,
    pub field_selector: Option<&'a str>,
    /// Dimension name to field path.
    pub dimensions: &'a BTreeMap<String, String>,
}

/// Measurement strategy selected by the orchestrator.
pub(crate) enum Handler<'a, C, R> {
    Metric(MetricHandler<'a, C, R>),
    Managed(ManagedHandler<'a, C, R>),
    Federated(FederatedHandler<'a, C, R>),
    FederatedManaged(FederatedManagedHandler<'a, C, R>),
}

impl<C: TargetCluster, R: Recorder> Handler<'_, C, R> {
    pub(crate) async fn monitor(&self) -> Result<MonitorResult, HandlerError> {
        match self {
            Handler::Metric(h) => h.monitor().await,
            Handler::Managed(h) => h.monitor().await,
            Handler::Federated(h) => h.monitor().await,
            Handler::FederatedManaged(h) => h.monitor().await,
        }
    }
}

pub(crate) fn list_params(label_selector: Option<&str>, field_selector: Option<&str>) -> ListParams {
    let mut lp = ListParams::default();
    lp.label_selector = label_selector
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string);
    lp.field_selector = field_selector
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string);
    lp
}

/// Dimensions every data point of `target` carries, each only if non-empty.
pub(crate) fn base_dimensions(
    target: &TargetResource,
    cluster: Option<&str>,
) -> BTreeMap<String, String> {
    [
        (RESOURCE_DIMENSION, target.kind.as_str()),
        (GROUP_DIMENSION, target.group.as_str()),
        (VERSION_DIMENSION, target.version.as_str()),
        (CLUSTER_DIMENSION, cluster.unwrap_or_default()),
    ]
    .into_iter()
    .filter(|(_, value)| !value.is_empty())
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

pub(crate) fn dimension_value(value: Option<String>) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// Resolve the target kind and list its resources.
pub(crate) async fn list_targets<C: TargetCluster>(
    cluster: &C,
    query: &ResourceQuery<'_>,
) -> Result<Vec<DynamicObject>, Interrupt> {
    let target = query.target;
    let gvk = GroupVersionKind::gvk(&target.group, &target.version, &target.kind);
    let resource = cluster
        .resolve(&gvk)
        .await
        .map_err(|e| Interrupt::cluster(e, GET_RESOURCES_FAILED, "discovery failed"))?
        .ok_or_else(|| {
            Interrupt::failed(
                RESOURCE_NOT_FOUND,
                "unknown target",
                format!("{} {} is not served", gvk.api_version(), gvk.kind),
            )
        })?;
    cluster
        .list(&resource, &list_params(query.label_selector, query.field_selector))
        .await
        .map_err(|e| {
            Interrupt::cluster(
                e,
                GET_RESOURCES_FAILED,
                &format!("failed to list {}", resource.plural),
            )
        })
}

/// Data points of a set of listed resources.
#[derive(Debug, Default)]
pub(crate) struct Measurement {
    pub points: Vec<DataPoint>,
    /// Resources measured, excluding those whose projection failed.
    pub resources: usize,
    pub errors: Vec<String>,
}

impl Measurement {
    pub(crate) fn extend(&mut self, other: Measurement) {
        self.points.extend(other.points);
        self.resources += other.resources;
        self.errors.extend(other.errors);
    }

    /// Reported if any resource could not be projected.
    pub(crate) fn projection_failure(&self) -> Option<MonitorResult> {
        let first = self.errors.first()?;
        Some(MonitorResult::failed(
            RECORD_METRIC_FAILED,
            &format!(
                "{} resource(s) could not be projected",
                self.errors.len()
            ),
            first,
        ))
    }

    /// Record all data points, reporting failures as `SendMetricFailed`.
    pub(crate) fn record<R: Recorder>(&self, recorder: &R) -> Result<(), Interrupt> {
        recorder
            .record(&self.points)
            .map_err(|e| Interrupt::failed(SEND_METRIC_FAILED, "failed to record data points", e))
    }
}

fn object_id(item: &DynamicObject) -> String {
    match item.namespace() {
        Some(namespace) => format!("{}/{}", namespace, item.name_any()),
        None => item.name_any(),
    }
}

/// Count `items`, one data point per distinct tuple of projected values.
///
/// Without projections a single data point carries the total count, even if
/// there are no items.
pub(crate) fn measure_resources(
    items: &[DynamicObject],
    projections: &[Projection],
    base: &BTreeMap<String, String>,
) -> Measurement {
    if projections.is_empty() {
        return Measurement {
            points: vec![DataPoint {
                dimensions: base.clone(),
                value: items.len() as i64,
            }],
            resources: items.len(),
            errors: Vec::new(),
        };
    }
    let mut measurement = Measurement::default();
    let mut groups: BTreeMap<Vec<(String, String)>, i64> = BTreeMap::new();
    for item in items {
        match project_item(item, projections) {
            Ok(key) => {
                *groups.entry(key).or_default() += 1;
                measurement.resources += 1;
            }
            Err(e) => measurement
                .errors
                .push(format!("{}: {}", object_id(item), e)),
        }
    }
    measurement.points = groups
        .into_iter()
        .map(|(key, value)| {
            let mut dimensions = base.clone();
            dimensions.extend(key);
            DataPoint { dimensions, value }
        })
        .collect();
    measurement
}

fn project_item(
    item: &DynamicObject,
    projections: &[Projection],
) -> Result<Vec<(String, String)>, String> {
    let value = serde_json::to_value(item).map_err(|e| e.to_string())?;
    projections
        .iter()
        .map(|p| {
            project(&value, &p.field_path, p.type_, p.default.as_deref())
                .map(|v| (p.name.clone(), dimension_value(v)))
                .map_err(|e| format!("projection {:?}: {}", p.name, e))
        })
        .collect()
}

/// Project each `dimensions` field path of `value` as primitive.
pub(crate) fn project_dimensions(
    value: &Value,
    dimensions: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, String> {
    dimensions
        .iter()
        .map(|(name, path)| {
            project(value, path, Default::default(), None)
                .map(|v| (name.clone(), dimension_value(v)))
                .map_err(|e| format!("dimension {:?}: {}", name, e))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory cluster and recorder used by the handler tests.
    use std::{collections::HashMap, sync::Mutex};

    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::ApiResource;

    use super::*;
    use crate::sink::SinkError;

    #[derive(Default)]
    pub(crate) struct FakeCluster {
        /// Served resources by `apiVersion/Kind`.
        pub resources: HashMap<String, ApiResource>,
        /// Items by plural name.
        pub items: HashMap<String, Vec<Value>>,
        pub crds: Vec<CustomResourceDefinition>,
        pub unreachable: bool,
        pub lists: Mutex<Vec<ListParams>>,
    }

    impl FakeCluster {
        pub(crate) fn serve(mut self, group: &str, version: &str, kind: &str, plural: &str) -> Self {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            self.resources.insert(
                format!("{}/{}", gvk.api_version(), kind),
                ApiResource::from_gvk_with_plural(&gvk, plural),
            );
            self
        }

        pub(crate) fn with_items(mut self, plural: &str, items: Vec<Value>) -> Self {
            self.items.insert(plural.to_string(), items);
            self
        }

        fn unavailable() -> ClusterError {
            ClusterError::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "service unavailable".to_string(),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            }))
        }
    }

    impl TargetCluster for FakeCluster {
        async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ApiResource>, ClusterError> {
            if self.unreachable {
                return Err(Self::unavailable());
            }
            Ok(self
                .resources
                .get(&format!("{}/{}", gvk.api_version(), gvk.kind))
                .cloned())
        }

        async fn list(
            &self,
            resource: &ApiResource,
            lp: &ListParams,
        ) -> Result<Vec<DynamicObject>, ClusterError> {
            if self.unreachable {
                return Err(Self::unavailable());
            }
            self.lists.lock().unwrap().push(lp.clone());
            Ok(self
                .items
                .get(&resource.plural)
                .into_iter()
                .flatten()
                .map(|v| serde_json::from_value(v.clone()).unwrap())
                .collect())
        }

        async fn list_crds(&self) -> Result<Vec<CustomResourceDefinition>, ClusterError> {
            if self.unreachable {
                return Err(Self::unavailable());
            }
            Ok(self.crds.clone())
        }
    }

    #[derive(Default)]
    pub(crate) struct CollectingRecorder {
        pub points: Mutex<Vec<DataPoint>>,
        pub fail: bool,
    }

    impl CollectingRecorder {
        pub(crate) fn recorded(&self) -> Vec<DataPoint> {
            self.points.lock().unwrap().clone()
        }
    }

    impl Recorder for CollectingRecorder {
        fn record(&self, points: &[DataPoint]) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::EmptyAttribute("resource".to_string()));
            }
            self.points.lock().unwrap().extend_from_slice(points);
            Ok(())
        }
    }

    pub(crate) fn pod(namespace: &str, name: &str, phase: &str) -> Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": namespace, "uid": format!("uid-{}", name)},
            "status": {"phase": phase},
        })
    }
}
