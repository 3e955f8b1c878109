use std::ops::{Deref, DerefMut};

use json_patch::diff;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use metrics_operator_apis::{Condition, MetricStatus, now, tri_state};

use crate::{
    MANAGER,
    errors::ControllerError,
    flavors::Monitored,
    handlers::{MonitorResult, Phase},
};

pub(crate) const AVAILABLE: &str = "Available";
pub(crate) const ERROR: &str = "Error";
pub(crate) const CREATING: &str = "Creating";

/// Translate a measurement outcome into `status`.
///
/// The observation is only replaced by a successful measurement.
pub(crate) fn apply_result(status: &mut MetricStatus, result: &MonitorResult, generation: Option<i64>) {
    let condition = |tpe: &str, value: Option<bool>| {
        let mut c = Condition::new(tpe, value, result.reason, result.message.clone());
        c.observed_generation = generation;
        c
    };
    match result.phase {
        Phase::Ready => {
            status.update_condition(condition(AVAILABLE, Some(true)));
            status.remove_condition(ERROR);
            status.remove_condition(CREATING);
            if let Some(observation) = &result.observation {
                status.observation = Some(observation.clone());
            }
            status.last_reconcile_time = Some(now());
        }
        Phase::Failed => {
            status.update_condition(condition(ERROR, Some(true)));
            status.update_condition(condition(AVAILABLE, Some(false)));
            status.remove_condition(CREATING);
        }
        Phase::Pending => {
            status.update_condition(condition(CREATING, Some(true)));
            status.remove_condition(ERROR);
        }
    }
    let ready = match result.phase {
        Phase::Ready => Some(true),
        Phase::Failed => Some(false),
        Phase::Pending => None,
    };
    status.ready = Some(tri_state(ready).to_string());
}

/// Helper construct to simplify updating and patching the status of metric objects.
pub(crate) struct MetricModifications<K> {
    original: K,
    pub modified: K,
}

impl<K> Deref for MetricModifications<K> {
    type Target = K;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl<K> DerefMut for MetricModifications<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl<K: Monitored> MetricModifications<K> {
    pub(crate) fn new(original: K) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub(crate) fn id(&self) -> String {
        format!(
            "{}/{}",
            self.original.namespace().unwrap_or_default(),
            self.original.name_any()
        )
    }

    /// Metric name exported to the DataSink, `spec.name` or the object name.
    pub(crate) fn exported_name(&self) -> String {
        let name = self.modified.metric_name().trim();
        if name.is_empty() {
            self.modified.name_any()
        } else {
            name.to_string()
        }
    }

    pub(crate) fn apply(&mut self, result: &MonitorResult) {
        let generation = self.modified.meta().generation;
        apply_result(self.modified.metric_status_mut(), result, generation);
    }

    fn api(&self, client: Client) -> Api<K> {
        Api::namespaced(client, &self.original.namespace().unwrap_or_default())
    }

    fn get_status_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &serde_json::to_value(self.original.metric_status())?,
            &serde_json::to_value(self.modified.metric_status())?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    /// Merge-patch the status subresource if it was modified. Returns whether
    /// a patch was sent.
    pub(crate) async fn patch_status(&mut self, client: Client) -> Result<bool, ControllerError> {
        if self.get_status_patch()?.is_none() {
            return Ok(false);
        }
        let name = self.original.name_any();
        let patch = serde_json::json!({ "status": self.modified.metric_status() });
        let response = self
            .api(client)
            .patch_status(
                name.as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Merge(&patch),
            )
            .await;
        debug!(
            "Patch status of {} ({:?}) -> {}",
            self.id(),
            self.original.resource_version(),
            match &response {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            }
        );
        self.modified = response?;
        self.original = self.modified.clone();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::reason::{GET_RESOURCES_FAILED, METRICS_CREATING, MONITORING_ACTIVE};
    use metrics_operator_apis::{
        MetricObject,
        v1alpha1::{Metric, MetricSpec},
    };
    use std::collections::BTreeMap;

    fn metric() -> Metric {
        let mut metric = Metric::new(
            "pods",
            serde_json::from_value(serde_json::json!({
                "name": "",
                "target": {"version": "v1", "kind": "Pod"},
            }))
            .unwrap(),
        );
        metric.metadata.namespace = Some("ops".to_string());
        metric.metadata.generation = Some(3);
        metric
    }

    fn ready(value: usize) -> MonitorResult {
        MonitorResult::ready(
            value,
            BTreeMap::from([("resource".to_string(), "Pod".to_string())]),
            "measured".to_string(),
        )
    }

    #[test]
    fn ready_sets_observation_and_availability() {
        let mut status = MetricStatus::default();
        apply_result(&mut status, &ready(3), Some(3));
        assert_eq!(Some("True"), status.ready.as_deref());
        let available = status.condition(AVAILABLE).unwrap();
        assert_eq!("True", available.status);
        assert_eq!(MONITORING_ACTIVE, available.reason);
        assert_eq!(Some(3), available.observed_generation);
        assert_eq!("3", status.observation.as_ref().unwrap().latest_value);
        assert!(status.last_reconcile_time.is_some());
        assert!(status.condition(ERROR).is_none());
    }

    #[test]
    fn failure_preserves_observation() {
        let mut status = MetricStatus::default();
        apply_result(&mut status, &ready(3), None);
        let observation = status.observation.clone();
        let reconciled = status.last_reconcile_time.clone();
        let failed = MonitorResult::failed(GET_RESOURCES_FAILED, "failed to list pods", "forbidden");
        apply_result(&mut status, &failed, None);
        assert_eq!(Some("False"), status.ready.as_deref());
        let error = status.condition(ERROR).unwrap();
        assert_eq!("True", error.status);
        assert_eq!(GET_RESOURCES_FAILED, error.reason);
        assert_eq!("failed to list pods: forbidden", error.message);
        assert_eq!("False", status.condition(AVAILABLE).unwrap().status);
        assert_eq!(observation, status.observation);
        assert_eq!(reconciled, status.last_reconcile_time);

        apply_result(&mut status, &ready(4), None);
        assert!(status.condition(ERROR).is_none());
        assert_eq!("4", status.observation.as_ref().unwrap().latest_value);
    }

    #[test]
    fn pending_is_unknown() {
        let mut status = MetricStatus::default();
        apply_result(
            &mut status,
            &MonitorResult::pending("no managed resource definition matches */* *".to_string()),
            None,
        );
        assert_eq!(Some("Unknown"), status.ready.as_deref());
        let creating = status.condition(CREATING).unwrap();
        assert_eq!(METRICS_CREATING, creating.reason);
        assert!(status.observation.is_none());
    }

    #[test]
    fn status_patch_only_when_modified() {
        let mut modifications = MetricModifications::new(metric());
        assert!(modifications.get_status_patch().unwrap().is_none());
        assert_eq!("ops/pods", modifications.id());
        assert_eq!("pods", modifications.exported_name());
        modifications.apply(&ready(1));
        assert!(modifications.get_status_patch().unwrap().is_some());
        assert_eq!(
            Some(3),
            modifications
                .metric_status()
                .and_then(|s| s.condition(AVAILABLE))
                .and_then(|c| c.observed_generation)
        );
    }

    #[test]
    fn exported_name_prefers_spec_name() {
        let mut metric = metric();
        metric.spec = MetricSpec {
            name: "pod_count".to_string(),
            ..metric.spec
        };
        assert_eq!("pod_count", MetricModifications::new(metric).exported_name());
    }
}
