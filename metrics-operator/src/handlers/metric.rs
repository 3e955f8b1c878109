use super::*;
use crate::orchestrator::QueryConfig;

/// Counts the resources of a single cluster, grouped by projections.
pub(crate) struct MetricHandler<'a, C, R> {
    pub query: ResourceQuery<'a>,
    pub target: &'a QueryConfig<C>,
    pub recorder: &'a R,
}

impl<C: TargetCluster, R: Recorder> MetricHandler<'_, C, R> {
    pub(crate) async fn monitor(&self) -> Result<MonitorResult, HandlerError> {
        settle(self.measure().await)
    }

    async fn measure(&self) -> Result<MonitorResult, Interrupt> {
        let items = list_targets(&self.target.cluster, &self.query).await?;
        let base = base_dimensions(self.query.target, self.target.cluster_name.as_deref());
        let measurement = measure_resources(&items, self.query.projections, &base);
        if let Some(failure) = measurement.projection_failure() {
            return Ok(failure);
        }
        measurement.record(self.recorder)?;
        let dimensions = measurement
            .points
            .first()
            .map(|p| p.dimensions.clone())
            .unwrap_or(base);
        Ok(MonitorResult::ready(
            items.len(),
            dimensions,
            format!(
                "measured {} resource(s) in {} group(s)",
                items.len(),
                measurement.points.len()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::{CollectingRecorder, FakeCluster, pod};
    use super::*;
    use metrics_operator_apis::{Projection, ProjectionType};

    fn pods() -> TargetResource {
        TargetResource {
            group: "".to_string(),
            version: "v1".to_string(),
            kind: "Pod".to_string(),
        }
    }

    fn cluster() -> FakeCluster {
        FakeCluster::default()
            .serve("", "v1", "Pod", "pods")
            .with_items(
                "pods",
                vec![
                    pod("default", "a", "Running"),
                    pod("default", "b", "Running"),
                    pod("kube-system", "c", "Running"),
                ],
            )
    }

    fn config(cluster: FakeCluster) -> QueryConfig<FakeCluster> {
        QueryConfig {
            cluster,
            cluster_name: None,
        }
    }

    async fn monitor(
        target: &TargetResource,
        projections: &[Projection],
        config: &QueryConfig<FakeCluster>,
        recorder: &CollectingRecorder,
    ) -> MonitorResult {
        MetricHandler {
            query: ResourceQuery {
                target,
                label_selector: Some("app=web"),
                field_selector: None,
                projections,
            },
            target: config,
            recorder,
        }
        .monitor()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn counts_pods() {
        let config = config(cluster());
        let recorder = CollectingRecorder::default();
        let result = monitor(&pods(), &[], &config, &recorder).await;
        assert_eq!(Phase::Ready, result.phase);
        assert_eq!(MONITORING_ACTIVE, result.reason);
        let observation = result.observation.unwrap();
        assert_eq!("3", observation.latest_value);
        let points = recorder.recorded();
        assert_eq!(1, points.len());
        assert_eq!(3, points[0].value);
        assert_eq!(
            BTreeMap::from([
                ("resource".to_string(), "Pod".to_string()),
                ("version".to_string(), "v1".to_string()),
            ]),
            points[0].dimensions
        );
        let lists = config.cluster.lists.lock().unwrap();
        assert_eq!(Some("app=web".to_string()), lists[0].label_selector);
    }

    #[tokio::test]
    async fn groups_by_namespace() {
        let config = config(cluster());
        let recorder = CollectingRecorder::default();
        let projections = [Projection {
            name: "namespace".to_string(),
            field_path: "metadata.namespace".to_string(),
            type_: ProjectionType::Primitive,
            default: None,
        }];
        let result = monitor(&pods(), &projections, &config, &recorder).await;
        let observation = result.observation.unwrap();
        assert_eq!("3", observation.latest_value);
        assert!(
            observation
                .dimensions
                .iter()
                .any(|d| d.name == "namespace" && d.value == "default")
        );
        let points: Vec<(String, i64)> = recorder
            .recorded()
            .into_iter()
            .map(|p| (p.dimensions["namespace"].clone(), p.value))
            .collect();
        assert_eq!(
            vec![("default".to_string(), 2), ("kube-system".to_string(), 1)],
            points
        );
    }

    #[tokio::test]
    async fn unknown_kind_is_not_found() {
        let config = config(cluster());
        let recorder = CollectingRecorder::default();
        let widgets = TargetResource {
            group: "x.example".to_string(),
            version: "v1".to_string(),
            kind: "Widget".to_string(),
        };
        let result = monitor(&widgets, &[], &config, &recorder).await;
        assert_eq!(Phase::Failed, result.phase);
        assert_eq!(RESOURCE_NOT_FOUND, result.reason);
        assert!(result.observation.is_none());
        assert!(recorder.recorded().is_empty());
    }

    #[tokio::test]
    async fn list_failure() {
        let mut cluster = cluster();
        cluster.unreachable = true;
        let config = config(cluster);
        let recorder = CollectingRecorder::default();
        let result = monitor(&pods(), &[], &config, &recorder).await;
        assert_eq!(Phase::Failed, result.phase);
        assert_eq!(GET_RESOURCES_FAILED, result.reason);
    }

    #[tokio::test]
    async fn record_failure() {
        let config = config(cluster());
        let recorder = CollectingRecorder {
            fail: true,
            ..Default::default()
        };
        let result = monitor(&pods(), &[], &config, &recorder).await;
        assert_eq!(Phase::Failed, result.phase);
        assert_eq!(SEND_METRIC_FAILED, result.reason);
    }

    #[tokio::test]
    async fn remote_cluster_name_is_a_dimension() {
        let config = QueryConfig {
            cluster: cluster(),
            cluster_name: Some("east".to_string()),
        };
        let recorder = CollectingRecorder::default();
        monitor(&pods(), &[], &config, &recorder).await;
        assert_eq!("east", recorder.recorded()[0].dimensions["cluster"]);
    }
}
