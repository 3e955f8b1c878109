use super::{
    federated::{Unavailable, conclude},
    managed::{ManagedMeasurement, describe, measure_managed},
    *,
};
use crate::orchestrator::FederatedTarget;

/// Counts Crossplane managed resources in every federated cluster.
pub(crate) struct FederatedManagedHandler<'a, C, R> {
    pub query: ManagedQuery<'a>,
    pub clusters: &'a [FederatedTarget<C>],
    pub recorder: &'a R,
}

impl<C: TargetCluster, R: Recorder> FederatedManagedHandler<'_, C, R> {
    pub(crate) async fn monitor(&self) -> Result<MonitorResult, HandlerError> {
        settle(self.measure().await)
    }

    async fn measure(&self) -> Result<MonitorResult, Interrupt> {
        let mut measurement = Measurement::default();
        let mut unavailable = Vec::new();
        let mut definitions = 0;
        for target in self.clusters {
            let cluster = match &target.cluster {
                Ok(cluster) => cluster,
                Err(failure) => {
                    unavailable.push(Unavailable {
                        cluster: target.name.clone(),
                        reason: failure.reason,
                        message: failure.message.clone(),
                    });
                    continue;
                }
            };
            match measure_managed(cluster, Some(target.name.as_str()), &self.query).await {
                Ok(managed) => {
                    let ManagedMeasurement {
                        measurement: m,
                        definitions: d,
                    } = managed;
                    measurement.extend(m);
                    definitions += d;
                }
                Err(Interrupt::Failed(result)) => unavailable.push(Unavailable {
                    cluster: target.name.clone(),
                    reason: result.reason,
                    message: result.message,
                }),
                Err(e) => return Err(e),
            }
        }
        if definitions == 0 && unavailable.len() < self.clusters.len() {
            return Ok(MonitorResult::pending(format!(
                "no managed resource definition matches {} in any federated cluster",
                describe(&self.query.target)
            )));
        }
        conclude(
            measurement,
            unavailable,
            self.clusters.len(),
            self.recorder,
            base_dimensions(&self.query.target, None),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::{
        fake::{CollectingRecorder, FakeCluster},
        managed::tests::{crossplane_cluster, synced_dimensions},
    };
    use super::*;
    use crate::orchestrator::ClusterFailure;

    fn query(dimensions: &BTreeMap<String, String>) -> ManagedQuery<'_> {
        ManagedQuery {
            target: TargetResource::default(),
            label_selector: None,
            field_selector: None,
            dimensions,
        }
    }

    #[tokio::test]
    async fn adds_cluster_and_uuid() {
        let clusters = [
            FederatedTarget {
                name: "west".to_string(),
                cluster: Ok(crossplane_cluster()),
            },
            FederatedTarget {
                name: "east".to_string(),
                cluster: Err(ClusterFailure {
                    reason: CLUSTER_UNAVAILABLE,
                    message: "invalid kubeconfig".to_string(),
                }),
            },
        ];
        let recorder = CollectingRecorder::default();
        let dimensions = synced_dimensions();
        let result = FederatedManagedHandler {
            query: query(&dimensions),
            clusters: &clusters,
            recorder: &recorder,
        }
        .monitor()
        .await
        .unwrap();
        assert_eq!(Phase::Ready, result.phase);
        assert_eq!("4", result.observation.unwrap().latest_value);
        let points = recorder.recorded();
        assert_eq!(4, points.len());
        assert!(points.iter().all(|p| p.value == 1));
        assert!(points.iter().all(|p| p.dimensions["cluster"] == "west"));
        assert!(points.iter().all(|p| p.dimensions["UUID"].starts_with("uid-")));
    }

    #[tokio::test]
    async fn pending_without_definitions() {
        let clusters = [FederatedTarget {
            name: "west".to_string(),
            cluster: Ok(FakeCluster::default()),
        }];
        let recorder = CollectingRecorder::default();
        let dimensions = BTreeMap::new();
        let result = FederatedManagedHandler {
            query: query(&dimensions),
            clusters: &clusters,
            recorder: &recorder,
        }
        .monitor()
        .await
        .unwrap();
        assert_eq!(Phase::Pending, result.phase);
    }
}
