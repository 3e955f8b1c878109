//! Metrics measured across the clusters of a FederatedClusterAccess.
use std::cmp::Ordering;

use super::*;
use crate::orchestrator::FederatedTarget;

/// A federated cluster that could not be measured.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Unavailable {
    pub cluster: String,
    pub reason: &'static str,
    pub message: String,
}

fn summary(unavailable: &[Unavailable]) -> String {
    unavailable
        .iter()
        .map(|u| format!("{} ({}: {})", u.cluster, u.reason, u.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Whether `a` is a later revision of the same object than `b`.
fn is_newer(a: &DynamicObject, b: &DynamicObject) -> bool {
    match (a.metadata.generation, b.metadata.generation) {
        (Some(x), Some(y)) if x != y => x > y,
        _ => {
            let x = a.metadata.resource_version.as_deref().unwrap_or_default();
            let y = b.metadata.resource_version.as_deref().unwrap_or_default();
            match (x.parse::<u64>(), y.parse::<u64>()) {
                (Ok(x), Ok(y)) => x > y,
                _ => x.cmp(y) == Ordering::Greater,
            }
        }
    }
}

/// Keep only the latest revision of every `namespace/name`.
pub(super) fn latest_generation(items: Vec<DynamicObject>) -> Vec<DynamicObject> {
    let mut latest: BTreeMap<(String, String), DynamicObject> = BTreeMap::new();
    for item in items {
        let key = (item.namespace().unwrap_or_default(), item.name_any());
        match latest.get(&key) {
            Some(existing) if !is_newer(&item, existing) => {}
            _ => {
                latest.insert(key, item);
            }
        }
    }
    latest.into_values().collect()
}

/// Combine the measurements of all federated clusters.
///
/// Succeeds if at least one cluster was measured, fails with the reason of
/// the first unavailable cluster if none was.
pub(super) fn conclude<R: Recorder>(
    measurement: Measurement,
    unavailable: Vec<Unavailable>,
    clusters: usize,
    recorder: &R,
    base: BTreeMap<String, String>,
) -> Result<MonitorResult, Interrupt> {
    if let Some(first) = unavailable.first() {
        if unavailable.len() == clusters {
            return Ok(MonitorResult::failed(
                first.reason,
                "no federated cluster could be measured",
                summary(&unavailable),
            ));
        }
    }
    if let Some(failure) = measurement.projection_failure() {
        return Ok(failure);
    }
    measurement.record(recorder)?;
    let mut message = format!(
        "measured {} resource(s) in {} of {} cluster(s)",
        measurement.resources,
        clusters - unavailable.len(),
        clusters
    );
    if !unavailable.is_empty() {
        message.push_str("; unavailable: ");
        message.push_str(&summary(&unavailable));
    }
    let dimensions = measurement
        .points
        .first()
        .map(|p| p.dimensions.clone())
        .unwrap_or(base);
    Ok(MonitorResult::ready(
        measurement.resources,
        dimensions,
        message,
    ))
}

/// Counts resources in every federated cluster, grouped by projections.
pub(crate) struct FederatedHandler<'a, C, R> {
    pub query: ResourceQuery<'a>,
    pub clusters: &'a [FederatedTarget<C>],
    pub recorder: &'a R,
}

impl<C: TargetCluster, R: Recorder> FederatedHandler<'_, C, R> {
    pub(crate) async fn monitor(&self) -> Result<MonitorResult, HandlerError> {
        settle(self.measure().await)
    }

    async fn measure(&self) -> Result<MonitorResult, Interrupt> {
        let mut measurement = Measurement::default();
        let mut unavailable = Vec::new();
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
            match list_targets(cluster, &self.query).await {
                Ok(items) => {
                    let items = latest_generation(items);
                    let base = base_dimensions(self.query.target, Some(target.name.as_str()));
                    measurement.extend(measure_resources(&items, self.query.projections, &base));
                }
                Err(Interrupt::Failed(result)) => unavailable.push(Unavailable {
                    cluster: target.name.clone(),
                    reason: result.reason,
                    message: result.message,
                }),
                Err(e) => return Err(e),
            }
        }
        conclude(
            measurement,
            unavailable,
            self.clusters.len(),
            self.recorder,
            base_dimensions(self.query.target, None),
        )
    }
}
