//! Wires a metric's sink credentials and target clusters to its handler.
use std::sync::Arc;

use crate::{
    cluster::TargetCluster,
    handlers::{
        FederatedHandler, FederatedManagedHandler, Handler, ManagedHandler, ManagedQuery,
        MetricHandler, ResourceQuery,
    },
    sink::{DataSinkCredentials, Recorder, SinkClient, SinkError, SinkPool},
};

/// A single cluster to measure.
pub(crate) struct QueryConfig<C> {
    pub cluster: C,
    /// Added as `cluster` dimension if set.
    pub cluster_name: Option<String>,
}

/// Why a federated cluster cannot be measured.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ClusterFailure {
    pub reason: &'static str,
    pub message: String,
}

pub(crate) struct FederatedTarget<C> {
    pub name: String,
    pub cluster: Result<C, ClusterFailure>,
}

pub(crate) enum Targets<C> {
    Single(QueryConfig<C>),
    Federated(Vec<FederatedTarget<C>>),
}

impl<C> Targets<C> {
    /// The clusters that can be measured.
    pub(crate) fn clusters(&self) -> Vec<&C> {
        match self {
            Targets::Single(config) => vec![&config.cluster],
            Targets::Federated(targets) => targets
                .iter()
                .filter_map(|t| t.cluster.as_ref().ok())
                .collect(),
        }
    }
}

/// Everything one reconciliation of a metric needs. Built per reconciliation.
pub(crate) struct Orchestrator<C> {
    credentials: DataSinkCredentials,
    targets: Targets<C>,
}

impl<C: TargetCluster> Orchestrator<C> {
    pub(crate) fn new(credentials: DataSinkCredentials, targets: Targets<C>) -> Self {
        Self {
            credentials,
            targets,
        }
    }

    pub(crate) fn targets(&self) -> &Targets<C> {
        &self.targets
    }

    /// The pooled client of the DataSink with `uid`.
    pub(crate) async fn sink(&self, pool: &SinkPool, uid: &str) -> Result<Arc<SinkClient>, SinkError> {
        pool.get(uid, &self.credentials).await
    }

    /// Handler counting the resources of `query`.
    pub(crate) fn with_metric<'a, R: Recorder>(
        &'a self,
        query: ResourceQuery<'a>,
        gauge: &'a R,
    ) -> Handler<'a, C, R> {
        match &self.targets {
            Targets::Single(target) => Handler::Metric(MetricHandler {
                query,
                target,
                recorder: gauge,
            }),
            Targets::Federated(clusters) => Handler::Federated(FederatedHandler {
                query,
                clusters,
                recorder: gauge,
            }),
        }
    }

    /// Handler counting the Crossplane managed resources of `query`.
    pub(crate) fn with_managed<'a, R: Recorder>(
        &'a self,
        query: ManagedQuery<'a>,
        gauge: &'a R,
    ) -> Handler<'a, C, R> {
        match &self.targets {
            Targets::Single(target) => Handler::Managed(ManagedHandler {
                query,
                target,
                recorder: gauge,
            }),
            Targets::Federated(clusters) => Handler::FederatedManaged(FederatedManagedHandler {
                query,
                clusters,
                recorder: gauge,
            }),
        }
    }
}
