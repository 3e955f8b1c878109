//! The metric kinds the operator reconciles and how each is measured.
use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use metrics_operator_apis::{
    MetricObject, ObjectReference, ValidationError, v1alpha1, v1beta1, validate_projections,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::handlers::{ManagedQuery, ResourceQuery};

/// Where a metric's target resources live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Access<'a> {
    /// The operator's own cluster.
    Local,
    /// Cluster of a `v1alpha1` RemoteClusterAccess.
    Remote(&'a ObjectReference),
    /// Cluster of a `v1beta1` ClusterAccess.
    Cluster(&'a ObjectReference),
    /// All clusters of a FederatedClusterAccess.
    Federated(&'a ObjectReference),
}

pub(crate) enum Query<'a> {
    Resources(ResourceQuery<'a>),
    Managed(ManagedQuery<'a>),
}

/// A metric kind the operator reconciles.
pub(crate) trait Monitored:
    MetricObject
    + Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Whether changes of the target resources trigger a measurement.
    const WATCH_TARGETS: bool = true;

    fn access(&self) -> Access<'_>;

    fn query(&self) -> Query<'_>;

    /// Checks admission cannot express.
    fn validate(&self) -> Result<(), ValidationError> {
        match self.query() {
            Query::Resources(query) => {
                query.target.validate()?;
                validate_projections(query.projections)
            }
            Query::Managed(_) => Ok(()),
        }
    }
}

fn resources<'a>(
    target: &'a metrics_operator_apis::TargetResource,
    label_selector: &'a Option<String>,
    field_selector: &'a Option<String>,
    projections: &'a [metrics_operator_apis::Projection],
) -> Query<'a> {
    Query::Resources(ResourceQuery {
        target,
        label_selector: label_selector.as_deref(),
        field_selector: field_selector.as_deref(),
        projections,
    })
}

impl Monitored for v1alpha1::Metric {
    fn access(&self) -> Access<'_> {
        self.spec
            .remote_cluster_access_ref
            .as_ref()
            .map_or(Access::Local, Access::Remote)
    }

    fn query(&self) -> Query<'_> {
        let spec = &self.spec;
        resources(
            &spec.target,
            &spec.label_selector,
            &spec.field_selector,
            &spec.projections,
        )
    }
}

impl Monitored for v1alpha1::ManagedMetric {
    const WATCH_TARGETS: bool = false;

    fn access(&self) -> Access<'_> {
        self.spec
            .remote_cluster_access_ref
            .as_ref()
            .map_or(Access::Local, Access::Remote)
    }

    fn query(&self) -> Query<'_> {
        Query::Managed(ManagedQuery {
            target: self.spec.target(),
            label_selector: self.spec.label_selector.as_deref(),
            field_selector: self.spec.field_selector.as_deref(),
            dimensions: &self.spec.dimensions,
        })
    }
}

impl Monitored for v1alpha1::FederatedMetric {
    fn access(&self) -> Access<'_> {
        Access::Federated(&self.spec.federate_cluster_access_ref)
    }

    fn query(&self) -> Query<'_> {
        let spec = &self.spec;
        resources(
            &spec.target,
            &spec.label_selector,
            &spec.field_selector,
            &spec.projections,
        )
    }
}

impl Monitored for v1alpha1::FederatedManagedMetric {
    const WATCH_TARGETS: bool = false;

    fn access(&self) -> Access<'_> {
        Access::Federated(&self.spec.federate_cluster_access_ref)
    }

    fn query(&self) -> Query<'_> {
        Query::Managed(ManagedQuery {
            target: self.spec.target(),
            label_selector: self.spec.label_selector.as_deref(),
            field_selector: self.spec.field_selector.as_deref(),
            dimensions: &self.spec.dimensions,
        })
    }
}

impl Monitored for v1beta1::SingleMetric {
    fn access(&self) -> Access<'_> {
        self.spec
            .cluster_access_ref
            .as_ref()
            .map_or(Access::Local, Access::Cluster)
    }

    fn query(&self) -> Query<'_> {
        let spec = &self.spec;
        resources(&spec.target, &spec.label_selector, &spec.field_selector, &[])
    }
}

impl Monitored for v1beta1::CompoundMetric {
    fn access(&self) -> Access<'_> {
        self.spec
            .cluster_access_ref
            .as_ref()
            .map_or(Access::Local, Access::Cluster)
    }

    fn query(&self) -> Query<'_> {
        let spec = &self.spec;
        resources(
            &spec.target,
            &spec.label_selector,
            &spec.field_selector,
            &spec.projections,
        )
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.spec.projections.is_empty() {
            return Err(ValidationError::MissingProjections);
        }
        self.spec.target.validate()?;
        validate_projections(&self.spec.projections)
    }
}
