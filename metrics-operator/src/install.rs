//! `init`: install or upgrade the operator's CustomResourceDefinitions.
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use kube_runtime::wait::{await_condition, conditions};

use crate::{MANAGER, utils::with_deadline};

/// How long a CRD may take to become established.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallError {
    #[error("failed to build CustomResourceDefinitions: {0}")]
    Merge(#[from] kube::core::crd::MergeError),
    #[error("failed to apply CustomResourceDefinition {0}: {1}")]
    Apply(String, kube::Error),
    #[error("failed to wait for CustomResourceDefinition {0}: {1}")]
    Wait(String, kube_runtime::wait::Error),
    #[error("CustomResourceDefinition {0} was not established within {1:?}")]
    Timeout(String, Duration),
}

/// Server-side apply all CRDs and wait until they are established.
pub(crate) async fn install_crds(client: Client) -> Result<(), InstallError> {
    let crds = metrics_operator_apis::crds()?;
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply(MANAGER).force();
    for crd in &crds {
        let name = crd.name_any();
        api.patch(&name, &params, &Patch::Apply(crd))
            .await
            .map_err(|e| InstallError::Apply(name.clone(), e))?;
        info!("applied CustomResourceDefinition {}", name);
    }
    for crd in &crds {
        let name = crd.name_any();
        with_deadline(
            ESTABLISH_TIMEOUT,
            await_condition(api.clone(), &name, conditions::is_crd_established()),
        )
        .await
        .map_err(|e| InstallError::Timeout(name.clone(), e.0))?
        .map_err(|e| InstallError::Wait(name.clone(), e))?;
        debug!("CustomResourceDefinition {} is established", name);
    }
    info!("installed {} CustomResourceDefinitions", crds.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_patches_carry_type_information() {
        let crds = metrics_operator_apis::crds().unwrap();
        assert!(!crds.is_empty());
        for crd in &crds {
            assert!(crd.name_any().ends_with(".metrics.openmcp.cloud"), "{}", crd.name_any());
            let value = serde_json::to_value(crd).unwrap();
            assert_eq!("apiextensions.k8s.io/v1", value["apiVersion"]);
            assert_eq!("CustomResourceDefinition", value["kind"]);
        }
    }
}
