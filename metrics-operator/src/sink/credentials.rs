use std::{fmt, time::Duration};

use kube::{Api, Client, ResourceExt};
use metrics_operator_apis::{
    SecretKeyReference, ValidationError,
    v1alpha1::{DataSink, SinkAuthentication},
};

use crate::{
    errors::ExtKubeApiError,
    handlers::reason::{INVALID_SPEC, RESOURCE_NOT_FOUND, SEND_METRIC_FAILED},
    secrets::{SecretError, read_secret_key, utf8},
    utils::with_deadline,
};

/// Connection details of a DataSink with its secrets resolved.
#[derive(Clone, PartialEq)]
pub(crate) struct DataSinkCredentials {
    pub endpoint: String,
    pub auth: SinkAuth,
}

#[derive(Clone, PartialEq)]
pub(crate) enum SinkAuth {
    ApiKey(String),
    Certificate {
        client_cert: Vec<u8>,
        client_key: Vec<u8>,
        ca_cert: Option<Vec<u8>>,
    },
}

impl fmt::Debug for DataSinkCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth = match &self.auth {
            SinkAuth::ApiKey(_) => "api key",
            SinkAuth::Certificate { .. } => "certificate",
        };
        f.debug_struct("DataSinkCredentials")
            .field("endpoint", &self.endpoint)
            .field("auth", &auth)
            .finish()
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum CredentialsError {
    #[error("DataSink {0} not found")]
    DataSinkNotFound(String),
    #[error("failed to read DataSink {0}: {1}")]
    Kube(String, kube::Error),
    #[error("invalid DataSink {0}: {1}")]
    InvalidSpec(String, ValidationError),
    #[error("{0}")]
    Secret(#[from] SecretError),
    #[error("{0}")]
    InvalidSecret(String),
    #[error("{0} did not complete within {1:?}")]
    Timeout(&'static str, Duration),
}

impl CredentialsError {
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            CredentialsError::DataSinkNotFound(_)
            | CredentialsError::Secret(SecretError::NotFound { .. }) => RESOURCE_NOT_FOUND,
            CredentialsError::InvalidSpec(..) => INVALID_SPEC,
            _ => SEND_METRIC_FAILED,
        }
    }
}

/// Resolve the DataSink `name` in `namespace` and its secrets.
///
/// Returns the DataSink's UID along with its credentials.
pub(crate) async fn resolve_credentials(
    client: Client,
    namespace: &str,
    name: &str,
    deadline: Duration,
) -> Result<(String, DataSinkCredentials), CredentialsError> {
    with_deadline(deadline, resolve(client, namespace, name))
        .await
        .map_err(|e| CredentialsError::Timeout("resolving DataSink credentials", e.0))?
}

async fn resolve(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<(String, DataSinkCredentials), CredentialsError> {
    let id = format!("{}/{}", namespace, name);
    let api: Api<DataSink> = Api::namespaced(client.clone(), namespace);
    let sink = match api.get_opt(name).await {
        Ok(Some(sink)) => sink,
        Ok(None) => return Err(CredentialsError::DataSinkNotFound(id)),
        Err(e) if e.is_not_found() => return Err(CredentialsError::DataSinkNotFound(id)),
        Err(e) => return Err(CredentialsError::Kube(id, e)),
    };
    let auth = match sink
        .spec
        .validate()
        .map_err(|e| CredentialsError::InvalidSpec(id.clone(), e))?
    {
        SinkAuthentication::ApiKey(api_key) => {
            let token = read_text(&client, namespace, &api_key.secret_key_ref).await?;
            SinkAuth::ApiKey(token.trim().to_string())
        }
        SinkAuthentication::Certificate(certificate) => SinkAuth::Certificate {
            client_cert: read(&client, namespace, &certificate.client_cert).await?,
            client_key: read(&client, namespace, &certificate.client_key).await?,
            ca_cert: match &certificate.ca_cert {
                Some(ca) => Some(read(&client, namespace, ca).await?),
                None => None,
            },
        },
    };
    let uid = sink.uid().unwrap_or(id);
    Ok((
        uid,
        DataSinkCredentials {
            endpoint: sink.spec.connection.endpoint.trim().to_string(),
            auth,
        },
    ))
}

async fn read(
    client: &Client,
    namespace: &str,
    reference: &SecretKeyReference,
) -> Result<Vec<u8>, CredentialsError> {
    Ok(read_secret_key(client.clone(), namespace, &reference.name, &reference.key).await?)
}

async fn read_text(
    client: &Client,
    namespace: &str,
    reference: &SecretKeyReference,
) -> Result<String, CredentialsError> {
    let value = read(client, namespace, reference).await?;
    utf8(&reference.key, value).map_err(|e| {
        CredentialsError::InvalidSecret(format!("secret {}/{}: {}", namespace, reference.name, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let credentials = DataSinkCredentials {
            endpoint: "https://sink.example".to_string(),
            auth: SinkAuth::ApiKey("dt0c01.secret".to_string()),
        };
        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("dt0c01"));
        assert!(debug.contains("api key"));
    }

    #[test]
    fn reasons() {
        assert_eq!(
            RESOURCE_NOT_FOUND,
            CredentialsError::DataSinkNotFound("ops/default".to_string()).reason()
        );
        assert_eq!(
            RESOURCE_NOT_FOUND,
            CredentialsError::Secret(SecretError::NotFound {
                namespace: "ops".to_string(),
                name: "token".to_string(),
            })
            .reason()
        );
        assert_eq!(
            SEND_METRIC_FAILED,
            CredentialsError::Secret(SecretError::MissingKey {
                namespace: "ops".to_string(),
                name: "token".to_string(),
                key: "api-key".to_string(),
            })
            .reason()
        );
        assert_eq!(
            INVALID_SPEC,
            CredentialsError::InvalidSpec(
                "ops/default".to_string(),
                ValidationError::AmbiguousAuthentication
            )
            .reason()
        );
    }
}
