use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::errors::ExtKubeApiError;

#[derive(thiserror::Error, Debug)]
pub(crate) enum SecretError {
    #[error("secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("secret {namespace}/{name} has no key {key:?}")]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("failed to read secret {namespace}/{name}: {source}")]
    Kube {
        namespace: String,
        name: String,
        source: kube::Error,
    },
}

/// Read a Secret of the operator's own cluster.
pub(crate) async fn read_secret(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Secret, SecretError> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(secret) => Ok(secret),
        Err(e) if e.is_not_found() => Err(SecretError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }),
        Err(source) => Err(SecretError::Kube {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        }),
    }
}

/// Look up `key` in `secret`, preferring `data` over `stringData`.
pub(crate) fn secret_value(secret: &Secret, key: &str) -> Result<Vec<u8>, SecretError> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|v| v.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|v| v.as_bytes().to_vec())
        })
        .ok_or_else(|| SecretError::MissingKey {
            namespace: secret.metadata.namespace.clone().unwrap_or_default(),
            name: secret.metadata.name.clone().unwrap_or_default(),
            key: key.to_string(),
        })
}

/// Read a single key of a Secret of the operator's own cluster.
pub(crate) async fn read_secret_key(
    client: Client,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Vec<u8>, SecretError> {
    let secret = read_secret(client, namespace, name).await?;
    secret_value(&secret, key)
}

/// Read a key holding text, such as a kubeconfig or PEM document.
pub(crate) fn utf8(key: &str, value: Vec<u8>) -> Result<String, String> {
    String::from_utf8(value).map_err(|e| format!("key {:?} is not valid UTF-8: {}", key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn values_from_data_and_string_data() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("sink".to_string()),
                namespace: Some("ops".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(b"from-data".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([
                ("token".to_string(), "from-string-data".to_string()),
                ("ca".to_string(), "pem".to_string()),
            ])),
            ..Default::default()
        };
        assert_eq!(b"from-data".to_vec(), secret_value(&secret, "token").unwrap());
        assert_eq!(b"pem".to_vec(), secret_value(&secret, "ca").unwrap());
        let e = secret_value(&secret, "missing").unwrap_err();
        assert_eq!(r#"secret ops/sink has no key "missing""#, e.to_string());
    }
}
