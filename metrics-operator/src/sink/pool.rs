use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use super::{DataSinkCredentials, SinkClient, SinkError};

struct PooledClient {
    credentials: DataSinkCredentials,
    client: Arc<SinkClient>,
}

/// Sink clients shared by all metrics, keyed by DataSink UID.
#[derive(Default)]
pub(crate) struct SinkPool {
    clients: Mutex<HashMap<String, PooledClient>>,
}

impl SinkPool {
    /// The client of DataSink `uid`, re-created if its credentials changed.
    pub(crate) async fn get(
        &self,
        uid: &str,
        credentials: &DataSinkCredentials,
    ) -> Result<Arc<SinkClient>, SinkError> {
        // Creating a client does not perform network I/O, so the lock is held
        // while a missing client is built.
        let mut clients = self.clients.lock().await;
        if let Some(pooled) = clients.get(uid) {
            if pooled.credentials == *credentials {
                return Ok(pooled.client.clone());
            }
        }
        let client = Arc::new(SinkClient::new(credentials.clone()).await?);
        let previous = clients.insert(
            uid.to_string(),
            PooledClient {
                credentials: credentials.clone(),
                client: client.clone(),
            },
        );
        drop(clients);
        match previous {
            Some(previous) => {
                info!(
                    "DataSink {} changed, replacing exporter for {}",
                    uid,
                    previous.client.endpoint()
                );
                tokio::spawn(async move {
                    if let Err(e) = previous.client.close().await {
                        warn!("failed to close exporter of DataSink {}: {}", previous.client.endpoint(), e);
                    }
                });
            }
            None => info!("created exporter for {}", client.endpoint()),
        }
        Ok(client)
    }

    /// Flush and close all clients.
    pub(crate) async fn close_all(&self) {
        let clients: Vec<(String, PooledClient)> = self.clients.lock().await.drain().collect();
        info!("closing {} DataSink exporter(s)", clients.len());
        for (uid, pooled) in clients {
            match pooled.client.close().await {
                Ok(()) => debug!("closed exporter of DataSink {}", uid),
                Err(e) => warn!("failed to close exporter of DataSink {}: {}", uid, e),
            }
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}
