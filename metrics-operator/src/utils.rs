use std::{future::Future, time::Duration};

/// Name of the service account namespace file mounted into every pod.
const SERVICE_ACCOUNT_NAMESPACE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Smallest measurement interval accepted.
pub(crate) const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Safety margin between an I/O deadline and the next scheduled measurement.
const DEADLINE_MARGIN: Duration = Duration::from_secs(10);

/// Lower bound of any I/O deadline.
const MIN_DEADLINE: Duration = Duration::from_secs(30);

pub(crate) fn metric_name(name: &str) -> String {
    format!("metrics_operator_{}", name)
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The namespace the operator runs in, where default DataSinks live.
pub(crate) fn operator_namespace() -> String {
    env_var("POD_NAMESPACE")
        .or_else(|| {
            std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .unwrap_or_else(|| "default".to_string())
}

/// Parse a Go-style duration like `10m` or `1h30m` into a measurement interval.
pub(crate) fn parse_interval(interval: &str) -> Result<Duration, String> {
    let interval = interval.trim();
    let duration = humantime::parse_duration(interval)
        .map_err(|e| format!("invalid interval {:?}: {}", interval, e))?;
    if duration < MIN_INTERVAL {
        Err(format!(
            "interval {:?} is shorter than {}",
            interval,
            humantime::format_duration(MIN_INTERVAL)
        ))
    } else {
        Ok(duration)
    }
}

/// Deadline of each I/O operation performed on behalf of a metric measured
/// every `interval`.
pub(crate) fn io_deadline(interval: Duration) -> Duration {
    interval.saturating_sub(DEADLINE_MARGIN).max(MIN_DEADLINE)
}

/// Error returned by [`with_deadline`] if the future did not complete in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Elapsed(pub Duration);

/// Await `future`, giving up after `deadline`.
pub(crate) async fn with_deadline<F: Future>(
    deadline: Duration,
    future: F,
) -> Result<F::Output, Elapsed> {
    tokio::time::timeout(deadline, future)
        .await
        .map_err(|_| Elapsed(deadline))
}

/// A client for an unreachable API server, for tests that never talk to it.
#[cfg(test)]
pub(crate) fn offline_client() -> kube::Client {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
    kube::Client::try_from(config).unwrap()
}
