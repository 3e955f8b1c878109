use std::{collections::HashMap, time::Duration};

use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Gauge, Meter, MeterProvider},
};
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider, Temporality},
};
use reqwest::Url;

use super::credentials::{DataSinkCredentials, SinkAuth};
use crate::{handlers::DataPoint, utils::with_deadline};

/// Path OTLP/HTTP receivers accept metrics on.
const DEFAULT_METRICS_PATH: &str = "/v1/metrics";

const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Data points are exported explicitly after each measurement, the periodic
/// export only picks up what an aborted reconciliation left behind.
const BACKGROUND_EXPORT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const SERVICE_NAME: &str = "metrics-operator";

#[derive(thiserror::Error, Debug)]
pub(crate) enum SinkError {
    #[error("invalid endpoint {0:?}: {1}")]
    InvalidEndpoint(String, String),
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] reqwest::Error),
    #[error("failed to create OTLP exporter: {0}")]
    Exporter(String),
    #[error("dimension {0:?} has an empty value")]
    EmptyAttribute(String),
    #[error("export failed: {0}")]
    Export(String),
    #[error("export did not complete within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Consumer of the data points of a measurement.
pub(crate) trait Recorder: Send + Sync {
    /// Record all `points` or none of them.
    fn record(&self, points: &[DataPoint]) -> Result<(), SinkError>;
}

/// OTLP endpoint URL of a DataSink endpoint. Metrics are always sent over
/// OTLP/HTTP, so `grpc` and `grpcs` map to `http` and `https`.
pub(crate) fn metrics_endpoint(endpoint: &str) -> Result<String, SinkError> {
    let endpoint = endpoint.trim();
    let invalid = |message: String| SinkError::InvalidEndpoint(endpoint.to_string(), message);
    let (scheme, rest) = endpoint
        .split_once("://")
        .ok_or_else(|| invalid("missing scheme".to_string()))?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "grpc" => "http",
        "https" | "grpcs" => "https",
        other => return Err(invalid(format!("unsupported scheme {:?}", other))),
    };
    let mut url = Url::parse(&format!("{}://{}", scheme, rest)).map_err(|e| invalid(e.to_string()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_METRICS_PATH);
    }
    Ok(url.to_string())
}

fn attributes(point: &DataPoint) -> Result<Vec<KeyValue>, SinkError> {
    point
        .dimensions
        .iter()
        .map(|(name, value)| {
            if value.is_empty() {
                Err(SinkError::EmptyAttribute(name.clone()))
            } else {
                Ok(KeyValue::new(name.clone(), value.clone()))
            }
        })
        .collect()
}

/// OTLP exporter of one DataSink.
pub(crate) struct SinkClient {
    provider: SdkMeterProvider,
    endpoint: String,
}

impl SinkClient {
    /// Create the exporter. No connection is made before the first export.
    pub(crate) async fn new(credentials: DataSinkCredentials) -> Result<Self, SinkError> {
        // The blocking HTTP client must not be created on a runtime thread.
        tokio::task::spawn_blocking(move || Self::build(&credentials)).await?
    }

    fn build(credentials: &DataSinkCredentials) -> Result<Self, SinkError> {
        let endpoint = metrics_endpoint(&credentials.endpoint)?;
        let mut headers = HashMap::new();
        let mut http = reqwest::blocking::Client::builder().timeout(EXPORT_TIMEOUT);
        match &credentials.auth {
            SinkAuth::ApiKey(token) => {
                headers.insert("Authorization".to_string(), format!("Api-Token {}", token));
            }
            SinkAuth::Certificate {
                client_cert,
                client_key,
                ca_cert,
            } => {
                let mut pem = client_cert.clone();
                pem.push(b'\n');
                pem.extend_from_slice(client_key);
                http = http.identity(reqwest::Identity::from_pem(&pem)?);
                if let Some(ca_cert) = ca_cert {
                    for certificate in reqwest::Certificate::from_pem_bundle(ca_cert)? {
                        http = http.add_root_certificate(certificate);
                    }
                }
            }
        }
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_temporality(Temporality::Delta)
            .with_http()
            .with_http_client(http.build()?)
            .with_endpoint(endpoint.clone())
            .with_protocol(Protocol::HttpBinary)
            .with_timeout(EXPORT_TIMEOUT)
            .with_headers(headers)
            .build()
            .map_err(|e| SinkError::Exporter(e.to_string()))?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(BACKGROUND_EXPORT_INTERVAL)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
            .build();
        debug!("created OTLP exporter for {}", endpoint);
        Ok(Self { provider, endpoint })
    }

    pub(crate) fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Instrument scope named after a metric.
    pub(crate) fn meter(&self, name: &str) -> SinkMeter {
        SinkMeter {
            meter: self
                .provider
                .meter_with_scope(InstrumentationScope::builder(name.to_string()).build()),
        }
    }

    /// Ship everything recorded so far.
    pub(crate) async fn export(&self, deadline: Duration) -> Result<(), SinkError> {
        let provider = self.provider.clone();
        with_deadline(
            deadline,
            tokio::task::spawn_blocking(move || provider.force_flush()),
        )
        .await
        .map_err(|e| SinkError::Timeout(e.0))??
        .map_err(|e| SinkError::Export(e.to_string()))
    }

    /// Flush and shut the exporter down.
    pub(crate) async fn close(&self) -> Result<(), SinkError> {
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await?
            .map_err(|e| SinkError::Export(e.to_string()))
    }
}

pub(crate) struct SinkMeter {
    meter: Meter,
}

impl SinkMeter {
    pub(crate) fn new_metric(&self, name: &str) -> MetricGauge {
        MetricGauge {
            gauge: self.meter.i64_gauge(name.to_string()).build(),
        }
    }
}

/// Int64 gauge of one metric.
pub(crate) struct MetricGauge {
    gauge: Gauge<i64>,
}

impl Recorder for MetricGauge {
    fn record(&self, points: &[DataPoint]) -> Result<(), SinkError> {
        let attributes = points
            .iter()
            .map(attributes)
            .collect::<Result<Vec<_>, _>>()?;
        for (point, attributes) in points.iter().zip(attributes) {
            self.gauge.record(point.value, &attributes);
        }
        Ok(())
    }
}
