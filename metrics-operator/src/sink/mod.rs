//! Export of data points to DataSinks over OTLP/HTTP.
mod client;
mod credentials;
mod pool;

pub(crate) use client::{Recorder, SinkClient, SinkError};
pub(crate) use credentials::{CredentialsError, DataSinkCredentials, SinkAuth, resolve_credentials};
pub(crate) use pool::SinkPool;
