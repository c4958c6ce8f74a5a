use thiserror::Error;

use crate::databroker::StoreError;
use crate::model::UnemittableError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Databroker Error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Unemittable(#[from] UnemittableError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Store(_) => "DatabrokerError",
            Error::Unemittable(_) => "Unemittable",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::InvalidUrl(_) => "InvalidUrl",
        }
    }
}

/// Reconciliation pipeline, ownership and assembly logic
pub mod controllers;

/// External configuration store client, applier and lease
pub mod databroker;

/// Shared object registry and dependency graph
pub mod index;

/// Object identities and the IngressConfig snapshot
pub mod model;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;
