use crate::store::StoreError;
use thiserror::Error;

/// Errors that stop the ingress from starting or serving
#[derive(Error, Debug)]
pub enum IngressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not connect to the {name} store: {source}")]
    StoreConnection {
        name: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Causes of a dropped message that are worth reporting to diagnostics
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Missing payload")]
    MissingPayload,

    #[error("Invalid payload format")]
    InvalidPayload,

    #[error("Invalid origin")]
    InvalidOrigin,

    #[error("could not serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("could not commit message: {0}")]
    Store(#[from] StoreError),

    #[error("admission task failed: {0}")]
    Task(String),
}
