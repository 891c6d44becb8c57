use std::time::Duration;

use podipam_trace::error::TraceableError;
use thiserror::Error;

use super::item::UnitId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No available resource")]
    NoAvailableResource,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to get lock")]
    Lock,

    #[error("Store: {0}")]
    Store(#[source] podipam_store::Error),

    #[error("Factory: {0}")]
    Factory(#[source] FactoryError),

    #[error("Metrics: {0}")]
    Metrics(#[source] prometheus::Error),
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::NoAvailableResource => "no_available_resource".to_string(),
            Error::InvalidState(_) => "invalid_state".to_string(),
            Error::NotFound(_) => "not_found".to_string(),
            Error::Lock => "lock".to_string(),
            Error::Store(e) => format!("store_{}", e.metric_label()),
            Error::Factory(e) => format!("factory_{}", e.metric_label()),
            Error::Metrics(_) => "metrics".to_string(),
        }
    }
}

/// Errors reported by a [`ResourceFactory`](crate::factory::ResourceFactory).
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Cloud API: {0}")]
    Api(String),

    #[error("Unit {0} not found")]
    UnitNotFound(UnitId),

    #[error("Unit {0} is unhealthy: {1}")]
    Unhealthy(UnitId, String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

impl TraceableError for FactoryError {
    fn metric_label(&self) -> String {
        match self {
            FactoryError::Api(_) => "api",
            FactoryError::UnitNotFound(_) => "unit_not_found",
            FactoryError::Unhealthy(_, _) => "unhealthy",
            FactoryError::Timeout(_) => "timeout",
            FactoryError::Cancelled => "cancelled",
        }
        .to_string()
    }
}
