use podipam_trace::error::TraceableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Ipam: {0}")]
    Ipam(#[source] podipam_ipam::error::Error),

    #[error("Pool: {0}")]
    Pool(#[source] podipam_pool::Error),

    #[error("Store: {0}")]
    Store(#[source] podipam_store::Error),

    #[error("Missing fields: {0}")]
    MissingField(String),

    #[error("Config: {0}")]
    Config(#[source] ConfigError),

    #[error("Std I/O: {0}")]
    StdIo(#[source] std::io::Error),

    #[error("Metrics: {0}")]
    Metrics(#[source] prometheus::Error),

    #[error("Failed to get lock")]
    Lock,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load: {0}")]
    FailedToLoad(#[source] serde_yaml::Error),

    #[error("Duplicate network: {0}")]
    DuplicateNetwork(String),

    #[error("Network {0} must set exactly one of range or pool")]
    Backend(String),

    #[error("{0} must be positive")]
    ZeroInterval(&'static str),

    #[error("No resource factory for network {0}")]
    MissingFactory(String),
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::NetworkNotFound(_) => "network_not_found".to_string(),
            Error::Ipam(e) => format!("ipam_{}", e.metric_label()),
            Error::Pool(e) => format!("pool_{}", e.metric_label()),
            Error::Store(e) => format!("store_{}", e.metric_label()),
            Error::MissingField(_) => "missing_field".to_string(),
            Error::Config(_) => "config".to_string(),
            Error::StdIo(_) => "std_io".to_string(),
            Error::Metrics(_) => "metrics".to_string(),
            Error::Lock => "lock".to_string(),
        }
    }
}
