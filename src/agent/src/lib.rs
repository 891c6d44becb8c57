pub mod config;
pub mod error;
pub mod gc;
pub mod ipam;
pub mod metrics;
pub mod pod;
pub mod pooled;
pub mod range;

pub use config::{Config, NetworkConfig};
pub use error::Error;
pub use ipam::{Backends, Ipam, NetworkContext};
pub use pod::PodInfo;
