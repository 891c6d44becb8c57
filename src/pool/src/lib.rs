pub mod authority;
pub mod config;
pub mod error;
pub mod factory;
pub mod item;
pub mod metrics;
pub mod pool;
mod queue;
mod worker;

pub use authority::{Authority, LeaseAuthority, Standalone};
pub use config::PoolConfig;
pub use error::{Error, FactoryError};
pub use factory::ResourceFactory;
pub use item::{
    Allocation, Binding, ItemState, PoolItem, PooledUnit, Resource, ResourceKey, Subnet, UnitId,
};
pub use metrics::PoolMetrics;
pub use pool::{PoolStats, ResourcePool};
