use std::{collections::HashMap, net::IpAddr};

use async_trait::async_trait;

use super::{
    error::FactoryError,
    item::{PooledUnit, UnitId},
};

/// Cloud boundary of the pool.
///
/// `create` and `dispose` mutate cluster-visible state and are only called
/// while the pool holds authority. The remaining calls are node-local.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    /// Create unit(s) carrying `count` secondary addresses in total.
    async fn create(&self, count: usize) -> Result<Vec<PooledUnit>, FactoryError>;

    async fn dispose(&self, unit: &PooledUnit) -> Result<(), FactoryError>;

    /// Every unit attached to this node, keyed by unit id.
    async fn list(&self) -> Result<HashMap<UnitId, PooledUnit>, FactoryError>;

    async fn check(&self, unit: &PooledUnit) -> Result<(), FactoryError>;

    async fn assign(&self, unit: &UnitId, count: usize) -> Result<Vec<IpAddr>, FactoryError>;

    async fn unassign(&self, unit: &UnitId, addrs: &[IpAddr]) -> Result<(), FactoryError>;
}
