use std::{net::IpAddr, sync::Arc, time::Duration};

use ipnet::IpNet;
use podipam_pool::{Authority, PoolConfig, PoolMetrics, ResourceFactory, ResourcePool};
use podipam_store::{DiskStore, JsonCodec};
use redb::Database;

use super::error::Error;

/// Pool-backed network. Owners are pods, keyed by `namespace/name`.
/// Sticky releases are held by the pool itself, which persists them.
pub struct PooledIpam {
    network: String,
    pool: ResourcePool,
    sticky_window: Duration,
}

impl PooledIpam {
    pub async fn new(
        db: Arc<Database>,
        network: &str,
        config: PoolConfig,
        sticky_window: Duration,
        factory: Arc<dyn ResourceFactory>,
        authority: Arc<dyn Authority>,
        metrics: PoolMetrics,
    ) -> Result<PooledIpam, Error> {
        let store = DiskStore::new(db, network, JsonCodec).map_err(Error::Store)?;
        let pool = ResourcePool::new(network, config, factory, authority, store, metrics)
            .await
            .map_err(Error::Pool)?;
        Ok(PooledIpam {
            network: network.to_string(),
            pool,
            sticky_window,
        })
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn allocate(&self, owner: &str, requested: &[IpAddr]) -> Result<IpNet, Error> {
        let mut preferred = None;
        for address in requested.iter() {
            if let Some(key) = self.pool.lookup(*address).map_err(Error::Pool)? {
                preferred = Some(key);
                break;
            }
        }

        let allocation = self
            .pool
            .allocate_preferred(owner, preferred.as_ref())
            .map_err(Error::Pool)?;
        allocation.net().ok_or_else(|| {
            Error::Pool(podipam_pool::Error::InvalidState(format!(
                "{} does not fit in {}",
                allocation.address(),
                allocation.subnet.cidr
            )))
        })
    }

    /// Release the address of `owner`. With `sticky`, the address is held back
    /// for the sticky window and offered again when the same owner returns.
    pub fn release(&self, owner: &str, sticky: bool) -> Result<(), Error> {
        let window = if sticky {
            self.sticky_window
        } else {
            Duration::ZERO
        };
        match self.pool.release_with_reservation(owner, window) {
            Ok(()) => Ok(()),
            Err(podipam_pool::Error::NotFound(_)) => {
                tracing::debug!(network = self.network, owner, "Nothing to release");
                Ok(())
            }
            Err(e) => Err(Error::Pool(e)),
        }
    }

    pub fn get(&self, owner: &str) -> Result<Option<IpNet>, Error> {
        match self.pool.get(owner) {
            Ok(allocation) => Ok(allocation.net()),
            Err(podipam_pool::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(Error::Pool(e)),
        }
    }

    pub fn purge_tombstones(&self, grace: Duration) -> Result<usize, Error> {
        self.pool.purge_tombstones(grace).map_err(Error::Pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podipam_mock::MockFactory;
    use podipam_pool::Standalone;
    use podipam_store::open_database;

    async fn backend(dir: &tempfile::TempDir, factory: Arc<MockFactory>) -> PooledIpam {
        backend_with(dir, factory, Duration::from_secs(60)).await
    }

    async fn backend_with(
        dir: &tempfile::TempDir,
        factory: Arc<MockFactory>,
        sticky_window: Duration,
    ) -> PooledIpam {
        let db = open_database(dir.path().join("pooled.redb")).unwrap();
        let config = PoolConfig {
            min_idle: 2,
            max_idle: 4,
            capacity: 6,
            jitter: 0.0,
            ..Default::default()
        };
        PooledIpam::new(
            db,
            "eni",
            config,
            sticky_window,
            factory,
            Arc::new(Standalone),
            PoolMetrics::new().unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn works_allocate_release() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(MockFactory::new("10.0.0.0/24".parse().unwrap()));
        let ipam = backend(&dir, factory).await;

        assert!(matches!(
            ipam.allocate("default/pod-a", &[]),
            Err(Error::Pool(podipam_pool::Error::NoAvailableResource))
        ));
        ipam.pool().reconcile().await;
        ipam.pool().settle().await;

        let net = ipam.allocate("default/pod-a", &[]).unwrap();
        assert_eq!(net.prefix_len(), 24);
        assert_eq!(ipam.allocate("default/pod-a", &[]).unwrap(), net);
        assert_eq!(ipam.get("default/pod-a").unwrap(), Some(net));

        ipam.release("default/pod-a", false).unwrap();
        ipam.release("default/pod-a", false).unwrap();
        assert_eq!(ipam.get("default/pod-a").unwrap(), None);
        ipam.pool().shutdown().await;
    }

    #[tokio::test]
    async fn works_sticky_release() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(MockFactory::new("10.0.0.0/24".parse().unwrap()));
        let ipam = backend(&dir, factory).await;
        ipam.pool().reconcile().await;
        ipam.pool().settle().await;

        let first = ipam.allocate("default/sticky", &[]).unwrap();
        ipam.release("default/sticky", true).unwrap();
        let item = ipam
            .pool()
            .items()
            .unwrap()
            .into_iter()
            .find(|item| item.resource.address() == first.addr())
            .unwrap();
        assert!(item.reserved_until.is_some());

        // another pod does not take the reserved address while others are idle
        let other = ipam.allocate("default/other", &[]).unwrap();
        assert_ne!(other, first);

        let again = ipam.allocate("default/sticky", &[]).unwrap();
        assert_eq!(again, first);
        ipam.pool().shutdown().await;
    }

    #[tokio::test]
    async fn works_sticky_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(MockFactory::new("10.0.0.0/24".parse().unwrap()));
        let ipam = backend(&dir, factory.clone()).await;
        ipam.pool().reconcile().await;
        ipam.pool().settle().await;

        let first = ipam.allocate("default/sticky", &[]).unwrap();
        ipam.release("default/sticky", true).unwrap();
        ipam.pool().shutdown().await;
        drop(ipam);

        let ipam = backend(&dir, factory).await;
        assert_eq!(ipam.allocate("default/sticky", &[]).unwrap(), first);
        ipam.pool().shutdown().await;
    }

    #[tokio::test]
    async fn works_sticky_owner_never_returns() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(MockFactory::new("10.0.0.0/24".parse().unwrap()));
        let ipam = backend_with(&dir, factory, Duration::from_millis(50)).await;
        ipam.pool().reconcile().await;
        ipam.pool().settle().await;

        for i in 0..2 {
            let owner = format!("default/sticky-{i}");
            ipam.allocate(&owner, &[]).unwrap();
            ipam.release(&owner, true).unwrap();
        }
        assert_eq!(
            ipam.pool()
                .items()
                .unwrap()
                .iter()
                .filter(|item| item.reserved_for.is_some())
                .count(),
            2
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        ipam.pool().reconcile().await;
        ipam.pool().settle().await;
        assert!(ipam
            .pool()
            .items()
            .unwrap()
            .iter()
            .all(|item| item.reserved_for.is_none()));
        ipam.pool().shutdown().await;
    }

    #[tokio::test]
    async fn works_requested_address() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(MockFactory::new("10.0.0.0/24".parse().unwrap()));
        let ipam = backend(&dir, factory).await;
        ipam.pool().reconcile().await;
        ipam.pool().settle().await;

        let idle: Vec<IpAddr> = ipam
            .pool()
            .items()
            .unwrap()
            .iter()
            .map(|item| item.resource.address())
            .collect();
        let wanted = idle[idle.len() - 1];
        let got = ipam.allocate("default/pod-a", &[wanted]).unwrap();
        assert_eq!(got.addr(), wanted);
        ipam.pool().shutdown().await;
    }
}
