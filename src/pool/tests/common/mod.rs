use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ipnet::IpNet;
use podipam_mock::MockFactory;
use podipam_pool::{Authority, Binding, PoolConfig, PoolMetrics, ResourcePool, Standalone};
use podipam_store::{open_database, DiskStore, FnCodec, JsonCodec};
use redb::Database;
use tempfile::TempDir;

pub const POOL: &str = "eni";

pub fn config(min_idle: usize, max_idle: usize, capacity: usize) -> PoolConfig {
    PoolConfig {
        min_idle,
        max_idle,
        capacity,
        reconcile_interval: 1,
        jitter: 0.0,
        call_timeout: 5,
        ..Default::default()
    }
}

pub fn factory() -> Arc<MockFactory> {
    Arc::new(MockFactory::new(IpNet::from_str("10.0.0.0/24").unwrap()))
}

pub struct Env {
    // Keeps the database file alive for the duration of the test.
    pub dir: TempDir,
    pub db: Arc<Database>,
}

impl Env {
    pub fn new() -> Env {
        let dir = TempDir::new().unwrap();
        let db = open_database(dir.path().join("pool.redb")).unwrap();
        Env { dir, db }
    }

    pub fn store(&self) -> DiskStore<Binding> {
        DiskStore::new(self.db.clone(), POOL, JsonCodec).unwrap()
    }

    /// A store whose writes fail while `failing` is set.
    pub fn flaky_store(&self, failing: Arc<AtomicBool>) -> DiskStore<Binding> {
        let codec = FnCodec::new(
            move |binding: &Binding| -> Result<Vec<u8>, podipam_store::Error> {
                if failing.load(Ordering::SeqCst) {
                    return Err(podipam_store::Error::Codec(Box::new(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "injected",
                    ))));
                }
                serde_json::to_vec(binding).map_err(|e| podipam_store::Error::Codec(Box::new(e)))
            },
            |bytes: &[u8]| {
                serde_json::from_slice::<Binding>(bytes)
                    .map_err(|e| podipam_store::Error::Codec(Box::new(e)))
            },
        );
        DiskStore::new(self.db.clone(), POOL, codec).unwrap()
    }

    pub async fn pool(&self, config: PoolConfig, factory: Arc<MockFactory>) -> ResourcePool {
        self.pool_with(config, factory, Arc::new(Standalone), self.store())
            .await
    }

    pub async fn pool_with(
        &self,
        config: PoolConfig,
        factory: Arc<MockFactory>,
        authority: Arc<dyn Authority>,
        store: DiskStore<Binding>,
    ) -> ResourcePool {
        ResourcePool::new(
            POOL,
            config,
            factory,
            authority,
            store,
            PoolMetrics::new().unwrap(),
        )
        .await
        .unwrap()
    }
}
