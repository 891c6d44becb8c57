use std::{collections::HashMap, net::IpAddr, path::Path, sync::Arc, time::Duration};

use ipnet::IpNet;
use podipam_pool::{Authority, PoolMetrics, ResourceFactory, Standalone};
use podipam_store::open_database;
use podipam_trace::error::TraceableError;
use prometheus::Registry;

use super::{
    config::Config,
    error::{ConfigError, Error},
    metrics::AgentMetrics,
    pod::PodInfo,
    pooled::PooledIpam,
    range::RangeIpam,
};

pub enum Backend {
    Range(RangeIpam),
    Pooled(PooledIpam),
}

pub struct NetworkContext {
    name: String,
    backend: Backend,
}

impl NetworkContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    fn allocate(
        &self,
        container_id: &str,
        if_name: &str,
        pod: Option<&PodInfo>,
    ) -> Result<IpNet, Error> {
        let requested = pod.map(|p| p.ips.as_slice()).unwrap_or(&[]);
        match &self.backend {
            Backend::Range(range) => range.allocate(container_id, if_name, requested),
            Backend::Pooled(pooled) => pooled.allocate(&pool_owner(container_id, pod), requested),
        }
    }

    fn release(
        &self,
        container_id: &str,
        if_name: &str,
        pod: Option<&PodInfo>,
    ) -> Result<Vec<IpAddr>, Error> {
        match &self.backend {
            Backend::Range(range) => range.release(container_id, if_name),
            Backend::Pooled(pooled) => {
                let owner = pool_owner(container_id, pod);
                let held = pooled.get(&owner)?;
                let sticky = pod.map_or(false, |p| p.sticky || p.sandbox_exited);
                pooled.release(&owner, sticky)?;
                Ok(held.map(|net| vec![net.addr()]).unwrap_or_default())
            }
        }
    }

    fn get(
        &self,
        container_id: &str,
        if_name: &str,
        pod: Option<&PodInfo>,
    ) -> Result<Option<IpNet>, Error> {
        match &self.backend {
            Backend::Range(range) => range.get(container_id, if_name),
            Backend::Pooled(pooled) => pooled.get(&pool_owner(container_id, pod)),
        }
    }

    pub fn purge_tombstones(&self, grace: Duration) -> Result<usize, Error> {
        match &self.backend {
            Backend::Range(range) => range.purge_tombstones(grace),
            Backend::Pooled(pooled) => pooled.purge_tombstones(grace),
        }
    }
}

// Pool bindings outlive sandboxes, so they are keyed by pod rather than container.
fn pool_owner(container_id: &str, pod: Option<&PodInfo>) -> String {
    pod.map(|p| p.key())
        .unwrap_or_else(|| container_id.to_string())
}

/// Collaborators injected into [`Ipam`].
pub struct Backends {
    /// Resource factory per pooled network name.
    pub factories: HashMap<String, Arc<dyn ResourceFactory>>,
    pub authority: Arc<dyn Authority>,
    pub registry: Option<Registry>,
}

impl Default for Backends {
    fn default() -> Self {
        Backends {
            factories: HashMap::new(),
            authority: Arc::new(Standalone),
            registry: None,
        }
    }
}

pub struct Ipam {
    networks: HashMap<String, NetworkContext>,
    metrics: AgentMetrics,
}

impl Ipam {
    #[tracing::instrument(skip_all)]
    pub async fn new(config: &Config, backends: Backends) -> Result<Ipam, Error> {
        config.validate()?;

        if let Some(parent) = Path::new(&config.data_path).parent() {
            std::fs::create_dir_all(parent).map_err(Error::StdIo)?;
        }
        let db = open_database(&config.data_path).map_err(Error::Store)?;

        let mut metrics = AgentMetrics::new().map_err(Error::Metrics)?;
        let mut pool_metrics = PoolMetrics::new().map_err(Error::Metrics)?;
        if let Some(registry) = backends.registry.as_ref() {
            metrics = metrics.register(registry).map_err(Error::Metrics)?;
            pool_metrics = pool_metrics.register(registry).map_err(Error::Metrics)?;
        }

        let mut networks = HashMap::new();
        for network in config.networks.iter() {
            let backend = match (&network.range, &network.pool) {
                (Some(range), None) => {
                    Backend::Range(RangeIpam::new(db.clone(), &network.name, range)?)
                }
                (None, Some(pool)) => {
                    let factory = backends.factories.get(&network.name).ok_or_else(|| {
                        Error::Config(ConfigError::MissingFactory(network.name.clone()))
                    })?;
                    Backend::Pooled(
                        PooledIpam::new(
                            db.clone(),
                            &network.name,
                            pool.clone(),
                            network.sticky_window(),
                            factory.clone(),
                            backends.authority.clone(),
                            pool_metrics.clone(),
                        )
                        .await?,
                    )
                }
                _ => return Err(Error::Config(ConfigError::Backend(network.name.clone()))),
            };
            tracing::info!(network = network.name, "Network is ready");
            networks.insert(
                network.name.clone(),
                NetworkContext {
                    name: network.name.clone(),
                    backend,
                },
            );
        }

        Ok(Ipam { networks, metrics })
    }

    pub fn network(&self, name: &str) -> Result<&NetworkContext, Error> {
        self.networks
            .get(name)
            .ok_or_else(|| Error::NetworkNotFound(name.to_string()))
    }

    pub fn networks(&self) -> impl Iterator<Item = &NetworkContext> {
        self.networks.values()
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    #[tracing::instrument(
        skip_all,
        fields(network = %network, container_id = %container_id, if_name = %if_name)
    )]
    pub fn allocate(
        &self,
        network: &str,
        container_id: &str,
        if_name: &str,
        pod: Option<&PodInfo>,
    ) -> Result<IpNet, Error> {
        self.metrics.ipam_call("allocate", network);
        let res = self
            .network(network)
            .and_then(|ctx| ctx.allocate(container_id, if_name, pod));
        match &res {
            Ok(address) => tracing::info!(address = %address, "Allocate address"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to allocate address");
                self.metrics
                    .ipam_error("allocate", network, &e.metric_label());
            }
        }
        res
    }

    /// Release whatever the container holds on the network. Releasing twice is not an error.
    #[tracing::instrument(
        skip_all,
        fields(network = %network, container_id = %container_id, if_name = %if_name)
    )]
    pub fn release(
        &self,
        network: &str,
        container_id: &str,
        if_name: &str,
        pod: Option<&PodInfo>,
    ) -> Result<Vec<IpAddr>, Error> {
        self.metrics.ipam_call("release", network);
        let res = self
            .network(network)
            .and_then(|ctx| ctx.release(container_id, if_name, pod));
        match &res {
            Ok(released) if released.is_empty() => tracing::debug!("Nothing to release"),
            Ok(released) => tracing::info!(addresses = ?released, "Release addresses"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to release address");
                self.metrics
                    .ipam_error("release", network, &e.metric_label());
            }
        }
        res
    }

    pub fn get(
        &self,
        network: &str,
        container_id: &str,
        if_name: &str,
        pod: Option<&PodInfo>,
    ) -> Result<Option<IpNet>, Error> {
        self.network(network)?.get(container_id, if_name, pod)
    }

    /// Start the reconcile loop of every pooled network.
    pub fn start(&self) -> Result<(), Error> {
        for ctx in self.networks.values() {
            if let Backend::Pooled(pooled) = &ctx.backend {
                pooled.pool().start().map_err(Error::Pool)?;
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        for ctx in self.networks.values() {
            if let Backend::Pooled(pooled) = &ctx.backend {
                pooled.pool().shutdown().await;
            }
        }
    }
}
