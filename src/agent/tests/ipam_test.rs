use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use ipnet::IpNet;
use podipam_agent::{
    config::NetworkConfig, error::ConfigError, ipam::Backend, Backends, Config, Error, Ipam,
    PodInfo,
};
use podipam_ipam::range::Range;
use podipam_mock::MockFactory;
use podipam_pool::{PoolConfig, ResourceFactory};
use tempfile::TempDir;

fn range_network(name: &str, subnet: &str) -> NetworkConfig {
    NetworkConfig {
        name: name.to_string(),
        range: Some(Range::new(IpNet::from_str(subnet).unwrap())),
        pool: None,
        sticky_window: 0,
    }
}

fn pool_network(name: &str) -> NetworkConfig {
    NetworkConfig {
        name: name.to_string(),
        range: None,
        pool: Some(PoolConfig {
            min_idle: 2,
            max_idle: 4,
            capacity: 6,
            jitter: 0.0,
            ..Default::default()
        }),
        sticky_window: 60,
    }
}

fn config(dir: &TempDir, networks: Vec<NetworkConfig>) -> Config {
    Config {
        data_path: dir
            .path()
            .join("state/ipam.redb")
            .to_str()
            .unwrap()
            .to_string(),
        networks,
        ..Default::default()
    }
}

fn pod(name: &str) -> PodInfo {
    PodInfo {
        container_id: format!("{name}-sandbox"),
        namespace: "default".to_string(),
        name: name.to_string(),
        ..Default::default()
    }
}

fn addr(s: &str) -> IpAddr {
    IpAddr::from_str(s).unwrap()
}

#[tokio::test]
async fn works_range_network() {
    let dir = TempDir::new().unwrap();
    let ipam = Ipam::new(
        &config(&dir, vec![range_network("static", "10.0.0.0/30")]),
        Backends::default(),
    )
    .await
    .unwrap();

    let a = ipam.allocate("static", "A", "eth0", None).unwrap();
    assert_eq!(a.addr(), addr("10.0.0.1"));
    let b = ipam.allocate("static", "B", "eth0", None).unwrap();
    assert_eq!(b.addr(), addr("10.0.0.2"));
    assert!(matches!(
        ipam.allocate("static", "C", "eth0", None),
        Err(Error::Ipam(_))
    ));

    assert_eq!(
        ipam.release("static", "A", "eth0", None).unwrap(),
        vec![addr("10.0.0.1")]
    );
    assert!(ipam.release("static", "A", "eth0", None).unwrap().is_empty());
    let d = ipam.allocate("static", "D", "eth0", None).unwrap();
    assert_eq!(d.addr(), addr("10.0.0.1"));
    assert_eq!(ipam.get("static", "D", "eth0", None).unwrap(), Some(d));
}

#[tokio::test]
async fn fails_unknown_network() {
    let dir = TempDir::new().unwrap();
    let ipam = Ipam::new(&config(&dir, vec![]), Backends::default())
        .await
        .unwrap();
    assert!(matches!(
        ipam.allocate("missing", "c1", "eth0", None),
        Err(Error::NetworkNotFound(_))
    ));
}

#[tokio::test]
async fn fails_pool_without_factory() {
    let dir = TempDir::new().unwrap();
    let res = Ipam::new(&config(&dir, vec![pool_network("eni")]), Backends::default()).await;
    assert!(matches!(
        res,
        Err(Error::Config(ConfigError::MissingFactory(_)))
    ));
}

#[tokio::test]
async fn works_persist_across_restart() {
    let dir = TempDir::new().unwrap();
    let conf = config(&dir, vec![range_network("static", "10.0.0.0/29")]);
    let first = {
        let ipam = Ipam::new(&conf, Backends::default()).await.unwrap();
        ipam.allocate("static", "c1", "eth0", None).unwrap()
    };

    let ipam = Ipam::new(&conf, Backends::default()).await.unwrap();
    assert_eq!(ipam.get("static", "c1", "eth0", None).unwrap(), Some(first));
    let second = ipam.allocate("static", "c2", "eth0", None).unwrap();
    assert_ne!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn works_concurrent_allocations_unique() {
    let dir = TempDir::new().unwrap();
    let ipam = Arc::new(
        Ipam::new(
            &config(&dir, vec![range_network("static", "10.0.0.0/24")]),
            Backends::default(),
        )
        .await
        .unwrap(),
    );

    let handles: Vec<_> = (0..10)
        .map(|t| {
            let ipam = ipam.clone();
            tokio::task::spawn_blocking(move || {
                (0..10)
                    .map(|i| {
                        ipam.allocate("static", &format!("c-{t}-{i}"), "eth0", None)
                            .unwrap()
                    })
                    .collect::<Vec<IpNet>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for net in handle.await.unwrap() {
            assert!(seen.insert(net.addr()), "{net} allocated twice");
        }
    }
    assert_eq!(seen.len(), 100);
}

#[tokio::test]
async fn works_pooled_network() {
    let dir = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory::new("10.1.0.0/24".parse().unwrap()));
    let mut factories: HashMap<String, Arc<dyn ResourceFactory>> = HashMap::new();
    factories.insert("eni".to_string(), factory.clone());
    let ipam = Ipam::new(
        &config(
            &dir,
            vec![range_network("static", "10.0.0.0/24"), pool_network("eni")],
        ),
        Backends {
            factories,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let Backend::Pooled(pooled) = ipam.network("eni").unwrap().backend() else {
        panic!("eni must be pooled");
    };
    pooled.pool().reconcile().await;
    pooled.pool().settle().await;

    let mut sticky = pod("sticky");
    sticky.sticky = true;
    let first = ipam.allocate("eni", "sandbox-1", "eth0", Some(&sticky)).unwrap();
    assert_eq!(first.prefix_len(), 24);
    // the same pod on a new sandbox keeps its binding
    assert_eq!(
        ipam.allocate("eni", "sandbox-2", "eth0", Some(&sticky)).unwrap(),
        first
    );

    assert_eq!(
        ipam.release("eni", "sandbox-2", "eth0", Some(&sticky)).unwrap(),
        vec![first.addr()]
    );
    let other = ipam.allocate("eni", "other", "eth0", Some(&pod("other"))).unwrap();
    assert_ne!(other, first);
    assert_eq!(
        ipam.allocate("eni", "sandbox-3", "eth0", Some(&sticky)).unwrap(),
        first
    );

    // a pod whose sandbox exited keeps its address held too
    pooled.pool().reconcile().await;
    pooled.pool().settle().await;
    let mut exited = pod("exited");
    exited.sandbox_exited = true;
    let kept = ipam.allocate("eni", "sandbox-4", "eth0", Some(&exited)).unwrap();
    ipam.release("eni", "sandbox-4", "eth0", Some(&exited)).unwrap();
    let held = pooled
        .pool()
        .items()
        .unwrap()
        .into_iter()
        .find(|item| item.reserved_for.as_deref() == Some("default/exited"))
        .unwrap();
    assert_eq!(held.resource.address(), kept.addr());

    ipam.shutdown().await;
}

#[tokio::test]
async fn works_gc_purges_tombstones() {
    let dir = TempDir::new().unwrap();
    let ipam = Arc::new(
        Ipam::new(
            &config(&dir, vec![range_network("static", "10.0.0.0/24")]),
            Backends::default(),
        )
        .await
        .unwrap(),
    );
    for id in ["c1", "c2"] {
        ipam.allocate("static", id, "eth0", None).unwrap();
        ipam.release("static", id, "eth0", None).unwrap();
    }

    let gc = podipam_agent::gc::GarbageCollector::new(
        Duration::from_secs(60),
        Duration::from_secs(3600),
        ipam.clone(),
    );
    assert_eq!(gc.collect(), 0);

    let gc = podipam_agent::gc::GarbageCollector::new(
        Duration::from_secs(60),
        Duration::ZERO,
        ipam.clone(),
    );
    assert_eq!(gc.collect(), 2);
    assert_eq!(gc.collect(), 0);
}
