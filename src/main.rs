pub(crate) mod cmd;

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use cmd::{Cmd, Output, SubCmd};
use podipam_agent::{
    gc::GarbageCollector, ipam::Backend, Backends, Config, Ipam, PodInfo,
};
use podipam_trace::init::prepare_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = Cmd::parse();

    let mut config = match command.file.as_ref() {
        Some(file) => Config::load(file).with_context(|| format!("failed to load {file}"))?,
        None => Config::default(),
    };
    prepare_tracing(config.trace.clone())?;

    // Pooled networks need a cloud resource factory, which only an embedding agent provides.
    config.networks.retain(|network| {
        if network.pool.is_some() {
            tracing::warn!(network = network.name, "Skip pooled network");
            return false;
        }
        true
    });

    let ipam = Arc::new(Ipam::new(&config, Backends::default()).await?);

    match command.sub {
        SubCmd::Allocate {
            network,
            container_id,
            if_name,
            args,
        } => {
            let pod = parse_pod(args)?;
            let address = ipam.allocate(&network, &container_id, &if_name, pod.as_ref())?;
            match command.output {
                Output::Plain => println!("{address}"),
                Output::Json => println!(
                    "{}",
                    serde_json::json!({ "network": network, "address": address.to_string() })
                ),
            }
        }
        SubCmd::Release {
            network,
            container_id,
            if_name,
            args,
        } => {
            let pod = parse_pod(args)?;
            let released = ipam.release(&network, &container_id, &if_name, pod.as_ref())?;
            match command.output {
                Output::Plain => {
                    for address in released.iter() {
                        println!("{address}");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string(&released)?),
            }
        }
        SubCmd::List { network } => {
            let Backend::Range(range) = ipam.network(&network)?.backend() else {
                return Err(anyhow!("{network} is not a range network"));
            };
            let reservations = range.reservations()?;
            match command.output {
                Output::Plain => {
                    for r in reservations.iter() {
                        println!("{}\t{}\t{}", r.address, r.owner, r.interface);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&reservations)?),
            }
        }
        SubCmd::Gc => {
            let gc = GarbageCollector::new(
                config.gc_interval(),
                config.tombstone_grace(),
                ipam.clone(),
            );
            let purged = gc.collect();
            match command.output {
                Output::Plain => println!("purged {purged} tombstones"),
                Output::Json => println!("{}", serde_json::json!({ "purged": purged })),
            }
        }
        SubCmd::Run => {
            ipam.start()?;
            let mut gc = GarbageCollector::new(
                config.gc_interval(),
                config.tombstone_grace(),
                ipam.clone(),
            );
            tracing::info!("Start garbage collector");
            tokio::select! {
                _ = gc.run() => {}
                res = tokio::signal::ctrl_c() => res?,
            }
            tracing::info!("Shutting down");
            ipam.shutdown().await;
        }
    }
    Ok(())
}

fn parse_pod(args: Option<String>) -> anyhow::Result<Option<PodInfo>> {
    args.map(|args| args.parse::<PodInfo>())
        .transpose()
        .map_err(anyhow::Error::from)
}
