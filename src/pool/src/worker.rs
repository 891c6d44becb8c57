use std::{future::Future, net::IpAddr, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Notify, Semaphore},
    task::JoinHandle,
};

use super::{
    error::FactoryError,
    factory::ResourceFactory,
    item::{PooledUnit, UnitId},
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct BacklogRequest {
    pub(crate) count: usize,
}

/// Outcome of a provisioning call, applied by the reconciler.
#[derive(Debug)]
pub(crate) enum ProvisionResult {
    Assigned {
        unit: UnitId,
        requested: usize,
        result: Result<Vec<IpAddr>, FactoryError>,
    },
    Created {
        requested: usize,
        result: Result<Vec<PooledUnit>, FactoryError>,
    },
}

/// Shared handles every background call needs.
#[derive(Clone)]
pub(crate) struct CallContext {
    pub(crate) factory: Arc<dyn ResourceFactory>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) results: mpsc::Sender<ProvisionResult>,
    pub(crate) notify: Arc<Notify>,
    pub(crate) timeout: Duration,
}

impl CallContext {
    async fn publish(&self, result: ProvisionResult) -> bool {
        if self.results.send(result).await.is_err() {
            return false;
        }
        self.notify.notify_one();
        true
    }
}

pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, FactoryError>
where
    F: Future<Output = Result<T, FactoryError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(FactoryError::Timeout(timeout)),
    }
}

/// Spawn the backlog worker of `unit`. It runs until the returned sender is dropped.
pub(crate) fn spawn_unit_worker(
    unit: UnitId,
    ctx: CallContext,
    capacity: usize,
) -> (mpsc::Sender<BacklogRequest>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(run_unit_worker(unit, ctx, rx));
    (tx, handle)
}

#[tracing::instrument(skip_all, fields(unit = %unit))]
async fn run_unit_worker(
    unit: UnitId,
    ctx: CallContext,
    mut backlog: mpsc::Receiver<BacklogRequest>,
) {
    tracing::debug!("Start backlog worker");
    while let Some(req) = backlog.recv().await {
        let mut count = req.count;
        while let Ok(more) = backlog.try_recv() {
            count += more.count;
        }

        let result = match ctx.permits.acquire().await {
            Ok(_permit) => with_timeout(ctx.timeout, ctx.factory.assign(&unit, count)).await,
            Err(_) => Err(FactoryError::Cancelled),
        };
        match &result {
            Ok(addrs) => tracing::info!(
                requested = count,
                assigned = addrs.len(),
                "Assigned secondary addresses"
            ),
            Err(e) => tracing::warn!(
                requested = count,
                error = %e,
                "Failed to assign secondary addresses"
            ),
        }

        let published = ctx
            .publish(ProvisionResult::Assigned {
                unit: unit.clone(),
                requested: count,
                result,
            })
            .await;
        if !published {
            break;
        }
    }
    tracing::debug!("Stop backlog worker");
}

/// Spawn a one-shot task creating new unit(s) for `count` addresses.
pub(crate) fn spawn_create(ctx: CallContext, count: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = match ctx.permits.acquire().await {
            Ok(_permit) => with_timeout(ctx.timeout, ctx.factory.create(count)).await,
            Err(_) => Err(FactoryError::Cancelled),
        };
        match &result {
            Ok(units) => tracing::info!(requested = count, units = units.len(), "Created units"),
            Err(e) => tracing::warn!(requested = count, error = %e, "Failed to create units"),
        }
        ctx.publish(ProvisionResult::Created {
            requested: count,
            result,
        })
        .await;
    })
}
