use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use podipam_store::DiskStore;
use podipam_trace::error::TraceableError;
use rand::Rng;
use tokio::{
    sync::{mpsc, watch, Notify, Semaphore},
    task::JoinHandle,
    time::Instant,
};

use super::{
    authority::Authority,
    config::PoolConfig,
    error::{Error, FactoryError},
    factory::ResourceFactory,
    item::{Allocation, Binding, ItemState, PoolItem, PooledUnit, Resource, ResourceKey, UnitId},
    metrics::{PoolMetrics, PoolRecorder},
    queue::IdleQueue,
    worker::{
        spawn_create, spawn_unit_worker, with_timeout, BacklogRequest, CallContext,
        ProvisionResult,
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub invalid: usize,
    pub pending: usize,
    pub units: usize,
}

#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    until: Option<Instant>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            current: initial,
            until: None,
        }
    }

    fn fail(&mut self) -> Duration {
        let wait = self.current;
        self.until = Some(Instant::now() + wait);
        self.current = self.current.saturating_mul(2).min(self.max);
        wait
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.until = None;
    }

    fn active(&self) -> bool {
        self.until.map_or(false, |until| Instant::now() < until)
    }
}

struct UnitEntry {
    unit: PooledUnit,
    pending: usize,
    last_validated: DateTime<Utc>,
    backlog: Option<mpsc::Sender<BacklogRequest>>,
}

struct PoolState {
    units: HashMap<UnitId, UnitEntry>,
    items: HashMap<ResourceKey, PoolItem>,
    idle: IdleQueue,
    owners: HashMap<String, ResourceKey>,
    pending: usize,
    creating: bool,
    backoff: Backoff,
}

impl PoolState {
    fn new(backoff: Backoff) -> PoolState {
        PoolState {
            units: HashMap::new(),
            items: HashMap::new(),
            idle: IdleQueue::default(),
            owners: HashMap::new(),
            pending: 0,
            creating: false,
            backoff,
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            in_use: self.owners.len(),
            invalid: self
                .items
                .values()
                .filter(|item| item.state == ItemState::Invalid)
                .count(),
            pending: self.pending,
            units: self.units.len(),
        }
    }

    fn insert_idle(&mut self, unit: &UnitId, address: IpAddr, now: DateTime<Utc>) {
        let resource = Resource::EniIp {
            unit: unit.clone(),
            address,
        };
        let key = resource.key();
        if self.items.contains_key(&key) {
            return;
        }
        self.items.insert(key.clone(), PoolItem::idle(resource, now));
        self.idle.push(key, now);
    }

    fn add_secondary(&mut self, unit: &UnitId, address: IpAddr, now: DateTime<Utc>) -> bool {
        match self.units.get_mut(unit) {
            Some(entry) => {
                if !entry.unit.secondaries.contains(&address) {
                    entry.unit.secondaries.push(address);
                }
            }
            None => return false,
        }
        self.insert_idle(unit, address, now);
        true
    }

    /// Idle to InUse.
    fn bind(&mut self, owner: &str, key: &ResourceKey) -> bool {
        let Some(item) = self.items.get_mut(key) else {
            return false;
        };
        if item.state != ItemState::Idle {
            return false;
        }
        item.state = ItemState::InUse {
            owner: owner.to_string(),
        };
        item.reserved_until = None;
        item.reserved_for = None;
        self.idle.remove(key);
        self.owners.insert(owner.to_string(), key.clone());
        true
    }

    /// InUse to Idle. With `reserved_until`, the item stays held for `owner`.
    fn unbind(
        &mut self,
        owner: &str,
        reserved_until: Option<DateTime<Utc>>,
    ) -> Option<ResourceKey> {
        let key = self.owners.remove(owner)?;
        if let Some(item) = self.items.get_mut(&key) {
            item.state = ItemState::Idle;
            item.reserved_until = reserved_until;
            item.reserved_for = reserved_until.map(|_| owner.to_string());
            self.idle.push(key.clone(), item.last_validated);
        }
        Some(key)
    }

    /// Hold an idle item for `owner` until `until`.
    fn hold(&mut self, owner: &str, key: &ResourceKey, until: DateTime<Utc>) -> bool {
        match self.items.get_mut(key) {
            Some(item) if item.state == ItemState::Idle => {
                item.reserved_until = Some(until);
                item.reserved_for = Some(owner.to_string());
                true
            }
            _ => false,
        }
    }

    /// Idle item still held for `owner`.
    fn held_for(&self, owner: &str, now: DateTime<Utc>) -> Option<ResourceKey> {
        self.idle
            .newest_first()
            .find(|key| {
                self.items
                    .get(*key)
                    .map_or(false, |item| item.is_reserved_for(owner, now))
            })
            .cloned()
    }

    /// Forget every hold for `owner`.
    fn clear_holds(&mut self, owner: &str) {
        for item in self.items.values_mut() {
            if item.reserved_for.as_deref() == Some(owner) {
                item.reserved_until = None;
                item.reserved_for = None;
            }
        }
    }

    /// Idle to Invalid.
    fn invalidate(&mut self, key: &ResourceKey) {
        if let Some(item) = self.items.get_mut(key) {
            if item.state == ItemState::Idle {
                item.state = ItemState::Invalid;
                self.idle.remove(key);
            }
        }
    }

    fn pick_idle(&self, now: DateTime<Utc>) -> Option<ResourceKey> {
        self.idle
            .newest_first()
            .find(|key| {
                self.items
                    .get(*key)
                    .map_or(false, |item| !item.is_reserved(now))
            })
            .or_else(|| self.idle.newest_first().next())
            .cloned()
    }

    fn allocation(&self, key: &ResourceKey) -> Result<Allocation, Error> {
        let item = self
            .items
            .get(key)
            .ok_or_else(|| Error::InvalidState(format!("resource {key} is not in the pool")))?;
        let entry = self.units.get(item.resource.unit()).ok_or_else(|| {
            Error::InvalidState(format!("unit {} is not in the pool", item.resource.unit()))
        })?;
        Ok(Allocation {
            resource: item.resource.clone(),
            subnet: entry.unit.subnet.clone(),
        })
    }

    /// Idle items beyond `max_idle` or `capacity`, oldest validated first.
    /// Items inside a reservation window are only picked once no other idle item is left.
    fn surplus(&self, max_idle: usize, capacity: usize, now: DateTime<Utc>) -> Vec<ResourceKey> {
        let stats = self.stats();
        let over_idle = stats.idle.saturating_sub(max_idle);
        let over_capacity = (stats.idle + stats.in_use)
            .saturating_sub(capacity)
            .min(stats.idle);
        let excess = over_idle.max(over_capacity);
        if excess == 0 {
            return Vec::new();
        }
        let (held, free): (Vec<&ResourceKey>, Vec<&ResourceKey>) =
            self.idle.oldest_first().partition(|key| {
                self.items
                    .get(*key)
                    .map_or(false, |item| item.is_reserved(now))
            });
        free.into_iter()
            .chain(held)
            .take(excess)
            .cloned()
            .collect()
    }

    fn unit_items(&self, unit: &UnitId, state: &ItemState) -> Vec<ResourceKey> {
        self.items
            .iter()
            .filter(|(_, item)| item.resource.unit() == unit && &item.state == state)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn is_unit_empty(&self, unit: &UnitId) -> bool {
        let no_pending = self.units.get(unit).map_or(true, |entry| entry.pending == 0);
        no_pending && !self.items.values().any(|item| item.resource.unit() == unit)
    }
}

struct PoolInner {
    name: String,
    config: PoolConfig,
    authority: Arc<dyn Authority>,
    store: DiskStore<Binding>,
    state: Mutex<PoolState>,
    ctx: CallContext,
    results: tokio::sync::Mutex<mpsc::Receiver<ProvisionResult>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    recorder: PoolRecorder,
}

/// Warm pool of cloud-provisioned addresses.
///
/// Allocation and release are synchronous and only touch in-memory state
/// plus the binding store. Everything that talks to the cloud happens in
/// [`reconcile`](Self::reconcile) or in per-unit backlog workers.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl ResourcePool {
    /// Build a pool and recover its state from the factory and the binding store.
    #[tracing::instrument(skip_all, fields(pool = name))]
    pub async fn new(
        name: &str,
        config: PoolConfig,
        factory: Arc<dyn ResourceFactory>,
        authority: Arc<dyn Authority>,
        store: DiskStore<Binding>,
        metrics: PoolMetrics,
    ) -> Result<ResourcePool, Error> {
        config.validate()?;

        let (results_tx, results_rx) = mpsc::channel(config.result_capacity);
        let ctx = CallContext {
            factory,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            results: results_tx,
            notify: Arc::new(Notify::new()),
            timeout: config.call_timeout(),
        };

        let units = with_timeout(ctx.timeout, ctx.factory.list())
            .await
            .map_err(Error::Factory)?;

        let now = Utc::now();
        let mut state = PoolState::new(Backoff::new(
            config.backoff_initial(),
            config.backoff_max(),
        ));
        let mut tasks = Vec::new();
        for unit in units.into_values() {
            let (backlog, handle) =
                spawn_unit_worker(unit.id.clone(), ctx.clone(), config.backlog_capacity);
            tasks.push(handle);
            let id = unit.id.clone();
            let secondaries = unit.secondaries.clone();
            state.units.insert(
                id.clone(),
                UnitEntry {
                    unit,
                    pending: 0,
                    last_validated: now,
                    backlog: Some(backlog),
                },
            );
            for address in secondaries {
                state.insert_idle(&id, address, now);
            }
        }

        let mut bindings = store.entries().map_err(Error::Store)?;
        // live bindings win over holds on the same resource
        bindings.sort_by_key(|(_, binding)| binding.is_held());
        for (owner, binding) in bindings {
            let key = binding.resource.key();
            match binding.reserved_until {
                Some(until) if until > now && state.hold(&owner, &key, until) => {
                    tracing::info!(owner = %owner, resource = %key, "Recover reservation");
                }
                Some(_) => {
                    tracing::info!(owner = %owner, resource = %key, "Drop stale reservation");
                    store.delete(&owner).map_err(Error::Store)?;
                }
                None if state.bind(&owner, &key) => {
                    tracing::info!(owner = %owner, resource = %key, "Recover binding");
                }
                None => {
                    tracing::warn!(
                        owner = %owner,
                        resource = %key,
                        "Drop binding to a resource that no longer exists"
                    );
                    store.delete(&owner).map_err(Error::Store)?;
                }
            }
        }

        let stats = state.stats();
        tracing::info!(
            units = stats.units,
            idle = stats.idle,
            in_use = stats.in_use,
            "Pool is ready"
        );

        let (shutdown, _) = watch::channel(false);
        let pool = ResourcePool {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                recorder: PoolRecorder::new(metrics, name, &config),
                config,
                authority,
                store,
                state: Mutex::new(state),
                ctx,
                results: tokio::sync::Mutex::new(results_rx),
                tasks: Mutex::new(tasks),
                runner: Mutex::new(None),
                shutdown,
            }),
        };
        pool.record();
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn state(&self) -> Result<MutexGuard<'_, PoolState>, Error> {
        self.inner.state.lock().map_err(|_| Error::Lock)
    }

    pub fn allocate(&self, owner: &str) -> Result<Allocation, Error> {
        self.allocate_preferred(owner, None)
    }

    /// Allocate `prefer` if it is idle, then an item held for `owner`, otherwise the
    /// most recently validated idle item.
    #[tracing::instrument(skip_all, fields(pool = %self.inner.name, owner = %owner))]
    pub fn allocate_preferred(
        &self,
        owner: &str,
        prefer: Option<&ResourceKey>,
    ) -> Result<Allocation, Error> {
        let now = Utc::now();
        let allocation = {
            let mut state = self.state()?;
            if let Some(key) = state.owners.get(owner) {
                return state.allocation(key);
            }

            let chosen = prefer
                .filter(|key| state.idle.contains(key))
                .cloned()
                .or_else(|| state.held_for(owner, now));
            let key = match chosen {
                Some(key) => key,
                None => match state.pick_idle(now) {
                    Some(key) => key,
                    None => {
                        drop(state);
                        tracing::debug!("No idle resource, nudge provisioning");
                        self.inner.ctx.notify.notify_one();
                        return Err(Error::NoAvailableResource);
                    }
                },
            };
            let previous = state
                .items
                .get(&key)
                .map(|item| (item.reserved_until, item.reserved_for.clone()))
                .unwrap_or_default();
            state.clear_holds(owner);
            state.bind(owner, &key);
            match state.allocation(&key) {
                Ok(allocation) => (allocation, previous),
                Err(e) => {
                    state.unbind(owner, None);
                    return Err(e);
                }
            }
        };
        let (allocation, (held_until, held_for)) = allocation;

        let binding = Binding {
            resource: allocation.resource.clone(),
            bound_at: now,
            reserved_until: None,
        };
        if let Err(e) = self.inner.store.put(owner, binding) {
            tracing::error!(error = %e, "Failed to persist binding, roll back");
            let mut state = self.state()?;
            if let Some(key) = state.unbind(owner, None) {
                if let Some(item) = state.items.get_mut(&key) {
                    item.reserved_until = held_until;
                    item.reserved_for = held_for;
                }
            }
            return Err(Error::Store(e));
        }
        // the item was held for someone else, whose hold is gone now
        if let Some(other) = held_for.filter(|other| other != owner) {
            let state = self.state()?;
            if !state.owners.contains_key(&other) {
                if let Err(e) = self.inner.store.delete(&other) {
                    tracing::warn!(held_for = %other, error = %e, "Failed to drop reservation");
                }
            }
        }

        tracing::info!(
            resource = %allocation.resource.key(),
            address = %allocation.address(),
            "Allocate resource"
        );
        self.inner.ctx.notify.notify_one();
        self.record();
        Ok(allocation)
    }

    pub fn release(&self, owner: &str) -> Result<(), Error> {
        self.release_with_reservation(owner, Duration::ZERO)
    }

    /// Release the binding of `owner`.
    ///
    /// With a non-zero `reservation` the item is held for `owner`: it is evicted
    /// last, handed to `owner` first on its next allocation, and the hold is
    /// persisted so it survives a restart.
    #[tracing::instrument(skip_all, fields(pool = %self.inner.name, owner = %owner))]
    pub fn release_with_reservation(
        &self,
        owner: &str,
        reservation: Duration,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let resource = {
            let state = self.state()?;
            let key = state
                .owners
                .get(owner)
                .ok_or_else(|| Error::NotFound(owner.to_string()))?;
            state
                .items
                .get(key)
                .map(|item| item.resource.clone())
                .ok_or_else(|| Error::InvalidState(format!("resource {key} is not in the pool")))?
        };

        let reserved_until = if reservation.is_zero() {
            None
        } else {
            chrono::Duration::from_std(reservation)
                .ok()
                .and_then(|window| now.checked_add_signed(window))
        };
        match reserved_until {
            Some(until) => self.inner.store.put(
                owner,
                Binding {
                    resource,
                    bound_at: now,
                    reserved_until: Some(until),
                },
            ),
            None => self.inner.store.delete(owner),
        }
        .map_err(Error::Store)?;

        let key = self.state()?.unbind(owner, reserved_until);
        tracing::info!(resource = ?key.map(|k| k.to_string()), "Release resource");

        self.inner.ctx.notify.notify_one();
        self.record();
        Ok(())
    }

    pub fn get(&self, owner: &str) -> Result<Allocation, Error> {
        let state = self.state()?;
        let key = state
            .owners
            .get(owner)
            .ok_or_else(|| Error::NotFound(owner.to_string()))?;
        state.allocation(key)
    }

    pub fn stats(&self) -> Result<PoolStats, Error> {
        Ok(self.state()?.stats())
    }

    pub fn items(&self) -> Result<Vec<PoolItem>, Error> {
        Ok(self.state()?.items.values().cloned().collect())
    }

    /// Key of the item holding `address`, in any state.
    pub fn lookup(&self, address: IpAddr) -> Result<Option<ResourceKey>, Error> {
        Ok(self
            .state()?
            .items
            .iter()
            .find(|(_, item)| item.resource.address() == address)
            .map(|(key, _)| key.clone()))
    }

    /// Drop binding tombstones older than `grace`.
    pub fn purge_tombstones(&self, grace: Duration) -> Result<usize, Error> {
        self.inner.store.purge_tombstones(grace).map_err(Error::Store)
    }

    pub fn units(&self) -> Result<Vec<PooledUnit>, Error> {
        Ok(self
            .state()?
            .units
            .values()
            .map(|entry| entry.unit.clone())
            .collect())
    }

    /// Spawn the background reconcile loop. Calling this twice is a no-op.
    pub fn start(&self) -> Result<(), Error> {
        let mut runner = self.inner.runner.lock().map_err(|_| Error::Lock)?;
        if runner.is_some() {
            return Ok(());
        }
        let pool = self.clone();
        *runner = Some(tokio::spawn(async move { pool.run().await }));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(pool = %self.inner.name))]
    async fn run(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        tracing::info!("Start reconcile loop");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.reconcile().await;

            let wait = self.next_wait();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.inner.ctx.notify.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Stop reconcile loop");
    }

    fn next_wait(&self) -> Duration {
        let base = self.inner.config.reconcile_interval();
        let jitter = rand::thread_rng().gen_range(0.0..=self.inner.config.jitter);
        base.mul_f64(1.0 + jitter)
    }

    /// One reconcile tick.
    pub async fn reconcile(&self) {
        let _measure = self.inner.recorder.measure_reconcile();
        let mut results = self.inner.results.lock().await;
        while let Ok(res) = results.try_recv() {
            if let Err(e) = self.apply(res) {
                tracing::error!(
                    pool = %self.inner.name,
                    error = %e,
                    "Failed to apply provisioning result"
                );
            }
        }

        if let Err(e) = self.reconcile_steps().await {
            tracing::error!(pool = %self.inner.name, error = %e, "Failed to reconcile");
        }
        self.record();
    }

    async fn reconcile_steps(&self) -> Result<(), Error> {
        self.validate_units().await?;
        self.expire_reservations()?;
        self.evict()?;
        self.dispose_invalid().await?;
        self.provision()?;
        self.dispose_empty_units().await?;
        Ok(())
    }

    /// Wait until every in-flight provisioning request has reported back.
    pub async fn settle(&self) {
        let mut results = self.inner.results.lock().await;
        loop {
            match self.state().map(|state| state.pending) {
                Ok(pending) if pending > 0 => {}
                _ => break,
            }
            let Some(res) = results.recv().await else {
                break;
            };
            if let Err(e) = self.apply(res) {
                tracing::error!(
                    pool = %self.inner.name,
                    error = %e,
                    "Failed to apply provisioning result"
                );
            }
        }
        self.record();
    }

    /// Stop the reconcile loop, close every backlog and join all workers.
    #[tracing::instrument(skip_all, fields(pool = %self.inner.name))]
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let runner = self.inner.runner.lock().ok().and_then(|mut r| r.take());
        if let Some(runner) = runner {
            if let Err(e) = runner.await {
                tracing::error!(error = %e, "Reconcile loop panicked");
            }
        }

        if let Ok(mut state) = self.state() {
            for entry in state.units.values_mut() {
                entry.backlog = None;
            }
        }
        self.inner.ctx.permits.close();

        let handles = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        let count = handles.len();
        let join = futures::future::join_all(handles);
        tokio::pin!(join);

        let mut results = self.inner.results.lock().await;
        loop {
            tokio::select! {
                joined = &mut join => {
                    for res in joined {
                        if let Err(e) = res {
                            tracing::error!(error = %e, "Worker panicked");
                        }
                    }
                    break;
                }
                Some(res) = results.recv() => {
                    if let Err(e) = self.apply(res) {
                        tracing::error!(error = %e, "Failed to apply provisioning result");
                    }
                }
            }
        }
        while let Ok(res) = results.try_recv() {
            if let Err(e) = self.apply(res) {
                tracing::error!(error = %e, "Failed to apply provisioning result");
            }
        }
        self.record();
        tracing::info!(workers = count, "Pool is shut down");
    }

    fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn track(&self, handle: JoinHandle<()>) -> Result<(), Error> {
        let mut tasks = self.inner.tasks.lock().map_err(|_| Error::Lock)?;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(())
    }

    fn apply(&self, res: ProvisionResult) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state()?;
        match res {
            ProvisionResult::Assigned {
                unit,
                requested,
                result,
            } => {
                state.pending = state.pending.saturating_sub(requested);
                if let Some(entry) = state.units.get_mut(&unit) {
                    entry.pending = entry.pending.saturating_sub(requested);
                }
                match result {
                    Ok(addrs) => {
                        state.backoff.reset();
                        for address in addrs {
                            if !state.add_secondary(&unit, address, now) {
                                tracing::warn!(
                                    pool = %self.inner.name,
                                    unit = %unit,
                                    address = %address,
                                    "Assigned address belongs to an unknown unit"
                                );
                            }
                        }
                    }
                    Err(e) => self.cloud_failure(&mut state, "assign", Some(&unit), &e),
                }
            }
            ProvisionResult::Created { requested, result } => {
                state.pending = state.pending.saturating_sub(requested);
                state.creating = false;
                match result {
                    Ok(units) => {
                        state.backoff.reset();
                        for unit in units {
                            self.attach(&mut state, unit, now)?;
                        }
                    }
                    Err(e) => self.cloud_failure(&mut state, "create", None, &e),
                }
            }
        }
        Ok(())
    }

    fn attach(
        &self,
        state: &mut PoolState,
        unit: PooledUnit,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let backlog = if self.is_shutting_down() {
            None
        } else {
            let (backlog, handle) = spawn_unit_worker(
                unit.id.clone(),
                self.inner.ctx.clone(),
                self.inner.config.backlog_capacity,
            );
            self.track(handle)?;
            Some(backlog)
        };
        tracing::info!(
            pool = %self.inner.name,
            unit = %unit.id,
            secondaries = unit.secondaries.len(),
            "Attach unit"
        );
        let id = unit.id.clone();
        let secondaries = unit.secondaries.clone();
        state.units.insert(
            id.clone(),
            UnitEntry {
                unit,
                pending: 0,
                last_validated: now,
                backlog,
            },
        );
        for address in secondaries {
            state.insert_idle(&id, address, now);
        }
        Ok(())
    }

    fn cloud_failure(
        &self,
        state: &mut PoolState,
        op: &str,
        unit: Option<&UnitId>,
        e: &FactoryError,
    ) {
        self.inner.recorder.cloud_error(op, &e.metric_label());
        if matches!(e, FactoryError::Cancelled) {
            return;
        }
        let wait = state.backoff.fail();
        tracing::warn!(
            pool = %self.inner.name,
            unit = ?unit.map(|u| u.to_string()),
            op,
            error = %e,
            backoff = ?wait,
            "Provisioning failed"
        );
    }

    async fn validate_units(&self) -> Result<(), Error> {
        let now = Utc::now();
        let interval = self.inner.config.validate_interval();
        let stale: Vec<PooledUnit> = {
            let state = self.state()?;
            state
                .units
                .values()
                .filter(|entry| {
                    (now - entry.last_validated)
                        .to_std()
                        .map_or(false, |elapsed| elapsed >= interval)
                })
                .filter(|entry| !state.unit_items(&entry.unit.id, &ItemState::Idle).is_empty())
                .map(|entry| entry.unit.clone())
                .collect()
        };

        for unit in stale {
            let result =
                with_timeout(self.inner.ctx.timeout, self.inner.ctx.factory.check(&unit)).await;
            let mut state = self.state()?;
            let idle = state.unit_items(&unit.id, &ItemState::Idle);
            match result {
                Ok(()) => {
                    if let Some(entry) = state.units.get_mut(&unit.id) {
                        entry.last_validated = now;
                    }
                    for key in idle {
                        if let Some(item) = state.items.get_mut(&key) {
                            item.last_validated = now;
                        }
                        state.idle.push(key, now);
                    }
                }
                Err(FactoryError::UnitNotFound(_)) => {
                    self.inner.recorder.cloud_error("check", "unit_not_found");
                    self.forget_unit(&mut state, &unit.id, &idle);
                }
                Err(e) => {
                    self.inner.recorder.cloud_error("check", &e.metric_label());
                    tracing::warn!(
                        pool = %self.inner.name,
                        unit = %unit.id,
                        error = %e,
                        invalidated = idle.len(),
                        "Unit failed health check"
                    );
                    for key in idle {
                        state.invalidate(&key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop holds whose window has passed and persisted holds that no longer
    /// match a held item.
    fn expire_reservations(&self) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state()?;
        for item in state.items.values_mut() {
            if item.reserved_until.is_some() && !item.is_reserved(now) {
                item.reserved_until = None;
                item.reserved_for = None;
            }
        }

        // deleted under the lock, bound owners are never touched
        let stale: Vec<String> = self
            .inner
            .store
            .entries()
            .map_err(Error::Store)?
            .into_iter()
            .filter(|(owner, binding)| {
                binding.is_held()
                    && !state.owners.contains_key(owner)
                    && !state
                        .items
                        .get(&binding.resource.key())
                        .map_or(false, |item| item.is_reserved_for(owner, now))
            })
            .map(|(owner, _)| owner)
            .collect();
        for owner in stale.iter() {
            self.inner.store.delete(owner).map_err(Error::Store)?;
        }
        if !stale.is_empty() {
            tracing::info!(
                pool = %self.inner.name,
                expired = stale.len(),
                "Drop expired reservations"
            );
        }
        Ok(())
    }

    /// Drop the idle items of a unit that no longer exists in the cloud.
    /// The unit itself goes once nothing is bound to it, which also stops its worker.
    fn forget_unit(&self, state: &mut PoolState, unit: &UnitId, idle: &[ResourceKey]) {
        for key in idle {
            state.idle.remove(key);
            state.items.remove(key);
        }
        let bound = state
            .items
            .values()
            .filter(|item| item.resource.unit() == unit)
            .count();
        if bound == 0 {
            state.units.remove(unit);
        } else if let Some(entry) = state.units.get_mut(unit) {
            entry.backlog = None;
        }
        tracing::warn!(
            pool = %self.inner.name,
            unit = %unit,
            dropped = idle.len(),
            bound,
            "Unit is gone, forget it"
        );
    }

    fn evict(&self) -> Result<(), Error> {
        let mut state = self.state()?;
        let victims = state.surplus(
            self.inner.config.max_idle,
            self.inner.config.capacity,
            Utc::now(),
        );
        if victims.is_empty() {
            return Ok(());
        }
        for key in victims.iter() {
            state.invalidate(key);
        }
        tracing::info!(
            pool = %self.inner.name,
            evicted = victims.len(),
            "Evict surplus idle resources"
        );
        Ok(())
    }

    async fn dispose_invalid(&self) -> Result<(), Error> {
        let batches: BTreeMap<UnitId, Vec<(ResourceKey, IpAddr)>> = {
            let state = self.state()?;
            let mut batches: BTreeMap<UnitId, Vec<(ResourceKey, IpAddr)>> = BTreeMap::new();
            for (key, item) in state.items.iter() {
                if item.state == ItemState::Invalid {
                    batches
                        .entry(item.resource.unit().clone())
                        .or_default()
                        .push((key.clone(), item.resource.address()));
                }
            }
            batches
        };

        for (unit, entries) in batches {
            let addrs: Vec<IpAddr> = entries.iter().map(|(_, addr)| *addr).collect();
            let result = with_timeout(
                self.inner.ctx.timeout,
                self.inner.ctx.factory.unassign(&unit, &addrs),
            )
            .await;
            match result {
                Ok(()) => {
                    let mut state = self.state()?;
                    for (key, _) in entries.iter() {
                        state.items.remove(key);
                    }
                    if let Some(entry) = state.units.get_mut(&unit) {
                        entry.unit.secondaries.retain(|addr| !addrs.contains(addr));
                    }
                    self.inner.recorder.disposed(addrs.len());
                    tracing::info!(
                        pool = %self.inner.name,
                        unit = %unit,
                        count = addrs.len(),
                        "Dispose invalid resources"
                    );
                }
                Err(FactoryError::UnitNotFound(_)) => {
                    let mut state = self.state()?;
                    for (key, _) in entries.iter() {
                        state.items.remove(key);
                    }
                    let idle = state.unit_items(&unit, &ItemState::Idle);
                    self.forget_unit(&mut state, &unit, &idle);
                }
                Err(e) => {
                    self.inner.recorder.cloud_error("unassign", &e.metric_label());
                    tracing::warn!(
                        pool = %self.inner.name,
                        unit = %unit,
                        error = %e,
                        "Failed to dispose invalid resources, retry on the next tick"
                    );
                }
            }
        }
        Ok(())
    }

    fn provision(&self) -> Result<(), Error> {
        let config = &self.inner.config;
        let mut guard = self.state()?;
        let state = &mut *guard;
        if state.backoff.active() {
            tracing::debug!(pool = %self.inner.name, "Provisioning is backing off");
            return Ok(());
        }

        let stats = state.stats();
        let mut want = config
            .min_idle
            .saturating_sub(stats.idle + state.pending)
            .min(
                config
                    .capacity
                    .saturating_sub(stats.idle + stats.in_use + state.pending),
            );
        if want == 0 {
            return Ok(());
        }

        let mut entries: Vec<&mut UnitEntry> = state
            .units
            .values_mut()
            .filter(|entry| entry.backlog.is_some())
            .collect();
        entries.sort_by(|a, b| a.unit.id.cmp(&b.unit.id));
        let mut enqueued = 0;
        for entry in entries {
            if want == 0 {
                break;
            }
            let room = config
                .max_ips_per_unit
                .saturating_sub(entry.unit.secondaries.len() + entry.pending);
            let count = room.min(want);
            if count == 0 {
                continue;
            }
            let Some(backlog) = entry.backlog.as_ref() else {
                continue;
            };
            match backlog.try_send(BacklogRequest { count }) {
                Ok(()) => {
                    entry.pending += count;
                    want -= count;
                    enqueued += count;
                    tracing::debug!(
                        pool = %self.inner.name,
                        unit = %entry.unit.id,
                        count,
                        "Enqueue provisioning"
                    );
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        pool = %self.inner.name,
                        unit = %entry.unit.id,
                        "Backlog is full"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!(
                        pool = %self.inner.name,
                        unit = %entry.unit.id,
                        "Backlog worker is gone"
                    );
                }
            }
        }
        state.pending += enqueued;

        if want == 0 {
            return Ok(());
        }
        if !self.inner.authority.is_authority() {
            tracing::debug!(
                pool = %self.inner.name,
                want,
                "Not the authority, skip creating a unit"
            );
            return Ok(());
        }
        if state.creating {
            return Ok(());
        }
        if state.units.len() >= config.max_units {
            tracing::debug!(
                pool = %self.inner.name,
                units = state.units.len(),
                "Unit limit reached"
            );
            return Ok(());
        }

        let count = want.min(config.max_ips_per_unit);
        state.creating = true;
        state.pending += count;
        drop(guard);
        tracing::info!(pool = %self.inner.name, count, "Create a unit");
        self.track(spawn_create(self.inner.ctx.clone(), count))
    }

    async fn dispose_empty_units(&self) -> Result<(), Error> {
        if !self.inner.authority.is_authority() {
            return Ok(());
        }
        let empty: Vec<PooledUnit> = {
            let state = self.state()?;
            state
                .units
                .values()
                .filter(|entry| state.is_unit_empty(&entry.unit.id))
                .map(|entry| entry.unit.clone())
                .collect()
        };

        for unit in empty {
            let result = with_timeout(
                self.inner.ctx.timeout,
                self.inner.ctx.factory.dispose(&unit),
            )
            .await;
            match result {
                Ok(()) | Err(FactoryError::UnitNotFound(_)) => {
                    let mut state = self.state()?;
                    if state.is_unit_empty(&unit.id) {
                        state.units.remove(&unit.id);
                    }
                    tracing::info!(pool = %self.inner.name, unit = %unit.id, "Dispose empty unit");
                }
                Err(e) => {
                    self.inner.recorder.cloud_error("dispose", &e.metric_label());
                    tracing::warn!(
                        pool = %self.inner.name,
                        unit = %unit.id,
                        error = %e,
                        "Failed to dispose empty unit"
                    );
                }
            }
        }
        Ok(())
    }

    fn record(&self) {
        if let Ok(state) = self.state() {
            let stats = state.stats();
            self.inner.recorder.set_sizes(
                stats.idle,
                stats.idle + stats.in_use + stats.invalid,
                stats.pending,
            );
        }
    }
}
