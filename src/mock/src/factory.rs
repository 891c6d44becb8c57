use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use ipnet::IpNet;
use podipam_pool::{FactoryError, PooledUnit, ResourceFactory, Subnet, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Dispose,
    List,
    Check,
    Assign,
    Unassign,
}

#[derive(Debug)]
struct MockState {
    subnet: Subnet,
    next_host: usize,
    next_unit: u32,
    max_ips_per_unit: usize,
    units: HashMap<UnitId, PooledUnit>,
    failing: HashSet<Op>,
    unhealthy: HashSet<UnitId>,
    calls: HashMap<Op, usize>,
    delay: Duration,
}

impl MockState {
    fn next_address(&mut self) -> Result<IpAddr, FactoryError> {
        let addr = self
            .subnet
            .cidr
            .hosts()
            .nth(self.next_host)
            .ok_or_else(|| FactoryError::Api(format!("subnet {} is exhausted", self.subnet.cidr)))?;
        self.next_host += 1;
        Ok(addr)
    }

    fn new_unit(&mut self, secondaries: usize) -> Result<PooledUnit, FactoryError> {
        self.next_unit += 1;
        let id = UnitId::new(format!(
            "02:00:00:00:{:02x}:{:02x}",
            (self.next_unit >> 8) & 0xff,
            self.next_unit & 0xff
        ));
        let primary = self.next_address()?;
        let secondaries = (0..secondaries)
            .map(|_| self.next_address())
            .collect::<Result<Vec<IpAddr>, FactoryError>>()?;
        let unit = PooledUnit {
            id: id.clone(),
            primary,
            secondaries,
            security_groups: vec!["sg-default".to_string()],
            subnet: self.subnet.clone(),
        };
        self.units.insert(id, unit.clone());
        Ok(unit)
    }
}

/// Cloud stand-in keeping every unit in memory.
///
/// Addresses are handed out sequentially from `cidr`. The first host is the
/// gateway.
#[derive(Debug)]
pub struct MockFactory {
    state: Mutex<MockState>,
}

impl MockFactory {
    pub fn new(cidr: IpNet) -> MockFactory {
        let gateway = cidr.hosts().next().unwrap_or_else(|| cidr.addr());
        MockFactory {
            state: Mutex::new(MockState {
                subnet: Subnet {
                    id: format!("subnet-{}", cidr.network()),
                    cidr,
                    gateway,
                },
                next_host: 1,
                next_unit: 0,
                max_ips_per_unit: 10,
                units: HashMap::new(),
                failing: HashSet::new(),
                unhealthy: HashSet::new(),
                calls: HashMap::new(),
                delay: Duration::ZERO,
            }),
        }
    }

    pub fn with_max_ips_per_unit(self, max: usize) -> MockFactory {
        self.lock().max_ips_per_unit = max;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a unit as if it existed before the pool started.
    pub fn attach(&self, secondaries: usize) -> Result<PooledUnit, FactoryError> {
        self.lock().new_unit(secondaries)
    }

    pub fn fail(&self, op: Op, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    pub fn set_unhealthy(&self, unit: &UnitId, unhealthy: bool) {
        let mut state = self.lock();
        if unhealthy {
            state.unhealthy.insert(unit.clone());
        } else {
            state.unhealthy.remove(unit);
        }
    }

    /// Every call sleeps for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn units(&self) -> Vec<PooledUnit> {
        let mut units: Vec<PooledUnit> = self.lock().units.values().cloned().collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    pub fn unit(&self, id: &UnitId) -> Option<PooledUnit> {
        self.lock().units.get(id).cloned()
    }

    async fn enter(&self, op: Op) -> Result<(), FactoryError> {
        let delay = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.lock().failing.contains(&op) {
            tracing::debug!(?op, "Inject failure");
            return Err(FactoryError::Api(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceFactory for MockFactory {
    async fn create(&self, count: usize) -> Result<Vec<PooledUnit>, FactoryError> {
        self.enter(Op::Create).await?;
        let mut state = self.lock();
        let mut units = Vec::new();
        let mut remaining = count;
        loop {
            let n = remaining.min(state.max_ips_per_unit);
            units.push(state.new_unit(n)?);
            remaining -= n;
            if remaining == 0 {
                break;
            }
        }
        Ok(units)
    }

    async fn dispose(&self, unit: &PooledUnit) -> Result<(), FactoryError> {
        self.enter(Op::Dispose).await?;
        self.lock()
            .units
            .remove(&unit.id)
            .map(|_| ())
            .ok_or_else(|| FactoryError::UnitNotFound(unit.id.clone()))
    }

    async fn list(&self) -> Result<HashMap<UnitId, PooledUnit>, FactoryError> {
        self.enter(Op::List).await?;
        Ok(self.lock().units.clone())
    }

    async fn check(&self, unit: &PooledUnit) -> Result<(), FactoryError> {
        self.enter(Op::Check).await?;
        let state = self.lock();
        if !state.units.contains_key(&unit.id) {
            return Err(FactoryError::UnitNotFound(unit.id.clone()));
        }
        if state.unhealthy.contains(&unit.id) {
            return Err(FactoryError::Unhealthy(
                unit.id.clone(),
                "link is down".to_string(),
            ));
        }
        Ok(())
    }

    async fn assign(&self, unit: &UnitId, count: usize) -> Result<Vec<IpAddr>, FactoryError> {
        self.enter(Op::Assign).await?;
        let mut state = self.lock();
        let max = state.max_ips_per_unit;
        let held = state
            .units
            .get(unit)
            .map(|u| u.secondaries.len())
            .ok_or_else(|| FactoryError::UnitNotFound(unit.clone()))?;
        let n = count.min(max.saturating_sub(held));
        let addrs = (0..n)
            .map(|_| state.next_address())
            .collect::<Result<Vec<IpAddr>, FactoryError>>()?;
        if let Some(u) = state.units.get_mut(unit) {
            u.secondaries.extend(addrs.iter().copied());
        }
        Ok(addrs)
    }

    async fn unassign(&self, unit: &UnitId, addrs: &[IpAddr]) -> Result<(), FactoryError> {
        self.enter(Op::Unassign).await?;
        let mut state = self.lock();
        let u = state
            .units
            .get_mut(unit)
            .ok_or_else(|| FactoryError::UnitNotFound(unit.clone()))?;
        u.secondaries.retain(|a| !addrs.contains(a));
        Ok(())
    }
}
