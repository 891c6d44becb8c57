use std::{fmt, net::IpAddr};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Identity of a pooled unit. For an ENI this is its MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> UnitId {
        UnitId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub cidr: IpNet,
    pub gateway: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PooledUnit {
    pub id: UnitId,
    pub primary: IpAddr,
    pub secondaries: Vec<IpAddr>,
    pub security_groups: Vec<String>,
    pub subnet: Subnet,
}

/// Key of one assignable resource, `<unit>/<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(unit: &UnitId, address: &IpAddr) -> ResourceKey {
        ResourceKey(format!("{}/{}", unit, address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    EniIp { unit: UnitId, address: IpAddr },
}

impl Resource {
    pub fn key(&self) -> ResourceKey {
        match self {
            Resource::EniIp { unit, address } => ResourceKey::new(unit, address),
        }
    }

    pub fn unit(&self) -> &UnitId {
        match self {
            Resource::EniIp { unit, .. } => unit,
        }
    }

    pub fn address(&self) -> IpAddr {
        match self {
            Resource::EniIp { address, .. } => *address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    Idle,
    InUse { owner: String },
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolItem {
    pub resource: Resource,
    pub state: ItemState,
    pub last_validated: DateTime<Utc>,
    pub reserved_until: Option<DateTime<Utc>>,
    /// Owner the item is held for while `reserved_until` lies ahead.
    pub reserved_for: Option<String>,
}

impl PoolItem {
    pub(crate) fn idle(resource: Resource, validated: DateTime<Utc>) -> PoolItem {
        PoolItem {
            resource,
            state: ItemState::Idle,
            last_validated: validated,
            reserved_until: None,
            reserved_for: None,
        }
    }

    pub fn is_reserved(&self, now: DateTime<Utc>) -> bool {
        self.reserved_until.map_or(false, |until| until > now)
    }

    pub fn is_reserved_for(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.is_reserved(now) && self.reserved_for.as_deref() == Some(owner)
    }
}

/// Persisted `owner -> resource` binding.
///
/// With `reserved_until` set, the owner released the resource and it is only
/// held for the owner until then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub resource: Resource,
    pub bound_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_until: Option<DateTime<Utc>>,
}

impl Binding {
    pub fn is_held(&self) -> bool {
        self.reserved_until.is_some()
    }
}

/// What [`ResourcePool::allocate`](crate::pool::ResourcePool::allocate) hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub resource: Resource,
    pub subnet: Subnet,
}

impl Allocation {
    pub fn address(&self) -> IpAddr {
        self.resource.address()
    }

    /// The allocated address with the prefix length of its subnet.
    pub fn net(&self) -> Option<IpNet> {
        IpNet::new(self.address(), self.subnet.cidr.prefix_len()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn works_resource_key() {
        let res = Resource::EniIp {
            unit: UnitId::new("02:00:00:00:00:01"),
            address: IpAddr::from_str("10.0.0.5").unwrap(),
        };
        assert_eq!(res.key().as_str(), "02:00:00:00:00:01/10.0.0.5");
        assert_eq!(res.unit().as_str(), "02:00:00:00:00:01");
    }

    #[test]
    fn works_resource_serde() {
        let res = Resource::EniIp {
            unit: UnitId::new("eni-1"),
            address: IpAddr::from_str("10.0.0.5").unwrap(),
        };
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains("\"kind\":\"eni_ip\""));
        let back: Resource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, res);
    }

    #[test]
    fn works_reservation_window() {
        let now = Utc::now();
        let mut item = PoolItem::idle(
            Resource::EniIp {
                unit: UnitId::new("eni-1"),
                address: IpAddr::from_str("10.0.0.5").unwrap(),
            },
            now,
        );
        assert!(!item.is_reserved(now));
        item.reserved_until = Some(now + chrono::Duration::seconds(10));
        assert!(item.is_reserved(now));
        assert!(!item.is_reserved(now + chrono::Duration::seconds(11)));

        assert!(!item.is_reserved_for("sts-0", now));
        item.reserved_for = Some("sts-0".to_string());
        assert!(item.is_reserved_for("sts-0", now));
        assert!(!item.is_reserved_for("sts-1", now));
        assert!(!item.is_reserved_for("sts-0", now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn works_binding_serde_without_hold() {
        let binding = Binding {
            resource: Resource::EniIp {
                unit: UnitId::new("eni-1"),
                address: IpAddr::from_str("10.0.0.5").unwrap(),
            },
            bound_at: Utc::now(),
            reserved_until: None,
        };
        let json = serde_json::to_string(&binding).unwrap();
        assert!(!json.contains("reserved_until"));
        let back: Binding = serde_json::from_str(&json).unwrap();
        assert_eq!(back, binding);
        assert!(!back.is_held());
    }
}
