use tokio::sync::watch;

/// Decides whether this node may perform cluster-mutating operations.
pub trait Authority: Send + Sync {
    fn is_authority(&self) -> bool;
}

/// Single node deployment. Always the authority.
#[derive(Debug, Default, Clone, Copy)]
pub struct Standalone;

impl Authority for Standalone {
    fn is_authority(&self) -> bool {
        true
    }
}

/// Authority held while an external lease manager publishes `true`.
#[derive(Debug, Clone)]
pub struct LeaseAuthority {
    rx: watch::Receiver<bool>,
}

impl LeaseAuthority {
    pub fn new(rx: watch::Receiver<bool>) -> LeaseAuthority {
        LeaseAuthority { rx }
    }
}

impl Authority for LeaseAuthority {
    fn is_authority(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn works_lease_authority() {
        let (tx, rx) = watch::channel(false);
        let authority = LeaseAuthority::new(rx);
        assert!(!authority.is_authority());
        tx.send(true).unwrap();
        assert!(authority.is_authority());
        tx.send(false).unwrap();
        assert!(!authority.is_authority());
        assert!(Standalone.is_authority());
    }
}
