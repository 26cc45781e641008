//! Network address reservations held by VMs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{NetworkKind, ProviderError, VmSpec};
use crate::types::VmCid;

/// Tracks which VM holds each address. An address is released only once the
/// holding VM's deletion has been confirmed.
#[derive(Clone, Debug, Default)]
pub struct ReservationLedger {
    held: Arc<Mutex<HashMap<IpAddr, VmCid>>>,
}

impl ReservationLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, VmCid>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks that every fixed address requested by `spec` is free.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AddressInUse`] naming the current holder.
    pub fn ensure_available(&self, spec: &VmSpec) -> Result<(), ProviderError> {
        let held = self.lock();
        for network in &spec.networks {
            if let NetworkKind::Static(ip) = network.kind
                && let Some(holder) = held.get(&ip)
            {
                return Err(ProviderError::AddressInUse {
                    ip,
                    holder: holder.clone(),
                });
            }
        }
        Ok(())
    }

    /// Records `ips` as held by `cid`. Either all addresses are claimed or
    /// none are.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AddressInUse`] when another VM holds one of
    /// the addresses.
    pub fn claim(&self, cid: &VmCid, ips: &[IpAddr]) -> Result<(), ProviderError> {
        let mut held = self.lock();
        if let Some((ip, holder)) = ips
            .iter()
            .find_map(|ip| held.get(ip).filter(|holder| *holder != cid).map(|holder| (*ip, holder)))
        {
            return Err(ProviderError::AddressInUse {
                ip,
                holder: holder.clone(),
            });
        }
        for ip in ips {
            held.insert(*ip, cid.clone());
        }
        Ok(())
    }

    /// Releases every address held by `cid`, returning them.
    pub fn release(&self, cid: &VmCid) -> Vec<IpAddr> {
        let mut held = self.lock();
        let released: Vec<IpAddr> = held
            .iter()
            .filter(|(_, holder)| *holder == cid)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &released {
            held.remove(ip);
        }
        released
    }

    /// VM currently holding `ip`.
    #[must_use]
    pub fn holder(&self, ip: &IpAddr) -> Option<VmCid> {
        self.lock().get(ip).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::backend::NetworkRequest;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn claim_rejects_address_held_by_another_vm() {
        let ledger = ReservationLedger::new();
        ledger
            .claim(&VmCid::from("old"), &[ip(5)])
            .expect("first claim succeeds");

        let err = ledger
            .claim(&VmCid::from("new"), &[ip(6), ip(5)])
            .expect_err("double reservation should fail");

        assert!(matches!(err, ProviderError::AddressInUse { ref holder, .. } if holder.as_str() == "old"));
        assert_eq!(ledger.holder(&ip(6)), None, "claims are all-or-nothing");
    }

    #[test]
    fn release_frees_addresses_for_reuse() {
        let ledger = ReservationLedger::new();
        let old = VmCid::from("old");
        ledger.claim(&old, &[ip(5)]).expect("claim succeeds");

        assert_eq!(ledger.release(&old), vec![ip(5)]);
        ledger
            .claim(&VmCid::from("new"), &[ip(5)])
            .expect("released address is reusable");
    }

    #[test]
    fn ensure_available_checks_static_networks_only() {
        let ledger = ReservationLedger::new();
        ledger
            .claim(&VmCid::from("old"), &[ip(5)])
            .expect("claim succeeds");
        let dynamic = VmSpec::builder()
            .instance_name("foobar/1")
            .vm_type("a")
            .stemcell("s")
            .network(NetworkRequest::dynamic("a"))
            .build()
            .expect("spec builds");
        let fixed = VmSpec {
            networks: vec![NetworkRequest::fixed("a", ip(5))],
            ..dynamic.clone()
        };

        assert!(ledger.ensure_available(&dynamic).is_ok());
        assert!(ledger.ensure_available(&fixed).is_err());
    }
}
