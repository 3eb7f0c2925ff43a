//! EID registry
//!
//! Maps capture interfaces to LISP instance IDs and each instance ID to the
//! EIDs the local endpoints may use as source addresses. Workers only read
//! it; the control plane binds interfaces and assigns EIDs.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::RwLock;

use tracing::{debug, info};

/// Instance ID reported for interfaces without a binding
pub const UNKNOWN_IID: u32 = 0;

/// Read side of the EID registry as seen by a worker.
pub trait EidRegistry: Send + Sync {
    /// Instance ID bound to `ifname`, or `UNKNOWN_IID`.
    fn lookup_iface_iid(&self, ifname: &str) -> u32;

    /// EIDs assigned to `iid`, `None` if none are known yet.
    fn lookup_iface_eids(&self, iid: u32) -> Option<Vec<Ipv6Addr>>;
}

/// In-memory registry.
pub struct InterfaceRegistry {
    /// Interface name to instance ID
    interfaces: RwLock<HashMap<String, u32>>,
    /// Instance ID to permitted source EIDs
    eids: RwLock<HashMap<u32, Vec<Ipv6Addr>>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        InterfaceRegistry {
            interfaces: RwLock::new(HashMap::new()),
            eids: RwLock::new(HashMap::new()),
        }
    }

    /// Bind `ifname` to `iid`.
    ///
    /// Returns the previous binding if one existed.
    pub fn bind(&self, ifname: &str, iid: u32) -> Option<u32> {
        info!(ifname, iid, "Interface bound to instance");
        self.interfaces
            .write()
            .unwrap()
            .insert(ifname.to_string(), iid)
    }

    pub fn unbind(&self, ifname: &str) -> Option<u32> {
        self.interfaces.write().unwrap().remove(ifname)
    }

    /// Add one EID to `iid`. Duplicates are ignored.
    pub fn add_eid(&self, iid: u32, eid: Ipv6Addr) {
        let mut eids = self.eids.write().unwrap();
        let list = eids.entry(iid).or_default();
        if !list.contains(&eid) {
            list.push(eid);
            debug!(iid, %eid, "EID added");
        }
    }

    /// Replace the EID set of `iid`. An empty set removes it.
    pub fn set_eids(&self, iid: u32, list: Vec<Ipv6Addr>) {
        let mut eids = self.eids.write().unwrap();
        if list.is_empty() {
            eids.remove(&iid);
        } else {
            eids.insert(iid, list);
        }
    }

    /// Number of bound interfaces.
    pub fn interface_count(&self) -> usize {
        self.interfaces.read().unwrap().len()
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EidRegistry for InterfaceRegistry {
    fn lookup_iface_iid(&self, ifname: &str) -> u32 {
        self.interfaces
            .read()
            .unwrap()
            .get(ifname)
            .copied()
            .unwrap_or(UNKNOWN_IID)
    }

    fn lookup_iface_eids(&self, iid: u32) -> Option<Vec<Ipv6Addr>> {
        self.eids
            .read()
            .unwrap()
            .get(&iid)
            .filter(|list| !list.is_empty())
            .cloned()
    }
}
