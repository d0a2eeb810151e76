use std::{collections::BTreeSet, fmt, net::Ipv4Addr, sync::Arc};

use cfdevd_common::PRIVILEGED_ADDRESSES;

/// The fixed set of addresses the daemon binds and aliases on behalf of
/// clients.
///
/// Built once at construction and never mutated afterwards, so "only these
/// addresses are ever bound through the privileged path" can be checked by
/// looking at where the daemon is constructed.
#[derive(Clone, PartialEq, Eq)]
pub struct AllowList {
    addrs: Arc<BTreeSet<Ipv4Addr>>,
}

impl AllowList {
    pub fn new<I: IntoIterator<Item = Ipv4Addr>>(addrs: I) -> Self {
        Self {
            addrs: Arc::new(addrs.into_iter().collect()),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.addrs.contains(&ip)
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.addrs.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// The virtual director and router addresses
impl Default for AllowList {
    fn default() -> Self {
        Self::new(PRIVILEGED_ADDRESSES)
    }
}

impl fmt::Debug for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.addrs.iter()).finish()
    }
}
