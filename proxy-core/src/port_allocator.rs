//! Port Allocator — hands out backend ports from a bounded inclusive
//! range, verifying each candidate is actually bindable before handing it
//! out so externally-held ports (outside this process's bookkeeping) are
//! never double-assigned.

use crate::error::{ProxyError, ProxyResult};
use std::collections::HashSet;
use std::net::{IpAddr, TcpListener};
use std::sync::Mutex;

pub struct PortAllocator {
    min: u16,
    max: u16,
    bind_addr: IpAddr,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16, bind_addr: IpAddr) -> Self {
        Self {
            min,
            max,
            bind_addr,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the next free port in the configured range, verifying it
    /// binds before returning it. Returns `PortsExhausted` once every port
    /// in range is either reserved by this allocator or held externally.
    ///
    /// A candidate that fails to bind is marked in-use for the remainder of
    /// the process's lifetime rather than merely skipped — it is held by
    /// some other process, and without this an externally-held port gets
    /// re-attempted (and re-failed) on every subsequent call.
    pub fn acquire(&self) -> ProxyResult<u16> {
        let mut in_use = self.in_use.lock().expect("port allocator mutex poisoned");
        for candidate in self.min..=self.max {
            if in_use.contains(&candidate) {
                continue;
            }
            if self.can_bind(candidate) {
                in_use.insert(candidate);
                return Ok(candidate);
            }
            in_use.insert(candidate);
        }
        Err(ProxyError::PortsExhausted)
    }

    /// Release a previously-acquired port back into the pool.
    pub fn release(&self, port: u16) {
        self.in_use.lock().expect("port allocator mutex poisoned").remove(&port);
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    fn can_bind(&self, port: u16) -> bool {
        TcpListener::bind((self.bind_addr, port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn allocator(min: u16, max: u16) -> PortAllocator {
        PortAllocator::new(min, max, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn acquire_returns_port_in_range() {
        let alloc = allocator(41000, 41010);
        let port = alloc.acquire().unwrap();
        assert!((41000..=41010).contains(&port));
    }

    #[test]
    fn acquire_does_not_reissue_held_port() {
        let alloc = allocator(41020, 41022);
        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        let c = alloc.acquire().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn exhaustion_returns_ports_exhausted() {
        let alloc = allocator(41030, 41031);
        alloc.acquire().unwrap();
        alloc.acquire().unwrap();
        match alloc.acquire() {
            Err(ProxyError::PortsExhausted) => {}
            other => panic!("expected PortsExhausted, got {other:?}"),
        }
    }

    #[test]
    fn release_makes_port_available_again() {
        let alloc = allocator(41040, 41040);
        let port = alloc.acquire().unwrap();
        alloc.release(port);
        let reacquired = alloc.acquire().unwrap();
        assert_eq!(port, reacquired);
    }

    #[test]
    fn externally_held_port_is_skipped() {
        let _guard = TcpListener::bind((Ipv4Addr::LOCALHOST, 41050)).unwrap();
        let alloc = allocator(41050, 41051);
        let port = alloc.acquire().unwrap();
        assert_eq!(port, 41051);
    }
}
