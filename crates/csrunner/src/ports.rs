use std::collections::HashSet;
use std::net::TcpListener;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Hands out OS-assigned loopback ports and tracks every port a managed
/// app currently holds, fixed or dynamic, so no two apps are offered the
/// same one.
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Bind port 0 on loopback, read back the assigned port, and reserve
    /// it. Rebinds on the rare collision with an outstanding reservation.
    pub fn allocate(&self) -> Result<u16> {
        const MAX_BIND_ATTEMPTS: usize = 16;
        for _ in 0..MAX_BIND_ATTEMPTS {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .map_err(|e| Error::PortUnavailable(format!("bind failed: {e}")))?;
            let port = listener
                .local_addr()
                .map_err(|e| Error::PortUnavailable(format!("local_addr failed: {e}")))?
                .port();
            drop(listener);

            let mut reserved = self.reserved.lock();
            if reserved.insert(port) {
                debug!(port, "allocated dynamic port");
                return Ok(port);
            }
        }
        Err(Error::PortUnavailable(
            "exhausted attempts to find an unreserved port".to_string(),
        ))
    }

    /// Reserve a fixed port declared in a spec. Fails if another managed
    /// app holds it or the OS refuses to bind it.
    pub fn reserve_fixed(&self, port: u16) -> Result<()> {
        {
            let reserved = self.reserved.lock();
            if reserved.contains(&port) {
                return Err(Error::PortUnavailable(format!(
                    "port {port} is held by another managed application"
                )));
            }
        }
        // Probe bind outside the lock; the set alone decides ownership.
        TcpListener::bind(("127.0.0.1", port))
            .map_err(|e| Error::PortUnavailable(format!("port {port} is in use: {e}")))?;

        let mut reserved = self.reserved.lock();
        if !reserved.insert(port) {
            return Err(Error::PortUnavailable(format!(
                "port {port} is held by another managed application"
            )));
        }
        debug!(port, "reserved fixed port");
        Ok(())
    }

    /// Idempotent.
    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            debug!(port, "released port");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_unique_while_outstanding() {
        let alloc = PortAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let port = alloc.allocate().expect("allocate");
            assert!(seen.insert(port), "port {port} offered twice");
        }
        for port in seen {
            alloc.release(port);
        }
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = PortAllocator::new();
        let port = alloc.allocate().expect("allocate");
        alloc.release(port);
        alloc.release(port);
        assert!(!alloc.is_reserved(port));
    }

    #[test]
    fn fixed_port_conflicts_with_reservation() {
        let alloc = PortAllocator::new();
        let port = alloc.allocate().expect("allocate");
        let err = alloc.reserve_fixed(port).expect_err("must conflict");
        assert!(matches!(err, Error::PortUnavailable(_)));
        alloc.release(port);
    }

    #[test]
    fn fixed_port_reserves_and_releases() {
        let alloc = PortAllocator::new();
        // Grab a free port number from the OS, then reserve it as fixed.
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        alloc.reserve_fixed(port).expect("reserve");
        assert!(alloc.is_reserved(port));
        alloc.release(port);
        assert!(!alloc.is_reserved(port));
    }

    #[test]
    fn fixed_port_in_use_by_foreign_process_is_rejected() {
        let alloc = PortAllocator::new();
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        let err = alloc.reserve_fixed(port).expect_err("must fail");
        assert!(matches!(err, Error::PortUnavailable(_)));
    }

    #[test]
    fn concurrent_allocations_do_not_collide() {
        let alloc = std::sync::Arc::new(PortAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || {
                (0..8).map(|_| alloc.allocate().unwrap()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(all.insert(port), "port {port} offered twice");
            }
        }
    }
}
