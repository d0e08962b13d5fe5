//! Port allocation for spawned servers.
//!
//! A port handed out by [`PortReservations::reserve`] stays reserved until
//! it is consumed by a load, released, or its TTL runs out, so concurrent
//! callers never receive the same port.

use rand::Rng;
use std::collections::HashMap;
use std::net::TcpListener;
use std::ops::Range;
use std::time::{Duration, Instant};

pub const PORT_RANGE: Range<u16> = 3000..4000;
pub const MAX_PORT_ATTEMPTS: usize = 20_000;
pub const RESERVATION_TTL: Duration = Duration::from_secs(60);

/// Whether nothing currently listens on `127.0.0.1:port`
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Random free port from [`PORT_RANGE`] for which `taken` is false
pub fn pick_random_port(taken: impl Fn(u16) -> bool) -> Option<u16> {
    let mut rng = rand::rng();
    (0..MAX_PORT_ATTEMPTS)
        .map(|_| rng.random_range(PORT_RANGE))
        .find(|port| !taken(*port) && is_port_free(*port))
}

#[derive(Debug)]
pub struct PortReservations {
    ttl: Duration,
    reserved: HashMap<u16, Instant>,
}

impl Default for PortReservations {
    fn default() -> Self {
        Self::with_ttl(RESERVATION_TTL)
    }
}

impl PortReservations {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            reserved: HashMap::new(),
        }
    }

    pub fn reserve(&mut self, port: u16) {
        self.reserved.insert(port, Instant::now());
    }

    /// Drop the reservation, returning whether one was live
    pub fn release(&mut self, port: u16) -> bool {
        let live = self.contains(port);
        self.reserved.remove(&port);
        live
    }

    pub fn contains(&self, port: u16) -> bool {
        self.reserved
            .get(&port)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    pub fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.reserved.retain(|_, at| at.elapsed() < ttl);
    }

    pub fn clear(&mut self) {
        self.reserved.clear();
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }
}
