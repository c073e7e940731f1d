//! Port allocation for new instances.
//!
//! Each category draws from its own range. A candidate port is accepted only
//! if no live instance records it and the host lets us bind it right now.
//! The accepted port is reserved under the same lock that checked it, so two
//! concurrent allocations can never hand out the same value.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

use crate::config::PortsConfig;
use crate::error::{InstanceError, InstanceResult};
use crate::registry::{InstancePorts, PortCategory};

pub struct PortAllocator {
    config: PortsConfig,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(config: PortsConfig, in_use: impl IntoIterator<Item = u16>) -> Self {
        Self {
            config,
            used: Mutex::new(in_use.into_iter().collect()),
        }
    }

    /// Reserve a free port from `category`'s range.
    pub fn allocate(&self, category: PortCategory) -> InstanceResult<u16> {
        let range = self.config.range(category);
        let mut used = self.used.lock();
        let mut rng = rand::rng();

        for _ in 0..self.config.max_attempts.max(1) {
            let port = rng.random_range(range.min..=range.max);
            if used.contains(&port) {
                continue;
            }
            if !is_port_bindable(port) {
                tracing::debug!(port, category = %category, "Port busy on host, resampling");
                continue;
            }
            used.insert(port);
            tracing::debug!(port, category = %category, "Port reserved");
            return Ok(port);
        }

        tracing::warn!(
            category = %category,
            min = range.min,
            max = range.max,
            attempts = self.config.max_attempts,
            "Port range exhausted"
        );
        Err(InstanceError::PortExhaustion { category })
    }

    /// Reserve one port per category. Ports taken before a failure are
    /// released again.
    pub fn allocate_all(&self) -> InstanceResult<InstancePorts> {
        let mut taken = Vec::with_capacity(PortCategory::ALL.len());
        for category in PortCategory::ALL {
            match self.allocate(category) {
                Ok(port) => taken.push(port),
                Err(e) => {
                    self.release(taken);
                    return Err(e);
                }
            }
        }

        Ok(InstancePorts {
            http_gateway: taken[0],
            https_gateway: taken[1],
            db_external: taken[2],
            pooler: taken[3],
            analytics: taken[4],
        })
    }

    pub fn release(&self, ports: impl IntoIterator<Item = u16>) {
        let mut used = self.used.lock();
        for port in ports {
            used.remove(&port);
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.used.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.used.lock().len()
    }
}

/// Bind and immediately drop a listener on all interfaces.
pub fn is_port_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}
