//! Exclusive ownership of device ports.
//!
//! A session must hold a [`PortLease`] for its port while connected. The
//! lease is an RAII guard: dropping it releases the port for the next
//! session. Registries are ordinary values, so independent test instances
//! never see each other's ports; sessions meant to exclude one another
//! share a clone of the same registry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{AppResult, DaqError};

/// Set of ports currently claimed by a session
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    ports: Arc<Mutex<HashSet<String>>>,
}

impl PortRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port` exclusively.
    ///
    /// # Errors
    /// [`DaqError::Connection`] when another lease on the same port is alive.
    ///
    /// # Example
    /// ```
    /// use picodaq::registry::PortRegistry;
    ///
    /// let registry = PortRegistry::new();
    /// let lease = registry.claim("/dev/ttyACM0")?;
    /// assert!(registry.claim("/dev/ttyACM0").is_err());
    /// drop(lease);
    /// assert!(registry.is_available("/dev/ttyACM0"));
    /// # Ok::<(), picodaq::error::DaqError>(())
    /// ```
    pub fn claim(&self, port: &str) -> AppResult<PortLease> {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        if !ports.insert(port.to_string()) {
            return Err(DaqError::Connection(format!(
                "A connection already exists to {}",
                port
            )));
        }
        tracing::debug!(port, "Port claimed");
        Ok(PortLease {
            ports: self.ports.clone(),
            port: port.to_string(),
        })
    }

    /// Whether no lease on `port` is alive.
    pub fn is_available(&self, port: &str) -> bool {
        !self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(port)
    }

    /// Number of ports currently claimed.
    pub fn len(&self) -> usize {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no port is claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII guard for a claimed port
///
/// Releases the claim when dropped.
#[derive(Debug)]
pub struct PortLease {
    ports: Arc<Mutex<HashSet<String>>>,
    port: String,
}

impl PortLease {
    /// The claimed port name.
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        if ports.remove(&self.port) {
            tracing::debug!(port = %self.port, "Port released");
        }
    }
}
