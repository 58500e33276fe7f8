//! Boundary to the port-probing capability
//!
//! The orchestrator only depends on the [`Prober`] trait: given targets and an
//! optional port subset, report which ports were seen open (with optional
//! service metadata) before a deadline. [`TcpConnectProber`] is the bundled
//! implementation.

pub mod rate;
pub mod tcp;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::RangeInclusive;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use rate::RateLimiter;
pub use tcp::TcpConnectProber;

/// The port space covered by a full-range probe
pub const FULL_RANGE: RangeInclusive<u16> = 1..=65535;

/// Service metadata observed on an open port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

impl ServiceInfo {
    /// Merge metadata for the same port seen on another target, keeping known fields
    pub fn merge(&mut self, other: ServiceInfo) {
        if self.name.is_none() {
            self.name = other.name;
        }
        if self.product.is_none() {
            self.product = other.product;
        }
        if self.version.is_none() {
            self.version = other.version;
        }
    }
}

/// Ports observed open, keyed by number
pub type OpenPorts = HashMap<u16, Option<ServiceInfo>>;

/// One probe invocation
#[derive(Debug, Clone, Copy)]
pub struct ProbeRequest<'a> {
    /// Ordered probe targets (host name first, then resolved addresses)
    pub targets: &'a [String],
    /// Explicit ports; `None` probes the full range
    pub ports: Option<&'a [u16]>,
    /// Results collected by this instant are returned, the rest abandoned
    pub deadline: Instant,
}

impl ProbeRequest<'_> {
    /// Number of ports this request covers per target
    pub fn port_count(&self) -> usize {
        match self.ports {
            Some(ports) => ports.len(),
            None => FULL_RANGE.len(),
        }
    }
}

/// Port-probing capability
///
/// Implementations must return what they collected when the deadline passes
/// rather than failing, and must fail only when the probe could not start at
/// all (no usable target, driver unavailable).
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, request: ProbeRequest<'_>) -> crate::Result<OpenPorts>;
}

/// Record an open port, merging metadata when several targets report it
pub(crate) fn record_open(found: &mut OpenPorts, port: u16, info: Option<ServiceInfo>) {
    match found.entry(port) {
        Entry::Vacant(entry) => {
            entry.insert(info);
        }
        Entry::Occupied(mut entry) => {
            let Some(info) = info else { return };
            let slot = entry.get_mut();
            if let Some(existing) = slot.as_mut() {
                existing.merge(info);
            } else {
                *slot = Some(info);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_port_count() {
        let targets = vec!["127.0.0.1".to_string()];
        let deadline = Instant::now() + Duration::from_secs(1);
        let full = ProbeRequest {
            targets: &targets,
            ports: None,
            deadline,
        };
        assert_eq!(full.port_count(), 65535);

        let ports = [22, 80];
        let targeted = ProbeRequest {
            ports: Some(&ports),
            ..full
        };
        assert_eq!(targeted.port_count(), 2);
    }

    #[test]
    fn test_record_open_merges_metadata() {
        let mut found = OpenPorts::new();
        record_open(&mut found, 22, None);
        record_open(
            &mut found,
            22,
            Some(ServiceInfo {
                product: Some("OpenSSH".into()),
                ..Default::default()
            }),
        );
        record_open(
            &mut found,
            22,
            Some(ServiceInfo {
                product: Some("Dropbear".into()),
                version: Some("9.6".into()),
                ..Default::default()
            }),
        );
        record_open(&mut found, 22, None);

        let info = found[&22].as_ref().unwrap();
        assert_eq!(info.product.as_deref(), Some("OpenSSH"));
        assert_eq!(info.version.as_deref(), Some("9.6"));
    }
}
