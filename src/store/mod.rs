//! Persistence boundary for hosts and ports
//!
//! The orchestrator and the reconciliation pass talk to storage only through
//! [`PortStore`]. Each operation is atomic on its own; nothing spans a whole
//! reconciliation pass, so readers may observe a partially reconciled host.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Host, Port, PortStatus};
use crate::Result;

pub use memory::MemoryStore;

/// Sort key for a port listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSort {
    #[default]
    Number,
    LastChecked,
    UpdatedAt,
    Fingerprint,
}

impl PortSort {
    /// Parse `number`, `last_checked`, `updated_at` or `fingerprint`;
    /// anything else sorts by number
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "last_checked" => PortSort::LastChecked,
            "updated_at" => PortSort::UpdatedAt,
            "fingerprint" => PortSort::Fingerprint,
            _ => PortSort::Number,
        }
    }
}

/// Filters, order and paging for [`MemoryStore::list_ports_with_query`]
#[derive(Debug, Clone, Default)]
pub struct PortQuery {
    /// Case-insensitive substring of the port number, fingerprint or note
    pub search: String,
    pub status: Option<PortStatus>,
    pub sort_by: PortSort,
    pub sort_desc: bool,
    /// 1-based, 0 counts as 1
    pub page: usize,
    /// 0 returns every match
    pub page_size: usize,
}

#[async_trait]
pub trait PortStore: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<Host>>;

    async fn get_host(&self, host_id: i64) -> Result<Host>;

    /// Atomically move the host's scanning flag from idle to scanning
    ///
    /// Returns `Ok(false)` when a scan already holds the flag and
    /// [`ScanError::HostNotFound`](crate::ScanError::HostNotFound) when the
    /// host does not exist.
    async fn begin_scan(&self, host_id: i64) -> Result<bool>;

    /// Release the scanning flag whatever its current state
    async fn end_scan(&self, host_id: i64) -> Result<()>;

    async fn list_ports(&self, host_id: i64, include_hidden: bool) -> Result<Vec<Port>>;

    /// Track a new port; it starts out with status `unknown`
    async fn create_port(&self, host_id: i64, number: u16, note: &str, fingerprint: &str) -> Result<i64>;

    async fn update_port_status(&self, port_id: i64, status: PortStatus, checked: DateTime<Utc>) -> Result<()>;

    async fn update_port_fingerprint(&self, port_id: i64, fingerprint: &str) -> Result<()>;
}
