//! In-process inventory with JSON snapshots

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{PortQuery, PortSort, PortStore};
use crate::models::{Host, Port, PortStatus};
use crate::targets;
use crate::{Result, ScanError};

#[derive(Debug, Default)]
struct Inventory {
    next_host_id: i64,
    next_port_id: i64,
    hosts: BTreeMap<i64, Host>,
    ports: BTreeMap<i64, Port>,
}

impl Inventory {
    fn host_mut(&mut self, host_id: i64) -> Result<&mut Host> {
        self.hosts
            .get_mut(&host_id)
            .ok_or(ScanError::HostNotFound(host_id))
    }

    fn port_mut(&mut self, port_id: i64) -> Result<&mut Port> {
        self.ports
            .get_mut(&port_id)
            .ok_or(ScanError::PortNotFound(port_id))
    }

    fn name_taken(&self, name: &str, except: Option<i64>) -> bool {
        self.hosts
            .values()
            .any(|h| h.name == name && Some(h.id) != except)
    }

    /// Host as handed out to callers: canonical address and port counts
    fn host_view(&self, host: &Host) -> Host {
        let mut view = with_canonical_address(host.clone());
        let (hidden, shown): (Vec<&Port>, Vec<&Port>) = self
            .ports
            .values()
            .filter(|p| p.host_id == host.id)
            .partition(|p| p.hidden);
        view.open_count = shown.len();
        view.hidden_count = hidden.len();
        view
    }
}

/// On-disk form of the inventory
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    saved_at: DateTime<Utc>,
    hosts: Vec<Host>,
    ports: Vec<Port>,
}

/// Host and port inventory kept in memory behind a single lock
///
/// Every method takes the lock once, so each call is atomic with respect to
/// every other call. [`MemoryStore::save_snapshot`] and
/// [`MemoryStore::load_snapshot`] carry the inventory across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inventory>,
}

fn with_canonical_address(mut host: Host) -> Host {
    if let Some(address) = targets::normalize(&host.address) {
        host.address = address;
    }
    host
}

fn check_host_fields(name: &str, address: &str) -> Result<(String, String)> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ScanError::InvalidTarget("host name is empty".to_string()));
    }
    if targets::normalize(address).is_none() {
        return Err(ScanError::InvalidTarget(address.to_string()));
    }
    Ok((name.to_string(), address.trim().to_string()))
}

fn matches_search(port: &Port, needle: &str) -> bool {
    port.number.to_string().contains(needle)
        || port.fingerprint.to_lowercase().contains(needle)
        || port.note.to_lowercase().contains(needle)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host with automatic scanning on; names are unique
    pub fn create_host(&self, name: &str, address: &str) -> Result<i64> {
        let (name, address) = check_host_fields(name, address)?;
        let mut inv = self.inner.lock();
        if inv.name_taken(&name, None) {
            return Err(ScanError::DuplicateHost(name));
        }

        inv.next_host_id += 1;
        let id = inv.next_host_id;
        let now = Utc::now();
        inv.hosts.insert(
            id,
            Host {
                id,
                name,
                address,
                auto_scan: true,
                scanning: false,
                open_count: 0,
                hidden_count: 0,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    pub fn update_host(&self, host_id: i64, name: &str, address: &str) -> Result<()> {
        let (name, address) = check_host_fields(name, address)?;
        let mut inv = self.inner.lock();
        if inv.name_taken(&name, Some(host_id)) {
            return Err(ScanError::DuplicateHost(name));
        }

        let host = inv.host_mut(host_id)?;
        host.name = name;
        host.address = address;
        host.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_host_auto_scan(&self, host_id: i64, auto_scan: bool) -> Result<()> {
        let mut inv = self.inner.lock();
        let host = inv.host_mut(host_id)?;
        host.auto_scan = auto_scan;
        host.updated_at = Utc::now();
        Ok(())
    }

    /// Remove a host together with all of its ports
    pub fn delete_host(&self, host_id: i64) -> Result<()> {
        let mut inv = self.inner.lock();
        if inv.hosts.remove(&host_id).is_none() {
            return Err(ScanError::HostNotFound(host_id));
        }
        inv.ports.retain(|_, p| p.host_id != host_id);
        Ok(())
    }

    pub fn get_port(&self, port_id: i64) -> Result<Port> {
        self.inner
            .lock()
            .ports
            .get(&port_id)
            .cloned()
            .ok_or(ScanError::PortNotFound(port_id))
    }

    pub fn find_port_by_number(&self, host_id: i64, number: u16) -> Option<Port> {
        self.inner
            .lock()
            .ports
            .values()
            .find(|p| p.host_id == host_id && p.number == number)
            .cloned()
    }

    /// Filtered, sorted and paged listing of a host's ports
    ///
    /// Returns the requested page and the number of ports matching the
    /// filters before paging. Ties in the sort key fall back to port number.
    pub fn list_ports_with_query(
        &self,
        host_id: i64,
        include_hidden: bool,
        query: &PortQuery,
    ) -> Result<(Vec<Port>, usize)> {
        let needle = query.search.trim().to_lowercase();
        let mut ports: Vec<Port> = {
            let inv = self.inner.lock();
            if !inv.hosts.contains_key(&host_id) {
                return Err(ScanError::HostNotFound(host_id));
            }
            inv.ports
                .values()
                .filter(|p| p.host_id == host_id && (include_hidden || !p.hidden))
                .filter(|p| query.status.map_or(true, |status| p.status == status))
                .filter(|p| needle.is_empty() || matches_search(p, &needle))
                .cloned()
                .collect()
        };
        let total = ports.len();

        ports.sort_by(|a, b| {
            let order = match query.sort_by {
                PortSort::Number => a.number.cmp(&b.number),
                PortSort::LastChecked => a.last_checked.cmp(&b.last_checked),
                PortSort::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                PortSort::Fingerprint => a.fingerprint.cmp(&b.fingerprint),
            };
            let order = if query.sort_desc { order.reverse() } else { order };
            order.then(a.number.cmp(&b.number))
        });

        if query.page_size > 0 {
            let offset = (query.page.max(1) - 1).saturating_mul(query.page_size);
            ports = ports
                .into_iter()
                .skip(offset)
                .take(query.page_size)
                .collect();
        }
        Ok((ports, total))
    }

    /// Manual edit of the note and fingerprint; status is left alone
    pub fn update_port_note(&self, port_id: i64, note: &str, fingerprint: &str) -> Result<()> {
        let mut inv = self.inner.lock();
        let port = inv.port_mut(port_id)?;
        port.note = note.to_string();
        port.fingerprint = fingerprint.to_string();
        port.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_port_hidden(&self, port_id: i64, hidden: bool) -> Result<()> {
        let mut inv = self.inner.lock();
        let port = inv.port_mut(port_id)?;
        port.hidden = hidden;
        port.updated_at = Utc::now();
        Ok(())
    }

    pub fn delete_port(&self, port_id: i64) -> Result<()> {
        self.inner
            .lock()
            .ports
            .remove(&port_id)
            .map(|_| ())
            .ok_or(ScanError::PortNotFound(port_id))
    }

    /// Hide or unhide every port of a host within `range`, returning how many matched
    pub fn bulk_set_hidden(&self, host_id: i64, range: RangeInclusive<u16>, hidden: bool) -> usize {
        let now = Utc::now();
        let mut inv = self.inner.lock();
        let mut affected = 0;
        for port in inv.ports.values_mut() {
            if port.host_id == host_id && range.contains(&port.number) {
                port.hidden = hidden;
                port.updated_at = now;
                affected += 1;
            }
        }
        affected
    }

    pub fn bulk_delete_ports(&self, host_id: i64, range: RangeInclusive<u16>) -> usize {
        let mut inv = self.inner.lock();
        let before = inv.ports.len();
        inv.ports
            .retain(|_, p| !(p.host_id == host_id && range.contains(&p.number)));
        before - inv.ports.len()
    }

    /// Write the inventory to `path` as JSON, replacing the file atomically
    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let snapshot = {
            let inv = self.inner.lock();
            Snapshot {
                saved_at: Utc::now(),
                hosts: inv.hosts.values().cloned().collect(),
                ports: inv.ports.values().cloned().collect(),
            }
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let temp_path = path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;

        log::debug!(
            "Saved {} host(s) and {} port(s) to {}",
            snapshot.hosts.len(),
            snapshot.ports.len(),
            path.display()
        );
        Ok(())
    }

    /// Load a snapshot written by [`MemoryStore::save_snapshot`]
    ///
    /// A missing file yields an empty store. Scanning flags are cleared since
    /// no job survives a restart.
    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No snapshot at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;

        let mut inv = Inventory::default();
        for mut host in snapshot.hosts {
            host.scanning = false;
            inv.next_host_id = inv.next_host_id.max(host.id);
            inv.hosts.insert(host.id, host);
        }
        for port in snapshot.ports {
            if !inv.hosts.contains_key(&port.host_id) {
                log::warn!("Skipping port {} of unknown host {}", port.id, port.host_id);
                continue;
            }
            inv.next_port_id = inv.next_port_id.max(port.id);
            inv.ports.insert(port.id, port);
        }

        log::info!(
            "Loaded {} host(s) and {} port(s) from {}",
            inv.hosts.len(),
            inv.ports.len(),
            path.display()
        );
        Ok(Self {
            inner: Mutex::new(inv),
        })
    }
}

#[async_trait]
impl PortStore for MemoryStore {
    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let mut hosts: Vec<Host> = {
            let inv = self.inner.lock();
            inv.hosts.values().map(|h| inv.host_view(h)).collect()
        };
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hosts)
    }

    async fn get_host(&self, host_id: i64) -> Result<Host> {
        let inv = self.inner.lock();
        let host = inv
            .hosts
            .get(&host_id)
            .ok_or(ScanError::HostNotFound(host_id))?;
        Ok(inv.host_view(host))
    }

    async fn begin_scan(&self, host_id: i64) -> Result<bool> {
        let mut inv = self.inner.lock();
        let host = inv.host_mut(host_id)?;
        if host.scanning {
            return Ok(false);
        }
        host.scanning = true;
        host.updated_at = Utc::now();
        Ok(true)
    }

    async fn end_scan(&self, host_id: i64) -> Result<()> {
        let mut inv = self.inner.lock();
        // The host may have been deleted while its scan ran
        if let Some(host) = inv.hosts.get_mut(&host_id) {
            host.scanning = false;
            host.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_ports(&self, host_id: i64, include_hidden: bool) -> Result<Vec<Port>> {
        let inv = self.inner.lock();
        if !inv.hosts.contains_key(&host_id) {
            return Err(ScanError::HostNotFound(host_id));
        }
        let mut ports: Vec<Port> = inv
            .ports
            .values()
            .filter(|p| p.host_id == host_id && (include_hidden || !p.hidden))
            .cloned()
            .collect();
        ports.sort_by_key(|p| p.number);
        Ok(ports)
    }

    async fn create_port(&self, host_id: i64, number: u16, note: &str, fingerprint: &str) -> Result<i64> {
        let mut inv = self.inner.lock();
        if !inv.hosts.contains_key(&host_id) {
            return Err(ScanError::HostNotFound(host_id));
        }
        if inv
            .ports
            .values()
            .any(|p| p.host_id == host_id && p.number == number)
        {
            return Err(ScanError::DuplicatePort { host_id, number });
        }

        inv.next_port_id += 1;
        let id = inv.next_port_id;
        let now = Utc::now();
        inv.ports.insert(
            id,
            Port {
                id,
                host_id,
                number,
                note: note.to_string(),
                fingerprint: fingerprint.to_string(),
                hidden: false,
                status: PortStatus::Unknown,
                last_checked: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn update_port_status(&self, port_id: i64, status: PortStatus, checked: DateTime<Utc>) -> Result<()> {
        let mut inv = self.inner.lock();
        let port = inv.port_mut(port_id)?;
        port.status = status;
        port.last_checked = Some(checked);
        port.updated_at = Utc::now();
        Ok(())
    }

    async fn update_port_fingerprint(&self, port_id: i64, fingerprint: &str) -> Result<()> {
        let mut inv = self.inner.lock();
        let port = inv.port_mut(port_id)?;
        port.fingerprint = fingerprint.to_string();
        port.updated_at = Utc::now();
        Ok(())
    }
}
