//! Inventory records: hosts and the ports tracked on them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Port status as last established by reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    #[default]
    Unknown,
    Open,
    Closed,
}

impl PortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Unknown => "unknown",
            PortStatus::Open => "open",
            PortStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PortStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-registered host whose ports are tracked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub address: String,
    #[serde(default = "default_auto_scan")]
    pub auto_scan: bool,
    /// Held while a full-range scan is queued or running
    #[serde(default)]
    pub scanning: bool,
    /// Ports not hidden from listings, filled in on read
    #[serde(default)]
    pub open_count: usize,
    /// Hidden ports, filled in on read
    #[serde(default)]
    pub hidden_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_auto_scan() -> bool {
    true
}

/// A port tracked on a host, unique on (host, number)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub id: i64,
    pub host_id: i64,
    pub number: u16,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub status: PortStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Port {
    pub fn is_open(&self) -> bool {
        self.status == PortStatus::Open
    }
}
