//! portnote - keeps a port inventory in sync with live probes
//!
//! Hosts are registered in a [`PortStore`]; a [`ScanOrchestrator`] probes
//! them in the background, reconciles the results against the stored ports
//! and reports every change through an [`EventBroker`].

pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod models;
pub mod orchestrator;
pub mod probe;
pub mod reconcile;
pub mod store;
pub mod targets;

// Re-export commonly used types
pub use config::ScanConfig;
pub use error::{ScanError, ScanResult};
pub use events::{Event, EventBroker, EventKind, Subscription};
pub use models::{Host, Port, PortStatus};
pub use orchestrator::ScanOrchestrator;
pub use probe::{OpenPorts, Prober, ProbeRequest, ServiceInfo, TcpConnectProber};
pub use store::{MemoryStore, PortQuery, PortSort, PortStore};

pub type Result<T> = std::result::Result<T, ScanError>;
