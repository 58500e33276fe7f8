//! Diff persisted ports against a probe result and apply the difference
//!
//! Planning is pure: [`plan_full_range`] and [`plan_targeted`] turn the
//! host's current port records and the discovered open set into a list of
//! [`Mutation`]s. [`apply`] then walks that list against the store, one
//! atomic store call at a time, publishing an event per port touched.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::events::{Event, EventBroker};
use crate::fingerprint;
use crate::models::{Port, PortStatus};
use crate::probe::OpenPorts;
use crate::store::PortStore;

/// One store mutation produced by planning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Track a newly discovered open port
    Create {
        number: u16,
        note: String,
        fingerprint: String,
    },
    /// Record the probe outcome for a tracked port
    SetStatus {
        port_id: i64,
        number: u16,
        status: PortStatus,
        /// The previous status differed from the new one
        transition: bool,
    },
    /// Replace a tracked port's fingerprint with one derived from probe metadata
    SetFingerprint { port_id: i64, fingerprint: String },
}

impl Mutation {
    /// Whether this mutation counts as a change of the host's inventory
    pub fn is_change(&self) -> bool {
        match self {
            Mutation::Create { .. } => true,
            Mutation::SetStatus { transition, .. } => *transition,
            Mutation::SetFingerprint { .. } => false,
        }
    }
}

/// What an [`apply`] pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub changed: bool,
    pub created: usize,
    pub opened: usize,
    pub closed: usize,
    pub store_failures: usize,
}

fn status_mutation(port: &Port, status: PortStatus) -> Mutation {
    Mutation::SetStatus {
        port_id: port.id,
        number: port.number,
        status,
        transition: port.status != status,
    }
}

/// Fingerprint update for a tracked open port, if metadata names something new
fn fingerprint_mutation(port: &Port, discovered: &OpenPorts) -> Option<Mutation> {
    let label = discovered
        .get(&port.number)?
        .as_ref()
        .and_then(fingerprint::service_label)?;
    (label != port.fingerprint).then(|| Mutation::SetFingerprint {
        port_id: port.id,
        fingerprint: label,
    })
}

fn sorted_numbers(discovered: &OpenPorts) -> Vec<u16> {
    let mut numbers: Vec<u16> = discovered.keys().copied().collect();
    numbers.sort_unstable();
    numbers
}

/// Plan a full-range pass over every tracked port, hidden or not
pub fn plan_full_range(existing: &[Port], discovered: &OpenPorts) -> Vec<Mutation> {
    let by_number: HashMap<u16, &Port> = existing.iter().map(|p| (p.number, p)).collect();
    let mut plan = Vec::new();

    for number in sorted_numbers(discovered) {
        match by_number.get(&number) {
            Some(port) => {
                plan.extend(fingerprint_mutation(port, discovered));
                plan.push(status_mutation(port, PortStatus::Open));
            }
            None => {
                let info = discovered.get(&number).and_then(Option::as_ref);
                let note = info
                    .and_then(fingerprint::service_label)
                    .unwrap_or_else(|| format!("Port {}", number));
                plan.push(Mutation::Create {
                    number,
                    note,
                    fingerprint: fingerprint::label_for(number, info),
                });
            }
        }
    }

    let mut missing: Vec<&Port> = existing
        .iter()
        .filter(|p| !discovered.contains_key(&p.number))
        .collect();
    missing.sort_by_key(|p| p.number);
    plan.extend(missing.into_iter().map(|p| status_mutation(p, PortStatus::Closed)));

    plan
}

/// Plan a targeted pass that only touches the queried port numbers
///
/// Queried numbers the host does not track are skipped; targeted scans
/// confirm known ports, they never create new ones.
pub fn plan_targeted(existing: &[Port], queried: &[u16], discovered: &OpenPorts) -> Vec<Mutation> {
    let by_number: HashMap<u16, &Port> = existing.iter().map(|p| (p.number, p)).collect();
    let mut seen = HashSet::new();
    let mut plan = Vec::new();

    for &number in queried {
        if !seen.insert(number) {
            continue;
        }
        let Some(port) = by_number.get(&number) else {
            log::debug!("Port {} is not tracked, skipping", number);
            continue;
        };

        if discovered.contains_key(&number) {
            plan.extend(fingerprint_mutation(port, discovered));
            plan.push(status_mutation(port, PortStatus::Open));
        } else {
            plan.push(status_mutation(port, PortStatus::Closed));
        }
    }

    plan
}

/// Apply a plan for `host_id`, publishing `port_created` and `port_status` events
///
/// A failing store call is logged and skipped; the rest of the plan still
/// runs. Status transitions count as changes even if their write failed, a
/// created port only if the creation itself succeeded.
pub async fn apply(
    store: &dyn PortStore,
    broker: &EventBroker,
    host_id: i64,
    plan: Vec<Mutation>,
    checked: DateTime<Utc>,
) -> Summary {
    let mut summary = Summary::default();

    for mutation in plan {
        match mutation {
            Mutation::Create {
                number,
                note,
                fingerprint,
            } => {
                let port_id = match store.create_port(host_id, number, &note, &fingerprint).await {
                    Ok(id) => id,
                    Err(e) => {
                        log::warn!("Create port failed host={} port={}: {}", host_id, number, e);
                        summary.store_failures += 1;
                        continue;
                    }
                };
                summary.changed = true;
                summary.created += 1;

                if let Err(e) = store
                    .update_port_status(port_id, PortStatus::Open, checked)
                    .await
                {
                    log::warn!("Status update failed host={} port={}: {}", host_id, number, e);
                    summary.store_failures += 1;
                }
                broker.publish(Event::port_created(host_id, port_id, number, &fingerprint));
                broker.publish(Event::port_status(host_id, port_id, PortStatus::Open, checked));
            }
            Mutation::SetStatus {
                port_id,
                number,
                status,
                transition,
            } => {
                if transition {
                    summary.changed = true;
                    match status {
                        PortStatus::Open => summary.opened += 1,
                        PortStatus::Closed => summary.closed += 1,
                        PortStatus::Unknown => {}
                    }
                }
                if let Err(e) = store.update_port_status(port_id, status, checked).await {
                    log::warn!("Status update failed host={} port={}: {}", host_id, number, e);
                    summary.store_failures += 1;
                    continue;
                }
                broker.publish(Event::port_status(host_id, port_id, status, checked));
            }
            Mutation::SetFingerprint {
                port_id,
                fingerprint,
            } => {
                if let Err(e) = store.update_port_fingerprint(port_id, &fingerprint).await {
                    log::warn!("Fingerprint update failed host={} port_id={}: {}", host_id, port_id, e);
                    summary.store_failures += 1;
                }
            }
        }
    }

    summary
}
