//! Background scan scheduling
//!
//! [`ScanOrchestrator`] owns a bounded job queue and a fixed pool of workers.
//! Full-range jobs are gated by the host's scanning flag in the store, so at
//! most one runs per host; targeted jobs are not gated and may interleave
//! with a running full-range pass on the same host.
//!
//! Every job runs resolve, probe, reconcile, publish. A full-range job always
//! releases the host's scanning flag exactly once, whatever happened before.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::events::{Event, EventBroker};
use crate::probe::{OpenPorts, ProbeRequest, Prober};
use crate::reconcile::{self, Summary};
use crate::store::PortStore;
use crate::targets;
use crate::{Result, ScanError};

/// Slack past the probe deadline before a silent prober is abandoned
const PROBE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanJob {
    FullRange { host_id: i64 },
    Ports { host_id: i64, ports: Vec<u16> },
}

impl ScanJob {
    fn host_id(&self) -> i64 {
        match self {
            ScanJob::FullRange { host_id } | ScanJob::Ports { host_id, .. } => *host_id,
        }
    }
}

struct Inner {
    config: ScanConfig,
    store: Arc<dyn PortStore>,
    prober: Arc<dyn Prober>,
    broker: Arc<EventBroker>,
    sender: Mutex<Option<mpsc::Sender<ScanJob>>>,
    shutdown: CancellationToken,
}

/// Queue-backed scan scheduler with a fixed worker pool
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ScanOrchestrator {
    /// Start the worker pool; must be called from within a Tokio runtime
    pub fn new(
        config: ScanConfig,
        store: Arc<dyn PortStore>,
        prober: Arc<dyn Prober>,
        broker: Arc<EventBroker>,
    ) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let inner = Arc::new(Inner {
            config,
            store,
            prober,
            broker,
            sender: Mutex::new(Some(tx)),
            shutdown: CancellationToken::new(),
        });

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| tokio::spawn(worker(id, inner.clone(), rx.clone())))
            .collect();

        log::info!(
            "Scan orchestrator started with {} worker(s), queue capacity {}",
            workers,
            inner.config.queue_capacity()
        );

        Self {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Claim the host and queue a full-range scan
    ///
    /// Returns `Ok(false)` when a full-range scan of the host is already
    /// queued or running. After shutdown has begun the claim is released
    /// again and [`ScanError::ShuttingDown`] is returned.
    pub async fn schedule_full_range(&self, host_id: i64) -> Result<bool> {
        self.inner.schedule_full_range(host_id).await
    }

    /// Queue a scan of specific ports; duplicates are dropped, an empty list does nothing
    pub async fn schedule_ports(&self, host_id: i64, ports: Vec<u16>) {
        let mut seen = HashSet::new();
        let ports: Vec<u16> = ports.into_iter().filter(|p| seen.insert(*p)).collect();
        if ports.is_empty() {
            return;
        }

        let count = ports.len();
        match self.inner.enqueue(ScanJob::Ports { host_id, ports }).await {
            Ok(()) => log::debug!("Enqueued targeted scan host={} ports={}", host_id, count),
            Err(e) => log::debug!("Targeted scan for host={} not queued: {}", host_id, e),
        }
    }

    /// Sweep every host with a full-range scan once per `period`
    ///
    /// The first sweep happens one period from now. A zero period does nothing.
    pub fn start_periodic(&self, period: Duration) {
        if period.is_zero() {
            return;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => inner.sweep().await,
                }
            }
            log::debug!("Periodic sweep stopped");
        });

        log::info!("Periodic sweep every {:?}", period);
        self.handles.lock().push(handle);
    }

    /// Stop accepting jobs, drain the queue and wait for every worker
    ///
    /// Probes already running are not interrupted; they end at their own
    /// deadline.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.sender.lock().take();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Orchestrator task failed: {}", e);
            }
        }
        log::info!("Scan orchestrator stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.inner.broker
    }

    pub fn config(&self) -> &ScanConfig {
        &self.inner.config
    }
}

impl Drop for ScanOrchestrator {
    fn drop(&mut self) {
        // Let workers run out once the queue is empty even without close()
        self.inner.shutdown.cancel();
        self.inner.sender.lock().take();
    }
}

async fn worker(id: usize, inner: Arc<Inner>, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ScanJob>>>) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else { break };

        let host_id = job.host_id();
        let full_range = matches!(job, ScanJob::FullRange { .. });
        let released = Arc::new(AtomicBool::new(false));

        // A panicking job must not take the worker or the host's claim with it
        let task = {
            let inner = inner.clone();
            let released = released.clone();
            tokio::spawn(async move { inner.run(job, &released).await })
        };
        if let Err(e) = task.await {
            log::error!("Worker {} job for host={} aborted: {}", id, host_id, e);
            if full_range {
                inner.release_once(host_id, &released).await;
            }
        }
    }
    log::debug!("Worker {} exiting", id);
}

impl Inner {
    async fn schedule_full_range(&self, host_id: i64) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Err(ScanError::ShuttingDown);
        }
        if !self.store.begin_scan(host_id).await? {
            log::debug!("Host {} already scanning", host_id);
            return Ok(false);
        }

        let started = Utc::now();
        self.broker.publish(Event::scan_started(host_id, started));

        match self.enqueue(ScanJob::FullRange { host_id }).await {
            Ok(()) => {
                log::info!("Enqueued full scan for host={}", host_id);
                Ok(true)
            }
            Err(e) => {
                log::info!("Full scan for host={} dropped: {}", host_id, e);
                self.release(host_id).await;
                self.broker
                    .publish(Event::host_scanned(host_id, false, false, Utc::now()));
                Err(e)
            }
        }
    }

    /// Wait for room in the queue unless shutdown comes first
    async fn enqueue(&self, job: ScanJob) -> Result<()> {
        let sender = self.sender.lock().clone();
        let Some(tx) = sender else {
            return Err(ScanError::ShuttingDown);
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ScanError::ShuttingDown),
            sent = tx.send(job) => sent.map_err(|_| ScanError::ShuttingDown),
        }
    }

    async fn sweep(&self) {
        let hosts = match self.store.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                log::warn!("Periodic sweep could not list hosts: {}", e);
                return;
            }
        };

        log::debug!("Periodic sweep over {} host(s)", hosts.len());
        for host in hosts {
            match self.schedule_full_range(host.id).await {
                Ok(_) => {}
                Err(ScanError::ShuttingDown) => return,
                Err(e) => log::warn!("Periodic sweep skipped host={}: {}", host.id, e),
            }
        }
    }

    async fn run(&self, job: ScanJob, released: &AtomicBool) {
        match job {
            ScanJob::FullRange { host_id } => self.run_full_range(host_id, released).await,
            ScanJob::Ports { host_id, ports } => {
                if let Err(e) = self.scan_ports(host_id, &ports).await {
                    log::warn!("Targeted scan failed host={}: {}", host_id, e);
                }
            }
        }
    }

    async fn run_full_range(&self, host_id: i64, released: &AtomicBool) {
        let started = Instant::now();
        let outcome = self.scan_full_range(host_id).await;
        self.release_once(host_id, released).await;

        let (changed, success) = match outcome {
            Ok(summary) => {
                log::info!(
                    "Completed full scan host={} in {:?}: {} created, {} opened, {} closed",
                    host_id,
                    started.elapsed(),
                    summary.created,
                    summary.opened,
                    summary.closed
                );
                (summary.changed, true)
            }
            Err(e) => {
                log::warn!("Full scan failed host={} ({}): {}", host_id, e.kind(), e);
                (false, false)
            }
        };
        self.broker
            .publish(Event::host_scanned(host_id, changed, success, Utc::now()));
    }

    /// Release a running job's claim unless the job already did
    async fn release_once(&self, host_id: i64, released: &AtomicBool) {
        if !released.swap(true, Ordering::AcqRel) {
            self.release(host_id).await;
        }
    }

    async fn release(&self, host_id: i64) {
        if let Err(e) = self.store.end_scan(host_id).await {
            log::error!("Releasing scan flag failed host={}: {}", host_id, e);
        }
    }

    async fn scan_full_range(&self, host_id: i64) -> Result<Summary> {
        let host = self.store.get_host(host_id).await?;
        log::info!("Starting full scan host={} addr={}", host.id, host.address);

        let targets = targets::build(&host.address).await?;
        let found = self
            .probe(&targets, None, self.config.full_range_deadline())
            .await?;

        let existing = self.store.list_ports(host_id, true).await?;
        let plan = reconcile::plan_full_range(&existing, &found);
        Ok(reconcile::apply(self.store.as_ref(), &self.broker, host_id, plan, Utc::now()).await)
    }

    async fn scan_ports(&self, host_id: i64, ports: &[u16]) -> Result<Summary> {
        let host = self.store.get_host(host_id).await?;
        let targets = targets::build(&host.address).await?;
        let found = self
            .probe(&targets, Some(ports), self.config.targeted_deadline())
            .await?;

        let existing = self.store.list_ports(host_id, true).await?;
        let plan = reconcile::plan_targeted(&existing, ports, &found);
        Ok(reconcile::apply(self.store.as_ref(), &self.broker, host_id, plan, Utc::now()).await)
    }

    async fn probe(&self, targets: &[String], ports: Option<&[u16]>, window: Duration) -> Result<OpenPorts> {
        let request = ProbeRequest {
            targets,
            ports,
            deadline: Instant::now() + window,
        };
        log::debug!(
            "Probing {} port(s) on {:?} within {:?}",
            request.port_count(),
            targets,
            window
        );
        timeout(window + PROBE_GRACE, self.prober.probe(request)).await?
    }
}
