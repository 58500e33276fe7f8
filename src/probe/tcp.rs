//! TCP connect prober

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};

use super::{record_open, OpenPorts, ProbeRequest, Prober, RateLimiter, ServiceInfo, FULL_RANGE};
use crate::config::ScanConfig;
use crate::error::retry_delay;
use crate::fingerprint;
use crate::ScanError;

/// Upper bound on how long an open port is given to send its greeting
const BANNER_WAIT: Duration = Duration::from_millis(800);

/// Full TCP handshake prober with bounded concurrency and pacing
#[derive(Debug, Clone)]
pub struct TcpConnectProber {
    timeout: Duration,
    retries: u32,
    rate: u64,
    concurrency: usize,
    service_discovery: bool,
}

impl TcpConnectProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retries: 1,
            rate: 0,
            concurrency: 256,
            service_discovery: false,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            timeout: config.timeout_duration(),
            retries: config.retries,
            rate: config.rate,
            concurrency: config.probe_concurrency.max(1),
            service_discovery: config.service_discovery,
        }
    }

    pub fn with_service_discovery(mut self, enabled: bool) -> Self {
        self.service_discovery = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Connect once per attempt; a refusal is final, a timeout is retried
    async fn connect(&self, addr: SocketAddr) -> Option<TcpStream> {
        for attempt in 0..=self.retries {
            match timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Some(stream),
                Ok(Err(_)) => return None,
                Err(_) if attempt < self.retries => {
                    tokio::time::sleep(retry_delay(
                        Duration::from_millis(50),
                        attempt,
                        Duration::from_millis(500),
                    ))
                    .await;
                }
                Err(_) => {}
            }
        }
        None
    }

    async fn probe_port(&self, addr: SocketAddr) -> Option<Option<ServiceInfo>> {
        let mut stream = self.connect(addr).await?;
        if !self.service_discovery {
            return Some(None);
        }

        let mut buf = [0u8; 512];
        let wait = std::cmp::min(self.timeout, BANNER_WAIT);
        let info = match timeout(wait, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => fingerprint::parse_banner(&String::from_utf8_lossy(&buf[..n])),
            _ => None,
        };
        Some(info)
    }
}

#[async_trait]
impl Prober for TcpConnectProber {
    async fn probe(&self, request: ProbeRequest<'_>) -> crate::Result<OpenPorts> {
        let ips: Vec<IpAddr> = request
            .targets
            .iter()
            .filter_map(|t| t.parse::<IpAddr>().ok())
            .collect();
        if ips.is_empty() {
            return Err(ScanError::ProbeError(format!(
                "no resolvable address among targets {:?}",
                request.targets
            )));
        }

        let ports: Vec<u16> = match request.ports {
            Some(ports) => ports.to_vec(),
            None => FULL_RANGE.collect(),
        };
        let mut found = OpenPorts::new();
        if ports.is_empty() {
            return Ok(found);
        }

        log::debug!(
            "Probing {} ports on {} address(es) with concurrency {}",
            ports.len(),
            ips.len(),
            self.concurrency
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<(u16, Option<ServiceInfo>)>();
        let prober = self.clone();
        let dispatcher = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(prober.concurrency));
            let mut limiter = RateLimiter::new(prober.rate);
            let mut tasks = JoinSet::new();

            for ip in ips {
                for &port in &ports {
                    limiter.acquire().await;
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let tx = tx.clone();
                    let prober = prober.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Some(info) = prober.probe_port(SocketAddr::new(ip, port)).await {
                            let _ = tx.send((port, info));
                        }
                    });

                    // Reap finished tasks so the set stays small
                    while tasks.try_join_next().is_some() {}
                }
            }

            drop(tx);
            while tasks.join_next().await.is_some() {}
        });

        let deadline = sleep_until(request.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some((port, info)) => record_open(&mut found, port, info),
                    None => break,
                },
                _ = &mut deadline => {
                    log::warn!(
                        "Probe deadline reached, returning {} open port(s) collected so far",
                        found.len()
                    );
                    break;
                }
            }
        }

        // Aborting the dispatcher drops its JoinSet, which aborts outstanding connects
        dispatcher.abort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn request<'a>(targets: &'a [String], ports: Option<&'a [u16]>, secs: u64) -> ProbeRequest<'a> {
        ProbeRequest {
            targets,
            ports,
            deadline: Instant::now() + Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn test_finds_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {}
        });

        // Bind and drop to get a port that is very likely closed
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let prober = TcpConnectProber::new(Duration::from_millis(500));
        let targets = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        let ports = [open, closed];
        let found = prober.probe(request(&targets, Some(&ports), 5)).await.unwrap();

        assert!(found.contains_key(&open));
        assert!(!found.contains_key(&closed));
    }

    #[tokio::test]
    async fn test_reads_banner_when_enabled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
            }
        });

        let prober = TcpConnectProber::new(Duration::from_millis(500)).with_service_discovery(true);
        let targets = vec!["127.0.0.1".to_string()];
        let ports = [port];
        let found = prober.probe(request(&targets, Some(&ports), 5)).await.unwrap();

        let info = found[&port].as_ref().unwrap();
        assert_eq!(info.product.as_deref(), Some("OpenSSH"));
        assert_eq!(info.version.as_deref(), Some("9.6"));
    }

    #[tokio::test]
    async fn test_fails_without_ip_targets() {
        let prober = TcpConnectProber::new(Duration::from_millis(100));
        let targets = vec!["only-a-name.invalid".to_string()];
        let err = prober.probe(request(&targets, None, 1)).await.unwrap_err();
        assert!(matches!(err, ScanError::ProbeError(_)));
    }

    #[tokio::test]
    async fn test_deadline_returns_partial_results() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {}
        });

        // Pace to one connect per second so only the first port fits the deadline
        let prober = TcpConnectProber {
            rate: 1,
            ..TcpConnectProber::new(Duration::from_millis(200))
        };
        let targets = vec!["127.0.0.1".to_string()];
        let ports: Vec<u16> = std::iter::once(open).chain(40000..40010).collect();

        let started = Instant::now();
        let found = prober
            .probe(ProbeRequest {
                targets: &targets,
                ports: Some(&ports),
                deadline: Instant::now() + Duration::from_millis(700),
            })
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(found.contains_key(&open));
    }
}
