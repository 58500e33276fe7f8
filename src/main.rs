use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;

use portnote::{
    config::parse_duration,
    events::sse_frame,
    Event, EventBroker, MemoryStore, PortStatus, PortStore, ScanConfig, ScanError, ScanOrchestrator,
    TcpConnectProber,
};

fn cli() -> Command {
    Command::new("portnote")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Keep a port inventory in sync with live scans")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("watch")
                .about("Scan registered hosts in the background and stream changes as server-sent events")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("TOML configuration file (defaults to ~/.portnote.toml)"),
                )
                .arg(
                    Arg::new("host")
                        .long("host")
                        .value_name("ADDR")
                        .help("Register a host before watching (repeatable)")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("interval")
                        .short('i')
                        .long("interval")
                        .value_name("DURATION")
                        .help("Periodic sweep interval, e.g. 30m or 3600 (seconds)"),
                ),
        )
        .subcommand(
            Command::new("scan")
                .about("Scan one address now and print its open ports")
                .arg(
                    Arg::new("address")
                        .value_name("ADDR")
                        .help("Host name, IP address or URL to scan")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("ports")
                        .short('p')
                        .long("ports")
                        .value_name("PORTS")
                        .help("Comma separated ports to check instead of the full range")
                        .value_delimiter(',')
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .value_name("MS")
                        .help("Per-port connect timeout in milliseconds")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<ScanConfig> {
    let config = match matches.get_one::<String>("config") {
        Some(path) => ScanConfig::from_toml_file(path)?,
        None => ScanConfig::load_default_config(),
    };
    let mut config = config.apply_env();

    if let Some(value) = matches.get_one::<String>("interval") {
        let interval = parse_duration(value)
            .with_context(|| format!("invalid interval '{}'", value))?;
        config = config.with_sweep_interval(interval)?;
    }

    config.validate()?;
    Ok(config)
}

/// Find a host by name or address, registering it when unknown
///
/// A newly registered host is announced with a `host_created` event.
async fn ensure_host(store: &MemoryStore, broker: &EventBroker, address: &str) -> anyhow::Result<i64> {
    let canonical = portnote::targets::normalize(address)
        .with_context(|| format!("invalid address '{}'", address))?;

    let hosts = store.list_hosts().await?;
    if let Some(host) = hosts
        .iter()
        .find(|h| h.name == address || h.address == canonical)
    {
        return Ok(host.id);
    }

    match store.create_host(address, address) {
        Ok(id) => {
            log::info!("Registered host {} ({})", address, canonical);
            broker.publish(Event::host_created(id, address, address));
            Ok(id)
        }
        Err(ScanError::DuplicateHost(name)) => anyhow::bail!("host name '{}' is taken", name),
        Err(e) => Err(e.into()),
    }
}

async fn watch(matches: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(matches)?;
    let store = Arc::new(
        MemoryStore::load_snapshot(&config.snapshot_path)
            .with_context(|| format!("loading {}", config.snapshot_path.display()))?,
    );

    let broker = Arc::new(EventBroker::with_buffer(config.subscriber_buffer));
    let mut events = broker.subscribe();

    if let Some(addresses) = matches.get_many::<String>("host") {
        for address in addresses {
            ensure_host(&store, &broker, address).await?;
        }
    }
    let prober = Arc::new(TcpConnectProber::from_config(&config));
    let orchestrator = ScanOrchestrator::new(config.clone(), store.clone(), prober, broker);

    let hosts = store.list_hosts().await?;
    eprintln!(
        "{} {} host(s), {} worker(s)",
        "[~] Watching".bright_blue(),
        hosts.len().to_string().bright_cyan().bold(),
        config.workers
    );
    for host in &hosts {
        if let Err(e) = orchestrator.schedule_full_range(host.id).await {
            log::warn!("Initial scan of {} not scheduled: {}", host.name, e);
        }
    }
    if let Some(interval) = config.sweep_interval() {
        orchestrator.start_periodic(interval);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(data) => print!("{}", sse_frame(&data)),
                None => break,
            },
        }
    }

    eprintln!("{}", "[~] Shutting down, waiting for queued scans".bright_blue());
    orchestrator.close().await;
    store
        .save_snapshot(&config.snapshot_path)
        .with_context(|| format!("saving {}", config.snapshot_path.display()))?;
    eprintln!(
        "{} {}",
        "[✓] Inventory saved to".bright_green(),
        config.snapshot_path.display().to_string().bright_yellow()
    );
    Ok(())
}

async fn scan(matches: &ArgMatches) -> anyhow::Result<()> {
    let mut config = ScanConfig::load_default_config().apply_env().with_workers(1);
    if let Some(&ms) = matches.get_one::<u64>("timeout") {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    config.validate()?;

    let address = matches
        .get_one::<String>("address")
        .context("missing address")?;
    let ports: Vec<u16> = matches
        .get_many::<u16>("ports")
        .map(|ports| ports.copied().collect())
        .unwrap_or_default();

    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(EventBroker::new());
    let host_id = ensure_host(&store, &broker, address).await?;
    let prober = Arc::new(TcpConnectProber::from_config(&config));
    let orchestrator = ScanOrchestrator::new(config, store.clone(), prober, broker);

    if ports.is_empty() {
        eprintln!("{} {} (all ports)", "[~] Scanning".bright_blue(), address.bright_yellow());
        orchestrator.schedule_full_range(host_id).await?;
    } else {
        for &number in &ports {
            if store.find_port_by_number(host_id, number).is_none() {
                store.create_port(host_id, number, "", "").await?;
            }
        }
        eprintln!(
            "{} {} ({} port(s))",
            "[~] Scanning".bright_blue(),
            address.bright_yellow(),
            ports.len()
        );
        orchestrator.schedule_ports(host_id, ports.clone()).await;
    }
    orchestrator.close().await;

    let host = store.get_host(host_id).await?;
    let mut rows = store.list_ports(host_id, true).await?;
    if ports.is_empty() {
        rows.retain(|p| p.is_open());
    }

    println!("\nPort report for {} ({})", host.name.bright_cyan(), host.address);
    if rows.is_empty() {
        println!("{}", "No open ports found".bright_yellow());
        return Ok(());
    }

    println!(
        "{:<10} {:<8} {}",
        "PORT".bright_white().bold(),
        "STATE".bright_white().bold(),
        "SERVICE".bright_white().bold()
    );
    for port in rows {
        let state = match port.status {
            PortStatus::Open => "open".bright_green(),
            PortStatus::Closed => "closed".bright_red(),
            PortStatus::Unknown => "unknown".bright_yellow(),
        };
        let service = if port.fingerprint.is_empty() {
            portnote::fingerprint::label_for(port.number, None)
        } else {
            port.fingerprint.clone()
        };
        println!(
            "{:<10} {:<8} {}",
            format!("{}/tcp", port.number).bright_white(),
            state,
            service.bright_yellow()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("watch", sub)) => watch(sub).await,
        Some(("scan", sub)) => scan(sub).await,
        _ => unreachable!("subcommand is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portnote::EventKind;

    #[test]
    fn test_cli_definition() {
        cli().debug_assert();
    }

    #[test]
    fn test_scan_ports_parse() {
        let matches = cli()
            .try_get_matches_from(["portnote", "scan", "example.com", "--ports", "22,80,443"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let ports: Vec<u16> = sub.get_many::<u16>("ports").unwrap().copied().collect();
        assert_eq!(ports, vec![22, 80, 443]);
    }

    #[test]
    fn test_watch_repeated_hosts() {
        let matches = cli()
            .try_get_matches_from([
                "portnote", "watch", "--host", "10.0.0.1", "--host", "db.lan", "-i", "30m",
            ])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let hosts: Vec<&String> = sub.get_many::<String>("host").unwrap().collect();
        assert_eq!(hosts.len(), 2);
        assert_eq!(sub.get_one::<String>("interval").map(String::as_str), Some("30m"));
    }

    #[tokio::test]
    async fn test_registered_host_is_announced() {
        let store = MemoryStore::new();
        let broker = EventBroker::new();
        let mut events = broker.subscribe();

        let id = ensure_host(&store, &broker, "NAS.lan").await.unwrap();
        let data = events.try_recv().expect("host_created published");
        let event: Event = serde_json::from_str(&data).unwrap();
        assert_eq!(event.kind, EventKind::HostCreated);
        assert_eq!(event.host_id, Some(id));
        assert_eq!(event.payload.unwrap()["address"], "NAS.lan");

        // Known hosts are matched by name or canonical address without a new event
        assert_eq!(ensure_host(&store, &broker, "NAS.lan").await.unwrap(), id);
        assert_eq!(ensure_host(&store, &broker, "http://nas.lan:5000/").await.unwrap(), id);
        assert!(events.try_recv().is_none());
    }
}
