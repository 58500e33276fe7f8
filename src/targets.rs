//! Target normalization and expansion
//!
//! Users register hosts with whatever they paste: bare names, URLs,
//! `host:port` pairs or bracketed IPv6 literals. [`normalize`] reduces that to
//! a canonical host string and [`build`] expands it into the probe target list
//! (the host itself followed by every address it resolves to).

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::IpAddr;

use crate::ScanError;

/// Reduce a raw address to its canonical, lower-cased host part
///
/// Returns `None` when nothing usable is left.
pub fn normalize(address: &str) -> Option<String> {
    let mut addr = address.trim();
    if addr.is_empty() {
        return None;
    }

    // scheme://
    if let Some(idx) = addr.find("://") {
        addr = &addr[idx + 3..];
    }
    addr = addr.trim();
    addr = addr.strip_prefix("//").unwrap_or(addr);

    // user:pass@
    if let Some(at) = addr.rfind('@') {
        addr = &addr[at + 1..];
    }

    // Trailing path, query or fragment
    if let Some(end) = addr.find(['/', '?', '#']) {
        addr = &addr[..end];
    }
    addr = addr.trim();

    // [::1]:443 and [::1]
    if addr.starts_with('[') {
        if let Some(end) = addr.find(']') {
            addr = &addr[1..end];
        }
    }

    // Only a single colon can be a port separator; more means bare IPv6
    if addr.matches(':').count() == 1 {
        if let Some((host, _port)) = addr.split_once(':') {
            addr = host;
        }
    }

    let normalized = addr
        .trim_matches(|c| c == '[' || c == ']' || c == ' ')
        .to_lowercase();

    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// True when the normalized target is a literal IPv4/IPv6 address
pub fn is_ip_literal(target: &str) -> bool {
    target.parse::<IpAddr>().is_ok()
}

/// Expand an address into its ordered, deduplicated probe targets
///
/// Host names are resolved through the system resolver; literal IPs are
/// returned as-is without any lookup.
pub async fn build(address: &str) -> crate::Result<Vec<String>> {
    build_with(address, system_lookup).await
}

/// [`build`] with an injectable resolver
pub async fn build_with<F, Fut>(address: &str, lookup: F) -> crate::Result<Vec<String>>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = io::Result<Vec<IpAddr>>>,
{
    let normalized = normalize(address)
        .ok_or_else(|| ScanError::InvalidTarget(format!("{:?}", address)))?;

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(4);
    seen.insert(normalized.clone());
    targets.push(normalized.clone());

    if !is_ip_literal(&normalized) {
        match lookup(normalized.clone()).await {
            Ok(ips) => {
                for ip in ips {
                    let ip = ip.to_string();
                    if seen.insert(ip.clone()) {
                        targets.push(ip);
                    }
                }
            }
            Err(e) => log::debug!("Could not resolve {}: {}", normalized, e),
        }
    }

    Ok(targets)
}

async fn system_lookup(host: String) -> io::Result<Vec<IpAddr>> {
    let addrs = tokio::net::lookup_host((host.as_str(), 0)).await?;
    Ok(addrs.map(|addr| addr.ip()).collect())
}
