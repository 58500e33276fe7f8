//! Service labels for ports
//!
//! A port's fingerprint comes from probe metadata when the prober saw a
//! service, otherwise from the static well-known port table.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::probe::ServiceInfo;

/// Label used when neither metadata nor the static table know the port
pub const UNKNOWN_SERVICE: &str = "unknown";

static WELL_KNOWN: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    [
        (20, "ftp-data"),
        (21, "ftp"),
        (22, "ssh"),
        (23, "telnet"),
        (25, "smtp"),
        (53, "dns"),
        (67, "dhcp"),
        (69, "tftp"),
        (80, "http"),
        (88, "kerberos"),
        (110, "pop3"),
        (111, "rpcbind"),
        (123, "ntp"),
        (135, "msrpc"),
        (137, "netbios-ns"),
        (139, "netbios-ssn"),
        (143, "imap"),
        (161, "snmp"),
        (389, "ldap"),
        (443, "https"),
        (445, "microsoft-ds"),
        (465, "smtps"),
        (514, "syslog"),
        (515, "printer"),
        (587, "submission"),
        (631, "ipp"),
        (636, "ldaps"),
        (873, "rsync"),
        (993, "imaps"),
        (995, "pop3s"),
        (1080, "socks"),
        (1194, "openvpn"),
        (1433, "mssql"),
        (1521, "oracle"),
        (1723, "pptp"),
        (1883, "mqtt"),
        (2049, "nfs"),
        (2375, "docker"),
        (2376, "docker-tls"),
        (3000, "grafana"),
        (3128, "squid-http"),
        (3306, "mysql"),
        (3389, "rdp"),
        (5000, "upnp"),
        (5060, "sip"),
        (5353, "mdns"),
        (5432, "postgresql"),
        (5672, "amqp"),
        (5900, "vnc"),
        (5984, "couchdb"),
        (6379, "redis"),
        (6443, "kubernetes-api"),
        (8000, "http-alt"),
        (8080, "http-proxy"),
        (8443, "https-alt"),
        (8883, "mqtt-tls"),
        (9000, "cslistener"),
        (9090, "prometheus"),
        (9092, "kafka"),
        (9100, "jetdirect"),
        (9200, "elasticsearch"),
        (11211, "memcached"),
        (27017, "mongodb"),
    ]
    .into_iter()
    .collect()
});

/// Conventional service name for a port number
pub fn name_for_port(port: u16) -> Option<&'static str> {
    WELL_KNOWN.get(&port).copied()
}

/// Human-readable label derived from probe metadata
///
/// Prefers "product version", then product, then the service name.
pub fn service_label(info: &ServiceInfo) -> Option<String> {
    let product = info.product.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let version = info.version.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let name = info.name.as_deref().map(str::trim).filter(|s| !s.is_empty());

    match (product, version, name) {
        (Some(product), Some(version), _) => Some(format!("{} {}", product, version)),
        (Some(product), None, _) => Some(product.to_string()),
        (None, _, Some(name)) => Some(name.to_string()),
        _ => None,
    }
}

/// Fingerprint for a newly discovered port: metadata, then the static table, then [`UNKNOWN_SERVICE`]
pub fn label_for(port: u16, info: Option<&ServiceInfo>) -> String {
    info.and_then(service_label)
        .or_else(|| name_for_port(port).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_SERVICE.to_string())
}

struct BannerPattern {
    regex: Regex,
    name: &'static str,
    product: &'static str,
}

static BANNER_PATTERNS: Lazy<Vec<BannerPattern>> = Lazy::new(|| {
    let patterns: [(&str, &str, &str); 9] = [
        (r"SSH-[\d.]+-OpenSSH_([\w.\-]+)", "ssh", "OpenSSH"),
        (r"SSH-[\d.]+-dropbear_([\w.\-]+)", "ssh", "Dropbear"),
        (r"(?i)vsftpd ([\d.]+)", "ftp", "vsftpd"),
        (r"ProFTPD ([\d.]+[\w\-]*)", "ftp", "ProFTPD"),
        (r"(?i)pure-ftpd", "ftp", "Pure-FTPd"),
        (r"ESMTP Postfix", "smtp", "Postfix"),
        (r"ESMTP Exim ([\d.]+)", "smtp", "Exim"),
        (r"Dovecot", "imap", "Dovecot"),
        (r"([\d.]+)-MariaDB", "mysql", "MariaDB"),
    ];

    patterns
        .iter()
        .filter_map(|&(pattern, name, product)| {
            Regex::new(pattern).ok().map(|regex| BannerPattern {
                regex,
                name,
                product,
            })
        })
        .collect()
});

/// Extract service metadata from a greeting banner
pub fn parse_banner(banner: &str) -> Option<ServiceInfo> {
    let banner = banner.trim();
    if banner.is_empty() {
        return None;
    }

    for pattern in BANNER_PATTERNS.iter() {
        if let Some(captures) = pattern.regex.captures(banner) {
            return Some(ServiceInfo {
                name: Some(pattern.name.to_string()),
                product: Some(pattern.product.to_string()),
                version: captures.get(1).map(|m| m.as_str().to_string()),
            });
        }
    }

    // Generic SSH greeting without a recognised implementation
    if banner.starts_with("SSH-") {
        return Some(ServiceInfo {
            name: Some("ssh".to_string()),
            ..Default::default()
        });
    }

    None
}
