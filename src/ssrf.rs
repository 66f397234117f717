//! SSRF protection shared by the `fetch` block handler and the sandbox's
//! in-script `fetch` binding (spec §4.8).

use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use url::Url;

use crate::error::WorkflowError;

/// Reject the URL's host if it resolves to localhost, `.local`, or any
/// private/loopback/link-local address range. Returns `Ok(())` if the
/// request may proceed.
pub fn check_url(raw_url: &str) -> Result<Url, WorkflowError> {
    let url = Url::parse(raw_url).map_err(|e| WorkflowError::Validation(format!("invalid URL: {e}")))?;
    let host = url.host_str().ok_or_else(|| WorkflowError::Validation("URL has no host".to_string()))?;

    let host_trimmed = host.trim_start_matches('[').trim_end_matches(']');

    if host_trimmed.eq_ignore_ascii_case("localhost") || host_trimmed.to_ascii_lowercase().ends_with(".local") {
        return Err(WorkflowError::Policy(format!("SSRF: host '{host}' is blocked (localhost/.local)")));
    }

    if let Ok(ip) = IpAddr::from_str(host_trimmed) {
        if is_blocked_ip(ip) {
            return Err(WorkflowError::Policy(format!("SSRF: host '{host}' resolves to a blocked address range")));
        }
    }

    Ok(url)
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    const BLOCKED: &[&str] = &[
        "127.0.0.0/8",    // loopback
        "10.0.0.0/8",     // RFC1918
        "172.16.0.0/12",  // RFC1918
        "192.168.0.0/16", // RFC1918
        "169.254.0.0/16", // link-local
        "0.0.0.0/8",      // "this network"
    ];
    BLOCKED.iter().any(|cidr| {
        Ipv4Net::from_str(cidr)
            .map(|net| net.contains(&ip))
            .unwrap_or(false)
    })
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if ip == Ipv6Addr::LOCALHOST {
        return true;
    }
    const BLOCKED: &[&str] = &[
        "fc00::/7", // unique-local
        "fe80::/10", // link-local
    ];
    BLOCKED.iter().any(|cidr| {
        Ipv6Net::from_str(cidr)
            .map(|net| net.contains(&ip))
            .unwrap_or(false)
    })
}
