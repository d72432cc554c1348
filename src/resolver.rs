//! Address resolution
//!
//! Wraps the system resolver into an ordered list of candidate socket
//! addresses. The order is the resolver's preference order; the
//! establishment loop walks it without reordering.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::Family;
use crate::QanatError;

/// Resolve a host/port pair into candidate addresses for `family`.
///
/// With `numeric` set, only literal addresses are accepted and no name
/// lookup is performed. A missing host in `passive` (listen) mode binds
/// the wildcard; an unspecified family then defaults to IPv4, matching
/// netcat's listen behavior.
pub async fn resolve(
    host: Option<&str>,
    port: u16,
    family: Family,
    numeric: bool,
    passive: bool,
) -> Result<Vec<SocketAddr>, QanatError> {
    let host = match host {
        Some(h) => h,
        None => {
            if !passive {
                return Err(QanatError::ResolutionFailed("no host to resolve".to_string()));
            }
            return Ok(vec![SocketAddr::new(wildcard(family), port)]);
        }
    };

    if numeric {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| QanatError::ResolutionFailed(format!("{host}: not a numeric address")))?;
        if !family_matches(family, &ip) {
            return Err(QanatError::ResolutionFailed(format!(
                "{host}: wrong address family"
            )));
        }
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| QanatError::ResolutionFailed(format!("{host}: {e}")))?
        .filter(|a| family_matches(family, &a.ip()))
        .collect();

    if addrs.is_empty() {
        return Err(QanatError::ResolutionFailed(format!(
            "{host}: no addresses for requested family"
        )));
    }
    Ok(addrs)
}

fn wildcard(family: Family) -> IpAddr {
    match family {
        Family::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        // Unspecified defaults to the IPv4 wildcard for listening.
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

fn family_matches(family: Family, ip: &IpAddr) -> bool {
    match family {
        Family::Ipv4 => ip.is_ipv4(),
        Family::Ipv6 => ip.is_ipv6(),
        Family::Unspecified => true,
        Family::Unix => false,
    }
}
