//! Identity comparison of SIP URIs and Call-IDs.

use std::fmt;
use std::net::IpAddr;

use rsip::host_with_port::Host;
use rsip::{Scheme, Uri};

use crate::config::DEFAULT_SIP_PORT;
use crate::net::HostResolver;

/// Maximum stored length of each Call-ID component and of client ids.
pub const MAX_ID_LEN: usize = 64;

/// Compares scheme, user part and host; ports are not considered.
///
/// Hosts are equal when they match textually (case-insensitive) or when both
/// resolve to the same address through the resolver cache.
pub fn compare_url(a: &Uri, b: &Uri, resolver: &HostResolver) -> bool {
    scheme_of(a) == scheme_of(b) && user_of(a) == user_of(b) && same_host(a, b, resolver)
}

/// As [`compare_url`], additionally requiring equal ports (absent = 5060).
pub fn compare_url_strict(a: &Uri, b: &Uri, resolver: &HostResolver) -> bool {
    compare_url(a, b, resolver) && port_of(a) == port_of(b)
}

/// As [`compare_url`], also accepting `b` when its host is the address
/// `a`'s host resolved to when `a` was stored.
pub fn compare_url_pinned(
    a: &Uri,
    pinned: Option<IpAddr>,
    b: &Uri,
    resolver: &HostResolver,
) -> bool {
    if compare_url(a, b, resolver) {
        return true;
    }
    pinned.is_some_and(|ip| {
        scheme_of(a) == scheme_of(b)
            && user_of(a) == user_of(b)
            && resolver.cached(&host_text(&b.host_with_port.host)) == Some(ip)
    })
}

fn scheme_of(uri: &Uri) -> Scheme {
    uri.scheme.clone().unwrap_or(Scheme::Sip)
}

fn user_of(uri: &Uri) -> Option<&str> {
    uri.auth.as_ref().map(|auth| auth.user.as_str())
}

pub fn port_of(uri: &Uri) -> u16 {
    uri.host_with_port
        .port
        .as_ref()
        .map(|port| *port.value())
        .unwrap_or(DEFAULT_SIP_PORT)
}

pub fn host_text(host: &Host) -> String {
    match host {
        Host::Domain(domain) => domain.to_string(),
        Host::IpAddr(ip) => ip.to_string(),
    }
}

fn same_host(a: &Uri, b: &Uri, resolver: &HostResolver) -> bool {
    let host_a = host_text(&a.host_with_port.host);
    let host_b = host_text(&b.host_with_port.host);
    if host_a.eq_ignore_ascii_case(&host_b) {
        return true;
    }
    match (resolver.cached(&host_a), resolver.cached(&host_b)) {
        (Some(ip_a), Some(ip_b)) => ip_a == ip_b,
        _ => false,
    }
}

/// Call-ID split at the first `@`; each part truncated to [`MAX_ID_LEN`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CallId {
    pub number: String,
    pub host: String,
}

impl CallId {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        let (number, host) = value.split_once('@').unwrap_or((value, ""));
        Self {
            number: truncate(number),
            host: truncate(host),
        }
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.is_empty() {
            f.write_str(&self.number)
        } else {
            write!(f, "{}@{}", self.number, self.host)
        }
    }
}

pub fn compare_call_id(a: &CallId, b: &CallId) -> bool {
    a.number == b.number && a.host == b.host
}

pub fn truncate(value: &str) -> String {
    match value.char_indices().nth(MAX_ID_LEN) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
