//! Route and Record-Route handling for the proxy's own entries.

use std::net::IpAddr;

use rsip::{Headers, Request, Uri};
use tracing::{debug, trace};

use crate::net::{HostResolver, format_ip_for_sip};
use crate::sip::compare::{host_text, port_of};
use crate::sip::message::{
    parse_name_addr, record_route_values, replace_name_addr_uri, route_values, set_record_routes,
    set_routes, uri_text,
};

/// Addresses under which this proxy is reachable.
#[derive(Debug, Clone)]
pub struct LocalAddresses {
    pub ips: Vec<IpAddr>,
    pub domains: Vec<String>,
    pub port: u16,
}

impl LocalAddresses {
    pub fn is_local_host(&self, host: &str, resolver: &HostResolver) -> bool {
        if self
            .domains
            .iter()
            .any(|domain| domain.eq_ignore_ascii_case(host))
        {
            return true;
        }
        resolver
            .cached(host)
            .is_some_and(|ip| self.ips.contains(&ip))
    }

    /// True when `uri` names one of our interfaces on the listen port.
    pub fn is_self(&self, uri: &Uri, resolver: &HostResolver) -> bool {
        port_of(uri) == self.port
            && self.is_local_host(&host_text(&uri.host_with_port.host), resolver)
    }
}

/// Removes Route entries pointing at ourselves from the head and the tail of
/// the Route list. Returns the number of removed entries.
pub fn preprocess(headers: &mut Headers, local: &LocalAddresses, resolver: &HostResolver) -> usize {
    let mut routes = route_values(headers);
    let before = routes.len();
    let points_here = |value: &String| {
        parse_name_addr(value).is_some_and(|uri| local.is_self(&uri, resolver))
    };

    if routes.first().is_some_and(points_here) {
        let removed = routes.remove(0);
        trace!(route = %removed, "removed own route at head");
    }
    if routes.last().is_some_and(points_here) {
        let removed = routes.pop();
        trace!(route = ?removed, "removed own route at tail");
    }

    let removed = before - routes.len();
    if removed > 0 {
        set_routes(headers, &routes);
    }
    removed
}

pub fn is_loose_route(value: &str) -> bool {
    uri_text(value).is_some_and(|uri| {
        uri.split(';').skip(1).any(|param| {
            let name = param.split('=').next().unwrap_or("").trim();
            name.eq_ignore_ascii_case("lr")
        })
    })
}

/// Strict-routing interop: when the first Route lacks `lr`, it becomes the
/// Request-URI and the old Request-URI is appended to the Route list.
pub fn postprocess(request: &mut Request) -> bool {
    let mut routes = route_values(&request.headers);
    let Some(first) = routes.first() else {
        return false;
    };
    if is_loose_route(first) {
        return false;
    }
    let Some(next_uri) = parse_name_addr(first) else {
        return false;
    };
    routes.remove(0);
    routes.push(format!("<{}>", request.uri));
    debug!(old_uri = %request.uri, new_uri = %next_uri, "strict routing: promoting first route");
    request.uri = next_uri;
    set_routes(&mut request.headers, &routes);
    true
}

pub fn first_route(headers: &Headers) -> Option<Uri> {
    route_values(headers)
        .first()
        .and_then(|value| parse_name_addr(value))
}

pub fn record_route_value(ip: IpAddr, port: u16) -> String {
    format!("<sip:{}:{};lr>", format_ip_for_sip(&ip), port)
}

pub fn add_record_route(headers: &mut Headers, ip: IpAddr, port: u16) {
    let mut routes = record_route_values(headers);
    routes.insert(0, record_route_value(ip, port));
    set_record_routes(headers, &routes);
}

/// Points our own Record-Route entries at `ip`, the interface facing the
/// response's destination.
pub fn fix_record_route(
    headers: &mut Headers,
    local: &LocalAddresses,
    ip: IpAddr,
    resolver: &HostResolver,
) -> usize {
    let mut routes = record_route_values(headers);
    let mut changed = 0;
    for value in routes.iter_mut() {
        let Some(mut uri) = parse_name_addr(value) else {
            continue;
        };
        if !local.is_self(&uri, resolver) {
            continue;
        }
        uri.host_with_port.host = rsip::host_with_port::Host::IpAddr(ip);
        *value = replace_name_addr_uri(value, &uri);
        changed += 1;
    }
    if changed > 0 {
        set_record_routes(headers, &routes);
    }
    changed
}
