use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

#[cfg(any(target_os = "linux", target_os = "android"))]
use std::ffi::CString;
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::os::fd::AsRawFd;

/// Configure `SO_BINDTODEVICE` for a socket when an interface is provided.
///
/// On Linux/Android this uses `setsockopt` to constrain the socket to the
/// supplied interface. Other platforms return an error indicating that the
/// behaviour is unsupported so callers can surface a clear configuration issue.
pub fn bind_to_device(socket: &Socket, interface: &str) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let c_iface = CString::new(interface.as_bytes()).map_err(|_| {
            Error::configuration(format!(
                "interface name contains interior NUL bytes: {interface}"
            ))
        })?;
        // Safety: we pass a valid pointer and length from the CString that
        // remains alive for the duration of the call.
        let result = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                c_iface.as_ptr() as *const libc::c_void,
                c_iface.as_bytes_with_nul().len() as libc::socklen_t,
            )
        };
        if result != 0 {
            let io_err = std::io::Error::last_os_error();
            return Err(Error::configuration(format!(
                "failed to bind socket to interface {interface}: {io_err}"
            )));
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        Err(Error::configuration(format!(
            "interface binding not supported on this platform ({interface})"
        )))
    }
}

/// Marks outgoing datagrams with a DSCP code point (`dscp` 0 leaves the
/// socket untouched).
pub fn set_dscp(socket: &Socket, dscp: u8) -> Result<()> {
    if dscp == 0 {
        return Ok(());
    }
    if dscp > 63 {
        return Err(Error::configuration(format!("invalid DSCP value {dscp}")));
    }
    match socket.domain()? {
        domain if domain == Domain::IPV4 => {
            socket.set_tos(u32::from(dscp) << 2)?;
        }
        _ => debug!(dscp, "DSCP marking only applied to IPv4 sockets"),
    }
    Ok(())
}

/// Creates a non-blocking UDP socket bound to `addr`.
pub fn bind_udp_socket(
    addr: SocketAddr,
    interface: Option<&str>,
    dscp: u8,
) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if let Some(iface) = interface {
        bind_to_device(&socket, iface)?;
    }
    if let Err(err) = set_dscp(&socket, dscp) {
        warn!(%addr, dscp, error = %err, "failed to apply DSCP marking");
    }

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Host name resolution with an explicit timeout and a TTL cache.
///
/// Classification code only ever consults [`HostResolver::cached`], so a slow
/// DNS server can never stall message matching.
#[derive(Debug)]
pub struct HostResolver {
    timeout: Duration,
    ttl: Duration,
    cache: Mutex<HashMap<String, (IpAddr, Instant)>>,
}

impl HostResolver {
    pub fn new(timeout: Duration, ttl: Duration) -> Self {
        Self {
            timeout,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// IP literal or unexpired cache entry, without touching the network.
    pub fn cached(&self, host: &str) -> Option<IpAddr> {
        if let Some(ip) = parse_ip_literal(host) {
            return Some(ip);
        }
        let key = host.to_ascii_lowercase();
        let guard = self.cache.lock().ok()?;
        guard
            .get(&key)
            .filter(|(_, stored)| stored.elapsed() < self.ttl)
            .map(|(ip, _)| *ip)
    }

    /// Stores a lookup result, dropping entries whose TTL has passed.
    pub fn insert(&self, host: &str, ip: IpAddr) {
        if let Ok(mut guard) = self.cache.lock() {
            guard.retain(|_, (_, stored)| stored.elapsed() < self.ttl);
            guard.insert(host.to_ascii_lowercase(), (ip, Instant::now()));
        }
    }

    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Some(ip) = self.cached(host) {
            return Ok(ip);
        }

        let lookup = tokio::net::lookup_host((host, 0u16));
        let addrs = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(addrs)) => addrs.collect::<Vec<_>>(),
            Ok(Err(err)) => {
                debug!(host, error = %err, "host lookup failed");
                return Err(Error::UnresolvableHost(host.to_string()));
            }
            Err(_) => {
                warn!(host, timeout_ms = self.timeout.as_millis() as u64, "host lookup timed out");
                return Err(Error::UnresolvableHost(host.to_string()));
            }
        };

        let ip = addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .map(|addr| addr.ip())
            .ok_or_else(|| Error::UnresolvableHost(host.to_string()))?;
        self.insert(host, ip);
        Ok(ip)
    }

    pub async fn resolve_socket(&self, host: &str, port: u16) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.resolve(host).await?, port))
    }
}

pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse().ok()
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16)> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::configuration("empty host"));
    }
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::configuration(format!("unterminated IPv6 literal: {value}")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(Error::configuration)?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    if value.matches(':').count() > 1 {
        // bare IPv6 literal without port
        return Ok((value.to_string(), default_port));
    }
    match value.split_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse().map_err(Error::configuration)?)),
        None => Ok((value.to_string(), default_port)),
    }
}

pub fn format_ip_for_sip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V6(ipv6) => format!("[{ipv6}]"),
        IpAddr::V4(ipv4) => ipv4.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            split_host_port("proxy.example.net:5080", 5060).unwrap(),
            ("proxy.example.net".to_string(), 5080)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:5062", 5060).unwrap(),
            ("2001:db8::1".to_string(), 5062)
        );
        assert_eq!(
            split_host_port("2001:db8::1", 5060).unwrap(),
            ("2001:db8::1".to_string(), 5060)
        );
        assert!(split_host_port("host:notaport", 5060).is_err());
    }

    #[tokio::test]
    async fn resolver_prefers_literals_and_cache() {
        let resolver = HostResolver::new(Duration::from_millis(200), Duration::from_secs(60));
        assert_eq!(
            resolver.resolve("192.0.2.7").await.unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))
        );
        assert!(resolver.cached("pbx.invalid").is_none());
        resolver.insert("PBX.invalid", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(
            resolver.cached("pbx.invalid"),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
        );
    }

    #[test]
    fn expired_entries_are_evicted_on_insert() {
        let resolver = HostResolver::new(Duration::from_millis(200), Duration::from_millis(1));
        resolver.insert("old.invalid", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));
        std::thread::sleep(Duration::from_millis(5));
        resolver.insert("new.invalid", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)));
        let cache = resolver.cache.lock().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("new.invalid"));
    }

    #[test]
    fn udp_socket_binds_nonblocking() {
        let socket = bind_udp_socket("127.0.0.1:0".parse().unwrap(), None, 46).unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
