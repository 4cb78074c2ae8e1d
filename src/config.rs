use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_SIP_PORT: u16 = 5060;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct BindConfig {
    pub address: IpAddr,
    pub port: u16,
    /// Optional Linux interface name for SO_BINDTODEVICE.
    pub interface: Option<String>,
}

impl BindConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_SIP_PORT,
            interface: None,
        }
    }
}

/// One side of the NAT boundary. `address` is what the proxy advertises in
/// Via, Record-Route and SDP for traffic leaving through this side.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub address: IpAddr,
    /// Optional Linux interface name; relay sockets are bound to it.
    pub interface: Option<String>,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct SipConfig {
    pub listen: BindConfig,
    /// Interface facing the registered (private) user agents.
    pub inbound: InterfaceConfig,
    /// Interface facing the public network.
    pub outbound: InterfaceConfig,
    /// Extra host names under which the proxy itself is addressed.
    pub local_domains: Vec<String>,
    /// Always masquerade registered UAs behind the outbound interface.
    pub transparent_proxy: bool,
    /// Host masquerading, parallel to `masked_host`.
    pub mask_host: Vec<String>,
    pub masked_host: Vec<String>,
    /// `host[:port]` every outgoing request is sent to.
    pub outbound_proxy: Option<String>,
    /// Per-domain outbound proxies; the three lists are parallel.
    pub outbound_domain_name: Vec<String>,
    pub outbound_domain_host: Vec<String>,
    pub outbound_domain_port: Vec<u16>,
    /// DSCP value for the SIP socket (0 disables marking).
    pub dscp: u8,
    /// User-Agent/Server substrings whose 202 answer to SUBSCRIBE is turned into 404.
    pub subscribe_202_workaround: Vec<String>,
}

impl SipConfig {
    pub fn listen_port(&self) -> u16 {
        self.listen.port
    }

    /// Pairs `mask_host` with `masked_host`.
    pub fn masquerade_table(&self) -> Result<Vec<(String, String)>> {
        if self.mask_host.len() != self.masked_host.len() {
            return Err(Error::configuration(format!(
                "mask_host has {} entries but masked_host has {}",
                self.mask_host.len(),
                self.masked_host.len()
            )));
        }
        Ok(self
            .mask_host
            .iter()
            .cloned()
            .zip(self.masked_host.iter().cloned())
            .collect())
    }

    pub fn outbound_domains(&self) -> Result<Vec<OutboundDomain>> {
        let names = self.outbound_domain_name.len();
        if names != self.outbound_domain_host.len() || names != self.outbound_domain_port.len() {
            return Err(Error::configuration(format!(
                "outbound_domain_name/host/port lists differ in length ({}/{}/{})",
                names,
                self.outbound_domain_host.len(),
                self.outbound_domain_port.len()
            )));
        }
        Ok(self
            .outbound_domain_name
            .iter()
            .zip(&self.outbound_domain_host)
            .zip(&self.outbound_domain_port)
            .map(|((domain, host), port)| OutboundDomain {
                domain: domain.clone(),
                host: host.clone(),
                port: *port,
            })
            .collect())
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            listen: BindConfig::default(),
            inbound: InterfaceConfig {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                interface: None,
            },
            outbound: InterfaceConfig {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                interface: None,
            },
            local_domains: Vec::new(),
            transparent_proxy: false,
            mask_host: Vec::new(),
            masked_host: Vec::new(),
            outbound_proxy: None,
            outbound_domain_name: Vec::new(),
            outbound_domain_host: Vec::new(),
            outbound_domain_port: Vec::new(),
            dscp: 0,
            subscribe_202_workaround: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDomain {
    pub domain: String,
    pub host: String,
    pub port: u16,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub capacity: usize,
    /// Used when a REGISTER carries neither an Expires header nor parameter.
    pub default_expires_secs: u32,
    /// Added on top of the granted expiry before an entry is aged out.
    pub expiry_margin_secs: u32,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            default_expires_secs: 600,
            expiry_margin_secs: 30,
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub enabled: bool,
    pub port_range: PortRange,
    pub inactivity_timeout_secs: u64,
    /// Dejitter offset in milliseconds, 0 relays without delay.
    pub dejitter_ms: u64,
    pub dscp: u8,
    pub stream_capacity: usize,
    pub delay_queue_capacity: usize,
}

impl MediaConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn dejitter(&self) -> Duration {
        Duration::from_millis(self.dejitter_ms)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_range: PortRange {
                min: 7070,
                max: 7089,
            },
            inactivity_timeout_secs: 300,
            dejitter_ms: 0,
            dscp: 46,
            stream_capacity: 256,
            delay_queue_capacity: 1024,
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn validate(&self) -> Result<()> {
        if self.min % 2 != 0 {
            return Err(Error::configuration(
                "media port range must start on an even port",
            ));
        }
        if self.max <= self.min {
            return Err(Error::configuration(
                "media port range must span at least two ports",
            ));
        }
        Ok(())
    }

    /// Number of RTP/RTCP pairs that fit in the range.
    pub fn pair_count(&self) -> usize {
        if self.max <= self.min {
            return 0;
        }
        (usize::from(self.max - self.min) + 1) / 2
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Period of registration aging and plugin timer callbacks.
    pub tick_interval_secs: u64,
    pub resolver_timeout_ms: u64,
    pub resolver_cache_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            resolver_timeout_ms: 2000,
            resolver_cache_secs: 300,
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct ProxyAuthConfig {
    pub realm: String,
    pub credentials: Vec<Credential>,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub sip: SipConfig,
    pub registration: RegistrationConfig,
    pub media: MediaConfig,
    pub timers: TimerConfig,
    /// Digest authentication for REGISTER; None disables it.
    pub auth: Option<ProxyAuthConfig>,
    /// Optional User-Agent header for locally generated responses.
    pub user_agent: Option<String>,
}

impl ProxyConfig {
    pub fn resolved_user_agent(&self) -> String {
        self.user_agent
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Checks the settings without which the proxy cannot run at all.
    pub fn validate(&self) -> Result<()> {
        if self.sip.listen.port == 0 {
            return Err(Error::configuration("sip listen port must not be 0"));
        }
        if self.registration.capacity == 0 {
            return Err(Error::configuration("registration capacity must be positive"));
        }
        if self.timers.tick_interval_secs == 0 {
            return Err(Error::configuration("timer tick interval must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_masquerade_lists_are_rejected() {
        let mut sip = SipConfig::default();
        sip.mask_host = vec!["pbx.lan".into(), "phone.lan".into()];
        sip.masked_host = vec!["voip.example.com".into()];
        assert!(sip.masquerade_table().is_err());

        sip.masked_host.push("voip2.example.com".into());
        let table = sip.masquerade_table().expect("parallel lists");
        assert_eq!(table[1], ("phone.lan".to_string(), "voip2.example.com".to_string()));
    }

    #[test]
    fn outbound_domains_require_parallel_lists() {
        let mut sip = SipConfig::default();
        sip.outbound_domain_name = vec!["example.net".into()];
        sip.outbound_domain_host = vec!["proxy.example.net".into()];
        assert!(sip.outbound_domains().is_err());

        sip.outbound_domain_port = vec![5080];
        let domains = sip.outbound_domains().expect("parallel lists");
        assert_eq!(domains[0].port, 5080);
    }

    #[test]
    fn port_range_validation() {
        assert!(PortRange { min: 7071, max: 7090 }.validate().is_err());
        assert!(PortRange { min: 7070, max: 7070 }.validate().is_err());
        let range = PortRange { min: 7070, max: 7079 };
        assert!(range.validate().is_ok());
        assert_eq!(range.pair_count(), 5);
    }
}
