use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{OutboundDomain, ProxyConfig};
use crate::media::RtpRelay;
use crate::net::HostResolver;
use crate::plugin::PluginChain;
use crate::sip::message::Direction;
use crate::sip::registration::RegistrationTable;
use crate::sip::route::LocalAddresses;

use super::auth::Authenticator;

/// Everything message processing needs, shared by the listener task.
#[derive(Clone)]
pub struct SipContext {
    pub config: Arc<ProxyConfig>,
    pub relay: Option<Arc<RtpRelay>>,
    pub registrations: Arc<Mutex<RegistrationTable>>,
    pub resolver: Arc<HostResolver>,
    pub plugins: Arc<PluginChain>,
    pub authenticator: Arc<dyn Authenticator>,
    pub masquerade: Arc<Vec<(String, String)>>,
    pub outbound_domains: Arc<Vec<OutboundDomain>>,
    pub local: Arc<LocalAddresses>,
    pub user_agent: String,
}

impl fmt::Debug for SipContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipContext")
            .field("listen", &self.config.sip.listen)
            .field("relay", &self.relay.is_some())
            .field("plugins", &self.plugins)
            .field("masquerade", &self.masquerade)
            .field("outbound_domains", &self.outbound_domains)
            .field("local", &self.local)
            .finish()
    }
}

impl SipContext {
    pub fn new(
        config: Arc<ProxyConfig>,
        relay: Option<Arc<RtpRelay>>,
        plugins: PluginChain,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let masquerade = config.sip.masquerade_table().unwrap_or_else(|err| {
            warn!(error = %err, "host masquerading disabled");
            Vec::new()
        });
        let outbound_domains = config.sip.outbound_domains().unwrap_or_else(|err| {
            warn!(error = %err, "per-domain outbound proxies disabled");
            Vec::new()
        });

        let mut ips = vec![config.sip.inbound.address, config.sip.outbound.address];
        let listen = config.sip.listen.address;
        if !listen.is_unspecified() && !ips.contains(&listen) {
            ips.push(listen);
        }
        let local = LocalAddresses {
            ips,
            domains: config.sip.local_domains.clone(),
            port: config.sip.listen_port(),
        };

        let resolver = HostResolver::new(
            Duration::from_millis(config.timers.resolver_timeout_ms),
            Duration::from_secs(config.timers.resolver_cache_secs),
        );
        let registrations = RegistrationTable::with_capacity(config.registration.capacity);

        Self {
            user_agent: config.resolved_user_agent(),
            relay,
            registrations: Arc::new(Mutex::new(registrations)),
            resolver: Arc::new(resolver),
            plugins: Arc::new(plugins),
            authenticator,
            masquerade: Arc::new(masquerade),
            outbound_domains: Arc::new(outbound_domains),
            local: Arc::new(local),
            config,
        }
    }

    /// Address advertised towards the side a message of `direction` is
    /// heading to.
    pub fn interface_towards(&self, direction: Direction) -> IpAddr {
        match direction {
            Direction::Outgoing => self.config.sip.outbound.address,
            Direction::Incoming => self.config.sip.inbound.address,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.config.sip.listen_port()
    }

    pub fn masked_host(&self, host: &str) -> Option<&str> {
        self.masquerade
            .iter()
            .find(|(mask, _)| mask.eq_ignore_ascii_case(host))
            .map(|(_, masked)| masked.as_str())
    }
}
