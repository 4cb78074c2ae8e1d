use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use clap::Parser;
use sipmasq::SipMasqProxyBuilder;
use sipmasq::config::{
    BindConfig, Credential, InterfaceConfig, MediaConfig, PortRange, ProxyAuthConfig, ProxyConfig,
    RegistrationConfig, SipConfig, TimerConfig,
};
use sipmasq::plugin::{Plugin, PluginOutcome, PluginStages, ProcessingStage};
use sipmasq::sip::Ticket;
use tracing::info;
#[cfg(not(feature = "telemetry"))]
use tracing::warn;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sipmasq-server",
    about = "Masquerading SIP proxy with RTP relay for UAs behind NAT",
    version
)]
struct Cli {
    /// IP address the SIP listener binds to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    listen_addr: IpAddr,

    /// UDP port of the SIP listener
    #[arg(long, default_value_t = 5060)]
    listen_port: u16,

    /// Optional network interface name for SO_BINDTODEVICE on the listener
    #[arg(long)]
    listen_interface: Option<String>,

    /// Address of the interface facing the private UAs
    #[arg(long)]
    inbound_addr: IpAddr,

    /// Interface name facing the private UAs (relay sockets are bound to it)
    #[arg(long)]
    inbound_interface: Option<String>,

    /// Address of the interface facing the public network
    #[arg(long)]
    outbound_addr: IpAddr,

    /// Interface name facing the public network
    #[arg(long)]
    outbound_interface: Option<String>,

    /// Send every outgoing request to this `host[:port]`
    #[arg(long)]
    outbound_proxy: Option<String>,

    /// Per-domain outbound proxy as `domain=host[:port]`
    #[arg(long = "outbound-domain", value_name = "DOMAIN=HOST[:PORT]", action = clap::ArgAction::Append)]
    outbound_domain: Vec<String>,

    /// Host masquerading rule as `private=public`
    #[arg(long = "masquerade", value_name = "FROM=TO", action = clap::ArgAction::Append)]
    masquerade: Vec<String>,

    /// Masquerade every registration behind the outbound address
    #[arg(long)]
    transparent: bool,

    /// Extra host names the proxy answers to
    #[arg(long = "local-domain", action = clap::ArgAction::Append)]
    local_domain: Vec<String>,

    /// Maximum number of registrations
    #[arg(long, default_value_t = 32)]
    registrations: usize,

    /// Disable the RTP relay
    #[arg(long)]
    no_media: bool,

    /// Lower bound (inclusive) for RTP relay ports (must be even)
    #[arg(long, default_value_t = 7070)]
    media_port_min: u16,

    /// Upper bound (inclusive) for RTP relay ports
    #[arg(long, default_value_t = 7089)]
    media_port_max: u16,

    /// Seconds without traffic before a relay stream is closed
    #[arg(long, default_value_t = 300)]
    media_inactivity_timeout: u64,

    /// Dejitter delay in milliseconds (0 relays immediately)
    #[arg(long, default_value_t = 0)]
    dejitter_ms: u64,

    /// DSCP code point for RTP packets
    #[arg(long, default_value_t = 46)]
    rtp_dscp: u8,

    /// DSCP code point for SIP packets
    #[arg(long, default_value_t = 0)]
    sip_dscp: u8,

    /// Require digest authentication for REGISTER with this realm
    #[arg(long)]
    auth_realm: Option<String>,

    /// Credential as `user:password`; repeatable
    #[arg(long = "auth-user", value_name = "USER:PASSWORD", action = clap::ArgAction::Append)]
    auth_user: Vec<String>,

    /// User-Agent/Server substring whose 202 to SUBSCRIBE is turned into 404
    #[arg(long = "subscribe-workaround", action = clap::ArgAction::Append)]
    subscribe_workaround: Vec<String>,

    /// Log every request passing the proxy
    #[arg(long)]
    log_calls: bool,

    /// Log level when telemetry feature is enabled (default info)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn split_pair<'a>(value: &'a str, separator: char, flag: &str) -> Result<(&'a str, &'a str)> {
    value
        .split_once(separator)
        .filter(|(left, right)| !left.is_empty() && !right.is_empty())
        .ok_or_else(|| anyhow!("--{flag} expects `a{separator}b`, got `{value}`"))
}

impl Cli {
    fn into_proxy_config(self) -> Result<ProxyConfig> {
        let mut sip = SipConfig {
            listen: BindConfig {
                address: self.listen_addr,
                port: self.listen_port,
                interface: self.listen_interface,
            },
            inbound: InterfaceConfig {
                address: self.inbound_addr,
                interface: self.inbound_interface,
            },
            outbound: InterfaceConfig {
                address: self.outbound_addr,
                interface: self.outbound_interface,
            },
            local_domains: self.local_domain,
            transparent_proxy: self.transparent,
            outbound_proxy: self.outbound_proxy,
            dscp: self.sip_dscp,
            subscribe_202_workaround: self.subscribe_workaround,
            ..SipConfig::default()
        };

        for rule in &self.masquerade {
            let (from, to) = split_pair(rule, '=', "masquerade")?;
            sip.mask_host.push(from.to_string());
            sip.masked_host.push(to.to_string());
        }
        for rule in &self.outbound_domain {
            let (domain, target) = split_pair(rule, '=', "outbound-domain")?;
            let (host, port) = sipmasq::net::split_host_port(target, 5060)
                .with_context(|| format!("outbound domain target `{target}`"))?;
            sip.outbound_domain_name.push(domain.to_string());
            sip.outbound_domain_host.push(host);
            sip.outbound_domain_port.push(port);
        }

        let auth = match self.auth_realm {
            Some(realm) => {
                let credentials = self
                    .auth_user
                    .iter()
                    .map(|entry| {
                        split_pair(entry, ':', "auth-user").map(|(username, password)| Credential {
                            username: username.to_string(),
                            password: password.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                if credentials.is_empty() {
                    return Err(anyhow!("--auth-realm needs at least one --auth-user"));
                }
                Some(ProxyAuthConfig { realm, credentials })
            }
            None if !self.auth_user.is_empty() => {
                return Err(anyhow!("--auth-user requires --auth-realm"));
            }
            None => None,
        };

        let media = MediaConfig {
            enabled: !self.no_media,
            port_range: PortRange {
                min: self.media_port_min,
                max: self.media_port_max,
            },
            inactivity_timeout_secs: self.media_inactivity_timeout,
            dejitter_ms: self.dejitter_ms,
            dscp: self.rtp_dscp,
            ..MediaConfig::default()
        };
        if media.enabled {
            media.port_range.validate().context("media port range")?;
        }

        Ok(ProxyConfig {
            sip,
            registration: RegistrationConfig {
                capacity: self.registrations,
                ..RegistrationConfig::default()
            },
            media,
            timers: TimerConfig::default(),
            auth,
            user_agent: None,
        })
    }
}

/// Logs request lines and their classification.
struct CallLogger;

#[async_trait]
impl Plugin for CallLogger {
    fn name(&self) -> &str {
        "call-logger"
    }

    fn stages(&self) -> PluginStages {
        PluginStages::POST_PROXY
    }

    async fn process(&self, _stage: ProcessingStage, ticket: &mut Ticket) -> sipmasq::Result<PluginOutcome> {
        if let Some(method) = ticket.method() {
            let direction = ticket
                .direction
                .map(|direction| direction.to_string())
                .unwrap_or_default();
            info!(%method, %direction, source = %ticket.source, "request relayed");
        }
        Ok(PluginOutcome::Continue)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let log_level = cli.log_level.clone();
    let log_calls = cli.log_calls;
    let config = cli.into_proxy_config().context("build proxy config")?;

    info!(log_level = %log_level, "starting sipmasq");

    let mut builder = SipMasqProxyBuilder::new(config);
    if log_calls {
        builder = builder.with_plugin(Arc::new(CallLogger));
    }
    let runtime = builder.build().await.context("initialise proxy runtime")?;

    let handle = runtime.start().await.context("start proxy runtime")?;

    info!("proxy started; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;

    info!("shutdown signal received, stopping proxy");
    handle.shutdown().await.context("proxy shutdown")?;

    info!("proxy stopped");
    Ok(())
}

#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = if let Ok(value) = std::env::var(EnvFilter::DEFAULT_ENV) {
        EnvFilter::new(value)
    } else {
        EnvFilter::new(level)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
    Ok(())
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) -> Result<()> {
    if std::env::var("RUST_LOG").is_ok() {
        warn!("telemetry feature disabled; RUST_LOG ignored");
    }
    Ok(())
}
