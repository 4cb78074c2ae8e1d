use std::any::Any;
use std::sync::Arc;

use tokio::runtime::Builder as RuntimeBuilder;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::media::{RtpRelay, RtpRelayBuilder};
use crate::plugin::{Plugin, PluginChain};

use super::auth::{AllowAll, Authenticator, DigestAuthenticator};
use super::backend::{SipBackend, UdpBackend};
use super::state::SipContext;

pub struct SipMasqProxyBuilder<B = UdpBackend> {
    config: ProxyConfig,
    backend: B,
    plugins: Vec<Arc<dyn Plugin>>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl SipMasqProxyBuilder<UdpBackend> {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            backend: UdpBackend::default(),
            plugins: Vec::new(),
            authenticator: None,
        }
    }
}

impl<B> SipMasqProxyBuilder<B>
where
    B: SipBackend,
{
    pub fn with_backend<T: SipBackend>(self, backend: T) -> SipMasqProxyBuilder<T> {
        SipMasqProxyBuilder {
            config: self.config,
            backend,
            plugins: self.plugins,
            authenticator: self.authenticator,
        }
    }

    /// Plugins run in the order they are added.
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Replaces the authenticator derived from `ProxyConfig::auth`.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub async fn build(self) -> Result<ProxyRuntime<B>> {
        self.config.validate()?;

        let relay = if self.config.media.enabled {
            build_relay(&self.config).map(Arc::new)
        } else {
            info!("rtp relay disabled");
            None
        };

        let authenticator: Arc<dyn Authenticator> = match (self.authenticator, &self.config.auth) {
            (Some(authenticator), _) => authenticator,
            (None, Some(auth)) => Arc::new(DigestAuthenticator::new(auth.clone())),
            (None, None) => Arc::new(AllowAll),
        };

        let mut plugins = PluginChain::new(self.plugins);
        plugins.init(&self.config).await;

        let context = SipContext::new(Arc::new(self.config), relay, plugins, authenticator);
        Ok(ProxyRuntime {
            backend: Arc::new(self.backend),
            context,
        })
    }
}

fn build_relay(config: &ProxyConfig) -> Option<RtpRelay> {
    let builder = match RtpRelayBuilder::from_config(&config.media) {
        Ok(builder) => builder,
        Err(err) => {
            warn!(error = %err, "rtp relay disabled by configuration");
            return None;
        }
    };
    let builder = [&config.sip.inbound, &config.sip.outbound]
        .into_iter()
        .fold(builder, |builder, side| match &side.interface {
            Some(name) => builder.with_device(side.address, name.clone()),
            None => builder,
        });
    match builder.build() {
        Ok(relay) => Some(relay),
        Err(err) => {
            warn!(error = %err, "rtp relay failed to start");
            None
        }
    }
}

pub struct ProxyRuntime<B: SipBackend> {
    backend: Arc<B>,
    context: SipContext,
}

impl<B> ProxyRuntime<B>
where
    B: SipBackend,
{
    pub fn context(&self) -> &SipContext {
        &self.context
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub async fn start(self) -> Result<ProxyHandle> {
        self.backend.initialize(&self.context).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backend = self.backend.clone();
        let context = self.context.clone();

        let worker: std::thread::JoinHandle<Result<()>> = std::thread::Builder::new()
            .name("sipmasq-sip".into())
            .spawn(move || {
                let runtime = RuntimeBuilder::new_multi_thread()
                    .enable_all()
                    .build()
                    .map_err(Error::Transport)?;

                let mut shutdown = ShutdownSignal::new(shutdown_rx);
                runtime.block_on(async {
                    let served = backend.run(context.clone(), &mut shutdown).await;
                    let closed = backend.shutdown().await;
                    if let Some(relay) = context.relay.as_ref()
                        && let Err(err) = relay.shutdown().await
                    {
                        warn!(error = %err, "rtp relay shutdown failed");
                    }
                    context.plugins.shutdown().await;
                    served.and(closed)
                })
            })
            .map_err(Error::Transport)?;

        Ok(ProxyHandle {
            shutdown_tx,
            worker,
        })
    }
}

pub struct ProxyHandle {
    shutdown_tx: watch::Sender<bool>,
    worker: std::thread::JoinHandle<Result<()>>,
}

impl ProxyHandle {
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn wait(self) -> Result<()> {
        let Self {
            shutdown_tx: _,
            worker,
        } = self;
        Self::join(worker).await
    }

    pub async fn shutdown(self) -> Result<()> {
        let Self {
            shutdown_tx,
            worker,
        } = self;
        let _ = shutdown_tx.send(true);
        Self::join(worker).await
    }

    async fn join(worker: std::thread::JoinHandle<Result<()>>) -> Result<()> {
        let handle = tokio::task::spawn_blocking(move || Self::join_worker(worker));
        match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::SipStack(format!("proxy task panicked: {join_error}"))),
        }
    }

    fn join_worker(worker: std::thread::JoinHandle<Result<()>>) -> Result<()> {
        match worker.join() {
            Ok(result) => result,
            Err(panic) => Err(Error::SipStack(format!(
                "proxy worker panicked: {}",
                Self::panic_message(panic),
            ))),
        }
    }

    fn panic_message(panic: Box<dyn Any + Send + 'static>) -> String {
        match panic.downcast::<String>() {
            Ok(msg) => *msg,
            Err(panic) => match panic.downcast::<&'static str>() {
                Ok(msg) => (*msg).to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        }
    }
}

pub struct ShutdownSignal {
    inner: watch::Receiver<bool>,
}

impl ShutdownSignal {
    fn new(inner: watch::Receiver<bool>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) {
        if *self.inner.borrow() {
            return;
        }

        while self.inner.changed().await.is_ok() {
            if *self.inner.borrow() {
                break;
            }
        }
    }
}

pub type SipMasqProxy = ProxyRuntime<UdpBackend>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use crate::config::ProxyAuthConfig;

    #[tokio::test]
    async fn disabled_media_builds_without_relay() {
        let mut config = ProxyConfig::default();
        config.media.enabled = false;
        let proxy = SipMasqProxyBuilder::new(config).build().await.unwrap();
        assert!(proxy.context().relay.is_none());
    }

    #[tokio::test]
    async fn invalid_range_disables_relay() {
        let mut config = ProxyConfig::default();
        config.media.port_range.min = 7071;
        let proxy = SipMasqProxyBuilder::new(config).build().await.unwrap();
        assert!(proxy.context().relay.is_none());
    }

    #[tokio::test]
    async fn configured_auth_challenges_register() {
        let mut config = ProxyConfig::default();
        config.media.enabled = false;
        config.auth = Some(ProxyAuthConfig {
            realm: "sipmasq".into(),
            credentials: vec![Credential {
                username: "alice".into(),
                password: "secret".into(),
            }],
        });
        let proxy = SipMasqProxyBuilder::new(config).build().await.unwrap();
        let request = match crate::sip::message::tests::parse(
            "REGISTER sip:127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:45090;branch=z9hG4bKa\r\n\
From: <sip:alice@127.0.0.1>;tag=1\r\n\
To: <sip:alice@127.0.0.1>\r\n\
Call-ID: auth@127.0.0.1\r\n\
CSeq: 1 REGISTER\r\n\
Contact: <sip:alice@127.0.0.1:45090>\r\n\
Content-Length: 0\r\n\r\n",
        ) {
            rsip::SipMessage::Request(request) => request,
            rsip::SipMessage::Response(_) => unreachable!(),
        };
        let decision = proxy.context().authenticator.authenticate(&request).await;
        assert!(matches!(decision, super::super::auth::AuthDecision::Challenge(_)));
    }

    #[test]
    fn panic_payloads_are_described() {
        assert_eq!(ProxyHandle::panic_message(Box::new("boom")), "boom");
        assert_eq!(ProxyHandle::panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(ProxyHandle::panic_message(Box::new(7u8)), "unknown panic payload");
    }
}
