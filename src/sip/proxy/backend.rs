use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rsip::SipMessage;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::config::BindConfig;
use crate::error::{Error, Result};
use crate::net::bind_udp_socket;
use crate::sip::message::Ticket;

use super::builder::ShutdownSignal;
use super::router::{self, Routed};
use super::state::SipContext;

const MAX_DATAGRAM: usize = 65_535;

#[async_trait(?Send)]
pub trait SipBackend: Send + Sync + 'static {
    async fn initialize(&self, context: &SipContext) -> Result<()>;

    async fn run(&self, context: SipContext, shutdown: &mut ShutdownSignal) -> Result<()>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Single UDP listener serving both sides of the NAT boundary.
#[derive(Clone, Default)]
pub struct UdpBackend {
    inner: Arc<BackendInner>,
}

#[derive(Default)]
struct BackendInner {
    /// Bound in `initialize`, handed to the event loop's runtime in `run`.
    pending: std::sync::Mutex<Option<std::net::UdpSocket>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

#[async_trait(?Send)]
impl SipBackend for UdpBackend {
    async fn initialize(&self, context: &SipContext) -> Result<()> {
        let (socket, local_addr) = create_udp_listener(&context.config.sip.listen, context.config.sip.dscp)?;
        info!(%local_addr, "sip listener bound");
        *self.inner.local_addr.write().await = Some(local_addr);
        let mut guard = self
            .inner
            .pending
            .lock()
            .map_err(|_| Error::configuration("listener state poisoned"))?;
        guard.replace(socket);
        Ok(())
    }

    async fn run(&self, context: SipContext, shutdown: &mut ShutdownSignal) -> Result<()> {
        let std_socket = {
            let mut guard = self
                .inner
                .pending
                .lock()
                .map_err(|_| Error::configuration("listener state poisoned"))?;
            guard
                .take()
                .ok_or_else(|| Error::configuration("listener not initialized"))?
        };
        let socket = UdpSocket::from_std(std_socket)?;

        let tick_every = Duration::from_secs(context.config.timers.tick_interval_secs.max(1));
        let mut tick = tokio::time::interval(tick_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            listen = %context.config.sip.listen.socket_addr(),
            relay = context.relay.is_some(),
            "sip event loop started"
        );

        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("sip event loop stopping");
                    break;
                }
                _ = tick.tick() => {
                    run_timers(&context).await;
                }
                received = socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, source)) => {
                            handle_datagram(&context, &socket, &buffer[..len], source).await;
                        }
                        Err(err) if is_transient(&err) => {
                            trace!(error = %err, "transient receive error");
                        }
                        Err(err) => {
                            error!(error = %err, "sip socket receive failed");
                            return Err(Error::Transport(err));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("udp backend shutting down");
        if let Ok(mut guard) = self.inner.pending.lock() {
            guard.take();
        }
        self.inner.local_addr.write().await.take();
        Ok(())
    }
}

impl UdpBackend {
    /// Address the listener ended up on, once initialised.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read().await
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    )
}

async fn run_timers(context: &SipContext) {
    let expired = context.registrations.lock().await.age(Instant::now());
    for entry in &expired {
        info!(aor = %entry.registered_uri, contact = %entry.true_uri, "registration expired");
    }
    context.plugins.on_timer().await;
}

/// Datagrams are processed one at a time, in arrival order.
async fn handle_datagram(context: &SipContext, socket: &UdpSocket, payload: &[u8], source: SocketAddr) {
    if payload.iter().all(u8::is_ascii_whitespace) {
        trace!(%source, "keepalive");
        return;
    }
    let ticket = match Ticket::parse(payload, source) {
        Ok(ticket) => ticket,
        Err(err) => {
            debug!(%source, len = payload.len(), error = %err, "unparsable datagram");
            return;
        }
    };

    match router::route(context, ticket).await {
        Routed::Forward {
            message,
            destination,
        } => send_message(socket, message, destination).await,
        Routed::Respond {
            response,
            destination,
        } => send_message(socket, SipMessage::Response(response), destination).await,
        Routed::Consumed => trace!(%source, "message consumed by plugin"),
        Routed::Drop { reason } => debug!(%source, %reason, "message dropped"),
    }
}

async fn send_message(socket: &UdpSocket, message: SipMessage, destination: SocketAddr) {
    let wire = message.to_string();
    match socket.send_to(wire.as_bytes(), destination).await {
        Ok(_) => trace!(%destination, len = wire.len(), "sip message sent"),
        Err(err) => warn!(%destination, error = %err, "failed to send sip message"),
    }
}

fn create_udp_listener(bind: &BindConfig, dscp: u8) -> Result<(std::net::UdpSocket, SocketAddr)> {
    let socket = bind_udp_socket(bind.socket_addr(), bind.interface.as_deref(), dscp)?;
    let local_addr = socket.local_addr()?;
    Ok((socket, local_addr))
}
