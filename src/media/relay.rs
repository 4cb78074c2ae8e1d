use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::media::dejitter::{DelayQueue, Leg, rtp_timestamp};
use crate::media::table::{
    ForwardRequest, MediaSelector, StreamHandle, StreamInfo, StreamTable,
};
use crate::sip::compare::CallId;
use crate::sip::message::Direction;

const WAKE_TOKEN: Token = Token(usize::MAX);
const IDLE_CEILING: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const RECV_BUFFER: usize = 65_536;
/// Upper bound for the configured dejitter delay.
pub const MAX_DEJITTER_MS: u64 = 1_000;

enum Command {
    Start {
        request: ForwardRequest,
        reply: oneshot::Sender<Result<u16>>,
    },
    Stop {
        call_id: CallId,
        direction: Direction,
        selector: MediaSelector,
        reply: oneshot::Sender<Result<usize>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<StreamInfo>>,
    },
}

#[derive(Debug)]
pub struct RtpRelayBuilder {
    config: MediaConfig,
    devices: HashMap<IpAddr, String>,
}

impl RtpRelayBuilder {
    pub fn from_config(config: &MediaConfig) -> Result<Self> {
        config.port_range.validate()?;
        if config.dejitter_ms > MAX_DEJITTER_MS {
            return Err(Error::configuration(format!(
                "dejitter of {} ms exceeds {MAX_DEJITTER_MS} ms",
                config.dejitter_ms
            )));
        }
        if config.stream_capacity == 0 {
            return Err(Error::configuration("media stream capacity must be positive"));
        }
        Ok(Self {
            config: config.clone(),
            devices: HashMap::new(),
        })
    }

    /// Binds relay sockets opened on `address` to the network device `name`.
    pub fn with_device(mut self, address: IpAddr, name: impl Into<String>) -> Self {
        self.devices.insert(address, name.into());
        self
    }

    pub fn build(self) -> Result<RtpRelay> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = RelayWorker {
            poll,
            commands: commands_rx,
            cancel: cancel.clone(),
            table: StreamTable::new(
                self.config.stream_capacity,
                self.config.port_range.clone(),
                self.config.dscp,
                self.devices,
            ),
            queue: DelayQueue::with_capacity(self.config.delay_queue_capacity),
            inactivity_timeout: self.config.inactivity_timeout(),
        };
        let thread = std::thread::Builder::new()
            .name("sipmasq-rtp".into())
            .spawn(move || worker.run())?;

        info!(
            min = self.config.port_range.min,
            max = self.config.port_range.max,
            capacity = self.config.stream_capacity,
            dejitter_ms = self.config.dejitter_ms,
            "rtp relay started"
        );
        Ok(RtpRelay {
            commands: commands_tx,
            waker,
            cancel,
            dejitter: self.config.dejitter(),
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// Handle to the relay worker thread.
#[derive(Debug)]
pub struct RtpRelay {
    commands: mpsc::UnboundedSender<Command>,
    waker: Arc<Waker>,
    cancel: CancellationToken,
    dejitter: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Start { request, .. } => f.debug_tuple("Start").field(request).finish(),
            Command::Stop {
                call_id,
                direction,
                selector,
                ..
            } => f
                .debug_struct("Stop")
                .field("call_id", call_id)
                .field("direction", direction)
                .field("selector", selector)
                .finish(),
            Command::Snapshot { .. } => f.write_str("Snapshot"),
        }
    }
}

impl RtpRelay {
    /// Configured dejitter offset for new streams.
    pub fn dejitter(&self) -> Duration {
        self.dejitter
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::RelayUnavailable)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Opens or refreshes a relay stream and returns its local RTP port.
    pub async fn start_forward(&self, request: ForwardRequest) -> Result<u16> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Start { request, reply })?;
        response.await.map_err(|_| Error::RelayUnavailable)?
    }

    /// Tears down matching streams; returns how many were closed.
    pub async fn stop_forward(
        &self,
        call_id: &CallId,
        direction: Direction,
        selector: MediaSelector,
    ) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Stop {
            call_id: call_id.clone(),
            direction,
            selector,
            reply,
        })?;
        response.await.map_err(|_| Error::RelayUnavailable)?
    }

    pub async fn streams(&self) -> Result<Vec<StreamInfo>> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Snapshot { reply })?;
        response.await.map_err(|_| Error::RelayUnavailable)
    }

    fn signal_stop(&self) {
        self.cancel.cancel();
        if let Err(err) = self.waker.wake() {
            debug!(error = %err, "failed to wake rtp relay worker");
        }
    }

    /// Stops the worker and waits for it to close every stream.
    pub async fn shutdown(&self) -> Result<()> {
        self.signal_stop();
        let thread = self.thread.lock().ok().and_then(|mut guard| guard.take());
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|err| Error::Media(err.to_string()))?
                .map_err(|_| Error::Media("rtp relay worker panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for RtpRelay {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

struct RelayWorker {
    poll: Poll,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    table: StreamTable,
    queue: DelayQueue,
    inactivity_timeout: Duration,
}

impl RelayWorker {
    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut last_sweep = Instant::now();

        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            let mut timeout = IDLE_CEILING.min((last_sweep + SWEEP_INTERVAL).saturating_duration_since(now));
            if let Some(due) = self.queue.next_due() {
                timeout = timeout.min(due.saturating_duration_since(now));
            }

            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "rtp relay poll failed");
                break;
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.read_ready(event.token(), &mut buf);
            }
            self.drain_commands();

            let now = Instant::now();
            self.flush_due(now);
            if now.duration_since(last_sweep) >= SWEEP_INTERVAL {
                self.sweep(now);
                last_sweep = now;
            }
        }

        let open = self.table.handles();
        for handle in &open {
            self.teardown(*handle);
        }
        info!(closed = open.len(), "rtp relay stopped");
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            trace!(?command, "rtp relay command");
            match command {
                Command::Start { request, reply } => {
                    let call_id = request.call_id.clone();
                    let direction = request.direction;
                    let result = self
                        .table
                        .start(request, self.poll.registry(), Instant::now())
                        .map(|(_, port)| port);
                    match &result {
                        Ok(port) => debug!(%call_id, %direction, port, "relay stream ready"),
                        Err(err) => warn!(%call_id, %direction, error = %err, "relay stream not started"),
                    }
                    let _ = reply.send(result);
                }
                Command::Stop {
                    call_id,
                    direction,
                    selector,
                    reply,
                } => {
                    let handles = self.table.matching(&call_id, direction, selector);
                    let result = if handles.is_empty() {
                        Err(Error::NoMatchingStream)
                    } else {
                        for handle in &handles {
                            self.teardown(*handle);
                        }
                        debug!(%call_id, %direction, closed = handles.len(), "relay streams stopped");
                        Ok(handles.len())
                    };
                    let _ = reply.send(result);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.table.snapshot());
                }
            }
        }
    }

    fn teardown(&mut self, handle: StreamHandle) {
        let purged = self.queue.purge(handle);
        if let Some(stream) = self.table.remove(handle, self.poll.registry()) {
            debug!(
                call_id = %stream.call_id,
                direction = %stream.direction,
                port = stream.local_port,
                purged,
                "relay stream closed"
            );
        }
    }

    fn read_ready(&mut self, token: Token, buf: &mut [u8]) {
        let Some((handle, leg)) = self.table.resolve_token(token) else {
            return;
        };
        let mut received = 0usize;
        loop {
            let Some(stream) = self.table.get(handle) else {
                break;
            };
            let (len, from) = match stream.socket(leg).recv_from(buf) {
                Ok(value) => value,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(port = stream.local_port, error = %err, "relay receive failed");
                    break;
                }
            };
            received += 1;
            trace!(%from, len, ?leg, "relay datagram");
            self.relay(handle, leg, &buf[..len]);
        }
        if received == 0 {
            warn!(?token, "relay socket signalled readable without data");
        }
    }

    fn relay(&mut self, handle: StreamHandle, leg: Leg, payload: &[u8]) {
        let now = Instant::now();
        let Some(stream) = self.table.get_mut(handle) else {
            return;
        };
        stream.last_activity = now;
        let destination = stream.destination(leg);

        let due = match leg {
            Leg::Rtp if !stream.jitter.target().is_zero() => {
                rtp_timestamp(payload).map(|timestamp| stream.jitter.schedule(timestamp, now))
            }
            _ => None,
        };
        if let Some(due) = due
            && due > now
        {
            match self.queue.push(handle, leg, destination, due, payload) {
                Ok(()) => return,
                Err(err) => debug!(error = %err, "delay queue rejected packet, sending now"),
            }
        }

        if let Some(failed) = send_datagram(&mut self.table, handle, leg, destination, payload) {
            self.teardown(failed);
        }
    }

    fn flush_due(&mut self, now: Instant) {
        let table = &mut self.table;
        let mut failed = Vec::new();
        self.queue.flush(now, |handle, leg, destination, payload| {
            if let Some(peer) = send_datagram(table, handle, leg, destination, payload) {
                failed.push(peer);
            }
        });
        for handle in failed {
            self.teardown(handle);
        }
    }

    fn sweep(&mut self, now: Instant) {
        for handle in self.table.expired(now, self.inactivity_timeout) {
            if let Some(stream) = self.table.get(handle) {
                info!(
                    call_id = %stream.call_id,
                    port = stream.local_port,
                    idle_secs = now.saturating_duration_since(stream.last_activity).as_secs(),
                    "closing idle relay stream"
                );
            }
            self.teardown(handle);
        }
    }
}

/// Sends through the peer's socket (falling back to the stream's own).
/// Returns the peer to tear down after a hard send error.
fn send_datagram(
    table: &mut StreamTable,
    handle: StreamHandle,
    leg: Leg,
    destination: SocketAddr,
    payload: &[u8],
) -> Option<StreamHandle> {
    let peer = table.find_peer(handle);
    let stream = peer
        .and_then(|peer| table.get(peer))
        .or_else(|| table.get(handle))?;
    match stream.socket(leg).send_to(payload, destination) {
        Ok(_) => None,
        Err(err) if err.kind() == ErrorKind::ConnectionRefused => None,
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            trace!(%destination, "relay socket busy, dropping datagram");
            None
        }
        Err(err) => {
            warn!(%destination, error = %err, "relay send failed, closing opposite stream");
            peer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use std::net::UdpSocket as StdUdpSocket;

    fn config(min: u16, max: u16, dejitter_ms: u64) -> MediaConfig {
        MediaConfig {
            port_range: PortRange { min, max },
            dejitter_ms,
            dscp: 0,
            stream_capacity: 8,
            delay_queue_capacity: 64,
            ..MediaConfig::default()
        }
    }

    fn request(call: &str, client: &str, direction: Direction, remote: SocketAddr) -> ForwardRequest {
        ForwardRequest {
            call_id: CallId::parse(call),
            client_id: client.into(),
            direction,
            media_index: 0,
            local_addr: "127.0.0.1".parse().unwrap(),
            remote,
            dejitter: Duration::ZERO,
        }
    }

    fn rtp(seq: u16, timestamp: u32) -> Vec<u8> {
        let mut packet = vec![0x80, 0x00];
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&timestamp.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 7]);
        packet.extend_from_slice(&[0xd5; 160]);
        packet
    }

    #[tokio::test]
    async fn relays_between_matched_streams() {
        let relay = RtpRelayBuilder::from_config(&config(43000, 43019, 0))
            .unwrap()
            .build()
            .unwrap();
        let ua = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        ua.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        remote.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        // public side port, forwards towards the private UA
        let public_port = relay
            .start_forward(request("call1@h", "ua", Direction::Outgoing, ua.local_addr().unwrap()))
            .await
            .unwrap();
        // private side port, forwards towards the remote party
        let private_port = relay
            .start_forward(request("call1@h", "remote", Direction::Incoming, remote.local_addr().unwrap()))
            .await
            .unwrap();
        assert_ne!(public_port, private_port);

        ua.send_to(&rtp(1, 160), ("127.0.0.1", private_port)).unwrap();
        let mut buf = [0u8; 512];
        let (len, from) = remote.recv_from(&mut buf).unwrap();
        assert_eq!(len, 172);
        // symmetric: the remote sees media from the port it sends to
        assert_eq!(from.port(), public_port);

        remote.send_to(&rtp(1, 320), ("127.0.0.1", public_port)).unwrap();
        let (_, from) = ua.recv_from(&mut buf).unwrap();
        assert_eq!(from.port(), private_port);

        let streams = relay.streams().await.unwrap();
        assert_eq!(streams.len(), 2);
        assert!(streams.iter().all(|stream| stream.has_peer));

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn retransmitted_start_returns_same_port() {
        let relay = RtpRelayBuilder::from_config(&config(43020, 43039, 0))
            .unwrap()
            .build()
            .unwrap();
        let remote: SocketAddr = "127.0.0.1:49170".parse().unwrap();
        let first = relay
            .start_forward(request("call2@h", "ua", Direction::Outgoing, remote))
            .await
            .unwrap();
        let second = relay
            .start_forward(request("call2@h", "ua", Direction::Outgoing, remote))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(relay.streams().await.unwrap().len(), 1);
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stop_closes_streams_and_frees_ports() {
        let relay = RtpRelayBuilder::from_config(&config(43040, 43043, 20))
            .unwrap()
            .build()
            .unwrap();
        let remote: SocketAddr = "127.0.0.1:49172".parse().unwrap();
        let call = CallId::parse("call3@h");
        let port = relay
            .start_forward(request("call3@h", "ua", Direction::Outgoing, remote))
            .await
            .unwrap();

        assert_eq!(
            relay
                .stop_forward(&call, Direction::Outgoing, MediaSelector::All)
                .await
                .unwrap(),
            1
        );
        assert!(relay.streams().await.unwrap().is_empty());
        assert!(matches!(
            relay.stop_forward(&call, Direction::Outgoing, MediaSelector::All).await,
            Err(Error::NoMatchingStream)
        ));

        // the port is bindable again once the stream is gone
        StdUdpSocket::bind(("127.0.0.1", port)).unwrap();
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dejittered_packets_still_arrive() {
        let relay = RtpRelayBuilder::from_config(&config(43060, 43079, 30))
            .unwrap()
            .build()
            .unwrap();
        let remote = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        remote.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut req = request("call4@h", "remote", Direction::Incoming, remote.local_addr().unwrap());
        req.dejitter = Duration::from_millis(30);
        let port = relay.start_forward(req).await.unwrap();

        let ua = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        for seq in 0..5u16 {
            ua.send_to(&rtp(seq, u32::from(seq) * 160), ("127.0.0.1", port)).unwrap();
        }
        let mut buf = [0u8; 512];
        for _ in 0..5 {
            let (len, _) = remote.recv_from(&mut buf).unwrap();
            assert_eq!(len, 172);
        }
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stop_discards_queued_packets() {
        let relay = RtpRelayBuilder::from_config(&config(43120, 43139, 200))
            .unwrap()
            .build()
            .unwrap();
        let remote = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        remote.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut req = request("call5@h", "remote", Direction::Incoming, remote.local_addr().unwrap());
        req.dejitter = Duration::from_millis(200);
        let port = relay.start_forward(req).await.unwrap();

        let ua = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        for seq in 0..3u16 {
            ua.send_to(&rtp(seq, u32::from(seq) * 160), ("127.0.0.1", port)).unwrap();
        }
        // let the worker queue them, well inside the dejitter delay
        tokio::time::sleep(Duration::from_millis(50)).await;
        let closed = relay
            .stop_forward(&CallId::parse("call5@h"), Direction::Incoming, MediaSelector::All)
            .await
            .unwrap();
        assert_eq!(closed, 1);

        let mut buf = [0u8; 512];
        assert!(remote.recv_from(&mut buf).is_err(), "queued packet sent after teardown");
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn hard_send_error_closes_opposite_stream() {
        let relay = RtpRelayBuilder::from_config(&config(43140, 43159, 0))
            .unwrap()
            .build()
            .unwrap();
        let ua = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        relay
            .start_forward(request("call6@h", "ua", Direction::Outgoing, ua.local_addr().unwrap()))
            .await
            .unwrap();
        // an IPv6 remote cannot be reached from the IPv4 peer socket
        let unreachable: SocketAddr = "[::1]:9".parse().unwrap();
        let private_port = relay
            .start_forward(request("call6@h", "remote", Direction::Incoming, unreachable))
            .await
            .unwrap();

        ua.send_to(&rtp(1, 160), ("127.0.0.1", private_port)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let streams = relay.streams().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].direction, Direction::Incoming);
        assert_eq!(streams[0].local_port, private_port);
        relay.shutdown().await.unwrap();
    }

    #[test]
    fn invalid_range_is_rejected() {
        assert!(RtpRelayBuilder::from_config(&config(43081, 43090, 0)).is_err());
    }

    #[test]
    fn oversized_dejitter_is_rejected() {
        assert!(RtpRelayBuilder::from_config(&config(43100, 43119, MAX_DEJITTER_MS)).is_ok());
        let err = RtpRelayBuilder::from_config(&config(43100, 43119, u64::MAX / 1_000)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
