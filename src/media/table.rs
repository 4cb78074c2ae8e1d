//! Media stream arena owned by the relay worker.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::config::PortRange;
use crate::error::{Error, Result};
use crate::media::dejitter::{JitterState, Leg};
use crate::net::bind_udp_socket;
use crate::sip::compare::{CallId, compare_call_id, truncate};
use crate::sip::message::Direction;

/// Stable reference to a stream slot; goes stale once the slot is reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub index: usize,
    pub generation: u32,
}

impl StreamHandle {
    pub fn token(self, leg: Leg) -> Token {
        Token(self.index * 2 + leg.index())
    }
}

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub call_id: CallId,
    /// Fingerprint of the UA that sent the SDP.
    pub client_id: String,
    pub direction: Direction,
    pub media_index: usize,
    /// Interface the relay port is opened on.
    pub local_addr: IpAddr,
    /// Where received media is sent to (RTCP goes to port + 1).
    pub remote: SocketAddr,
    pub dejitter: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSelector {
    All,
    Stream(usize),
}

impl MediaSelector {
    fn matches(self, media_index: usize) -> bool {
        match self {
            MediaSelector::All => true,
            MediaSelector::Stream(index) => index == media_index,
        }
    }
}

#[derive(Debug)]
pub struct MediaStream {
    pub call_id: CallId,
    pub client_id: String,
    pub direction: Direction,
    pub media_index: usize,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote: SocketAddr,
    pub jitter: JitterState,
    pub last_activity: Instant,
    pub peer: Option<StreamHandle>,
    sockets: [UdpSocket; 2],
}

impl MediaStream {
    pub fn socket(&self, leg: Leg) -> &UdpSocket {
        &self.sockets[leg.index()]
    }

    pub fn destination(&self, leg: Leg) -> SocketAddr {
        match leg {
            Leg::Rtp => self.remote,
            Leg::Rtcp => SocketAddr::new(self.remote.ip(), self.remote.port().wrapping_add(1)),
        }
    }

    fn is_opposite_of(&self, other: &MediaStream) -> bool {
        compare_call_id(&self.call_id, &other.call_id)
            && self.media_index == other.media_index
            && self.direction == other.direction.opposite()
            && self.client_id != other.client_id
    }
}

/// Diagnostic view of a live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub call_id: CallId,
    pub client_id: String,
    pub direction: Direction,
    pub media_index: usize,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote: SocketAddr,
    pub has_peer: bool,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    stream: Option<MediaStream>,
}

#[derive(Debug)]
pub struct StreamTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    range: PortRange,
    /// Pair offset the next port search starts from.
    cursor: usize,
    dscp: u8,
    devices: HashMap<IpAddr, String>,
}

impl StreamTable {
    pub fn new(
        capacity: usize,
        range: PortRange,
        dscp: u8,
        devices: HashMap<IpAddr, String>,
    ) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    stream: None,
                })
                .collect(),
            free: (0..capacity).rev().collect(),
            range,
            cursor: 0,
            dscp,
            devices,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, handle: StreamHandle) -> Option<&MediaStream> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.stream.as_ref())
    }

    pub fn get_mut(&mut self, handle: StreamHandle) -> Option<&mut MediaStream> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.stream.as_mut())
    }

    pub fn resolve_token(&self, token: Token) -> Option<(StreamHandle, Leg)> {
        let index = token.0 / 2;
        let leg = if token.0 % 2 == 0 { Leg::Rtp } else { Leg::Rtcp };
        let slot = self.slots.get(index)?;
        slot.stream.as_ref()?;
        Some((
            StreamHandle {
                index,
                generation: slot.generation,
            },
            leg,
        ))
    }

    fn live(&self) -> impl Iterator<Item = (StreamHandle, &MediaStream)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.stream.as_ref().map(|stream| {
                (
                    StreamHandle {
                        index,
                        generation: slot.generation,
                    },
                    stream,
                )
            })
        })
    }

    fn find(&self, request: &ForwardRequest, client_id: &str) -> Option<StreamHandle> {
        self.live().find_map(|(handle, stream)| {
            (compare_call_id(&stream.call_id, &request.call_id)
                && stream.direction == request.direction
                && stream.media_index == request.media_index
                && stream.client_id == client_id)
                .then_some(handle)
        })
    }

    fn port_in_use(&self, local_addr: IpAddr, port: u16) -> bool {
        self.live()
            .any(|(_, stream)| stream.local_addr == local_addr && stream.local_port == port)
    }

    fn bind_pair(&self, local_addr: IpAddr, port: u16) -> Result<[UdpSocket; 2]> {
        let device = self.devices.get(&local_addr).map(String::as_str);
        let rtp = bind_udp_socket(SocketAddr::new(local_addr, port), device, self.dscp)?;
        let rtcp = bind_udp_socket(SocketAddr::new(local_addr, port + 1), device, self.dscp)?;
        Ok([UdpSocket::from_std(rtp), UdpSocket::from_std(rtcp)])
    }

    /// Opens (or refreshes) the stream for `request`; returns its RTP port.
    pub fn start(
        &mut self,
        request: ForwardRequest,
        registry: &Registry,
        now: Instant,
    ) -> Result<(StreamHandle, u16)> {
        let client_id = truncate(&request.client_id);
        if let Some(handle) = self.find(&request, &client_id) {
            if let Some(stream) = self.get_mut(handle) {
                if stream.remote != request.remote {
                    debug!(call_id = %stream.call_id, old = %stream.remote, new = %request.remote, "relay remote changed");
                }
                stream.remote = request.remote;
                stream.jitter.reset();
                stream.last_activity = now;
                return Ok((handle, stream.local_port));
            }
        }

        let index = self.free.pop().ok_or(Error::TableFull("media stream"))?;
        let pairs = self.range.pair_count();
        let mut bound = None;
        for step in 0..pairs {
            let offset = (self.cursor + step) % pairs;
            let port = self.range.min + (offset as u16) * 2;
            if port.checked_add(1).is_none_or(|rtcp| rtcp > self.range.max) {
                continue;
            }
            if self.port_in_use(request.local_addr, port) {
                continue;
            }
            match self.bind_pair(request.local_addr, port) {
                Ok(sockets) => {
                    self.cursor = offset + 1;
                    bound = Some((port, sockets));
                    break;
                }
                Err(err) => trace!(port, error = %err, "relay port unavailable"),
            }
        }
        let Some((port, mut sockets)) = bound else {
            self.free.push(index);
            return Err(Error::NoPortAvailable {
                min: self.range.min,
                max: self.range.max,
            });
        };

        let handle = StreamHandle {
            index,
            generation: self.slots[index].generation,
        };
        for (leg, socket) in [Leg::Rtp, Leg::Rtcp].into_iter().zip(sockets.iter_mut()) {
            if let Err(err) = registry.register(socket, handle.token(leg), Interest::READABLE) {
                self.free.push(index);
                return Err(err.into());
            }
        }

        self.slots[index].stream = Some(MediaStream {
            call_id: request.call_id,
            client_id,
            direction: request.direction,
            media_index: request.media_index,
            local_addr: request.local_addr,
            local_port: port,
            remote: request.remote,
            jitter: JitterState::new(request.dejitter),
            last_activity: now,
            peer: None,
            sockets,
        });
        Ok((handle, port))
    }

    /// Handles of the streams a stop request refers to.
    pub fn matching(
        &self,
        call_id: &CallId,
        direction: Direction,
        selector: MediaSelector,
    ) -> Vec<StreamHandle> {
        self.live()
            .filter(|(_, stream)| {
                compare_call_id(&stream.call_id, call_id)
                    && stream.direction == direction
                    && selector.matches(stream.media_index)
            })
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Opposite stream of `handle`, matched lazily and cached on both ends.
    pub fn find_peer(&mut self, handle: StreamHandle) -> Option<StreamHandle> {
        let stream = self.get(handle)?;
        if let Some(peer) = stream.peer
            && self.get(peer).is_some()
        {
            return Some(peer);
        }
        let peer = self
            .live()
            .find(|(candidate, other)| *candidate != handle && other.is_opposite_of(stream))
            .map(|(candidate, _)| candidate);
        if let Some(stream) = self.get_mut(handle) {
            stream.peer = peer;
        }
        if let Some(peer) = peer
            && let Some(other) = self.get_mut(peer)
        {
            other.peer = Some(handle);
        }
        peer
    }

    /// Closes the stream's sockets and frees its slot.
    pub fn remove(&mut self, handle: StreamHandle, registry: &Registry) -> Option<MediaStream> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let mut stream = slot.stream.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        for socket in stream.sockets.iter_mut() {
            if let Err(err) = registry.deregister(socket) {
                trace!(error = %err, "deregister relay socket");
            }
        }
        for slot in self.slots.iter_mut() {
            if let Some(other) = slot.stream.as_mut()
                && other.peer == Some(handle)
            {
                other.peer = None;
            }
        }
        Some(stream)
    }

    pub fn handles(&self) -> Vec<StreamHandle> {
        self.live().map(|(handle, _)| handle).collect()
    }

    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<StreamHandle> {
        self.live()
            .filter(|(_, stream)| now.saturating_duration_since(stream.last_activity) > timeout)
            .map(|(handle, _)| handle)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<StreamInfo> {
        self.live()
            .map(|(_, stream)| StreamInfo {
                call_id: stream.call_id.clone(),
                client_id: stream.client_id.clone(),
                direction: stream.direction,
                media_index: stream.media_index,
                local_addr: stream.local_addr,
                local_port: stream.local_port,
                remote: stream.remote,
                has_peer: stream.peer.is_some(),
            })
            .collect()
    }
}
