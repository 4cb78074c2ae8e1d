//! Per-stream RTP clock estimation and the delayed-send queue.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::media::table::StreamHandle;

const WARMUP_PACKETS: u32 = 20;
const SETTLE_PACKETS: u32 = 200;
/// Larger forward steps are treated as a new source (about 5 s at 48 kHz).
const MAX_TIMESTAMP_STEP: u32 = 240_000;
/// Largest payload a queue slot can hold.
pub const SLOT_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    Rtp,
    Rtcp,
}

impl Leg {
    pub fn index(self) -> usize {
        match self {
            Leg::Rtp => 0,
            Leg::Rtcp => 1,
        }
    }
}

/// Timestamp of an RTP packet; `None` for RTCP and anything else.
pub fn rtp_timestamp(payload: &[u8]) -> Option<u32> {
    if payload.len() < 12 || payload[0] >> 6 != 2 {
        return None;
    }
    // RTCP packet types 200..=204 alias payload types 72..=76 with the marker set
    if (72..=76).contains(&(payload[1] & 0x7f)) {
        return None;
    }
    Some(u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]))
}

/// Wall-clock seconds per RTP tick, learned from arrivals.
#[derive(Debug, Clone)]
pub struct JitterState {
    start: Option<Instant>,
    base_timestamp: u32,
    last_timestamp: u32,
    packets: u32,
    seconds_per_tick: f64,
    target: Duration,
}

impl JitterState {
    pub fn new(target: Duration) -> Self {
        Self {
            start: None,
            base_timestamp: 0,
            last_timestamp: 0,
            packets: 0,
            seconds_per_tick: 0.0,
            target,
        }
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    pub fn packets(&self) -> u32 {
        self.packets
    }

    pub fn seconds_per_tick(&self) -> f64 {
        self.seconds_per_tick
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.target);
    }

    fn restart(&mut self, timestamp: u32, now: Instant) {
        self.start = Some(now);
        self.base_timestamp = timestamp;
        self.last_timestamp = timestamp;
        self.packets = 1;
        self.seconds_per_tick = 0.0;
    }

    fn clamp(&self, ideal: Instant, now: Instant) -> Instant {
        let Some(latest) = self
            .target
            .checked_mul(2)
            .and_then(|window| now.checked_add(window))
        else {
            return now;
        };
        ideal.checked_add(self.target).unwrap_or(latest).clamp(now, latest)
    }

    /// Send time for a packet with RTP `timestamp` that arrived at `now`.
    pub fn schedule(&mut self, timestamp: u32, now: Instant) -> Instant {
        let Some(start) = self.start else {
            self.restart(timestamp, now);
            return self.clamp(now, now);
        };

        let step = timestamp.wrapping_sub(self.last_timestamp);
        if step > MAX_TIMESTAMP_STEP {
            // wrapped negative or jumped far ahead
            self.restart(timestamp, now);
            return self.clamp(now, now);
        }
        self.last_timestamp = timestamp;
        self.packets = self.packets.saturating_add(1);

        let ticks = timestamp.wrapping_sub(self.base_timestamp);
        if ticks == 0 {
            return self.clamp(now, now);
        }
        let sample = now.duration_since(start).as_secs_f64() / f64::from(ticks);

        if self.packets <= WARMUP_PACKETS {
            let n = f64::from(self.packets - 1);
            self.seconds_per_tick = if n <= 1.0 {
                sample
            } else {
                (self.seconds_per_tick * (n - 1.0) + sample) / n
            };
            return self.clamp(now, now);
        }

        self.seconds_per_tick = if self.packets <= SETTLE_PACKETS {
            self.seconds_per_tick * 0.95 + sample * 0.05
        } else {
            self.seconds_per_tick * 0.99 + sample * 0.01
        };
        let offset = Duration::from_secs_f64((self.seconds_per_tick * f64::from(ticks)).max(0.0));
        self.clamp(start + offset, now)
    }
}

#[derive(Debug)]
struct Slot {
    stream: StreamHandle,
    leg: Leg,
    destination: SocketAddr,
    due: Instant,
    len: usize,
    buf: Box<[u8]>,
    next: Option<usize>,
}

/// Fixed-capacity queue of delayed datagrams ordered by due time.
///
/// Payload buffers are allocated once; pushing never allocates.
#[derive(Debug)]
pub struct DelayQueue {
    slots: Vec<Slot>,
    head: Option<usize>,
    free: Vec<usize>,
}

impl DelayQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let now = Instant::now();
        let placeholder: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    stream: StreamHandle::default(),
                    leg: Leg::Rtp,
                    destination: placeholder,
                    due: now,
                    len: 0,
                    buf: vec![0u8; SLOT_SIZE].into_boxed_slice(),
                    next: None,
                })
                .collect(),
            head: None,
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push(
        &mut self,
        stream: StreamHandle,
        leg: Leg,
        destination: SocketAddr,
        due: Instant,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > SLOT_SIZE {
            return Err(Error::Media(format!(
                "datagram of {} bytes exceeds delay slot",
                payload.len()
            )));
        }
        let index = self.free.pop().ok_or(Error::TableFull("delay queue"))?;
        {
            let slot = &mut self.slots[index];
            slot.stream = stream;
            slot.leg = leg;
            slot.destination = destination;
            slot.due = due;
            slot.len = payload.len();
            slot.buf[..payload.len()].copy_from_slice(payload);
        }

        // insert after every node due at or before `due`
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if self.slots[current].due > due {
                break;
            }
            prev = Some(current);
            cursor = self.slots[current].next;
        }
        self.slots[index].next = cursor;
        match prev {
            Some(prev) => self.slots[prev].next = Some(index),
            None => self.head = Some(index),
        }
        Ok(())
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.head.map(|index| self.slots[index].due)
    }

    /// Hands every message due at `now` to `send`, in due order.
    pub fn flush(
        &mut self,
        now: Instant,
        mut send: impl FnMut(StreamHandle, Leg, SocketAddr, &[u8]),
    ) -> usize {
        let mut sent = 0;
        while let Some(index) = self.head {
            let slot = &self.slots[index];
            if slot.due > now {
                break;
            }
            send(slot.stream, slot.leg, slot.destination, &slot.buf[..slot.len]);
            self.head = slot.next;
            self.slots[index].next = None;
            self.free.push(index);
            sent += 1;
        }
        sent
    }

    /// Drops every queued message of `stream`.
    pub fn purge(&mut self, stream: StreamHandle) -> usize {
        let mut removed = 0;
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let next = self.slots[current].next;
            if self.slots[current].stream == stream {
                match prev {
                    Some(prev) => self.slots[prev].next = next,
                    None => self.head = next,
                }
                self.slots[current].next = None;
                self.free.push(current);
                removed += 1;
            } else {
                prev = Some(current);
            }
            cursor = next;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(timestamp: u32) -> Vec<u8> {
        let mut packet = vec![0x80, 0x00, 0x00, 0x01];
        packet.extend_from_slice(&timestamp.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 1]);
        packet.extend_from_slice(&[0u8; 160]);
        packet
    }

    fn handle(index: usize) -> StreamHandle {
        StreamHandle {
            index,
            generation: 0,
        }
    }

    #[test]
    fn recognises_rtp_and_rejects_rtcp() {
        assert_eq!(rtp_timestamp(&rtp_packet(1234)), Some(1234));
        let rtcp_sr = [0x80u8, 200, 0, 6, 0, 0, 0, 1, 0, 0, 0, 0];
        assert_eq!(rtp_timestamp(&rtcp_sr), None);
        assert_eq!(rtp_timestamp(&[0x80, 0, 0]), None);
    }

    #[test]
    fn send_time_stays_within_clamp() {
        let offset = Duration::from_millis(60);
        let mut state = JitterState::new(offset);
        let start = Instant::now();
        for n in 0u32..400 {
            // 8 kHz clock, 20 ms packets with +-15 ms of arrival jitter
            let jitter = if n % 3 == 0 { 15 } else { 0 };
            let now = start + Duration::from_millis(u64::from(n) * 20 + jitter);
            let due = state.schedule(n * 160, now);
            assert!(due >= now, "packet {n} scheduled in the past");
            assert!(due <= now + offset * 2, "packet {n} scheduled beyond clamp");
        }
        assert!((state.seconds_per_tick() - 1.0 / 8000.0).abs() < 1e-5);
    }

    #[test]
    fn warmup_uses_arrival_time() {
        let offset = Duration::from_millis(40);
        let mut state = JitterState::new(offset);
        let start = Instant::now();
        for n in 0u32..WARMUP_PACKETS {
            let now = start + Duration::from_millis(u64::from(n) * 20);
            assert_eq!(state.schedule(n * 160, now), now + offset);
        }
    }

    #[test]
    fn unrepresentable_target_sends_immediately() {
        let mut state = JitterState::new(Duration::MAX);
        let now = Instant::now();
        assert_eq!(state.schedule(160, now), now);
        assert_eq!(state.schedule(320, now + Duration::from_millis(20)), now + Duration::from_millis(20));
    }

    #[test]
    fn timestamp_jump_restarts_estimator() {
        let mut state = JitterState::new(Duration::from_millis(40));
        let start = Instant::now();
        for n in 0u32..50 {
            state.schedule(n * 160, start + Duration::from_millis(u64::from(n) * 20));
        }
        assert_eq!(state.packets(), 50);
        state.schedule(10, start + Duration::from_secs(1));
        assert_eq!(state.packets(), 1);
        state.schedule(10 + MAX_TIMESTAMP_STEP + 1, start + Duration::from_secs(2));
        assert_eq!(state.packets(), 1);
    }

    #[test]
    fn queue_orders_and_flushes_due_messages() {
        let mut queue = DelayQueue::with_capacity(4);
        let now = Instant::now();
        let dest: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        queue.push(handle(0), Leg::Rtp, dest, now + Duration::from_millis(30), b"c").unwrap();
        queue.push(handle(0), Leg::Rtp, dest, now + Duration::from_millis(10), b"a").unwrap();
        queue.push(handle(1), Leg::Rtp, dest, now + Duration::from_millis(20), b"b").unwrap();
        assert_eq!(queue.next_due(), Some(now + Duration::from_millis(10)));

        let mut seen = Vec::new();
        let sent = queue.flush(now + Duration::from_millis(25), |_, _, _, payload| {
            seen.push(payload.to_vec())
        });
        assert_eq!(sent, 2);
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn full_queue_and_purge() {
        let mut queue = DelayQueue::with_capacity(2);
        let now = Instant::now();
        let dest: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        queue.push(handle(0), Leg::Rtp, dest, now, b"x").unwrap();
        queue.push(handle(1), Leg::Rtcp, dest, now, b"y").unwrap();
        let err = queue.push(handle(0), Leg::Rtp, dest, now, b"z").unwrap_err();
        assert!(err.is_exhaustion());

        assert_eq!(queue.purge(handle(0)), 1);
        assert_eq!(queue.len(), 1);
        // stale generation of the same slot does not match
        assert_eq!(queue.purge(StreamHandle { index: 1, generation: 7 }), 0);
        assert_eq!(queue.purge(handle(1)), 1);
        assert!(queue.is_empty());
    }
}
