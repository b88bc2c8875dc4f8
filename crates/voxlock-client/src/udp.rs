//! UDP media driver.
//!
//! Owns the voice socket: outbound RTP assembly (inner end-to-end
//! encryption, outer transport seal, trailing wire nonce), the paced
//! outbound queue with track markers, inbound transport opening, and IP
//! discovery.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use voxlock_core::{Encryptor, Environment, MediaType};
use voxlock_crypto::TransportCipher;
use voxlock_proto::{
    discovery::{DISCOVERY_PACKET_BYTES, DiscoveryPacket},
    rtp::{MIN_VOICE_PACKET_BYTES, RTP_HEADER_BYTES, RtpHeader, WIRE_NONCE_BYTES},
};

use crate::errors::ClientError;

/// Two-byte sentinel marking a track boundary in the outbound queue.
/// Too small to be an RTP packet, so the sender skips it instead of
/// transmitting.
pub const AUDIO_TRACK_MARKER: u16 = 0xFFFF;

/// Slices an overlap-mode sleep is divided into.
pub const AUDIO_OVERLAP_SLEEP_SAMPLES: u32 = 30;

/// How long to wait for an IP discovery reply.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound audio pacing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Throttle to real time: recorded audio arrives in bulk and must be
    /// fed out as if captured live.
    #[default]
    RecordedAudio,
    /// No throttling: the source is already real-time.
    LiveAudio,
    /// Like recorded, but each sleep is subdivided with overshoot
    /// accounting, for platforms with coarse sleep granularity.
    OverlapAudio,
}

/// An encrypted packet queued for sending.
#[derive(Debug, Clone)]
struct QueuedPacket {
    data: Vec<u8>,
    duration_ms: u64,
}

struct QueueState {
    packets: VecDeque<QueuedPacket>,
    tracks: u32,
    track_meta: Vec<String>,
}

/// The outbound packet queue with track markers.
///
/// Held under its own mutex; locked only for enqueue/dequeue, never
/// across a send.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                packets: VecDeque::new(),
                tracks: 0,
                track_meta: Vec::new(),
            }),
        }
    }

    /// Queue an encrypted packet.
    pub fn push(&self, data: Vec<u8>, duration_ms: u64) {
        let Ok(mut state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        state.packets.push_back(QueuedPacket { data, duration_ms });
    }

    /// Insert a track marker with attached metadata.
    pub fn insert_marker(&self, metadata: String) {
        let Ok(mut state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        state
            .packets
            .push_back(QueuedPacket { data: AUDIO_TRACK_MARKER.to_le_bytes().to_vec(), duration_ms: 0 });
        state.track_meta.push(metadata);
        state.tracks += 1;
    }

    /// Drop everything up to and including the next marker.
    pub fn skip_to_next_marker(&self) {
        let Ok(mut state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        match state.packets.iter().position(|packet| is_marker(&packet.data)) {
            Some(index) => {
                state.packets.drain(..=index);
            },
            None => state.packets.clear(),
        }
        state.tracks = state.tracks.saturating_sub(1);
        if !state.track_meta.is_empty() {
            state.track_meta.remove(0);
        }
    }

    /// Clear the queue and all track state.
    pub fn stop(&self) {
        let Ok(mut state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        state.packets.clear();
        state.track_meta.clear();
        state.tracks = 0;
    }

    /// Seconds of audio queued.
    pub fn secs_remaining(&self) -> f32 {
        let Ok(state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        state.packets.iter().map(|packet| packet.duration_ms as f32 / 1000.0).sum()
    }

    /// Tracks remaining: markers plus one, zero when empty.
    pub fn tracks_remaining(&self) -> u32 {
        let Ok(state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        if state.packets.is_empty() { 0 } else { state.tracks + 1 }
    }

    /// Metadata for the queued markers.
    pub fn marker_metadata(&self) -> Vec<String> {
        let Ok(state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        state.track_meta.clone()
    }

    /// Whether anything is queued.
    pub fn is_playing(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        !state.packets.is_empty()
    }

    /// Pop the next packet to send. Markers are consumed here, adjusting
    /// track state, and never returned.
    pub fn pop(&self) -> Option<(Vec<u8>, u64)> {
        let Ok(mut state) = self.state.lock() else {
            unreachable!("outbound queue mutex poisoned");
        };
        while let Some(packet) = state.packets.pop_front() {
            if is_marker(&packet.data) {
                state.tracks = state.tracks.saturating_sub(1);
                if !state.track_meta.is_empty() {
                    state.track_meta.remove(0);
                }
                continue;
            }
            return Some((packet.data, packet.duration_ms));
        }
        None
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn is_marker(data: &[u8]) -> bool {
    data.len() == 2 && data == AUDIO_TRACK_MARKER.to_le_bytes()
}

/// Paces outbound packets to their play-out rate.
pub struct Pacer<E: Environment> {
    env: E,
    mode: SendMode,
    last_send: Option<E::Instant>,
    sleep_remainder: Duration,
}

impl<E: Environment> Pacer<E> {
    /// Create a pacer for the given mode.
    pub fn new(env: E, mode: SendMode) -> Self {
        Self { env, mode, last_send: None, sleep_remainder: Duration::ZERO }
    }

    /// Sleep long enough that the packet lands `duration` after the
    /// previous one, accounting for observed send latency.
    pub async fn pace(&mut self, duration: Duration) {
        match self.mode {
            SendMode::LiveAudio => {},
            SendMode::RecordedAudio => {
                let observed = match self.last_send {
                    Some(last) => self.env.now() - last,
                    None => Duration::ZERO,
                };
                if duration > observed {
                    self.env.sleep(duration - observed).await;
                }
            },
            SendMode::OverlapAudio => {
                // Subdivide the sleep and track overshoot, so coarse
                // schedulers cannot drift the stream.
                let observed = match self.last_send {
                    Some(last) => self.env.now() - last,
                    None => Duration::ZERO,
                };
                let mut remaining = duration
                    .saturating_sub(observed)
                    .saturating_sub(self.sleep_remainder);
                let slice = remaining / AUDIO_OVERLAP_SLEEP_SAMPLES;
                let started = self.env.now();
                while remaining > Duration::ZERO && slice > Duration::ZERO {
                    self.env.sleep(slice.min(remaining)).await;
                    remaining = remaining.saturating_sub(slice);
                }
                let slept = self.env.now() - started;
                let intended = duration
                    .saturating_sub(observed)
                    .saturating_sub(self.sleep_remainder);
                self.sleep_remainder = slept.saturating_sub(intended);
            },
        }
        self.last_send = Some(self.env.now());
    }
}

/// The voice media socket.
///
/// Outbound packets are `[rtp header | sealed(inner frame) | wire nonce]`;
/// sequence, timestamp, and packet nonce advance monotonically per packet
/// and the nonce is never reused under one transport key.
pub struct MediaSocket<E: Environment> {
    socket: UdpSocket,
    encryptor: Arc<Encryptor<E>>,
    transport: Mutex<Option<TransportCipher>>,
    ssrc: u32,
    sequence: AtomicU32,
    timestamp: AtomicU32,
    packet_nonce: AtomicU32,
}

/// A transport-opened inbound packet, ready for the end-to-end layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundVoice {
    /// The speaker's SSRC.
    pub ssrc: u32,
    /// RTP sequence number.
    pub sequence: u16,
    /// RTP timestamp.
    pub timestamp: u32,
    /// Decrypted transport payload (still possibly end-to-end encrypted).
    pub payload: Vec<u8>,
}

impl<E: Environment> MediaSocket<E> {
    /// Bind an ephemeral non-blocking socket and connect it to the voice
    /// server.
    pub async fn connect(
        ip: &str,
        port: u16,
        ssrc: u32,
        encryptor: Arc<Encryptor<E>>,
    ) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ClientError::TransportSetupFailure(format!("bind failed: {e}")))?;
        socket
            .connect((ip, port))
            .await
            .map_err(|e| ClientError::TransportSetupFailure(format!("connect failed: {e}")))?;

        info!(ip, port, ssrc, "voice udp socket connected");
        Ok(Self {
            socket,
            encryptor,
            transport: Mutex::new(None),
            ssrc,
            sequence: AtomicU32::new(0),
            timestamp: AtomicU32::new(0),
            packet_nonce: AtomicU32::new(0),
        })
    }

    /// Install the transport secret from `SESSION_DESCRIPTION`.
    pub fn install_transport_key(&self, secret: &[u8; 32]) {
        let Ok(mut transport) = self.transport.lock() else {
            unreachable!("transport cipher mutex poisoned");
        };
        *transport = Some(TransportCipher::new(secret));
    }

    /// Encrypt and send one Opus frame spanning `samples` at 48 kHz.
    pub async fn send_opus_frame(&self, opus: &[u8], samples: u32) -> Result<(), ClientError> {
        let packet = self.build_packet(opus, samples)?;
        self.socket
            .send(&packet)
            .await
            .map_err(|e| ClientError::TransportSetupFailure(format!("send failed: {e}")))?;
        Ok(())
    }

    /// Send `millis` worth of canonical silence frames (20 ms each),
    /// kicking the receive pipeline on the far side.
    pub async fn send_silence(&self, millis: u64) -> Result<(), ClientError> {
        let frames = millis.div_ceil(20).max(1);
        for _ in 0..frames {
            self.send_opus_frame(&voxlock_proto::rtp::OPUS_SILENCE_PACKET, 960).await?;
        }
        Ok(())
    }

    /// Build the full wire packet for one Opus frame without sending it.
    ///
    /// Applies the inner end-to-end encryption (or passthrough), then the
    /// transport seal, then appends the big-endian wire nonce.
    pub fn build_packet(&self, opus: &[u8], samples: u32) -> Result<Vec<u8>, ClientError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) as u16;
        let timestamp = self.timestamp.fetch_add(samples, Ordering::Relaxed);
        let packet_nonce = self.packet_nonce.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let mut header = [0u8; RTP_HEADER_BYTES];
        RtpHeader::write(sequence, timestamp, self.ssrc, &mut header);

        let mut inner = vec![0u8; Encryptor::<E>::max_ciphertext_size(opus.len())];
        let written = self
            .encryptor
            .encrypt(MediaType::Audio, self.ssrc, opus, &mut inner)
            .map_err(|_| ClientError::InvalidState("frame encryption failed"))?;
        inner.truncate(written);

        let Ok(transport) = self.transport.lock() else {
            unreachable!("transport cipher mutex poisoned");
        };
        let Some(transport) = transport.as_ref() else {
            return Err(ClientError::InvalidState("transport key not installed"));
        };
        let sealed = transport
            .seal(packet_nonce, &header, &inner)
            .map_err(|_| ClientError::InvalidState("transport seal failed"))?;

        let mut packet = Vec::with_capacity(header.len() + sealed.len() + WIRE_NONCE_BYTES);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&sealed);
        packet.extend_from_slice(&packet_nonce.to_be_bytes());
        Ok(packet)
    }

    /// Receive one datagram, blocking until something arrives.
    pub async fn recv(&self, buffer: &mut [u8]) -> Result<usize, ClientError> {
        self.socket
            .recv(buffer)
            .await
            .map_err(|e| ClientError::TransportSetupFailure(format!("recv failed: {e}")))
    }

    /// Open an inbound packet's transport layer.
    ///
    /// RTCP, silence placeholders, and unauthentic packets yield `None`.
    pub fn open_packet(&self, packet: &[u8]) -> Option<InboundVoice> {
        if packet.len() < MIN_VOICE_PACKET_BYTES {
            debug!(size = packet.len(), "discarding silence placeholder packet");
            return None;
        }
        let header = match RtpHeader::parse(packet) {
            Ok(header) => header,
            Err(error) => {
                debug!(%error, "discarding malformed rtp packet");
                return None;
            },
        };
        if header.is_rtcp() {
            return None;
        }

        let nonce_at = packet.len() - WIRE_NONCE_BYTES;
        let wire_nonce = u32::from_be_bytes([
            packet[nonce_at],
            packet[nonce_at + 1],
            packet[nonce_at + 2],
            packet[nonce_at + 3],
        ]);

        let Ok(transport) = self.transport.lock() else {
            unreachable!("transport cipher mutex poisoned");
        };
        let transport = transport.as_ref()?;
        match transport.open(
            wire_nonce,
            &packet[..header.header_len],
            &packet[header.header_len..nonce_at],
        ) {
            Ok(payload) => Some(InboundVoice {
                ssrc: header.ssrc,
                sequence: header.sequence,
                timestamp: header.timestamp,
                payload,
            }),
            Err(_) => {
                warn!(ssrc = header.ssrc, "transport authentication failed");
                None
            },
        }
    }
}

impl<E: Environment> MediaSocket<E> {
    /// Send a pre-built packet (from [`MediaSocket::build_packet`]).
    pub async fn send_raw(&self, packet: &[u8]) -> Result<(), ClientError> {
        self.socket
            .send(packet)
            .await
            .map_err(|e| ClientError::TransportSetupFailure(format!("send failed: {e}")))?;
        Ok(())
    }
}

/// Encrypt an Opus frame now and queue the finished packet for paced
/// sending. Encoding up front keeps the send loop free of crypto work.
pub fn queue_opus_frame<E: Environment>(
    socket: &MediaSocket<E>,
    queue: &OutboundQueue,
    opus: &[u8],
    samples: u32,
    duration_ms: u64,
) -> Result<(), ClientError> {
    let packet = socket.build_packet(opus, samples)?;
    queue.push(packet, duration_ms);
    Ok(())
}

/// Drain the outbound queue, pacing each packet to its duration.
///
/// Returns when the queue is empty; the caller re-invokes as more audio
/// is queued.
pub async fn drain_queue<E: Environment>(
    socket: &MediaSocket<E>,
    queue: &OutboundQueue,
    pacer: &mut Pacer<E>,
) -> Result<(), ClientError> {
    while let Some((packet, duration_ms)) = queue.pop() {
        socket.send_raw(&packet).await?;
        pacer.pace(Duration::from_millis(duration_ms)).await;
    }
    Ok(())
}

/// The receive half of the media plane: read datagrams, open the
/// transport layer, decrypt the end-to-end layer with the speaker's
/// decryptor, and park the Opus payload with the courier.
///
/// Frames from SSRCs with no speaker mapping, and frames no decryptor
/// accepts, are dropped here; the courier only ever sees clean payloads.
pub async fn run_receive_loop<E: Environment>(
    socket: &MediaSocket<E>,
    session: &std::sync::Mutex<crate::session::VoiceSession<E>>,
    courier: &crate::courier::Courier,
) -> Result<(), ClientError> {
    let mut buffer = vec![0u8; 2048];
    loop {
        let received = socket.recv(&mut buffer).await?;
        let Some(voice) = socket.open_packet(&buffer[..received]) else {
            continue;
        };

        let (user_id, decryptor) = {
            let Ok(session) = session.lock() else {
                unreachable!("voice session mutex poisoned");
            };
            let Some(user_id) = session.user_for_ssrc(voice.ssrc).map(str::to_owned) else {
                debug!(ssrc = voice.ssrc, "voice from unmapped ssrc");
                continue;
            };
            (user_id, session.decryptor_for_ssrc(voice.ssrc))
        };

        let opus = match decryptor {
            Some(decryptor) => {
                let mut out = vec![0u8; voice.payload.len()];
                let written = decryptor.decrypt(MediaType::Audio, &voice.payload, &mut out);
                if written == 0 {
                    continue;
                }
                out.truncate(written);
                out
            },
            // No end-to-end layer on this call.
            None => voice.payload,
        };

        courier.park(&user_id, crate::courier::VoicePayload {
            sequence: voice.sequence,
            timestamp: voice.timestamp,
            opus,
        });
    }
}

/// Discover our external address by echoing a discovery packet off the
/// voice server. A timeout is a soft failure returning `None`.
pub async fn discover_ip(ip: &str, port: u16, ssrc: u32) -> Option<(String, u16)> {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(error) => {
            warn!(%error, "could not bind socket for ip discovery");
            return None;
        },
    };
    if let Err(error) = socket.connect((ip, port)).await {
        warn!(%error, "could not connect socket for ip discovery");
        return None;
    }

    let request = DiscoveryPacket::request(ssrc);
    if let Err(error) = socket.send(request.as_bytes()).await {
        warn!(%error, "could not send ip discovery packet");
        return None;
    }

    let mut reply = [0u8; DISCOVERY_PACKET_BYTES];
    let received =
        match tokio::time::timeout(DISCOVERY_TIMEOUT, socket.recv(&mut reply)).await {
            Ok(Ok(received)) => received,
            Ok(Err(error)) => {
                warn!(%error, "ip discovery receive failed");
                return None;
            },
            Err(_) => {
                warn!("timed out in ip discovery");
                return None;
            },
        };

    match DiscoveryPacket::parse_reply(&reply[..received]) {
        Ok((address, port)) => Some((address, port)),
        Err(error) => {
            warn!(%error, "malformed ip discovery reply");
            None
        },
    }
}
