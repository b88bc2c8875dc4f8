//! Voice gateway control plane.
//!
//! Control messages are JSON text frames shaped `{"op": <u8>, "d": ...}`
//! with an optional `"seq"` the client must acknowledge in heartbeats. MLS
//! extension traffic travels as WebSocket binary frames: the server
//! prefixes a 16-bit sequence and a 1-byte opcode, the client sends a
//! 1-byte opcode followed by the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;

/// JSON control opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GatewayOpcode {
    /// Client -> server: authenticate the voice session.
    Identify = 0,
    /// Client -> server: select transport protocol and mode.
    SelectProtocol = 1,
    /// Server -> client: UDP endpoint, SSRC, supported modes.
    Ready = 2,
    /// Client -> server: keepalive.
    Heartbeat = 3,
    /// Server -> client: transport secret and negotiated mode.
    SessionDescription = 4,
    /// Both directions: speaking state and SSRC mapping.
    Speaking = 5,
    /// Server -> client: heartbeat acknowledgement.
    HeartbeatAck = 6,
    /// Client -> server: resume a dropped session.
    Resume = 7,
    /// Server -> client: heartbeat interval.
    Hello = 8,
    /// Server -> client: resume accepted.
    Resumed = 9,
    /// Server -> client: a user left the call.
    ClientDisconnect = 13,
    /// Client -> server: platform identification.
    Platform = 20,
}

impl GatewayOpcode {
    /// Map a wire value to an opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Identify,
            1 => Self::SelectProtocol,
            2 => Self::Ready,
            3 => Self::Heartbeat,
            4 => Self::SessionDescription,
            5 => Self::Speaking,
            6 => Self::HeartbeatAck,
            7 => Self::Resume,
            8 => Self::Hello,
            9 => Self::Resumed,
            13 => Self::ClientDisconnect,
            20 => Self::Platform,
            _ => return None,
        })
    }
}

/// End-to-end encryption extension opcodes, carried on binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DaveOpcode {
    /// Server -> client: a protocol transition is coming.
    PrepareTransition = 21,
    /// Server -> client: execute a previously prepared transition.
    ExecuteTransition = 22,
    /// Client -> server: ready for the announced transition.
    TransitionReady = 23,
    /// Server -> client: prepare for an MLS epoch (re)start.
    PrepareEpoch = 24,
    /// Server -> client: the external sender the group must accept.
    MlsExternalSender = 25,
    /// Client -> server: our MLS key package.
    MlsKeyPackage = 26,
    /// Server -> client: proposals to append or revoke.
    MlsProposals = 27,
    /// Client -> server: commit produced from pending proposals.
    MlsCommitMessage = 28,
    /// Server -> client: the winning commit for this transition.
    MlsAnnounceCommitTransition = 29,
    /// Server -> client: welcome for members added by a commit.
    MlsWelcome = 30,
    /// Client -> server: a commit or welcome we could not process.
    MlsInvalidCommitWelcome = 31,
}

impl DaveOpcode {
    /// Map a wire value to an opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            21 => Self::PrepareTransition,
            22 => Self::ExecuteTransition,
            23 => Self::TransitionReady,
            24 => Self::PrepareEpoch,
            25 => Self::MlsExternalSender,
            26 => Self::MlsKeyPackage,
            27 => Self::MlsProposals,
            28 => Self::MlsCommitMessage,
            29 => Self::MlsAnnounceCommitTransition,
            30 => Self::MlsWelcome,
            31 => Self::MlsInvalidCommitWelcome,
            _ => return None,
        })
    }
}

/// A parsed inbound binary extension frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaveBinaryFrame<'a> {
    /// Server-assigned sequence number for resume bookkeeping.
    pub sequence: u16,
    /// Extension opcode.
    pub opcode: DaveOpcode,
    /// Opaque payload handed to the MLS session.
    pub payload: &'a [u8],
}

impl<'a> DaveBinaryFrame<'a> {
    /// Parse a server binary frame: `u16 seq | u8 opcode | payload`.
    pub fn parse(frame: &'a [u8]) -> Result<Self, ProtocolError> {
        if frame.len() < 3 {
            return Err(ProtocolError::DaveFrameTruncated);
        }
        let sequence = u16::from_be_bytes([frame[0], frame[1]]);
        let opcode =
            DaveOpcode::from_u8(frame[2]).ok_or(ProtocolError::UnknownOpcode(frame[2]))?;
        Ok(Self { sequence, opcode, payload: &frame[3..] })
    }

    /// Read the 16-bit big-endian transition id that prefixes welcome,
    /// announce-commit, and transition payloads.
    pub fn transition_id(&self) -> Result<u16, ProtocolError> {
        if self.payload.len() < 2 {
            return Err(ProtocolError::DaveFrameTruncated);
        }
        Ok(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Payload with the transition id prefix stripped.
    pub fn payload_after_transition_id(&self) -> Result<&'a [u8], ProtocolError> {
        if self.payload.len() < 2 {
            return Err(ProtocolError::DaveFrameTruncated);
        }
        Ok(&self.payload[2..])
    }
}

/// Encode a client binary frame: `u8 opcode | payload`.
pub fn encode_dave_frame(opcode: DaveOpcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(opcode as u8);
    frame.extend_from_slice(payload);
    frame
}

/// A JSON control message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// Opcode discriminant.
    pub op: u8,
    /// Opcode-specific payload.
    #[serde(default)]
    pub d: Value,
    /// Server sequence number, acknowledged in heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl GatewayMessage {
    /// Build an envelope for an outbound message.
    pub fn new(op: GatewayOpcode, d: Value) -> Self {
        Self { op: op as u8, d, seq: None }
    }

    /// Parse a text frame into an envelope.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    /// Decode the payload into a typed struct.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.d.clone())?)
    }
}

/// `IDENTIFY` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    /// Guild/server the voice channel belongs to.
    pub server_id: String,
    /// Our user id.
    pub user_id: String,
    /// Voice session id from the main gateway.
    pub session_id: String,
    /// Voice connection token.
    pub token: String,
    /// Highest end-to-end encryption protocol version we support;
    /// zero disables the extension.
    pub max_dave_protocol_version: u16,
}

/// `RESUME` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    /// Guild/server the voice channel belongs to.
    pub server_id: String,
    /// Voice session id being resumed.
    pub session_id: String,
    /// Voice connection token.
    pub token: String,
    /// Last server sequence we processed.
    pub seq_ack: i64,
}

/// `HELLO` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: f64,
}

/// `READY` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    /// Our RTP synchronization source.
    pub ssrc: u32,
    /// Voice server UDP address.
    pub ip: String,
    /// Voice server UDP port.
    pub port: u16,
    /// Transport encryption modes the server supports.
    pub modes: Vec<String>,
}

/// `SELECT_PROTOCOL` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProtocol {
    /// Always `"udp"`.
    pub protocol: String,
    /// Discovered external endpoint and chosen mode.
    pub data: SelectProtocolData,
}

/// Inner data of [`SelectProtocol`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProtocolData {
    /// Externally visible IP from discovery.
    pub address: String,
    /// Externally visible port from discovery.
    pub port: u16,
    /// Chosen transport encryption mode.
    pub mode: String,
}

/// `SESSION_DESCRIPTION` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Negotiated transport mode.
    pub mode: String,
    /// 32-byte transport secret key.
    pub secret_key: Vec<u8>,
    /// End-to-end protocol version the server selected; zero when
    /// the extension is off.
    #[serde(default)]
    pub dave_protocol_version: u16,
}

/// `HEARTBEAT` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Random token echoed by the acknowledgement.
    pub t: u64,
    /// Last server sequence we processed.
    pub seq_ack: i64,
}

/// `SPEAKING` payload (both directions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaking {
    /// Speaking flags; 1 = voice.
    pub speaking: u8,
    /// Playout delay hint.
    #[serde(default)]
    pub delay: u32,
    /// The speaker's SSRC.
    pub ssrc: u32,
    /// Set on server->client notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// `CLIENT_DISCONNECT` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDisconnect {
    /// The user that left the call.
    pub user_id: String,
}

/// Transport mode this client implements.
pub const TRANSPORT_MODE: &str = "aead_xchacha20_poly1305_rtpsize";
