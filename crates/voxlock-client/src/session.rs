//! Voice session state machine.
//!
//! Sans-IO in the action pattern: the drivers feed received text/binary
//! frames and one-second ticks in, and execute the returned actions
//! (frames to send, sockets to open, discovery to run). The session owns
//! the MLS state, the outbound encryptor, and one decryptor per speaking
//! member; the transports own nothing but sockets.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──HELLO──> HelloReceived ──identify──> Identifying
//!                                     └──resume───> Resuming
//! Identifying ──READY──> Ready ──SESSION_DESCRIPTION──> Described ──> Active
//! Resuming ──RESUMED──> Active
//! Active ──close 4014──> Reconnecting      Active ──fatal close──> Terminated
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use openmls_basic_credential::SignatureKeyPair;
use tracing::{debug, info, warn};
use voxlock_core::{
    Decryptor, Encryptor, Environment, MAX_PROTOCOL_VERSION,
    manager::DEFAULT_TRANSITION_EXPIRY,
    mls::MlsSession,
};
use voxlock_proto::{
    Codec,
    gateway::{
        ClientDisconnect, DaveBinaryFrame, DaveOpcode, GatewayMessage, GatewayOpcode, Heartbeat,
        Hello, Identify, Ready, Resume, SelectProtocol, SelectProtocolData, SessionDescription,
        Speaking, TRANSPORT_MODE, encode_dave_frame,
    },
};

use crate::errors::ClientError;

/// Duration of silence sent to kick the receive pipeline after a
/// non-encrypted session is described.
pub const SILENCE_KICK_MS: u64 = 20;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// WebSocket connecting; nothing received yet.
    Connecting,
    /// HELLO received; deciding between identify and resume.
    HelloReceived,
    /// IDENTIFY sent; waiting for READY.
    Identifying,
    /// RESUME sent; waiting for RESUMED.
    Resuming,
    /// READY received; UDP endpoint known, discovery in flight.
    Ready,
    /// SESSION_DESCRIPTION received; transport key installed.
    Described,
    /// Media is flowing.
    Active,
    /// Dropped with a resumable error; the driver is reconnecting.
    Reconnecting,
    /// Dropped with a fatal error; the session is dead.
    Terminated,
}

/// Static parameters of a voice connection.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Guild/server id.
    pub server_id: String,
    /// Our user id.
    pub user_id: String,
    /// Voice session id (also keys the persisted signature key).
    pub session_id: String,
    /// Voice token.
    pub token: String,
    /// Highest end-to-end protocol version to offer; zero disables.
    pub max_dave_version: u16,
}

/// Actions the session asks its drivers to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send a JSON text frame on the gateway.
    SendText(String),
    /// Send a binary extension frame on the gateway.
    SendBinary(Vec<u8>),
    /// Run IP discovery against the voice UDP endpoint.
    DiscoverIp {
        /// Server address.
        ip: String,
        /// Server port.
        port: u16,
        /// Our SSRC.
        ssrc: u32,
    },
    /// Bind and connect the media UDP socket.
    ConnectUdp {
        /// Server address.
        ip: String,
        /// Server port.
        port: u16,
    },
    /// Install the transport secret on the UDP driver.
    InstallTransportKey {
        /// 32-byte session secret.
        secret: [u8; 32],
    },
    /// Send this many milliseconds of silence to start the pipeline.
    SendSilence {
        /// Milliseconds of silence.
        millis: u64,
    },
    /// Clear the outbound audio queue.
    StopAudio,
    /// Attempt a reconnect + resume.
    Reconnect,
    /// The session is terminally closed.
    Terminate,
}

/// The voice session state machine.
pub struct VoiceSession<E: Environment> {
    env: E,
    config: VoiceConfig,
    state: SessionState,

    heartbeat_interval: Option<Duration>,
    last_heartbeat: Option<E::Instant>,
    receive_sequence: i64,
    tick_parity: u64,
    message_queue: VecDeque<String>,

    ssrc: u32,
    udp_endpoint: Option<(String, u16)>,
    modes: Vec<String>,
    secret_key: Option<[u8; 32]>,
    /// True once we've been READY at least once; HELLO then resumes.
    resumable: bool,
    sending: bool,

    dave_version: u16,
    /// Persisted signature key reused across sessions, when the embedder
    /// loaded one from the key store.
    signature_key: Option<SignatureKeyPair>,
    mls: Option<MlsSession<E>>,
    encryptor: Arc<Encryptor<E>>,
    decryptors: HashMap<String, Arc<Decryptor<E>>>,
    ssrc_users: HashMap<u32, String>,
    user_list: Vec<String>,
    pending_transition: Option<u16>,
}

impl<E: Environment> VoiceSession<E> {
    /// Create a session in the connecting state.
    pub fn new(env: E, config: VoiceConfig) -> Self {
        Self::with_signature_key(env, config, None)
    }

    /// Create a session that signs MLS traffic with a persisted key pair.
    pub fn with_signature_key(
        env: E,
        config: VoiceConfig,
        signature_key: Option<SignatureKeyPair>,
    ) -> Self {
        let encryptor = Arc::new(Encryptor::new(env.clone()));
        // Until the group is established, outbound frames pass through.
        encryptor.set_passthrough_mode(true);

        Self {
            env,
            config,
            state: SessionState::Connecting,
            heartbeat_interval: None,
            last_heartbeat: None,
            receive_sequence: -1,
            tick_parity: 0,
            message_queue: VecDeque::new(),
            ssrc: 0,
            udp_endpoint: None,
            modes: Vec::new(),
            secret_key: None,
            resumable: false,
            sending: false,
            dave_version: 0,
            signature_key,
            mls: None,
            encryptor,
            decryptors: HashMap::new(),
            ssrc_users: HashMap::new(),
            user_list: Vec::new(),
            pending_transition: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Our SSRC, zero before READY.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Negotiated end-to-end protocol version; zero when disabled.
    pub fn dave_protocol_version(&self) -> u16 {
        self.dave_version
    }

    /// Transport modes the server offered in READY.
    pub fn supported_modes(&self) -> &[String] {
        &self.modes
    }

    /// Transport secret from SESSION_DESCRIPTION, once described.
    pub fn transport_secret(&self) -> Option<&[u8; 32]> {
        self.secret_key.as_ref()
    }

    /// Outbound encryptor, shared with the UDP driver.
    pub fn encryptor(&self) -> Arc<Encryptor<E>> {
        self.encryptor.clone()
    }

    /// Decryptor for a receiving SSRC, if the speaker is known.
    pub fn decryptor_for_ssrc(&self, ssrc: u32) -> Option<Arc<Decryptor<E>>> {
        let user_id = self.ssrc_users.get(&ssrc)?;
        self.decryptors.get(user_id).cloned()
    }

    /// User id behind a receiving SSRC.
    pub fn user_for_ssrc(&self, ssrc: u32) -> Option<&str> {
        self.ssrc_users.get(&ssrc).map(String::as_str)
    }

    /// Whether the call is end-to-end encrypted: true once a privacy code
    /// has been derived.
    pub fn is_end_to_end_encrypted(&self) -> bool {
        self.mls.as_ref().is_some_and(MlsSession::is_established)
    }

    /// The call privacy code; empty until the group is established.
    pub fn privacy_code(&self) -> String {
        match &self.mls {
            Some(mls) if mls.is_established() => mls.privacy_code(),
            _ => String::new(),
        }
    }

    /// Pairwise privacy code with another member; empty unless available.
    pub fn user_privacy_code(&self, user_id: &str) -> String {
        match &self.mls {
            Some(mls) if mls.is_established() => mls.pairwise_privacy_code(0, user_id),
            _ => String::new(),
        }
    }

    /// Handle a JSON text frame from the gateway.
    pub fn handle_text(&mut self, text: &str) -> Result<Vec<SessionAction>, ClientError> {
        let message = GatewayMessage::parse(text)?;
        if let Some(sequence) = message.seq {
            self.receive_sequence = sequence;
        }

        let Some(opcode) = GatewayOpcode::from_u8(message.op) else {
            debug!(op = message.op, "ignoring unknown gateway opcode");
            return Ok(Vec::new());
        };

        match opcode {
            GatewayOpcode::Hello => self.on_hello(&message),
            GatewayOpcode::Ready => self.on_ready(&message),
            GatewayOpcode::SessionDescription => self.on_session_description(&message),
            GatewayOpcode::HeartbeatAck => Ok(Vec::new()),
            GatewayOpcode::Speaking => self.on_speaking(&message),
            GatewayOpcode::Resumed => {
                info!("voice session resumed");
                self.state = SessionState::Active;
                Ok(Vec::new())
            },
            GatewayOpcode::ClientDisconnect => self.on_client_disconnect(&message),
            _ => Ok(Vec::new()),
        }
    }

    /// Handle a binary extension frame from the gateway.
    pub fn handle_binary(&mut self, frame: &[u8]) -> Result<Vec<SessionAction>, ClientError> {
        let frame = DaveBinaryFrame::parse(frame)?;
        self.receive_sequence = i64::from(frame.sequence);

        match frame.opcode {
            DaveOpcode::MlsExternalSender => {
                let mls = self.mls.as_mut().ok_or(ClientError::InvalidState("no mls session"))?;
                mls.set_external_sender(frame.payload)?;
                Ok(Vec::new())
            },
            DaveOpcode::MlsProposals => self.on_mls_proposals(frame.payload),
            DaveOpcode::MlsAnnounceCommitTransition => {
                let transition_id = frame.transition_id()?;
                let commit = frame.payload_after_transition_id()?;
                self.pending_transition = Some(transition_id);
                self.on_group_changed(|mls| mls.process_commit(commit))?;
                Ok(Vec::new())
            },
            DaveOpcode::MlsWelcome => {
                let transition_id = frame.transition_id()?;
                let welcome = frame.payload_after_transition_id()?;
                self.pending_transition = Some(transition_id);
                self.on_group_changed(|mls| mls.process_welcome(welcome))?;
                Ok(Vec::new())
            },
            DaveOpcode::PrepareTransition => {
                let transition_id = frame.transition_id()?;
                self.pending_transition = Some(transition_id);
                Ok(vec![transition_ready(transition_id)])
            },
            DaveOpcode::ExecuteTransition => {
                let transition_id = frame.transition_id()?;
                self.on_execute_transition(transition_id)
            },
            DaveOpcode::PrepareEpoch => self.on_prepare_epoch(frame.payload),
            DaveOpcode::MlsInvalidCommitWelcome => {
                let transition_id = frame.transition_id().unwrap_or(0);
                warn!(transition_id, "server flagged our commit/welcome invalid");
                self.reinitialize_mls()
            },
            DaveOpcode::TransitionReady
            | DaveOpcode::MlsKeyPackage
            | DaveOpcode::MlsCommitMessage => {
                // Client -> server opcodes; a server echoing them is noise.
                Ok(Vec::new())
            },
        }
    }

    /// Handle the gateway closing with an error code.
    ///
    /// Errors 4003..4016 except 4014 are fatal: audio state is cleared and
    /// the session terminates. 4014 reconnects and resumes.
    pub fn handle_close(&mut self, code: u16) -> Vec<SessionAction> {
        warn!(code, "voice gateway closed");
        if ClientError::is_fatal_code(code) {
            self.state = SessionState::Terminated;
            self.message_queue.clear();
            return vec![SessionAction::StopAudio, SessionAction::Terminate];
        }
        self.state = SessionState::Reconnecting;
        vec![SessionAction::Reconnect]
    }

    /// One-second tick: heartbeats and the rate-limited message queue.
    ///
    /// Outbound control messages drain at 1 per odd tick and 2 per even
    /// tick; heartbeats jump the queue.
    pub fn tick(&mut self, now: E::Instant) -> Vec<SessionAction> {
        if self.state == SessionState::Terminated {
            return Vec::new();
        }

        self.tick_parity = self.tick_parity.wrapping_add(1);

        if let Some(interval) = self.heartbeat_interval {
            let due = match self.last_heartbeat {
                Some(last) => now - last > interval.mul_f64(0.75),
                None => true,
            };
            if due {
                let heartbeat = GatewayMessage::new(
                    GatewayOpcode::Heartbeat,
                    to_value(&Heartbeat {
                        t: self.env.random_u64(),
                        seq_ack: self.receive_sequence,
                    }),
                );
                self.message_queue.push_front(heartbeat.to_json());
                self.last_heartbeat = Some(now);
            }
        }

        // One message on odd ticks, two on even ticks.
        let budget = 2 - (self.tick_parity % 2);
        let mut actions = Vec::new();
        for _ in 0..budget {
            let Some(message) = self.message_queue.pop_front() else {
                break;
            };
            actions.push(SessionAction::SendText(message));
        }
        actions
    }

    /// Queue a SPEAKING notification the first time audio is sent.
    pub fn start_speaking(&mut self) -> Vec<SessionAction> {
        if self.sending {
            return Vec::new();
        }
        self.sending = true;
        let speaking = GatewayMessage::new(
            GatewayOpcode::Speaking,
            to_value(&Speaking { speaking: 1, delay: 0, ssrc: self.ssrc, user_id: None }),
        );
        vec![SessionAction::SendText(speaking.to_json())]
    }

    /// IP discovery finished; select the transport protocol.
    pub fn external_address_discovered(
        &mut self,
        address: String,
        port: u16,
    ) -> Vec<SessionAction> {
        info!(address, port, "external address discovered");
        let select = GatewayMessage::new(
            GatewayOpcode::SelectProtocol,
            to_value(&SelectProtocol {
                protocol: "udp".into(),
                data: SelectProtocolData { address, port, mode: TRANSPORT_MODE.into() },
            }),
        );
        vec![SessionAction::SendText(select.to_json())]
    }

    fn on_hello(&mut self, message: &GatewayMessage) -> Result<Vec<SessionAction>, ClientError> {
        let hello: Hello = message.payload()?;
        self.heartbeat_interval = Some(Duration::from_millis(hello.heartbeat_interval as u64));
        self.receive_sequence = -1;
        self.state = SessionState::HelloReceived;

        // A session that has been READY before carries its modes and can
        // resume; a fresh one identifies.
        let action = if self.resumable {
            self.state = SessionState::Resuming;
            GatewayMessage::new(
                GatewayOpcode::Resume,
                to_value(&Resume {
                    server_id: self.config.server_id.clone(),
                    session_id: self.config.session_id.clone(),
                    token: self.config.token.clone(),
                    seq_ack: self.receive_sequence,
                }),
            )
        } else {
            self.state = SessionState::Identifying;
            GatewayMessage::new(
                GatewayOpcode::Identify,
                to_value(&Identify {
                    server_id: self.config.server_id.clone(),
                    user_id: self.config.user_id.clone(),
                    session_id: self.config.session_id.clone(),
                    token: self.config.token.clone(),
                    max_dave_protocol_version: self.config.max_dave_version,
                }),
            )
        };
        Ok(vec![SessionAction::SendText(action.to_json())])
    }

    fn on_ready(&mut self, message: &GatewayMessage) -> Result<Vec<SessionAction>, ClientError> {
        let ready: Ready = message.payload()?;
        info!(ssrc = ready.ssrc, ip = %ready.ip, port = ready.port, "voice ready");

        self.ssrc = ready.ssrc;
        self.udp_endpoint = Some((ready.ip.clone(), ready.port));
        self.modes = ready.modes;
        self.resumable = true;
        self.state = SessionState::Ready;
        self.encryptor.assign_ssrc_to_codec(ready.ssrc, Codec::Opus);

        Ok(vec![
            SessionAction::ConnectUdp { ip: ready.ip.clone(), port: ready.port },
            SessionAction::DiscoverIp { ip: ready.ip, port: ready.port, ssrc: ready.ssrc },
        ])
    }

    fn on_session_description(
        &mut self,
        message: &GatewayMessage,
    ) -> Result<Vec<SessionAction>, ClientError> {
        let description: SessionDescription = message.payload()?;
        if description.secret_key.len() != 32 {
            return Err(ClientError::InvalidState("transport secret is not 32 bytes"));
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&description.secret_key);
        self.secret_key = Some(secret);
        self.state = SessionState::Described;

        let mut actions = vec![SessionAction::InstallTransportKey { secret }];

        let requested = self.config.max_dave_version;
        if requested != 0 && description.dave_protocol_version == requested {
            self.dave_version = requested;
            let mls = MlsSession::init(
                self.env.clone(),
                requested,
                group_id_from(&self.config.server_id),
                self.config.user_id.clone(),
                self.signature_key.clone(),
            )?;
            actions.push(SessionAction::SendBinary(encode_dave_frame(
                DaveOpcode::MlsKeyPackage,
                mls.marshalled_key_package(),
            )));
            self.mls = Some(mls);
            info!(version = requested, "end-to-end encryption negotiating");
        } else {
            // Downgrade: no end-to-end layer; kick the receive pipeline.
            self.dave_version = 0;
            self.mls = None;
            self.encryptor.set_passthrough_mode(true);
            actions.push(SessionAction::SendSilence { millis: SILENCE_KICK_MS });
            if requested != 0 {
                warn!(
                    offered = requested,
                    got = description.dave_protocol_version,
                    "server downgraded end-to-end encryption"
                );
            }
        }

        self.state = SessionState::Active;
        Ok(actions)
    }

    fn on_speaking(&mut self, message: &GatewayMessage) -> Result<Vec<SessionAction>, ClientError> {
        let speaking: Speaking = message.payload()?;
        if let Some(user_id) = speaking.user_id {
            debug!(ssrc = speaking.ssrc, user_id, "speaker mapped");
            self.ssrc_users.insert(speaking.ssrc, user_id.clone());
            if !self.user_list.contains(&user_id) {
                self.user_list.push(user_id);
            }
        }
        Ok(Vec::new())
    }

    fn on_client_disconnect(
        &mut self,
        message: &GatewayMessage,
    ) -> Result<Vec<SessionAction>, ClientError> {
        let disconnect: ClientDisconnect = message.payload()?;
        info!(user_id = %disconnect.user_id, "client disconnected");
        self.ssrc_users.retain(|_, user| user != &disconnect.user_id);
        self.decryptors.remove(&disconnect.user_id);
        self.user_list.retain(|user| user != &disconnect.user_id);
        Ok(Vec::new())
    }

    fn on_mls_proposals(&mut self, payload: &[u8]) -> Result<Vec<SessionAction>, ClientError> {
        let mls = self.mls.as_mut().ok_or(ClientError::InvalidState("no mls session"))?;
        let commit = mls.process_proposals(payload, &self.user_list)?;

        Ok(match commit {
            Some(commit) => {
                vec![SessionAction::SendBinary(encode_dave_frame(
                    DaveOpcode::MlsCommitMessage,
                    &commit,
                ))]
            },
            None => Vec::new(),
        })
    }

    fn on_execute_transition(
        &mut self,
        transition_id: u16,
    ) -> Result<Vec<SessionAction>, ClientError> {
        info!(transition_id, "executing transition");
        if let Some(prepared) = self.pending_transition {
            if prepared != transition_id {
                warn!(prepared, transition_id, "executing a transition we did not prepare");
            }
        }

        if self.mls.is_some() {
            // Media must be end-to-end encrypted from here on; unencrypted
            // stragglers get the default grace window.
            self.encryptor.set_passthrough_mode(false);
            for decryptor in self.decryptors.values() {
                decryptor.transition_to_passthrough(false, DEFAULT_TRANSITION_EXPIRY);
            }
        }
        self.pending_transition = None;
        Ok(vec![transition_ready(transition_id)])
    }

    fn on_prepare_epoch(&mut self, payload: &[u8]) -> Result<Vec<SessionAction>, ClientError> {
        if payload.len() < 6 {
            return Err(voxlock_proto::ProtocolError::DaveFrameTruncated.into());
        }
        let transition_id = u16::from_be_bytes([payload[0], payload[1]]);
        let epoch = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
        info!(transition_id, epoch, "prepare epoch");

        self.pending_transition = Some(transition_id);
        if epoch == 1 {
            // Epoch one means the group is restarting from scratch.
            return self.reinitialize_mls();
        }
        Ok(Vec::new())
    }

    /// Tear down and reinitialize the MLS session at the highest supported
    /// version, republishing our key package.
    fn reinitialize_mls(&mut self) -> Result<Vec<SessionAction>, ClientError> {
        if let Some(mls) = self.mls.as_mut() {
            mls.reset();
        }
        let mls = MlsSession::init(
            self.env.clone(),
            MAX_PROTOCOL_VERSION,
            group_id_from(&self.config.server_id),
            self.config.user_id.clone(),
            self.signature_key.clone(),
        )?;
        let key_package =
            encode_dave_frame(DaveOpcode::MlsKeyPackage, mls.marshalled_key_package());
        self.mls = Some(mls);
        self.decryptors.clear();
        Ok(vec![SessionAction::SendBinary(key_package)])
    }

    /// Apply a group change (commit or welcome): fresh decryptors for the
    /// whole roster, and our own ratchet on the encryptor.
    fn on_group_changed(
        &mut self,
        change: impl FnOnce(&mut MlsSession<E>) -> Result<Vec<String>, voxlock_core::MlsError>,
    ) -> Result<(), ClientError> {
        let mls = self.mls.as_mut().ok_or(ClientError::InvalidState("no mls session"))?;
        let roster = change(mls)?;

        for user_id in &roster {
            let ratchet = mls.key_ratchet_for(user_id)?;
            let decryptor = Arc::new(Decryptor::new(self.env.clone()));
            decryptor.transition_to_key_ratchet_default(Box::new(ratchet));
            self.decryptors.insert(user_id.clone(), decryptor);
        }
        self.user_list = roster;

        let own_ratchet = mls.key_ratchet_for(&self.config.user_id)?;
        self.encryptor.set_key_ratchet(Box::new(own_ratchet));

        info!(
            epoch = mls.epoch(),
            members = self.user_list.len(),
            privacy_code = %mls.privacy_code(),
            "group state updated"
        );
        Ok(())
    }
}

/// Encode a `TRANSITION_READY` reply.
fn transition_ready(transition_id: u16) -> SessionAction {
    SessionAction::SendBinary(encode_dave_frame(
        DaveOpcode::TransitionReady,
        &transition_id.to_be_bytes(),
    ))
}

/// Derive the MLS group id from the server id.
fn group_id_from(server_id: &str) -> u64 {
    server_id.parse().unwrap_or_else(|_| {
        // Non-numeric server ids hash down to a stable 64-bit id.
        let mut id: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in server_id.bytes() {
            id ^= u64::from(byte);
            id = id.wrapping_mul(0x100_0000_01b3);
        }
        id
    })
}

fn to_value<T: serde::Serialize>(payload: &T) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use voxlock_core::env::SimEnv;

    use super::*;

    fn config() -> VoiceConfig {
        VoiceConfig {
            server_id: "81384788765712384".into(),
            user_id: "user-a".into(),
            session_id: "session-1".into(),
            token: "token".into(),
            max_dave_version: 1,
        }
    }

    fn session() -> VoiceSession<SimEnv> {
        VoiceSession::new(SimEnv::default(), config())
    }

    fn hello(session: &mut VoiceSession<SimEnv>) -> Vec<SessionAction> {
        session
            .handle_text(r#"{"op":8,"d":{"heartbeat_interval":41250.0}}"#)
            .unwrap()
    }

    fn ready(session: &mut VoiceSession<SimEnv>) -> Vec<SessionAction> {
        session
            .handle_text(
                r#"{"op":2,"d":{"ssrc":12345,"ip":"198.51.100.7","port":4010,
                   "modes":["aead_xchacha20_poly1305_rtpsize"]}}"#,
            )
            .unwrap()
    }

    #[test]
    fn hello_triggers_identify_with_dave_version() {
        let mut session = session();
        let actions = hello(&mut session);

        assert_eq!(session.state(), SessionState::Identifying);
        let [SessionAction::SendText(text)] = actions.as_slice() else {
            unreachable!("expected a single identify frame");
        };
        let message = GatewayMessage::parse(text).unwrap();
        assert_eq!(message.op, GatewayOpcode::Identify as u8);
        let identify: Identify = message.payload().unwrap();
        assert_eq!(identify.max_dave_protocol_version, 1);
    }

    #[test]
    fn second_hello_resumes() {
        let mut session = session();
        hello(&mut session);
        ready(&mut session);

        let actions = hello(&mut session);
        assert_eq!(session.state(), SessionState::Resuming);
        let [SessionAction::SendText(text)] = actions.as_slice() else {
            unreachable!("expected a single resume frame");
        };
        assert_eq!(GatewayMessage::parse(text).unwrap().op, GatewayOpcode::Resume as u8);
    }

    #[test]
    fn ready_connects_udp_and_discovers() {
        let mut session = session();
        hello(&mut session);
        let actions = ready(&mut session);

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.ssrc(), 12345);
        assert!(actions.contains(&SessionAction::ConnectUdp {
            ip: "198.51.100.7".into(),
            port: 4010
        }));
        assert!(actions.contains(&SessionAction::DiscoverIp {
            ip: "198.51.100.7".into(),
            port: 4010,
            ssrc: 12345
        }));
    }

    #[test]
    fn discovery_result_selects_protocol() {
        let mut session = session();
        hello(&mut session);
        ready(&mut session);

        let actions = session.external_address_discovered("203.0.113.5".into(), 50000);
        let [SessionAction::SendText(text)] = actions.as_slice() else {
            unreachable!("expected a single select-protocol frame");
        };
        let message = GatewayMessage::parse(text).unwrap();
        assert_eq!(message.op, GatewayOpcode::SelectProtocol as u8);
        let select: SelectProtocol = message.payload().unwrap();
        assert_eq!(select.data.mode, TRANSPORT_MODE);
        assert_eq!(select.data.address, "203.0.113.5");
        assert_eq!(select.data.port, 50000);
    }

    fn describe(session: &mut VoiceSession<SimEnv>, dave_version: u16) -> Vec<SessionAction> {
        let secret: Vec<u8> = (0u8..32).collect();
        let description = serde_json::json!({
            "op": 4,
            "d": {
                "mode": TRANSPORT_MODE,
                "secret_key": secret,
                "dave_protocol_version": dave_version,
            }
        });
        session.handle_text(&description.to_string()).unwrap()
    }

    #[test]
    fn session_description_with_dave_publishes_key_package() {
        let mut session = session();
        hello(&mut session);
        ready(&mut session);
        let actions = describe(&mut session, 1);

        assert_eq!(session.state(), SessionState::Active);
        assert!(matches!(actions[0], SessionAction::InstallTransportKey { .. }));
        let Some(SessionAction::SendBinary(frame)) = actions.get(1) else {
            unreachable!("expected a key package frame");
        };
        assert_eq!(frame[0], DaveOpcode::MlsKeyPackage as u8);
        assert!(frame.len() > 1);
    }

    #[test]
    fn session_description_downgrade_sends_silence() {
        let mut session = session();
        hello(&mut session);
        ready(&mut session);
        let actions = describe(&mut session, 0);

        assert!(actions.contains(&SessionAction::SendSilence { millis: SILENCE_KICK_MS }));
        assert!(session.encryptor().is_passthrough());
        assert!(!session.is_end_to_end_encrypted());
        assert_eq!(session.privacy_code(), "");
    }

    #[test]
    fn execute_transition_replies_ready_and_closes_passthrough() {
        let mut session = session();
        hello(&mut session);
        ready(&mut session);
        describe(&mut session, 1);

        let frame = [0x00, 0x02, DaveOpcode::ExecuteTransition as u8, 0x00, 0x07];
        let actions = session.handle_binary(&frame).unwrap();

        assert_eq!(actions, vec![SessionAction::SendBinary(vec![
            DaveOpcode::TransitionReady as u8,
            0x00,
            0x07
        ])]);
        assert!(!session.encryptor().is_passthrough());
    }

    #[test]
    fn fatal_close_terminates_and_clears_audio() {
        let mut session = session();
        hello(&mut session);

        let actions = session.handle_close(4006);
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(actions, vec![SessionAction::StopAudio, SessionAction::Terminate]);
        assert!(session.tick(SimEnv::default().now()).is_empty());
    }

    #[test]
    fn disconnect_4014_reconnects() {
        let mut session = session();
        hello(&mut session);

        let actions = session.handle_close(4014);
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(actions, vec![SessionAction::Reconnect]);
    }

    #[test]
    fn tick_emits_heartbeat_with_seq_ack() {
        let env = SimEnv::default();
        let mut session = VoiceSession::new(env.clone(), config());
        hello(&mut session);

        // Raise the receive sequence via a sequenced frame.
        session.handle_text(r#"{"op":6,"d":{"t":1},"seq":17}"#).unwrap();

        let actions = session.tick(env.now());
        let heartbeat = actions.iter().find_map(|action| match action {
            SessionAction::SendText(text) => {
                let message = GatewayMessage::parse(text).unwrap();
                (message.op == GatewayOpcode::Heartbeat as u8)
                    .then(|| message.payload::<Heartbeat>().unwrap())
            },
            _ => None,
        });
        let heartbeat = heartbeat.expect("heartbeat queued on first tick");
        assert_eq!(heartbeat.seq_ack, 17);
    }

    #[test]
    fn tick_rate_limits_queue() {
        let env = SimEnv::default();
        let mut session = VoiceSession::new(env.clone(), config());

        for i in 0..5 {
            session.message_queue.push_back(format!("{{\"op\":5,\"d\":{{\"n\":{i}}}}}"));
        }

        // Odd tick: 1 message; even tick: 2.
        assert_eq!(session.tick(env.now()).len(), 1);
        assert_eq!(session.tick(env.now()).len(), 2);
        assert_eq!(session.tick(env.now()).len(), 1);
        assert_eq!(session.tick(env.now()).len(), 1);
        assert!(session.tick(env.now()).is_empty());
    }

    #[test]
    fn speaking_maps_ssrc_to_user() {
        let mut session = session();
        session
            .handle_text(r#"{"op":5,"d":{"speaking":1,"delay":0,"ssrc":777,"user_id":"user-b"}}"#)
            .unwrap();

        assert_eq!(session.user_for_ssrc(777), Some("user-b"));

        session.handle_text(r#"{"op":13,"d":{"user_id":"user-b"}}"#).unwrap();
        assert_eq!(session.user_for_ssrc(777), None);
    }

    #[test]
    fn start_speaking_fires_once() {
        let mut session = session();
        hello(&mut session);
        ready(&mut session);

        assert_eq!(session.start_speaking().len(), 1);
        assert!(session.start_speaking().is_empty());
    }
}
