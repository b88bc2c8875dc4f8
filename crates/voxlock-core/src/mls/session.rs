//! The MLS session driving the call's group secret.
//!
//! One session per voice connection. The server relays MLS traffic between
//! members and acts as the group's external sender: it proposes adds and
//! removes, any member commits them, and the server announces the winning
//! commit. Every epoch change re-derives one media key ratchet per member
//! from the new epoch's exported secret.

use std::collections::BTreeMap;

use openmls::prelude::{MlsMessageIn, *};
use openmls_basic_credential::SignatureKeyPair;
use sha2::{Digest, Sha512};
use tls_codec::{Deserialize as TlsDeserialize, Serialize as TlsSerialize};
use tracing::{debug, info, warn};

use voxlock_crypto::{HmacKeyRatchet, derive_ratchet_seed};

use super::{display::generate_displayable_code, provider::MlsProvider};
use crate::{env::Environment, errors::MlsError};

/// Base label for exporting the media key secret from the epoch's key
/// schedule.
pub const USER_MEDIA_KEY_BASE_LABEL: &str = "voxlock secure frames v1";

/// Digits in the group privacy code.
pub const PRIVACY_CODE_DIGITS: usize = 30;

/// Digits in a pairwise privacy code.
pub const PAIRWISE_CODE_DIGITS: usize = 45;

/// Exact size of a pairwise fingerprint; anything else renders empty.
pub const PAIRWISE_FINGERPRINT_BYTES: usize = 64;

/// Bytes of exported secret used to seed the per-member ratchets.
const MEDIA_KEY_SECRET_BYTES: usize = 32;

/// The MLS group session.
///
/// # Invariants
///
/// - The epoch only moves forward; a commit that fails to apply leaves
///   state untouched
/// - `key_ratchet_for` yields identical ratchets on every member for the
///   same (epoch, user) pair
/// - The cached commit is cleared once the server announces any commit
///   for the epoch it targeted
pub struct MlsSession<E: Environment> {
    protocol_version: u16,
    group_id: u64,
    self_user_id: String,
    provider: MlsProvider<E>,
    ciphersuite: Ciphersuite,
    signer: SignatureKeyPair,
    key_package_bytes: Vec<u8>,
    external_sender: Option<Vec<u8>>,
    group: Option<openmls::group::MlsGroup>,
    cached_commit: Option<Vec<u8>>,
    last_epoch_authenticator: Option<Vec<u8>>,
}

impl<E: Environment> MlsSession<E> {
    /// Initialize a session: generate (or adopt) the signature key pair
    /// and build the key package other members will use to welcome us.
    pub fn init(
        env: E,
        protocol_version: u16,
        group_id: u64,
        self_user_id: impl Into<String>,
        transient_key: Option<SignatureKeyPair>,
    ) -> Result<Self, MlsError> {
        let self_user_id = self_user_id.into();
        let provider = MlsProvider::new(env);
        let ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

        let signer = match transient_key {
            Some(key) => key,
            None => SignatureKeyPair::new(ciphersuite.signature_algorithm())
                .map_err(|e| MlsError::Crypto(format!("failed to generate keypair: {e}")))?,
        };

        let credential = BasicCredential::new(self_user_id.as_bytes().to_vec());
        let credential_with_key = CredentialWithKey {
            credential: credential.into(),
            signature_key: signer.public().into(),
        };

        let key_package_bundle = KeyPackage::builder()
            .build(ciphersuite, &provider, &signer, credential_with_key)
            .map_err(|e| MlsError::Crypto(format!("failed to build key package: {e}")))?;

        let key_package_bytes = key_package_bundle
            .key_package()
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("failed to serialize key package: {e}")))?;

        info!(group_id, protocol_version, "mls session initialized");

        Ok(Self {
            protocol_version,
            group_id,
            self_user_id,
            provider,
            ciphersuite,
            signer,
            key_package_bytes,
            external_sender: None,
            group: None,
            cached_commit: None,
            last_epoch_authenticator: None,
        })
    }

    /// Negotiated end-to-end protocol version.
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// Update the negotiated protocol version.
    pub fn set_protocol_version(&mut self, version: u16) {
        self.protocol_version = version;
    }

    /// Our serialized key package, sent with `MLS_KEY_PACKAGE`.
    pub fn marshalled_key_package(&self) -> &[u8] {
        &self.key_package_bytes
    }

    /// The signature key pair in use (for persistence between sessions).
    pub fn signature_key_pair(&self) -> &SignatureKeyPair {
        &self.signer
    }

    /// Install the server's external sender.
    ///
    /// If no group exists yet, this creates the initial single-member
    /// group carrying the external-senders extension, so server proposals
    /// validate against it.
    pub fn set_external_sender(&mut self, external_sender: &[u8]) -> Result<(), MlsError> {
        self.external_sender = Some(external_sender.to_vec());
        if self.group.is_none() {
            self.create_pending_group()?;
        }
        Ok(())
    }

    fn create_pending_group(&mut self) -> Result<(), MlsError> {
        let Some(external_sender_bytes) = &self.external_sender else {
            return Err(MlsError::InvalidState("external sender not set"));
        };

        let external_sender =
            ExternalSender::tls_deserialize_exact(external_sender_bytes.as_slice()).map_err(
                |e| MlsError::Serialization(format!("invalid external sender: {e}")),
            )?;

        let credential = BasicCredential::new(self.self_user_id.as_bytes().to_vec());
        let credential_with_key = CredentialWithKey {
            credential: credential.into(),
            signature_key: self.signer.public().into(),
        };

        let extensions =
            Extensions::single(Extension::ExternalSenders(vec![external_sender]));
        let group_config = MlsGroupCreateConfig::builder()
            .ciphersuite(self.ciphersuite)
            .use_ratchet_tree_extension(true)
            .with_group_context_extensions(extensions)
            .map_err(|e| MlsError::Crypto(format!("invalid group extensions: {e}")))?
            .build();

        let group = openmls::group::MlsGroup::new_with_group_id(
            &self.provider,
            &self.signer,
            &group_config,
            GroupId::from_slice(&self.group_id.to_be_bytes()),
            credential_with_key,
        )
        .map_err(|e| MlsError::Crypto(format!("failed to create group: {e}")))?;

        debug!(group_id = self.group_id, "created pending group");
        self.group = Some(group);
        Ok(())
    }

    /// Process a batch of proposals from the server.
    ///
    /// Add proposals naming users outside `recognized_user_ids` are
    /// rejected. Returns the serialized commit to send back with
    /// `MLS_COMMIT_MESSAGE`, if the batch produced one; the commit stays
    /// cached until the server announces it.
    pub fn process_proposals(
        &mut self,
        proposals: &[u8],
        recognized_user_ids: &[String],
    ) -> Result<Option<Vec<u8>>, MlsError> {
        let group = self.group.as_mut().ok_or(MlsError::InvalidState("no group"))?;

        let mut remaining = proposals;
        let mut stored_any = false;
        while !remaining.is_empty() {
            let message = MlsMessageIn::tls_deserialize(&mut remaining)
                .map_err(|e| MlsError::Serialization(format!("invalid proposal message: {e}")))?;

            let protocol_message: ProtocolMessage = message
                .try_into()
                .map_err(|e| MlsError::Serialization(format!("not a protocol message: {e:?}")))?;

            let processed = group
                .process_message(&self.provider, protocol_message)
                .map_err(|e| MlsError::Crypto(format!("failed to process proposal: {e}")))?;

            match processed.into_content() {
                ProcessedMessageContent::ProposalMessage(proposal) => {
                    if let Proposal::Add(add) = proposal.proposal() {
                        let identity = add.key_package().leaf_node().credential().serialized_content();
                        let user_id = String::from_utf8_lossy(identity).into_owned();
                        if !recognized_user_ids.contains(&user_id) {
                            warn!(user_id, "proposal adds unrecognized user");
                            return Err(MlsError::UnrecognizedUser(user_id));
                        }
                    }
                    group
                        .store_pending_proposal(self.provider.storage(), *proposal)
                        .map_err(|e| MlsError::Crypto(format!("failed to store proposal: {e}")))?;
                    stored_any = true;
                },
                ProcessedMessageContent::ExternalJoinProposalMessage(proposal) => {
                    group
                        .store_pending_proposal(self.provider.storage(), *proposal)
                        .map_err(|e| MlsError::Crypto(format!("failed to store proposal: {e}")))?;
                    stored_any = true;
                },
                _ => {
                    return Err(MlsError::Ignored("non-proposal in proposals payload"));
                },
            }
        }

        if !stored_any {
            return Ok(None);
        }

        let (commit, _welcome, _group_info) = group
            .commit_to_pending_proposals(&self.provider, &self.signer)
            .map_err(|e| MlsError::Crypto(format!("failed to commit proposals: {e}")))?;

        let commit_bytes = commit
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("failed to serialize commit: {e}")))?;

        debug!(epoch = self.epoch(), "commit built from proposals and cached");
        self.cached_commit = Some(commit_bytes.clone());
        Ok(Some(commit_bytes))
    }

    /// Apply the commit the server announced as the transition winner.
    ///
    /// If the announced commit is the one we produced and cached, our
    /// pending commit is merged; otherwise the message is processed as a
    /// remote commit. Either way the epoch advances and the epoch
    /// authenticator is refreshed.
    pub fn process_commit(&mut self, commit: &[u8]) -> Result<Vec<String>, MlsError> {
        let group = self.group.as_mut().ok_or(MlsError::InvalidState("no group"))?;

        let ours = self.cached_commit.as_deref() == Some(commit);
        if ours {
            group
                .merge_pending_commit(&self.provider)
                .map_err(|e| MlsError::Crypto(format!("failed to merge own commit: {e}")))?;
        } else {
            // A remote member won the transition; drop anything we staged.
            let _ = group.clear_pending_commit(self.provider.storage());

            let message = MlsMessageIn::tls_deserialize_exact(commit)
                .map_err(|e| MlsError::Serialization(format!("invalid commit message: {e}")))?;
            let protocol_message: ProtocolMessage = message
                .try_into()
                .map_err(|e| MlsError::Serialization(format!("not a protocol message: {e:?}")))?;

            let processed = group
                .process_message(&self.provider, protocol_message)
                .map_err(|e| MlsError::Crypto(format!("failed to process commit: {e}")))?;

            match processed.into_content() {
                ProcessedMessageContent::StagedCommitMessage(staged) => {
                    group
                        .merge_staged_commit(&self.provider, *staged)
                        .map_err(|e| MlsError::Crypto(format!("failed to merge commit: {e}")))?;
                },
                _ => return Err(MlsError::Ignored("announced message is not a commit")),
            }
        }

        self.cached_commit = None;
        self.refresh_epoch_authenticator();
        info!(epoch = self.epoch(), ours, "commit applied");
        Ok(self.member_user_ids())
    }

    /// Join the group from a welcome message.
    pub fn process_welcome(&mut self, welcome: &[u8]) -> Result<Vec<String>, MlsError> {
        let message = MlsMessageIn::tls_deserialize(&mut welcome.as_ref())
            .map_err(|e| MlsError::Serialization(format!("invalid welcome message: {e}")))?;

        let welcome = match message.extract() {
            MlsMessageBodyIn::Welcome(welcome) => welcome,
            _ => return Err(MlsError::Serialization("message is not a welcome".into())),
        };

        let join_config = MlsGroupJoinConfig::builder().use_ratchet_tree_extension(true).build();
        let group = StagedWelcome::new_from_welcome(&self.provider, &join_config, welcome, None)
            .map_err(|e| MlsError::Crypto(format!("failed to stage welcome: {e}")))?
            .into_group(&self.provider)
            .map_err(|e| MlsError::Crypto(format!("failed to join from welcome: {e}")))?;

        self.group = Some(group);
        self.cached_commit = None;
        self.refresh_epoch_authenticator();
        info!(epoch = self.epoch(), "joined group from welcome");
        Ok(self.member_user_ids())
    }

    /// Current epoch, zero before any group exists.
    pub fn epoch(&self) -> u64 {
        self.group.as_ref().map(|group| group.epoch().as_u64()).unwrap_or(0)
    }

    /// User ids of the current membership.
    pub fn member_user_ids(&self) -> Vec<String> {
        let Some(group) = &self.group else {
            return Vec::new();
        };
        group
            .members()
            .map(|member| String::from_utf8_lossy(member.credential.serialized_content()).into_owned())
            .collect()
    }

    /// The most recent epoch authenticator; empty before the group forms.
    pub fn last_epoch_authenticator(&self) -> Vec<u8> {
        self.last_epoch_authenticator.clone().unwrap_or_default()
    }

    /// The group privacy code: 30 digits derived from the epoch
    /// authenticator. Empty until an epoch has been established.
    pub fn privacy_code(&self) -> String {
        match &self.last_epoch_authenticator {
            Some(authenticator) => generate_displayable_code(authenticator, PRIVACY_CODE_DIGITS),
            None => String::new(),
        }
    }

    /// Media key ratchet for a member at the current epoch.
    ///
    /// Every member derives the identical ratchet for the same (epoch,
    /// user) pair, so the sender's encryptor and all receivers' decryptors
    /// agree on the key schedule.
    pub fn key_ratchet_for(&self, user_id: &str) -> Result<HmacKeyRatchet, MlsError> {
        let group = self.group.as_ref().ok_or(MlsError::InvalidState("no group"))?;

        let base_secret = group
            .export_secret(
                self.provider.crypto(),
                USER_MEDIA_KEY_BASE_LABEL,
                b"",
                MEDIA_KEY_SECRET_BYTES,
            )
            .map_err(|e| MlsError::Crypto(format!("failed to export media secret: {e}")))?;

        Ok(HmacKeyRatchet::new(&derive_ratchet_seed(&base_secret, user_id)))
    }

    /// Pairwise fingerprint between us and `user_id`: exactly
    /// [`PAIRWISE_FINGERPRINT_BYTES`] bytes, symmetric between the pair.
    pub fn pairwise_fingerprint(
        &self,
        version: u16,
        user_id: &str,
    ) -> Result<Vec<u8>, MlsError> {
        let group = self.group.as_ref().ok_or(MlsError::InvalidState("no group"))?;

        let remote_key = group
            .members()
            .find(|member| member.credential.serialized_content() == user_id.as_bytes())
            .map(|member| member.signature_key.clone())
            .ok_or_else(|| MlsError::UnrecognizedUser(user_id.to_owned()))?;

        let mut local = self.signer.public().to_vec();
        local.extend_from_slice(self.self_user_id.as_bytes());
        let mut remote = remote_key;
        remote.extend_from_slice(user_id.as_bytes());

        // Sort so both sides hash the same byte order.
        let (first, second) = if local <= remote { (local, remote) } else { (remote, local) };

        let mut hasher = Sha512::new();
        hasher.update(version.to_be_bytes());
        hasher.update(&first);
        hasher.update(&second);
        Ok(hasher.finalize().to_vec())
    }

    /// Pairwise privacy code: 45 digits over the pairwise fingerprint.
    /// Empty unless the fingerprint is exactly 64 bytes.
    pub fn pairwise_privacy_code(&self, version: u16, user_id: &str) -> String {
        match self.pairwise_fingerprint(version, user_id) {
            Ok(fingerprint) if fingerprint.len() == PAIRWISE_FINGERPRINT_BYTES => {
                generate_displayable_code(&fingerprint, PAIRWISE_CODE_DIGITS)
            },
            _ => String::new(),
        }
    }

    /// Whether the session has derived a privacy code, i.e. the call is
    /// end-to-end encrypted.
    pub fn is_established(&self) -> bool {
        self.last_epoch_authenticator.is_some()
    }

    /// Drop all group state, keeping the signature key pair.
    ///
    /// Used before reinitializing at a new protocol version or after an
    /// invalid commit/welcome.
    pub fn reset(&mut self) {
        info!("resetting mls session");
        self.group = None;
        self.cached_commit = None;
        self.last_epoch_authenticator = None;
        self.external_sender = None;
    }

    fn refresh_epoch_authenticator(&mut self) {
        if let Some(group) = &self.group {
            self.last_epoch_authenticator = Some(group.epoch_authenticator().as_slice().to_vec());
        }
    }

    /// Per-member ratchets for the entire current roster.
    pub fn all_key_ratchets(&self) -> Result<BTreeMap<String, HmacKeyRatchet>, MlsError> {
        let mut ratchets = BTreeMap::new();
        for user_id in self.member_user_ids() {
            let ratchet = self.key_ratchet_for(&user_id)?;
            ratchets.insert(user_id, ratchet);
        }
        Ok(ratchets)
    }
}
