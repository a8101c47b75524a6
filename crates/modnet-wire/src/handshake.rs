//! Connection handshake and security negotiation.
//!
//! [`Handshake`] is a sans-IO state machine. The connection manager feeds it
//! one decrypted frame at a time and carries out the [`Action`]s it returns,
//! in order. Converter installs and drops are positioned in that list so that
//! both ends switch encryption at the same frame boundary.
//!
//! States follow the connection lifecycle:
//! `RawUnverified -> SecurityPending -> ProtocolUnassigned ->
//! ProtocolSecurityPending -> Established`.

use crate::auth::{AuthPolicies, AuthPolicy, SecurityType, RAW_PROTOCOL};
use crate::error::PacketError;
use crate::frame::{PacketReader, PacketWriter};
use crate::security::{
    echo_matches, new_challenge, new_session_key, open_session_key, seal_session_key, Converter,
    SecurityError, Side, CHALLENGE_LEN,
};
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

/// Magic constant opening every connection ("modn").
pub const MAGIC: u32 = 0x6d6f_646e;

/// Handshake revision. Both ends must match exactly.
pub const REVISION: u32 = 1;

/// Width of the NUL-padded protocol name field.
pub const PROTOCOL_NAME_LEN: usize = 80;

/// Errors that end a handshake. Each closes only its own connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Bad magic number")]
    BadMagic,
    #[error("Bad revision number")]
    BadRevision,
    #[error("rejected by peer: {0}")]
    Rejected(String),
    #[error("refused protocol request: {0}")]
    Refused(String),
    #[error("challenge echo did not match")]
    ChallengeMismatch,
    #[error("security policy for \"{0}\" has no usable key")]
    MissingKey(String),
    #[error("no public key for recipient \"{0}\"")]
    UnknownRecipient(String),
    #[error("no secret key for identity \"{0}\"")]
    UnknownIdentity(String),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("trailing bytes in handshake frame")]
    TrailingBytes,
    #[error("frame arrived after the handshake finished")]
    Unexpected,
}

impl HandshakeError {
    /// Security failures are never explained to the peer.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Self::ChallengeMismatch
                | Self::MissingKey(_)
                | Self::UnknownRecipient(_)
                | Self::UnknownIdentity(_)
                | Self::Security(_)
        )
    }
}

/// Which handshake stage a converter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Raw,
    Protocol,
}

/// Coarse connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    RawUnverified,
    SecurityPending,
    ProtocolUnassigned,
    ProtocolSecurityPending,
    Established,
    Failed,
}

/// Monotonic verification flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationFlags {
    pub raw_verified: bool,
    pub security_verified: bool,
    pub protocol_security_verified: bool,
}

/// One step the connection manager must carry out.
#[derive(Debug)]
pub enum Action {
    /// Send a frame through whatever converters are active now.
    Send(Vec<u8>),
    /// Install a converter; frames after this point use it.
    Install(Stage, Converter),
    /// Drop a converter (its key material is zeroized on drop).
    Drop(Stage),
    /// The acceptor resolved and reserved a slot of this server protocol.
    ProtocolAssigned { name: String, version: u32 },
    /// Handshake complete.
    Established { peer_module: String },
    /// Close the connection. Any reason text has already been queued.
    Fail(HandshakeError),
}

/// Server-side protocol lookup used when a protocol request arrives.
pub trait ProtocolResolver {
    /// Resolve and reserve a connection slot, or return the rejection text.
    fn resolve(&mut self, name: &str, version: u32) -> Result<(), String>;
}

/// Everything the state machine needs from its surroundings.
pub struct HandshakeEnv<'a> {
    pub policies: &'a AuthPolicies,
    pub same_host: bool,
    pub module_name: &'a str,
    pub resolver: &'a mut dyn ProtocolResolver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AwaitRawHello,
    AwaitRawStatus,
    AwaitSealedKey,
    AwaitChallenge,
    AwaitEcho,
    AwaitPeerChallenge,
    AwaitEchoOfOwn,
    AwaitProtocolRequest,
    AwaitProtocolStatus,
    AwaitPeerName,
    Done,
}

/// Per-connection handshake.
#[derive(Debug)]
pub struct Handshake {
    side: Side,
    state: HandshakeState,
    step: Step,
    stage: Stage,
    security: Option<SecurityType>,
    protocol: Option<(String, u32)>,
    challenge: Option<[u8; CHALLENGE_LEN]>,
    flags: VerificationFlags,
    out: Vec<Action>,
}

impl Handshake {
    /// Handshake for an outgoing connection requesting `protocol`.
    pub fn initiator(protocol: impl Into<String>, version: u32) -> Self {
        Self::new(Side::Initiator, Some((protocol.into(), version)))
    }

    /// Handshake for an accepted connection.
    pub fn acceptor() -> Self {
        Self::new(Side::Acceptor, None)
    }

    fn new(side: Side, protocol: Option<(String, u32)>) -> Self {
        Self {
            side,
            state: HandshakeState::RawUnverified,
            step: match side {
                Side::Initiator => Step::AwaitRawStatus,
                Side::Acceptor => Step::AwaitRawHello,
            },
            stage: Stage::Raw,
            security: None,
            protocol,
            challenge: None,
            flags: VerificationFlags::default(),
            out: Vec::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn flags(&self) -> VerificationFlags {
        self.flags
    }

    /// Protocol requested (initiator) or resolved (acceptor).
    pub fn protocol(&self) -> Option<(&str, u32)> {
        self.protocol.as_ref().map(|(n, v)| (n.as_str(), *v))
    }

    /// First actions. The initiator opens with magic and revision.
    pub fn start(&mut self) -> Vec<Action> {
        if self.side == Side::Initiator {
            let hello = PacketWriter::new().put_u32(MAGIC).put_u32(REVISION).finish();
            self.out.push(Action::Send(hello));
        }
        std::mem::take(&mut self.out)
    }

    /// Feed one decrypted frame.
    pub fn on_frame(&mut self, frame: Bytes, env: &mut HandshakeEnv<'_>) -> Vec<Action> {
        let mut packet = PacketReader::new(frame);
        if let Err(e) = self.step_frame(&mut packet, env) {
            debug!(side = ?self.side, step = ?self.step, error = %e, "Handshake failed");
            self.state = HandshakeState::Failed;
            self.step = Step::Done;
            self.out.push(Action::Fail(e));
        }
        std::mem::take(&mut self.out)
    }

    fn step_frame(
        &mut self,
        packet: &mut PacketReader,
        env: &mut HandshakeEnv<'_>,
    ) -> Result<(), HandshakeError> {
        match self.step {
            Step::AwaitRawHello => {
                let magic = packet.get_u32()?;
                let revision = packet.get_u32()?;
                expect_drained(packet)?;
                if magic != MAGIC {
                    self.send_status(HandshakeError::BadMagic.to_string());
                    return Err(HandshakeError::BadMagic);
                }
                if revision != REVISION {
                    self.send_status(HandshakeError::BadRevision.to_string());
                    return Err(HandshakeError::BadRevision);
                }
                self.send_status(String::new());
                self.raw_verified();
                self.begin_security(Stage::Raw, env)
            }
            Step::AwaitRawStatus => {
                let status = packet.get_string()?;
                expect_drained(packet)?;
                if !status.is_empty() {
                    return Err(HandshakeError::Rejected(status));
                }
                self.raw_verified();
                self.begin_security(Stage::Raw, env)
            }
            Step::AwaitSealedKey => {
                let identity = packet.get_string()?;
                let sealed = packet.take_rest();
                let secret = env
                    .policies
                    .secret_key(&identity)
                    .ok_or_else(|| HandshakeError::UnknownIdentity(identity.clone()))?;
                let session_key = open_session_key(&sealed, secret)?;
                self.out
                    .push(Action::Install(self.stage, Converter::new(&session_key, self.side)));
                self.send_challenge();
                Ok(())
            }
            Step::AwaitChallenge => {
                let block = packet.get_bytes(CHALLENGE_LEN)?;
                expect_drained(packet)?;
                self.out.push(Action::Send(block.to_vec()));
                self.send_challenge();
                self.step = Step::AwaitEchoOfOwn;
                Ok(())
            }
            Step::AwaitEcho => {
                self.check_echo(packet)?;
                self.step = Step::AwaitPeerChallenge;
                Ok(())
            }
            Step::AwaitPeerChallenge => {
                let block = packet.get_bytes(CHALLENGE_LEN)?;
                expect_drained(packet)?;
                self.out.push(Action::Send(block.to_vec()));
                self.finish_security(env)
            }
            Step::AwaitEchoOfOwn => {
                self.check_echo(packet)?;
                self.finish_security(env)
            }
            Step::AwaitProtocolRequest => {
                let name = packet.get_fixed_str(PROTOCOL_NAME_LEN)?;
                let version = packet.get_u32()?;
                expect_drained(packet)?;
                if let Err(reason) = env.resolver.resolve(&name, version) {
                    self.send_status(reason.clone());
                    return Err(HandshakeError::Refused(reason));
                }
                self.protocol = Some((name.clone(), version));
                self.out.push(Action::ProtocolAssigned { name, version });
                self.send_status(String::new());
                self.state = HandshakeState::ProtocolSecurityPending;
                self.begin_security(Stage::Protocol, env)
            }
            Step::AwaitProtocolStatus => {
                let status = packet.get_string()?;
                expect_drained(packet)?;
                if !status.is_empty() {
                    return Err(HandshakeError::Rejected(status));
                }
                self.state = HandshakeState::ProtocolSecurityPending;
                self.begin_security(Stage::Protocol, env)
            }
            Step::AwaitPeerName => {
                let peer_module = packet.get_string()?;
                expect_drained(packet)?;
                self.state = HandshakeState::Established;
                self.step = Step::Done;
                self.out.push(Action::Established { peer_module });
                Ok(())
            }
            Step::Done => Err(HandshakeError::Unexpected),
        }
    }

    fn send_status(&mut self, status: String) {
        self.out
            .push(Action::Send(PacketWriter::new().put_string(&status).finish()));
    }

    fn raw_verified(&mut self) {
        self.flags.raw_verified = true;
        self.state = HandshakeState::SecurityPending;
    }

    fn policy_name(&self, stage: Stage) -> String {
        match stage {
            Stage::Raw => RAW_PROTOCOL.to_string(),
            Stage::Protocol => self
                .protocol
                .as_ref()
                .map(|(name, _)| name.clone())
                .unwrap_or_default(),
        }
    }

    fn begin_security(&mut self, stage: Stage, env: &mut HandshakeEnv<'_>) -> Result<(), HandshakeError> {
        self.stage = stage;
        let name = self.policy_name(stage);
        let policy: Option<AuthPolicy> = env.policies.get(&name).cloned();
        self.security = policy.as_ref().map(|p| p.security);

        let Some(policy) = policy else {
            self.mark_verified(stage);
            return self.after_security(stage, env);
        };

        match policy.security {
            SecurityType::DropEncryption => {
                // Rejected when the authorization file is loaded.
                assert!(
                    stage == Stage::Protocol,
                    "DropEncryption reached the raw handshake stage"
                );
                self.out.push(Action::Drop(Stage::Raw));
                self.mark_verified(stage);
                self.after_security(stage, env)
            }
            SecurityType::KeyOnly | SecurityType::Idea => {
                let key = policy
                    .symmetric_key()
                    .ok_or_else(|| HandshakeError::MissingKey(name.clone()))?;
                self.out
                    .push(Action::Install(stage, Converter::new(key, self.side)));
                match self.side {
                    Side::Acceptor => self.send_challenge(),
                    Side::Initiator => self.step = Step::AwaitChallenge,
                }
                Ok(())
            }
            SecurityType::PgpIdea => match self.side {
                Side::Initiator => {
                    let identity = policy
                        .recipient()
                        .ok_or_else(|| HandshakeError::MissingKey(name.clone()))?
                        .to_string();
                    let recipient_key = env
                        .policies
                        .recipient_key(&identity)
                        .ok_or_else(|| HandshakeError::UnknownRecipient(identity.clone()))?;
                    let session_key = new_session_key();
                    let sealed = seal_session_key(&session_key, recipient_key)?;
                    let frame = PacketWriter::new()
                        .put_string(&identity)
                        .put_bytes(&sealed)
                        .finish();
                    self.out.push(Action::Send(frame));
                    self.out
                        .push(Action::Install(stage, Converter::new(&session_key, self.side)));
                    self.step = Step::AwaitChallenge;
                    Ok(())
                }
                Side::Acceptor => {
                    self.step = Step::AwaitSealedKey;
                    Ok(())
                }
            },
        }
    }

    fn send_challenge(&mut self) {
        let block = new_challenge();
        self.challenge = Some(block);
        self.out.push(Action::Send(block.to_vec()));
        if self.side == Side::Acceptor {
            self.step = Step::AwaitEcho;
        }
    }

    fn check_echo(&mut self, packet: &mut PacketReader) -> Result<(), HandshakeError> {
        let echoed = packet.take_rest();
        let expected = self.challenge.take().ok_or(HandshakeError::Unexpected)?;
        if !echo_matches(&expected, &echoed) {
            return Err(HandshakeError::ChallengeMismatch);
        }
        Ok(())
    }

    fn finish_security(&mut self, env: &mut HandshakeEnv<'_>) -> Result<(), HandshakeError> {
        let stage = self.stage;
        self.mark_verified(stage);
        if let Some(security) = self.security {
            if security.drops_after_verify(env.same_host) {
                self.out.push(Action::Drop(stage));
            }
        }
        self.after_security(stage, env)
    }

    fn mark_verified(&mut self, stage: Stage) {
        match stage {
            Stage::Raw => self.flags.security_verified = true,
            Stage::Protocol => self.flags.protocol_security_verified = true,
        }
    }

    fn after_security(&mut self, stage: Stage, env: &mut HandshakeEnv<'_>) -> Result<(), HandshakeError> {
        match stage {
            Stage::Raw => {
                self.state = HandshakeState::ProtocolUnassigned;
                match self.side {
                    Side::Initiator => {
                        let (name, version) = self.protocol.clone().unwrap_or_default();
                        let request = PacketWriter::new()
                            .put_fixed_str(&name, PROTOCOL_NAME_LEN)?
                            .put_u32(version)
                            .finish();
                        self.out.push(Action::Send(request));
                        self.step = Step::AwaitProtocolStatus;
                    }
                    Side::Acceptor => self.step = Step::AwaitProtocolRequest,
                }
            }
            Stage::Protocol => {
                let name = PacketWriter::new().put_string(env.module_name).finish();
                self.out.push(Action::Send(name));
                self.step = Step::AwaitPeerName;
            }
        }
        Ok(())
    }
}

fn expect_drained(packet: &PacketReader) -> Result<(), HandshakeError> {
    if packet.is_drained() {
        Ok(())
    } else {
        Err(HandshakeError::TrailingBytes)
    }
}
