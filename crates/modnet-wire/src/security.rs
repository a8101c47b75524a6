//! Cryptographic converters and the challenge primitives.
//!
//! A [`Converter`] wraps every frame of one handshake stage in AES-256-GCM.
//! Nonces are never sent: both ends count frames per direction, and the
//! nonce is `seq(8) || direction(1) || zeros(3)`, so a reflected frame never
//! opens on the side that sealed it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use modnet_types::SameHostPolicy;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Size of a challenge block.
pub const CHALLENGE_LEN: usize = 32;

/// Size of a session key.
pub const SESSION_KEY_LEN: usize = 32;

const SESSION_KEY_INFO: &[u8] = b"modnet-session-key-v1";

/// Errors from converters and session-key transport.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("frame failed authentication")]
    Decrypt,
    #[error("frame could not be sealed")]
    Encrypt,
    #[error("sealed session key is malformed")]
    MalformedSealedKey,
}

/// Which end of the connection a converter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Acceptor,
}

impl Side {
    fn direction_byte(self) -> u8 {
        match self {
            Side::Initiator => 0x01,
            Side::Acceptor => 0x02,
        }
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Initiator => Side::Acceptor,
            Side::Acceptor => Side::Initiator,
        }
    }
}

/// Symmetric frame converter for one handshake stage.
pub struct Converter {
    cipher: Aes256Gcm,
    side: Side,
    send_seq: u64,
    recv_seq: u64,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("side", &self.side)
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .finish()
    }
}

impl Converter {
    pub fn new(key: &[u8; 32], side: Side) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            side,
            send_seq: 0,
            recv_seq: 0,
        }
    }

    fn nonce(seq: u64, side: Side) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&seq.to_be_bytes());
        nonce[8] = side.direction_byte();
        nonce
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let nonce = Self::nonce(self.send_seq, self.side);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SecurityError::Encrypt)?;
        self.send_seq += 1;
        Ok(sealed)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let nonce = Self::nonce(self.recv_seq, self.side.peer());
        let opened = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| SecurityError::Decrypt)?;
        self.recv_seq += 1;
        Ok(opened)
    }
}

/// Fresh random challenge block.
pub fn new_challenge() -> [u8; CHALLENGE_LEN] {
    let mut block = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut block);
    block
}

/// Fresh random session key.
pub fn new_session_key() -> Zeroizing<[u8; SESSION_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

/// Constant-time comparison of an echoed challenge.
pub fn echo_matches(expected: &[u8], echoed: &[u8]) -> bool {
    expected.len() == echoed.len() && bool::from(expected.ct_eq(echoed))
}

fn wrap_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> Zeroizing<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(SESSION_KEY_INFO, &mut okm[..])
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Seal a session key so only the holder of `recipient`'s secret can open it.
///
/// Layout: `ephemeral public key (32) || AES-256-GCM(session key) (48)`.
pub fn seal_session_key(
    session_key: &[u8; SESSION_KEY_LEN],
    recipient: &PublicKey,
) -> Result<Vec<u8>, SecurityError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let key = wrap_key(shared.as_bytes(), &ephemeral_public, recipient);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), session_key.as_slice())
        .map_err(|_| SecurityError::Encrypt)?;

    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a session key sealed with [`seal_session_key`].
pub fn open_session_key(
    sealed: &[u8],
    secret: &StaticSecret,
) -> Result<Zeroizing<[u8; SESSION_KEY_LEN]>, SecurityError> {
    if sealed.len() != 32 + SESSION_KEY_LEN + 16 {
        return Err(SecurityError::MalformedSealedKey);
    }
    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&sealed[..32]);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);
    let own_public = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    let key = wrap_key(shared.as_bytes(), &ephemeral_public, &own_public);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    let opened = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&[0u8; 12]), &sealed[32..])
            .map_err(|_| SecurityError::Decrypt)?,
    );
    let mut session_key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    session_key.copy_from_slice(&opened);
    Ok(session_key)
}

/// Decide whether two endpoints are on the same host.
pub fn same_host(local: SocketAddr, peer: SocketAddr, policy: SameHostPolicy) -> bool {
    let both_loopback = local.ip().is_loopback() && peer.ip().is_loopback();
    match policy {
        SameHostPolicy::Never => false,
        SameHostPolicy::Loopback => both_loopback,
        SameHostPolicy::LoopbackOrMatch => both_loopback || local.ip() == peer.ip(),
    }
}
