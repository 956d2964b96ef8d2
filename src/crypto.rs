//! Session cryptography shared by the channel client and the emulated HSM.
//!
//! An authentication key is derived from the password with
//! PBKDF2-HMAC-SHA256. Each session derives its own AES-256-GCM key from
//! the authentication key and both handshake challenges, and every frame
//! is sealed under a nonce built from its direction and counter.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::protocol::CHALLENGE_LEN;

/// Salt and iteration count for password-derived authentication keys.
pub const AUTH_KEY_SALT: &[u8] = b"Yubico";
pub const AUTH_KEY_ROUNDS: u32 = 10_000;

const CARD_CRYPTOGRAM: &[u8] = b"aiakos/card-cryptogram/1";
const HOST_CRYPTOGRAM: &[u8] = b"aiakos/host-cryptogram/1";

/// Counter reserved for the handshake cryptograms.
const CRYPTOGRAM_COUNTER: u64 = 0;

/// Errors from session cryptography.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid session key")]
    InvalidKey,

    #[error("failed to seal frame")]
    Seal,

    #[error("frame failed authentication")]
    Open,

    #[error("stale frame counter: got {got}, last seen {last}")]
    Replay { last: u64, got: u64 },

    #[error("response counter {got} does not answer request {expected}")]
    CounterMismatch { expected: u64, got: u64 },
}

/// 32-byte authentication key, zeroized on drop.
pub type AuthKey = Zeroizing<[u8; 32]>;

/// Derive the authentication key for a password.
pub fn derive_auth_key(password: &[u8]) -> AuthKey {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, AUTH_KEY_SALT, AUTH_KEY_ROUNDS, &mut key[..]);
    key
}

/// Fresh random handshake challenge.
pub fn random_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Which side sealed a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToCard = 1,
    CardToHost = 2,
}

/// AES-256-GCM cipher bound to one session.
pub struct SessionCipher {
    cipher: Aes256Gcm,
    session_id: u8,
}

impl SessionCipher {
    /// Derive the session cipher from the authentication key and challenges.
    pub fn derive(
        auth_key: &[u8; 32],
        host_challenge: &[u8; CHALLENGE_LEN],
        card_challenge: &[u8; CHALLENGE_LEN],
        session_id: u8,
    ) -> Result<Self, CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(auth_key);
        hasher.update(host_challenge);
        hasher.update(card_challenge);
        let session_key: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());

        let cipher =
            Aes256Gcm::new_from_slice(&session_key[..]).map_err(|_| CryptoError::InvalidKey)?;

        Ok(Self { cipher, session_id })
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    /// Encrypt and authenticate a frame payload.
    pub fn seal(
        &self,
        direction: Direction,
        counter: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_for(direction, counter);
        let aad = [self.session_id, direction as u8];
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Seal)
    }

    /// Decrypt a frame payload, failing if it was tampered with or sealed
    /// for another direction, counter or session.
    pub fn open(
        &self,
        direction: Direction,
        counter: u64,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let nonce = nonce_for(direction, counter);
        let aad = [self.session_id, direction as u8];
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Open)
    }

    /// Proof sent by the card that it holds the authentication key.
    pub fn card_cryptogram(&self) -> Result<Vec<u8>, CryptoError> {
        self.seal(Direction::CardToHost, CRYPTOGRAM_COUNTER, CARD_CRYPTOGRAM)
    }

    pub fn verify_card_cryptogram(&self, cryptogram: &[u8]) -> bool {
        self.open(Direction::CardToHost, CRYPTOGRAM_COUNTER, cryptogram)
            .map(|plain| plain.as_slice() == CARD_CRYPTOGRAM)
            .unwrap_or(false)
    }

    /// Proof sent by the host that it holds the authentication key.
    pub fn host_cryptogram(&self) -> Result<Vec<u8>, CryptoError> {
        self.seal(Direction::HostToCard, CRYPTOGRAM_COUNTER, HOST_CRYPTOGRAM)
    }

    pub fn verify_host_cryptogram(&self, cryptogram: &[u8]) -> bool {
        self.open(Direction::HostToCard, CRYPTOGRAM_COUNTER, cryptogram)
            .map(|plain| plain.as_slice() == HOST_CRYPTOGRAM)
            .unwrap_or(false)
    }
}

/// Rejects frame counters that do not strictly increase.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    last: u64,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate a sealed frame, then advance the window to its counter.
    ///
    /// Frames that fail authentication leave the window untouched.
    pub fn open(
        &mut self,
        cipher: &SessionCipher,
        direction: Direction,
        counter: u64,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let plaintext = cipher.open(direction, counter, ciphertext)?;
        self.check(counter)?;
        Ok(plaintext)
    }

    pub fn check(&mut self, counter: u64) -> Result<(), CryptoError> {
        if counter <= self.last {
            return Err(CryptoError::Replay {
                last: self.last,
                got: counter,
            });
        }
        self.last = counter;
        Ok(())
    }
}

fn nonce_for(direction: Direction, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = direction as u8;
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}
