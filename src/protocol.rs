//! Wire protocol for HSM communication.
//!
//! Uses a simple length-prefixed bincode format over TCP. Handshake frames
//! travel in the clear; once a session is authenticated every [`Command`]
//! and [`Response`] is bincode-encoded and sealed inside
//! [`Frame::Encrypted`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;
use zeroize::Zeroizing;

/// Object identifier of a key slot on the HSM.
pub type KeyId = u16;

/// Largest frame either side will accept (1MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum label length stored alongside an object.
pub const LABEL_MAX_LEN: usize = 40;

/// Label attached to keys imported for provisioning.
pub const IMPORTED_KEY_LABEL: &str = "imported";

/// Length of the host and card challenges exchanged during the handshake.
pub const CHALLENGE_LEN: usize = 8;

/// Asymmetric key algorithms known to the protocol.
///
/// Only [`Algorithm::Ed25519`] is accepted by the signer; the others exist
/// so a misconfigured slot is reported as such instead of as garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Rsa2048,
    EcP256,
    EcK256,
    Ed25519,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Rsa2048 => "rsa2048",
            Algorithm::EcP256 => "ecp256",
            Algorithm::EcK256 => "eck256",
            Algorithm::Ed25519 => "ed25519",
        };
        f.write_str(name)
    }
}

/// Bitmask of the security domains an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domains(pub u16);

impl Domains {
    pub const DOMAIN_1: Domains = Domains(0x0001);
}

/// Bitmask of operations an object is allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(pub u64);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const SIGN_EDDSA: Capabilities = Capabilities(0x0000_0001_0000_0000);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Private key bytes carried by an import command.
///
/// Zeroized on drop and never printed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyMaterial(Zeroizing<Vec<u8>>);

impl KeyMaterial {
    pub fn new(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED; {}])", self.0.len())
    }
}

/// Identifies which command a request or response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandCode {
    GetPubKey,
    SignEddsa,
    PutAsymmetricKey,
    Echo,
    Error,
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandCode::GetPubKey => "get-pubkey",
            CommandCode::SignEddsa => "sign-eddsa",
            CommandCode::PutAsymmetricKey => "put-asymmetric-key",
            CommandCode::Echo => "echo",
            CommandCode::Error => "error",
        };
        f.write_str(name)
    }
}

/// Commands sent to the HSM inside an authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Fetch the public half of an asymmetric key
    GetPubKey { key_id: KeyId },
    /// Produce an Ed25519 signature over `data`
    SignEddsa { key_id: KeyId, data: Vec<u8> },
    /// Store an externally generated private key
    PutAsymmetricKey {
        key_id: KeyId,
        label: String,
        domains: Domains,
        capabilities: Capabilities,
        algorithm: Algorithm,
        key: KeyMaterial,
        delegated_capabilities: Capabilities,
    },
    /// Session liveness check
    Echo { data: Vec<u8> },
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match self {
            Command::GetPubKey { .. } => CommandCode::GetPubKey,
            Command::SignEddsa { .. } => CommandCode::SignEddsa,
            Command::PutAsymmetricKey { .. } => CommandCode::PutAsymmetricKey,
            Command::Echo { .. } => CommandCode::Echo,
        }
    }

    /// Import command for an Ed25519 provisioning key.
    ///
    /// Domain 1, sign-eddsa only, no delegated capabilities.
    pub fn put_ed25519_key(key_id: KeyId, key: &[u8]) -> Self {
        Command::PutAsymmetricKey {
            key_id,
            label: IMPORTED_KEY_LABEL.to_string(),
            domains: Domains::DOMAIN_1,
            capabilities: Capabilities::SIGN_EDDSA,
            algorithm: Algorithm::Ed25519,
            key: KeyMaterial::new(key),
            delegated_capabilities: Capabilities::NONE,
        }
    }
}

/// Responses returned by the HSM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    GetPubKey { algorithm: Algorithm, key_data: Vec<u8> },
    SignEddsa { signature: Vec<u8> },
    PutAsymmetricKey { key_id: KeyId },
    Echo { data: Vec<u8> },
    Error(ErrorCode),
}

impl Response {
    pub fn code(&self) -> CommandCode {
        match self {
            Response::GetPubKey { .. } => CommandCode::GetPubKey,
            Response::SignEddsa { .. } => CommandCode::SignEddsa,
            Response::PutAsymmetricKey { .. } => CommandCode::PutAsymmetricKey,
            Response::Echo { .. } => CommandCode::Echo,
            Response::Error(_) => CommandCode::Error,
        }
    }
}

/// Error codes reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ErrorCode {
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid data")]
    InvalidData,
    #[error("invalid session")]
    InvalidSession,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("insufficient permissions")]
    InsufficientPermissions,
    #[error("object not found")]
    ObjectNotFound,
    #[error("object already exists")]
    ObjectExists,
}

/// Frames exchanged on the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    CreateSession {
        auth_key_id: KeyId,
        host_challenge: [u8; CHALLENGE_LEN],
    },
    SessionCreated {
        session_id: u8,
        card_challenge: [u8; CHALLENGE_LEN],
        card_cryptogram: Vec<u8>,
    },
    Authenticate {
        session_id: u8,
        host_cryptogram: Vec<u8>,
    },
    Authenticated,
    /// A sealed bincode-encoded [`Command`] or [`Response`]
    Encrypted {
        session_id: u8,
        counter: u64,
        payload: Vec<u8>,
    },
    CloseSession {
        session_id: u8,
    },
    Failed(ErrorCode),
}

/// Errors from reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Write a length-prefixed bincode message.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), FrameError> {
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    let len_bytes = (bytes.len() as u32).to_le_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-prefixed bincode message.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(msg_len));
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader.read_exact(&mut msg_buf)?;

    Ok(bincode::deserialize(&msg_buf)?)
}
