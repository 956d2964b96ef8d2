//! Validation of HSM responses.
//!
//! Every response is checked against the command that produced it before
//! any of its fields are copied out. A failure here means a corrupted
//! channel, a misbehaving HSM or a version mismatch; it is never retried.

use crate::protocol::{Algorithm, CommandCode, KeyId, Response};
use crate::types::{PubKey, Signature, PUBKEY_LEN, SIGNATURE_LEN};
use thiserror::Error;
use tracing::error;

/// A response failed a structural check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid response type: expected {expected}, got {actual}")]
    InvalidResponseType {
        expected: CommandCode,
        actual: CommandCode,
    },

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(Algorithm),

    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("invalid signature length: {0} bytes")]
    InvalidSignatureLength(usize),

    #[error("key id mismatch: requested 0x{requested:04x}, got 0x{returned:04x}")]
    KeyIdMismatch { requested: KeyId, returned: KeyId },

    #[error("echo mismatch")]
    EchoMismatch,
}

fn unexpected(expected: CommandCode, response: &Response) -> ProtocolError {
    error!(
        "invalid response type: expected={}, actual={}",
        expected,
        response.code()
    );
    ProtocolError::InvalidResponseType {
        expected,
        actual: response.code(),
    }
}

/// Validate a get-public-key response and extract the Ed25519 key.
pub fn pub_key(response: &Response) -> Result<PubKey, ProtocolError> {
    let (algorithm, key_data) = match response {
        Response::GetPubKey {
            algorithm,
            key_data,
        } => (*algorithm, key_data),
        other => return Err(unexpected(CommandCode::GetPubKey, other)),
    };

    if algorithm != Algorithm::Ed25519 {
        error!("invalid pubkey algorithm: {}", algorithm);
        return Err(ProtocolError::UnsupportedAlgorithm(algorithm));
    }

    let bytes: [u8; PUBKEY_LEN] = key_data.as_slice().try_into().map_err(|_| {
        error!("invalid pubkey size: {}", key_data.len());
        ProtocolError::InvalidKeyLength(key_data.len())
    })?;

    Ok(PubKey::from_bytes(bytes))
}

/// Validate a sign-eddsa response and extract the signature.
pub fn signature(response: &Response) -> Result<Signature, ProtocolError> {
    let signature = match response {
        Response::SignEddsa { signature } => signature,
        other => return Err(unexpected(CommandCode::SignEddsa, other)),
    };

    let bytes: [u8; SIGNATURE_LEN] = signature.as_slice().try_into().map_err(|_| {
        error!("invalid signature length: {}", signature.len());
        ProtocolError::InvalidSignatureLength(signature.len())
    })?;

    Ok(Signature::from_bytes(bytes))
}

/// Validate a put-asymmetric-key response against the requested slot.
pub fn imported_key(response: &Response, requested: KeyId) -> Result<KeyId, ProtocolError> {
    let returned = match response {
        Response::PutAsymmetricKey { key_id } => *key_id,
        other => return Err(unexpected(CommandCode::PutAsymmetricKey, other)),
    };

    if returned != requested {
        error!(
            "imported key id mismatch: requested=0x{:04x}, returned=0x{:04x}",
            requested, returned
        );
        return Err(ProtocolError::KeyIdMismatch {
            requested,
            returned,
        });
    }

    Ok(returned)
}

/// Validate an echo response against the data that was sent.
pub fn echo(response: &Response, sent: &[u8]) -> Result<(), ProtocolError> {
    match response {
        Response::Echo { data } if data.as_slice() == sent => Ok(()),
        Response::Echo { .. } => Err(ProtocolError::EchoMismatch),
        other => Err(unexpected(CommandCode::Echo, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;

    #[test]
    fn test_pub_key_accepts_ed25519_32_bytes() {
        let response = Response::GetPubKey {
            algorithm: Algorithm::Ed25519,
            key_data: vec![5u8; 32],
        };
        assert_eq!(pub_key(&response).unwrap().as_bytes(), &[5u8; 32]);
    }

    #[test]
    fn test_pub_key_rejects_wrong_algorithm() {
        let response = Response::GetPubKey {
            algorithm: Algorithm::EcP256,
            key_data: vec![5u8; 32],
        };
        assert_eq!(
            pub_key(&response),
            Err(ProtocolError::UnsupportedAlgorithm(Algorithm::EcP256))
        );
    }

    #[test]
    fn test_pub_key_rejects_wrong_length() {
        for len in [0usize, 31, 33, 64] {
            let response = Response::GetPubKey {
                algorithm: Algorithm::Ed25519,
                key_data: vec![5u8; len],
            };
            assert_eq!(pub_key(&response), Err(ProtocolError::InvalidKeyLength(len)));
        }
    }

    #[test]
    fn test_pub_key_rejects_wrong_variant() {
        let response = Response::SignEddsa {
            signature: vec![0u8; 64],
        };
        assert_eq!(
            pub_key(&response),
            Err(ProtocolError::InvalidResponseType {
                expected: CommandCode::GetPubKey,
                actual: CommandCode::SignEddsa,
            })
        );

        let response = Response::Error(ErrorCode::ObjectNotFound);
        assert!(matches!(
            pub_key(&response),
            Err(ProtocolError::InvalidResponseType { .. })
        ));
    }

    #[test]
    fn test_signature_length() {
        let ok = Response::SignEddsa {
            signature: vec![1u8; 64],
        };
        assert_eq!(signature(&ok).unwrap().as_bytes(), &[1u8; 64]);

        let short = Response::SignEddsa {
            signature: vec![1u8; 63],
        };
        assert_eq!(
            signature(&short),
            Err(ProtocolError::InvalidSignatureLength(63))
        );
    }

    #[test]
    fn test_imported_key_id() {
        let response = Response::PutAsymmetricKey { key_id: 7 };
        assert_eq!(imported_key(&response, 7), Ok(7));
        assert_eq!(
            imported_key(&response, 8),
            Err(ProtocolError::KeyIdMismatch {
                requested: 8,
                returned: 7
            })
        );
    }

    #[test]
    fn test_echo() {
        let response = Response::Echo {
            data: b"ping".to_vec(),
        };
        assert!(echo(&response, b"ping").is_ok());
        assert_eq!(echo(&response, b"pong"), Err(ProtocolError::EchoMismatch));
    }
}
