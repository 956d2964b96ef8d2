//! HSM-backed validator signer.
//!
//! [`HsmSigner`] implements the validator signing contract
//! ([`PrivValidator`]) and its lifecycle ([`Service`]) by forwarding every
//! key operation to an HSM over a [`SecureChannel`]. Responses are checked
//! by the [`validator`](crate::validator) before anything is returned.
//!
//! ## Failure policy
//!
//! A validator must never sign with an identity it has not verified, so
//! failing to obtain the public key is fatal: it surfaces as
//! [`SignerError::PubKeyUnavailable`], for which [`SignerError::is_fatal`]
//! is true. The signer itself never aborts; the host process decides how to
//! shut down. All other failures are recoverable and leave the vote or
//! proposal untouched.

use crate::channel::{ChannelError, SecureChannel, Session};
use crate::config::SignerIdentity;
use crate::protocol::{Command, KeyId, Response};
use crate::types::{Address, Proposal, PubKey, SignBytes, SignBytesError, Signature, Vote};
use crate::validator::{self, ProtocolError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Cause of a failed HSM request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Encoding(#[from] SignBytesError),
}

/// Errors from signer operations.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Failed to open HSM session: {0}")]
    Channel(#[from] ChannelError),

    #[error("Public key unavailable for key 0x{key_id:04x}: {source}")]
    PubKeyUnavailable {
        key_id: KeyId,
        #[source]
        source: RequestError,
    },

    #[error("Failed to sign {operation}: {source}")]
    Signing {
        operation: &'static str,
        #[source]
        source: RequestError,
    },

    #[error("Failed to import key into slot 0x{key_id:04x}: {source}")]
    Import {
        key_id: KeyId,
        #[source]
        source: RequestError,
    },

    #[error("HSM ping failed: {0}")]
    Ping(#[source] RequestError),
}

impl SignerError {
    /// True if the process must not keep validating after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SignerError::PubKeyUnavailable { .. })
    }
}

/// Lifecycle of a component that owns external resources.
pub trait Service {
    type Error;

    fn start(&self) -> Result<(), Self::Error>;

    /// Release resources. Must be safe whether or not `start` succeeded.
    fn stop(&self);
}

/// Signing contract expected by the consensus engine.
pub trait PrivValidator {
    type Error;

    fn address(&self) -> Result<Address, Self::Error>;

    fn pub_key(&self) -> Result<PubKey, Self::Error>;

    /// Sign the vote for `chain_id`, setting `vote.signature` on success only.
    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), Self::Error>;

    /// Sign the proposal for `chain_id`, setting `proposal.signature` on
    /// success only.
    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), Self::Error>;
}

/// Validator signer whose key lives in an HSM.
pub struct HsmSigner<C: SecureChannel> {
    channel: C,
    identity: SignerIdentity,
    // Held for the full request/response exchange.
    session: Mutex<Option<C::Session>>,
    // Held across check, fetch and store. Always taken before `session`.
    cached_pub_key: Mutex<Option<PubKey>>,
}

impl<C: SecureChannel> HsmSigner<C> {
    pub fn new(channel: C, identity: SignerIdentity) -> Self {
        Self {
            channel,
            identity,
            session: Mutex::new(None),
            cached_pub_key: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &SignerIdentity {
        &self.identity
    }

    pub fn is_started(&self) -> bool {
        lock(&self.session).is_some()
    }

    /// Check that the session is alive by echoing `data` off the HSM.
    pub fn ping(&self, data: &[u8]) -> Result<(), SignerError> {
        let command = Command::Echo {
            data: data.to_vec(),
        };
        let response = self
            .request(&command)
            .map_err(|e| SignerError::Ping(e.into()))?;
        validator::echo(&response, data).map_err(|e| SignerError::Ping(e.into()))
    }

    /// Import an Ed25519 private key into `key_id`.
    ///
    /// For test and provisioning setups only: the key material passes
    /// through this process. Fails if the slot is already occupied or the
    /// HSM acknowledges a different slot.
    #[cfg(any(test, feature = "provisioning"))]
    pub fn import_key(&self, key_id: KeyId, key: &[u8]) -> Result<(), SignerError> {
        warn!("Importing key material into HSM slot 0x{:04x}", key_id);

        let command = Command::put_ed25519_key(key_id, key);
        let result = self
            .request(&command)
            .map_err(RequestError::from)
            .and_then(|response| Ok(validator::imported_key(&response, key_id)?));

        match result {
            Ok(_) => {
                info!("Imported key into HSM slot 0x{:04x}", key_id);
                Ok(())
            }
            Err(source) => {
                error!("Key import into slot 0x{:04x} failed: {}", key_id, source);
                Err(SignerError::Import { key_id, source })
            }
        }
    }

    /// Send one command over the session, holding it exclusively.
    fn request(&self, command: &Command) -> Result<Response, ChannelError> {
        let mut session = lock(&self.session);
        let session = session.as_mut().ok_or(ChannelError::NotStarted)?;
        session.send_command(command)
    }

    fn fetch_pub_key(&self) -> Result<PubKey, RequestError> {
        let command = Command::GetPubKey {
            key_id: self.identity.signing_key_id(),
        };
        let response = self.request(&command)?;
        Ok(validator::pub_key(&response)?)
    }

    fn sign_bytes(&self, data: Vec<u8>) -> Result<Signature, RequestError> {
        let command = Command::SignEddsa {
            key_id: self.identity.signing_key_id(),
            data,
        };
        let response = self.request(&command)?;
        Ok(validator::signature(&response)?)
    }

    fn sign_canonical<T: SignBytes>(
        &self,
        operation: &'static str,
        chain_id: &str,
        message: &T,
    ) -> Result<Signature, SignerError> {
        message
            .sign_bytes(chain_id)
            .map_err(RequestError::from)
            .and_then(|bytes| self.sign_bytes(bytes))
            .map_err(|source| {
                warn!("Failed to sign {}: {}", operation, source);
                SignerError::Signing { operation, source }
            })
    }
}

impl<C: SecureChannel> Service for HsmSigner<C> {
    type Error = SignerError;

    fn start(&self) -> Result<(), SignerError> {
        let session = self
            .channel
            .open(
                self.identity.hsm_addr(),
                self.identity.auth_key_id(),
                self.identity.password(),
            )
            .map_err(|e| {
                error!(
                    "Failed to open HSM session at {}: {}",
                    self.identity.hsm_addr(),
                    e
                );
                SignerError::Channel(e)
            })?;

        let previous = lock(&self.session).replace(session);
        if let Some(mut previous) = previous {
            warn!("HSM signer started twice; closing previous session");
            previous.close();
        }

        info!(
            "HSM signer started: hsm={}, signing_key=0x{:04x}",
            self.identity.hsm_addr(),
            self.identity.signing_key_id()
        );
        Ok(())
    }

    fn stop(&self) {
        match lock(&self.session).take() {
            Some(mut session) => {
                session.close();
                info!("HSM signer stopped");
            }
            None => debug!("HSM signer stopped without an open session"),
        }
    }
}

impl<C: SecureChannel> PrivValidator for HsmSigner<C> {
    type Error = SignerError;

    fn address(&self) -> Result<Address, SignerError> {
        Ok(self.pub_key()?.address())
    }

    fn pub_key(&self) -> Result<PubKey, SignerError> {
        let mut cached = lock(&self.cached_pub_key);
        if let Some(pubkey) = *cached {
            return Ok(pubkey);
        }

        let key_id = self.identity.signing_key_id();
        match self.fetch_pub_key() {
            Ok(pubkey) => {
                info!("Fetched public key for HSM key 0x{:04x}: {}", key_id, pubkey);
                *cached = Some(pubkey);
                Ok(pubkey)
            }
            Err(source) => {
                error!(
                    "Public key unavailable for HSM key 0x{:04x}: {}",
                    key_id, source
                );
                Err(SignerError::PubKeyUnavailable { key_id, source })
            }
        }
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        let signature = self.sign_canonical("vote", chain_id, &*vote)?;
        vote.signature = Some(signature);
        debug!(
            "Signed vote: chain={}, height={}, round={}",
            chain_id, vote.height, vote.round
        );
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError> {
        let signature = self.sign_canonical("proposal", chain_id, &*proposal)?;
        proposal.signature = Some(signature);
        debug!(
            "Signed proposal: chain={}, height={}, round={}",
            chain_id, proposal.height, proposal.round
        );
        Ok(())
    }
}

/// The guarded state stays consistent even if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
