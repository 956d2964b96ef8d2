//! HSM-backed validator signer.
//!
//! This crate lets a validator delegate its Ed25519 consensus key to a
//! networked Hardware Security Module. The key never enters the validator
//! process: public-key retrieval and vote/proposal signing are sent to the
//! HSM over an authenticated, encrypted session, and every response is
//! validated before it is trusted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐                ┌───────────┐   encrypted    ┌─────────┐
//! │ Consensus engine│ PrivValidator  │ HsmSigner │ ─────────────► │   HSM   │
//! │                 │ ─────────────► │ validator │ ◄───────────── │         │
//! └─────────────────┘                └───────────┘    session     └─────────┘
//! ```
//!
//! ## Features
//!
//! - **Fail-closed**: a public key that cannot be fetched or validated is a
//!   fatal error; the signer never signs with an unverified identity
//! - **Strict validation**: response type, algorithm and key/signature
//!   widths are checked before any field is used
//! - **Serialized access**: one session per signer, one command in flight
//!
//! ## Usage
//!
//! Start the HSM emulator for local testing:
//! ```bash
//! AIAKOS_HSM_PASSWORD=password aiakos-hsm-emulator \
//!     --listen 127.0.0.1:12345 \
//!     --auth-key-id 1 \
//!     --signing-key-id 100 --signing-key-seed <hex>
//! ```
//!
//! Then point the signer at it:
//! ```bash
//! aiakos --config signer.json address
//! ```

pub mod channel;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod server;
pub mod signer;
pub mod types;
pub mod validator;

pub use channel::{ChannelError, SecureChannel, Session, TcpChannel, TcpSession};
pub use config::{ConfigError, Password, SignerConfig, SignerIdentity};
pub use protocol::{Algorithm, Command, CommandCode, ErrorCode, KeyId, Response};
pub use server::{HsmServer, HsmServerConfig, KeyStore, ServerError};
pub use signer::{HsmSigner, PrivValidator, RequestError, Service, SignerError};
pub use types::{Address, Proposal, PubKey, SignBytes, Signature, Vote, VoteType};
pub use validator::ProtocolError;
