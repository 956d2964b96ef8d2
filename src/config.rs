//! Signer configuration.
//!
//! ```json
//! {
//!   "hsm_addr": "127.0.0.1:12345",
//!   "auth_key_id": 1,
//!   "password": "password",
//!   "signing_key_id": 100
//! }
//! ```

use crate::protocol::KeyId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Authentication secret for the HSM. Zeroized on drop, never printed.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}

/// On-disk signer configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    /// HSM endpoint (`host:port`, optionally prefixed with `tcp://`)
    pub hsm_addr: String,
    /// Authentication key slot used to open sessions
    pub auth_key_id: KeyId,
    /// Password for the authentication key; may be left empty and
    /// supplied through the environment instead
    #[serde(default)]
    pub password: Password,
    /// Slot holding the Ed25519 signing key
    pub signing_key_id: KeyId,
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("hsm_addr", &self.hsm_addr)
            .field("auth_key_id", &self.auth_key_id)
            .field("signing_key_id", &self.signing_key_id)
            .finish_non_exhaustive()
    }
}

impl SignerConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path.as_ref())?;
        let config: SignerConfig = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    /// Build the signer identity, preferring `password_override` when set.
    pub fn into_identity(
        self,
        password_override: Option<String>,
    ) -> Result<SignerIdentity, ConfigError> {
        let password = password_override
            .filter(|p| !p.is_empty())
            .map(Password::new)
            .unwrap_or(self.password);

        if self.hsm_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("hsm_addr is empty".to_string()));
        }
        if password.expose().is_empty() {
            return Err(ConfigError::Invalid(
                "no HSM password in config or environment".to_string(),
            ));
        }

        Ok(SignerIdentity::new(
            self.hsm_addr,
            self.auth_key_id,
            password,
            self.signing_key_id,
        ))
    }
}

/// Immutable identity of an HSM-backed signer.
#[derive(Debug, Clone)]
pub struct SignerIdentity {
    hsm_addr: String,
    auth_key_id: KeyId,
    password: Password,
    signing_key_id: KeyId,
}

impl SignerIdentity {
    pub fn new(
        hsm_addr: impl Into<String>,
        auth_key_id: KeyId,
        password: Password,
        signing_key_id: KeyId,
    ) -> Self {
        Self {
            hsm_addr: hsm_addr.into(),
            auth_key_id,
            password,
            signing_key_id,
        }
    }

    pub fn hsm_addr(&self) -> &str {
        &self.hsm_addr
    }

    pub fn auth_key_id(&self) -> KeyId {
        self.auth_key_id
    }

    pub fn password(&self) -> &Password {
        &self.password
    }

    pub fn signing_key_id(&self) -> KeyId {
        self.signing_key_id
    }
}
