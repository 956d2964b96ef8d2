//! Emulated HSM server.
//!
//! Listens on a TCP socket and speaks the same session protocol as the
//! networked HSM: sessions are authenticated with password-derived keys,
//! commands are sealed with the session cipher, and Ed25519 keys live in
//! numbered slots. Used by the integration tests and for local validator
//! setups without hardware.

use crate::config::Password;
use crate::crypto::{
    derive_auth_key, random_challenge, AuthKey, CryptoError, Direction, ReplayGuard, SessionCipher,
};
use crate::protocol::{
    read_frame, write_frame, Algorithm, Capabilities, Command, Domains, ErrorCode, Frame,
    FrameError, KeyId, Response, LABEL_MAX_LEN,
};
use ed25519_dalek::{Signer as _, SigningKey};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Label given to keys loaded from the server configuration.
pub const DEFAULT_KEY_LABEL: &str = "default";

/// Server configuration.
pub struct HsmServerConfig {
    /// Address to listen on (`127.0.0.1:0` picks a free port)
    pub listen_addr: String,
    /// Authentication keys: slot and password
    pub auth_keys: Vec<(KeyId, Password)>,
    /// Ed25519 signing keys: slot and 32-byte seed
    pub signing_keys: Vec<(KeyId, Zeroizing<[u8; 32]>)>,
}

/// Errors from the emulated HSM.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Session crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

struct StoredKey {
    label: String,
    domains: Domains,
    capabilities: Capabilities,
    signing_key: SigningKey,
}

/// Objects held by the emulated HSM.
#[derive(Default)]
pub struct KeyStore {
    auth_keys: HashMap<KeyId, AuthKey>,
    keys: HashMap<KeyId, StoredKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_auth_key(&mut self, key_id: KeyId, password: &Password) {
        self.auth_keys
            .insert(key_id, derive_auth_key(password.expose().as_bytes()));
    }

    /// Store an Ed25519 key. Fails if the slot is taken or the input is
    /// malformed.
    pub fn put_ed25519_key(
        &mut self,
        key_id: KeyId,
        label: &str,
        domains: Domains,
        capabilities: Capabilities,
        seed: &[u8],
    ) -> Result<(), ErrorCode> {
        if self.keys.contains_key(&key_id) {
            return Err(ErrorCode::ObjectExists);
        }
        if label.len() > LABEL_MAX_LEN {
            return Err(ErrorCode::InvalidData);
        }
        let seed: &[u8; 32] = seed.try_into().map_err(|_| ErrorCode::InvalidData)?;

        self.keys.insert(
            key_id,
            StoredKey {
                label: label.to_string(),
                domains,
                capabilities,
                signing_key: SigningKey::from_bytes(seed),
            },
        );
        Ok(())
    }

    #[cfg(test)]
    fn contains_key(&self, key_id: KeyId) -> bool {
        self.keys.contains_key(&key_id)
    }

    #[cfg(test)]
    fn label(&self, key_id: KeyId) -> Option<&str> {
        self.keys.get(&key_id).map(|k| k.label.as_str())
    }

    fn auth_key(&self, key_id: KeyId) -> Option<AuthKey> {
        self.auth_keys.get(&key_id).cloned()
    }

    /// Execute a command against the store.
    pub fn execute(&mut self, command: &Command) -> Response {
        match self.try_execute(command) {
            Ok(response) => response,
            Err(code) => {
                debug!("{} command failed: {}", command.code(), code);
                Response::Error(code)
            }
        }
    }

    fn try_execute(&mut self, command: &Command) -> Result<Response, ErrorCode> {
        match command {
            Command::GetPubKey { key_id } => {
                let key = self.keys.get(key_id).ok_or(ErrorCode::ObjectNotFound)?;
                Ok(Response::GetPubKey {
                    algorithm: Algorithm::Ed25519,
                    key_data: key.signing_key.verifying_key().to_bytes().to_vec(),
                })
            }
            Command::SignEddsa { key_id, data } => {
                let key = self.keys.get(key_id).ok_or(ErrorCode::ObjectNotFound)?;
                if !key.capabilities.contains(Capabilities::SIGN_EDDSA) {
                    return Err(ErrorCode::InsufficientPermissions);
                }
                debug!(
                    "Signing {} bytes with key 0x{:04x} (domains={:#06x})",
                    data.len(),
                    key_id,
                    key.domains.0
                );
                Ok(Response::SignEddsa {
                    signature: key.signing_key.sign(data).to_bytes().to_vec(),
                })
            }
            Command::PutAsymmetricKey {
                key_id,
                label,
                domains,
                capabilities,
                algorithm,
                key,
                ..
            } => {
                if *algorithm != Algorithm::Ed25519 {
                    return Err(ErrorCode::InvalidData);
                }
                self.put_ed25519_key(*key_id, label, *domains, *capabilities, key.as_bytes())?;
                info!("Stored imported key in slot 0x{:04x}", key_id);
                Ok(Response::PutAsymmetricKey { key_id: *key_id })
            }
            Command::Echo { data } => Ok(Response::Echo { data: data.clone() }),
        }
    }
}

/// Emulated HSM.
pub struct HsmServer {
    listener: TcpListener,
    store: Arc<Mutex<KeyStore>>,
    next_session_id: AtomicU8,
}

impl HsmServer {
    /// Bind the listener and load the configured keys.
    pub fn new(config: HsmServerConfig) -> Result<Self, ServerError> {
        let mut store = KeyStore::new();
        for (key_id, password) in &config.auth_keys {
            store.add_auth_key(*key_id, password);
        }
        for (key_id, seed) in &config.signing_keys {
            store
                .put_ed25519_key(
                    *key_id,
                    DEFAULT_KEY_LABEL,
                    Domains::DOMAIN_1,
                    Capabilities::SIGN_EDDSA,
                    &seed[..],
                )
                .map_err(|code| {
                    ServerError::Protocol(format!("Cannot load key 0x{:04x}: {}", key_id, code))
                })?;
        }

        let listener = TcpListener::bind(&config.listen_addr)?;
        info!("HSM emulator listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            store: Arc::new(Mutex::new(store)),
            next_session_id: AtomicU8::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the key store.
    pub fn store(&self) -> Arc<Mutex<KeyStore>> {
        Arc::clone(&self.store)
    }

    /// Run the server (blocking). Each connection is one session, served on
    /// its own thread.
    pub fn run(&self) -> Result<(), ServerError> {
        info!("HSM emulator starting...");

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    let store = Arc::clone(&self.store);
                    debug!("New connection, session {}", session_id);
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(&store, session_id, stream) {
                            error!("Error handling session {}: {}", session_id, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Run the server on a background thread and return its address.
    pub fn spawn(self) -> Result<SocketAddr, ServerError> {
        let addr = self.local_addr()?;
        thread::spawn(move || {
            if let Err(e) = self.run() {
                error!("HSM emulator stopped: {}", e);
            }
        });
        Ok(addr)
    }
}

fn lock(store: &Mutex<KeyStore>) -> MutexGuard<'_, KeyStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serve one session from handshake to close.
fn handle_connection(
    store: &Mutex<KeyStore>,
    session_id: u8,
    mut stream: TcpStream,
) -> Result<(), ServerError> {
    let (auth_key_id, host_challenge) = match read_frame::<_, Frame>(&mut stream)? {
        Frame::CreateSession {
            auth_key_id,
            host_challenge,
        } => (auth_key_id, host_challenge),
        _ => {
            write_frame(&mut stream, &Frame::Failed(ErrorCode::InvalidCommand))?;
            return Err(ServerError::Protocol("expected CreateSession".to_string()));
        }
    };

    let Some(auth_key) = lock(store).auth_key(auth_key_id) else {
        warn!("Session requested for unknown auth key 0x{:04x}", auth_key_id);
        write_frame(&mut stream, &Frame::Failed(ErrorCode::AuthenticationFailed))?;
        return Ok(());
    };

    let card_challenge = random_challenge();
    let cipher = SessionCipher::derive(&auth_key, &host_challenge, &card_challenge, session_id)?;
    write_frame(
        &mut stream,
        &Frame::SessionCreated {
            session_id,
            card_challenge,
            card_cryptogram: cipher.card_cryptogram()?,
        },
    )?;

    let authenticated = match read_frame::<_, Frame>(&mut stream)? {
        Frame::Authenticate {
            session_id: requested,
            host_cryptogram,
        } => requested == session_id && cipher.verify_host_cryptogram(&host_cryptogram),
        _ => false,
    };
    if !authenticated {
        warn!(
            "Authentication failed for auth key 0x{:04x}, session {}",
            auth_key_id, session_id
        );
        write_frame(&mut stream, &Frame::Failed(ErrorCode::AuthenticationFailed))?;
        return Ok(());
    }
    write_frame(&mut stream, &Frame::Authenticated)?;
    info!(
        "Session {} authenticated with auth key 0x{:04x}",
        session_id, auth_key_id
    );

    let mut replay = ReplayGuard::new();

    loop {
        let frame: Frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(FrameError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("Session {} disconnected", session_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match frame {
            Frame::Encrypted {
                session_id: requested,
                counter,
                payload,
            } => {
                if requested != session_id {
                    warn!("Rejecting misrouted frame on session {}", session_id);
                    write_frame(&mut stream, &Frame::Failed(ErrorCode::InvalidSession))?;
                    return Ok(());
                }

                let plaintext =
                    match replay.open(&cipher, Direction::HostToCard, counter, &payload) {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            warn!("Session {}: {}", session_id, e);
                            write_frame(&mut stream, &Frame::Failed(ErrorCode::InvalidSession))?;
                            return Ok(());
                        }
                    };

                let response = match bincode::deserialize::<Command>(&plaintext) {
                    Ok(command) => lock(store).execute(&command),
                    Err(e) => {
                        warn!("Session {}: undecodable command: {}", session_id, e);
                        Response::Error(ErrorCode::InvalidCommand)
                    }
                };

                // Replies reuse the request's counter.
                let response_bytes =
                    Zeroizing::new(bincode::serialize(&response).map_err(FrameError::from)?);
                write_frame(
                    &mut stream,
                    &Frame::Encrypted {
                        session_id,
                        counter,
                        payload: cipher.seal(Direction::CardToHost, counter, &response_bytes)?,
                    },
                )?;
            }
            Frame::CloseSession { .. } => {
                info!("Session {} closed", session_id);
                return Ok(());
            }
            _ => {
                write_frame(&mut stream, &Frame::Failed(ErrorCode::InvalidCommand))?;
                return Err(ServerError::Protocol(format!(
                    "unexpected frame in session {}",
                    session_id
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IMPORTED_KEY_LABEL;

    fn store_with_key(key_id: KeyId, capabilities: Capabilities) -> KeyStore {
        let mut store = KeyStore::new();
        store
            .put_ed25519_key(key_id, "test", Domains::DOMAIN_1, capabilities, &[3u8; 32])
            .unwrap();
        store
    }

    #[test]
    fn test_get_pubkey_matches_seed() {
        let mut store = store_with_key(1, Capabilities::SIGN_EDDSA);
        let expected = SigningKey::from_bytes(&[3u8; 32]).verifying_key().to_bytes();

        match store.execute(&Command::GetPubKey { key_id: 1 }) {
            Response::GetPubKey {
                algorithm,
                key_data,
            } => {
                assert_eq!(algorithm, Algorithm::Ed25519);
                assert_eq!(key_data, expected.to_vec());
            }
            other => panic!("Expected GetPubKey response, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_slot() {
        let mut store = KeyStore::new();
        assert_eq!(
            store.execute(&Command::GetPubKey { key_id: 9 }),
            Response::Error(ErrorCode::ObjectNotFound)
        );
        assert_eq!(
            store.execute(&Command::SignEddsa {
                key_id: 9,
                data: b"msg".to_vec()
            }),
            Response::Error(ErrorCode::ObjectNotFound)
        );
    }

    #[test]
    fn test_sign_requires_capability() {
        let mut store = store_with_key(1, Capabilities::NONE);
        assert_eq!(
            store.execute(&Command::SignEddsa {
                key_id: 1,
                data: b"msg".to_vec()
            }),
            Response::Error(ErrorCode::InsufficientPermissions)
        );
    }

    #[test]
    fn test_put_key_rules() {
        let mut store = store_with_key(1, Capabilities::SIGN_EDDSA);

        assert_eq!(
            store.execute(&Command::put_ed25519_key(1, &[4u8; 32])),
            Response::Error(ErrorCode::ObjectExists)
        );
        assert_eq!(
            store.execute(&Command::put_ed25519_key(2, &[4u8; 31])),
            Response::Error(ErrorCode::InvalidData)
        );
        assert_eq!(
            store.execute(&Command::put_ed25519_key(2, &[4u8; 32])),
            Response::PutAsymmetricKey { key_id: 2 }
        );
        assert_eq!(store.label(2), Some(IMPORTED_KEY_LABEL));

        let mut long_label = Command::put_ed25519_key(3, &[4u8; 32]);
        if let Command::PutAsymmetricKey { label, .. } = &mut long_label {
            *label = "x".repeat(LABEL_MAX_LEN + 1);
        }
        assert_eq!(
            store.execute(&long_label),
            Response::Error(ErrorCode::InvalidData)
        );

        let mut wrong_algorithm = Command::put_ed25519_key(4, &[4u8; 32]);
        if let Command::PutAsymmetricKey { algorithm, .. } = &mut wrong_algorithm {
            *algorithm = Algorithm::EcK256;
        }
        assert_eq!(
            store.execute(&wrong_algorithm),
            Response::Error(ErrorCode::InvalidData)
        );
        assert!(!store.contains_key(3));
        assert!(!store.contains_key(4));
    }

    #[test]
    fn test_server_binds_and_loads_keys() {
        let server = HsmServer::new(HsmServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            auth_keys: vec![(1, Password::new("password"))],
            signing_keys: vec![(100, Zeroizing::new([5u8; 32]))],
        })
        .unwrap();

        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.store().lock().unwrap().contains_key(100));
    }

    #[test]
    fn test_unknown_auth_key_is_rejected() {
        let server = HsmServer::new(HsmServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            auth_keys: vec![(1, Password::new("password"))],
            signing_keys: vec![],
        })
        .unwrap();
        let addr = server.spawn().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        write_frame(
            &mut stream,
            &Frame::CreateSession {
                auth_key_id: 2,
                host_challenge: [0u8; 8],
            },
        )
        .unwrap();

        let reply: Frame = read_frame(&mut stream).unwrap();
        assert!(matches!(
            reply,
            Frame::Failed(ErrorCode::AuthenticationFailed)
        ));
    }
}
