//! Secure channel to the HSM.
//!
//! The signer only depends on the [`SecureChannel`] and [`Session`] traits.
//! [`TcpChannel`] is the production implementation: it authenticates with
//! a password-derived key, then exchanges AES-256-GCM sealed commands over
//! a single TCP connection for the lifetime of the session.

use crate::config::Password;
use crate::crypto::{derive_auth_key, random_challenge, CryptoError, Direction, SessionCipher};
use crate::protocol::{
    read_frame, write_frame, Command, ErrorCode, Frame, FrameError, KeyId, Response,
};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Transport and session failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Session crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Authentication failed for auth key 0x{0:04x}")]
    AuthenticationFailed(KeyId),

    #[error("Device error: {0}")]
    Device(ErrorCode),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("Session not started")]
    NotStarted,
}

/// Opens authenticated sessions to an HSM.
pub trait SecureChannel: Send + Sync {
    type Session: Session;

    /// Open and authenticate a new session.
    fn open(
        &self,
        endpoint: &str,
        auth_key_id: KeyId,
        password: &Password,
    ) -> Result<Self::Session, ChannelError>;
}

/// An open, authenticated session.
///
/// Implementations are not required to be safe for concurrent use; callers
/// serialize access.
pub trait Session: Send {
    /// Encrypt and send a command, then wait for and decrypt its response.
    ///
    /// Device-reported errors are returned as [`ChannelError::Device`].
    fn send_command(&mut self, command: &Command) -> Result<Response, ChannelError>;

    /// Release the session. Best-effort; safe to call more than once.
    fn close(&mut self);
}

/// TCP implementation of [`SecureChannel`].
#[derive(Debug, Clone, Default)]
pub struct TcpChannel {
    timeout: Option<Duration>,
}

impl TcpChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a read/write timeout to every session opened by this channel.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl SecureChannel for TcpChannel {
    type Session = TcpSession;

    fn open(
        &self,
        endpoint: &str,
        auth_key_id: KeyId,
        password: &Password,
    ) -> Result<TcpSession, ChannelError> {
        let addr = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
        debug!("Connecting to HSM at {}", addr);

        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;

        let host_challenge = random_challenge();
        write_frame(
            &mut stream,
            &Frame::CreateSession {
                auth_key_id,
                host_challenge,
            },
        )?;

        let handshake = read_frame::<_, Frame>(&mut stream)?;
        let (session_id, card_challenge, card_cryptogram) = match handshake {
            Frame::SessionCreated {
                session_id,
                card_challenge,
                card_cryptogram,
            } => (session_id, card_challenge, card_cryptogram),
            Frame::Failed(ErrorCode::AuthenticationFailed) => {
                return Err(ChannelError::AuthenticationFailed(auth_key_id));
            }
            Frame::Failed(code) => return Err(ChannelError::Device(code)),
            _ => return Err(ChannelError::UnexpectedFrame("expected SessionCreated")),
        };

        let auth_key = derive_auth_key(password.expose().as_bytes());
        let cipher = SessionCipher::derive(&auth_key, &host_challenge, &card_challenge, session_id)?;

        if !cipher.verify_card_cryptogram(&card_cryptogram) {
            warn!(
                "Card cryptogram mismatch for auth key 0x{:04x} (wrong password or impostor HSM)",
                auth_key_id
            );
            return Err(ChannelError::AuthenticationFailed(auth_key_id));
        }

        write_frame(
            &mut stream,
            &Frame::Authenticate {
                session_id,
                host_cryptogram: cipher.host_cryptogram()?,
            },
        )?;

        match read_frame::<_, Frame>(&mut stream)? {
            Frame::Authenticated => {}
            Frame::Failed(ErrorCode::AuthenticationFailed) => {
                return Err(ChannelError::AuthenticationFailed(auth_key_id));
            }
            Frame::Failed(code) => return Err(ChannelError::Device(code)),
            _ => return Err(ChannelError::UnexpectedFrame("expected Authenticated")),
        }

        info!(
            "Opened HSM session {} at {} with auth key 0x{:04x}",
            session_id, addr, auth_key_id
        );

        Ok(TcpSession {
            stream,
            cipher,
            counter: 0,
            closed: false,
        })
    }
}

/// Session over a TCP connection.
///
/// Any failure after a command is written leaves the connection in an
/// unknown state, so the session is torn down and later commands fail with
/// [`ChannelError::NotStarted`].
pub struct TcpSession {
    stream: TcpStream,
    cipher: SessionCipher,
    counter: u64,
    closed: bool,
}

impl TcpSession {
    /// One sealed request and its sealed reply.
    fn exchange(&mut self, command: &Command) -> Result<Response, ChannelError> {
        self.counter += 1;
        let plaintext = Zeroizing::new(bincode::serialize(command).map_err(FrameError::from)?);
        let payload = self
            .cipher
            .seal(Direction::HostToCard, self.counter, &plaintext)?;

        debug!(
            "Sending {} command: session={}, counter={}",
            command.code(),
            self.cipher.session_id(),
            self.counter
        );

        write_frame(
            &mut self.stream,
            &Frame::Encrypted {
                session_id: self.cipher.session_id(),
                counter: self.counter,
                payload,
            },
        )?;

        match read_frame::<_, Frame>(&mut self.stream)? {
            Frame::Encrypted {
                session_id,
                counter,
                payload,
            } => {
                if session_id != self.cipher.session_id() {
                    return Err(ChannelError::UnexpectedFrame("response for another session"));
                }
                let plaintext = self.cipher.open(Direction::CardToHost, counter, &payload)?;
                if counter != self.counter {
                    return Err(CryptoError::CounterMismatch {
                        expected: self.counter,
                        got: counter,
                    }
                    .into());
                }
                Ok(bincode::deserialize(&plaintext).map_err(FrameError::from)?)
            }
            Frame::Failed(code) => Err(ChannelError::Device(code)),
            _ => Err(ChannelError::UnexpectedFrame("expected Encrypted")),
        }
    }

    fn abort(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Session for TcpSession {
    fn send_command(&mut self, command: &Command) -> Result<Response, ChannelError> {
        if self.closed {
            return Err(ChannelError::NotStarted);
        }

        match self.exchange(command) {
            Ok(Response::Error(code)) => Err(ChannelError::Device(code)),
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(
                    "Closing HSM session {} after failed {} exchange: {}",
                    self.cipher.session_id(),
                    command.code(),
                    e
                );
                self.abort();
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let session_id = self.cipher.session_id();
        if let Err(e) = write_frame(&mut self.stream, &Frame::CloseSession { session_id }) {
            debug!("Failed to send CloseSession for session {}: {}", session_id, e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        info!("Closed HSM session {}", session_id);
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};
    use std::sync::mpsc;
    use std::thread::{self, JoinHandle};

    const PASSWORD: &str = "password";
    const SESSION_ID: u8 = 7;

    fn seal_reply(cipher: &SessionCipher, counter: u64, response: &Response) -> Frame {
        let bytes = bincode::serialize(response).unwrap();
        Frame::Encrypted {
            session_id: SESSION_ID,
            counter,
            payload: cipher.seal(Direction::CardToHost, counter, &bytes).unwrap(),
        }
    }

    fn echo_reply(stream: &mut TcpStream, cipher: &SessionCipher, counter: u64) {
        let response = Response::Echo {
            data: b"ping".to_vec(),
        };
        let _ = write_frame(stream, &seal_reply(cipher, counter, &response));
    }

    /// Card that completes the handshake honestly, then hands the n-th
    /// command's counter to `script`.
    fn scripted_card<F>(mut script: F) -> (SocketAddr, JoinHandle<()>)
    where
        F: FnMut(usize, &mut TcpStream, &SessionCipher, u64) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let host_challenge = match read_frame::<_, Frame>(&mut stream).unwrap() {
                Frame::CreateSession { host_challenge, .. } => host_challenge,
                other => panic!("Expected CreateSession, got {:?}", other),
            };
            let card_challenge = random_challenge();
            let auth_key = derive_auth_key(PASSWORD.as_bytes());
            let cipher =
                SessionCipher::derive(&auth_key, &host_challenge, &card_challenge, SESSION_ID)
                    .unwrap();
            write_frame(
                &mut stream,
                &Frame::SessionCreated {
                    session_id: SESSION_ID,
                    card_challenge,
                    card_cryptogram: cipher.card_cryptogram().unwrap(),
                },
            )
            .unwrap();
            let _: Frame = read_frame(&mut stream).unwrap();
            write_frame(&mut stream, &Frame::Authenticated).unwrap();

            let mut index = 0;
            while let Ok(Frame::Encrypted { counter, .. }) = read_frame::<_, Frame>(&mut stream) {
                script(index, &mut stream, &cipher, counter);
                index += 1;
            }
        });

        (addr, handle)
    }

    fn open_session(addr: SocketAddr, timeout: Duration) -> TcpSession {
        TcpChannel::with_timeout(timeout)
            .open(&addr.to_string(), 1, &Password::new(PASSWORD))
            .unwrap()
    }

    fn echo() -> Command {
        Command::Echo {
            data: b"ping".to_vec(),
        }
    }

    #[test]
    fn test_open_unreachable_endpoint_is_io_error() {
        // Reserve a port, then free it so nothing is listening.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = TcpChannel::with_timeout(Duration::from_secs(1));
        let result = channel.open(&addr.to_string(), 1, &Password::new("password"));
        assert!(matches!(result, Err(ChannelError::Io(_))));
    }

    #[test]
    fn test_open_rejects_non_handshake_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _: Frame = read_frame(&mut stream).unwrap();
            write_frame(&mut stream, &Frame::Authenticated).unwrap();
        });

        let channel = TcpChannel::new();
        let result = channel.open(&format!("tcp://{}", addr), 1, &Password::new("password"));
        assert!(matches!(result, Err(ChannelError::UnexpectedFrame(_))));

        peer.join().unwrap();
    }

    #[test]
    fn test_session_round_trips_commands() {
        let (addr, card) = scripted_card(|_, stream, cipher, counter| {
            echo_reply(stream, cipher, counter)
        });
        let mut session = open_session(addr, Duration::from_secs(5));

        for _ in 0..3 {
            assert_eq!(
                session.send_command(&echo()).unwrap(),
                Response::Echo {
                    data: b"ping".to_vec()
                }
            );
        }

        session.close();
        card.join().unwrap();
    }

    #[test]
    fn test_late_reply_is_never_paired_with_next_command() {
        let (released_tx, released_rx) = mpsc::channel();
        let (addr, card) = scripted_card(move |index, stream, cipher, counter| {
            if index == 0 {
                thread::sleep(Duration::from_millis(1500));
                echo_reply(stream, cipher, counter);
                let _ = released_tx.send(());
            } else {
                echo_reply(stream, cipher, counter);
            }
        });
        let mut session = open_session(addr, Duration::from_secs(1));

        assert!(session.send_command(&echo()).is_err());

        // The late reply is now on the wire; it must not answer this command.
        released_rx.recv().unwrap();
        assert!(matches!(
            session.send_command(&echo()),
            Err(ChannelError::NotStarted)
        ));

        drop(session);
        card.join().unwrap();
    }

    #[test]
    fn test_reply_under_wrong_counter_is_rejected() {
        let (addr, card) = scripted_card(|_, stream, cipher, counter| {
            let reply = seal_reply(
                cipher,
                counter + 1,
                &Response::Echo {
                    data: b"ping".to_vec(),
                },
            );
            let _ = write_frame(stream, &reply);
        });
        let mut session = open_session(addr, Duration::from_secs(5));

        assert!(matches!(
            session.send_command(&echo()),
            Err(ChannelError::Crypto(CryptoError::CounterMismatch {
                expected: 1,
                got: 2
            }))
        ));
        assert!(matches!(
            session.send_command(&echo()),
            Err(ChannelError::NotStarted)
        ));

        drop(session);
        card.join().unwrap();
    }

    #[test]
    fn test_replayed_reply_is_rejected() {
        let mut first_reply = None;
        let (addr, card) = scripted_card(move |_, stream, cipher, counter| {
            let reply = first_reply
                .get_or_insert_with(|| {
                    seal_reply(
                        cipher,
                        counter,
                        &Response::Echo {
                            data: b"ping".to_vec(),
                        },
                    )
                })
                .clone();
            let _ = write_frame(stream, &reply);
        });
        let mut session = open_session(addr, Duration::from_secs(5));

        assert!(session.send_command(&echo()).is_ok());
        assert!(matches!(
            session.send_command(&echo()),
            Err(ChannelError::Crypto(CryptoError::CounterMismatch {
                expected: 2,
                got: 1
            }))
        ));

        drop(session);
        card.join().unwrap();
    }

    #[test]
    fn test_tampered_reply_closes_session() {
        let (addr, card) = scripted_card(|_, stream, cipher, counter| {
            let mut reply = seal_reply(
                cipher,
                counter,
                &Response::Echo {
                    data: b"ping".to_vec(),
                },
            );
            if let Frame::Encrypted { payload, .. } = &mut reply {
                payload[0] ^= 0x01;
            }
            let _ = write_frame(stream, &reply);
        });
        let mut session = open_session(addr, Duration::from_secs(5));

        assert!(matches!(
            session.send_command(&echo()),
            Err(ChannelError::Crypto(CryptoError::Open))
        ));
        assert!(matches!(
            session.send_command(&echo()),
            Err(ChannelError::NotStarted)
        ));

        drop(session);
        card.join().unwrap();
    }

    #[test]
    fn test_failed_frame_closes_session() {
        let (addr, card) = scripted_card(|_, stream, _, _| {
            let _ = write_frame(stream, &Frame::Failed(ErrorCode::InvalidSession));
        });
        let mut session = open_session(addr, Duration::from_secs(5));

        assert!(matches!(
            session.send_command(&echo()),
            Err(ChannelError::Device(ErrorCode::InvalidSession))
        ));
        assert!(matches!(
            session.send_command(&echo()),
            Err(ChannelError::NotStarted)
        ));

        drop(session);
        card.join().unwrap();
    }

    #[test]
    fn test_device_error_keeps_session_open() {
        let (addr, card) = scripted_card(|index, stream, cipher, counter| {
            if index == 0 {
                let reply = seal_reply(cipher, counter, &Response::Error(ErrorCode::ObjectNotFound));
                let _ = write_frame(stream, &reply);
            } else {
                echo_reply(stream, cipher, counter);
            }
        });
        let mut session = open_session(addr, Duration::from_secs(5));

        assert!(matches!(
            session.send_command(&Command::GetPubKey { key_id: 9 }),
            Err(ChannelError::Device(ErrorCode::ObjectNotFound))
        ));
        assert!(session.send_command(&echo()).is_ok());

        session.close();
        card.join().unwrap();
    }
}
