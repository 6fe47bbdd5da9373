//! TLS backend contract.
//!
//! Keel does not implement TLS. A backend (OpenSSL, mbedTLS, rustls, a
//! vendor stack) is plugged in through [`TlsBackend`] and drives each
//! connection through a sans-IO [`TlsSession`]: the core moves ciphertext
//! between the socket and the session's `wire_in`/`wire_out` buffers and
//! plaintext between the session and the connection's recv/send buffers.
//!
//! Dropping a session frees it.

use crate::buffer::Mbuf;
use crate::error::Result;

/// Parameters for a TLS connection or listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsParams {
    /// PEM certificate (chain) presented to the peer
    pub cert: Option<String>,
    /// PEM private key for `cert`
    pub key: Option<String>,
    /// PEM CA bundle used to verify the peer; `None` disables verification
    pub ca_cert: Option<String>,
    /// SNI and verification name for client connections
    pub server_name: Option<String>,
    /// Backend-specific cipher suite list
    pub cipher_suites: Option<String>,
    pub psk_identity: Option<String>,
    pub psk_key: Option<Vec<u8>>,
}

impl TlsParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cert(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_ca_cert(mut self, ca: impl Into<String>) -> Self {
        self.ca_cert = Some(ca.into());
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_psk(mut self, identity: impl Into<String>, key: Vec<u8>) -> Self {
        self.psk_identity = Some(identity.into());
        self.psk_key = Some(key);
        self
    }
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// Handshake finished; application data may flow
    Done,
    /// Waiting for more ciphertext from the peer
    WantRead,
    /// Ciphertext is queued in `wire_out` and must be sent first
    WantWrite,
}

/// Ciphertext buffers lent to a session for one call.
///
/// The session consumes from the front of `wire_in` and appends to `wire_out`.
pub struct TlsIo<'a> {
    pub wire_in: &'a mut Mbuf,
    pub wire_out: &'a mut Mbuf,
}

/// One TLS session bound to a connection.
pub trait TlsSession {
    /// Advance the handshake.
    fn handshake(&mut self, io: TlsIo<'_>) -> Result<TlsStatus>;

    /// Decrypt whatever `wire_in` holds into `plain`. Returns plaintext bytes produced.
    fn read(&mut self, io: TlsIo<'_>, plain: &mut Mbuf) -> Result<usize>;

    /// Encrypt `data` into `wire_out`. Returns plaintext bytes consumed.
    fn write(&mut self, io: TlsIo<'_>, data: &[u8]) -> Result<usize>;

    /// Queue a close-notify alert.
    fn close_notify(&mut self, io: TlsIo<'_>);
}

/// Factory for TLS sessions, owned by the manager.
pub trait TlsBackend {
    fn name(&self) -> &str;

    /// One-time library initialization.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Create a client session for an outbound connection.
    fn conn_init(&mut self, params: &TlsParams) -> Result<Box<dyn TlsSession>>;

    /// Create a server session for a connection accepted on a TLS listener.
    fn conn_accept(&mut self, listener: &TlsParams) -> Result<Box<dyn TlsSession>>;
}

/// Session plus its ciphertext buffers, attached to a connection.
pub(crate) struct TlsState {
    pub session: Box<dyn TlsSession>,
    pub wire_in: Mbuf,
    pub wire_out: Mbuf,
}

impl TlsState {
    pub fn new(session: Box<dyn TlsSession>) -> Self {
        Self {
            session,
            wire_in: Mbuf::new(),
            wire_out: Mbuf::new(),
        }
    }

    pub fn handshake(&mut self) -> Result<TlsStatus> {
        self.session.handshake(TlsIo {
            wire_in: &mut self.wire_in,
            wire_out: &mut self.wire_out,
        })
    }

    pub fn read(&mut self, plain: &mut Mbuf) -> Result<usize> {
        self.session.read(
            TlsIo {
                wire_in: &mut self.wire_in,
                wire_out: &mut self.wire_out,
            },
            plain,
        )
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.session.write(
            TlsIo {
                wire_in: &mut self.wire_in,
                wire_out: &mut self.wire_out,
            },
            data,
        )
    }

    pub fn close_notify(&mut self) {
        self.session.close_notify(TlsIo {
            wire_in: &mut self.wire_in,
            wire_out: &mut self.wire_out,
        });
    }
}
