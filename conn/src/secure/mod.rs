//! Authenticate a peer and encrypt everything exchanged with it over a [Connection](crate::Connection).
//!
//! Peers already know one another's identities (an [Identities](crate::Identities) store maps each
//! [PeerId](crate::PeerId) to an ed25519 public key). The handshake is symmetric: neither side needs
//! to know whether it dialed or accepted the underlying transport.
//!
//! # Design
//!
//! ## Handshake
//!
//! Both sides run the same two rounds over the wrapped connection:
//!
//! 1. Each side sends a [handshake::Hello] containing:
//!    - the identity it claims (a [PeerId](crate::PeerId)),
//!    - its static ed25519 public key,
//!    - a fresh ephemeral X25519 public key,
//!    - the current timestamp (prevents replay attacks),
//!    - a signature over all of the above (and the namespace) by the static key.
//!
//!    Each side verifies the remote hello: the timestamp must be recent, the signature must be
//!    valid, the claimed identity must not be our own, and the static key must be the one the
//!    [Identities](crate::Identities) store has registered for the claimed identity.
//!
//! 2. Each side sends a [handshake::KeyConfirmation] proving that it derived the same keys.
//!
//! The hellos are ordered lexicographically to form the handshake transcript. The side whose hello
//! sorts first is the "first" party when assigning directional keys, so both sides agree on which
//! key protects which direction without any dialer/listener roles.
//!
//! ## Encryption
//!
//! All traffic is encrypted using ChaCha20-Poly1305. A shared secret is established using an
//! ephemeral X25519 Diffie-Hellman key exchange (and rejected if it is not contributory). This
//! secret and the handshake transcript are fed to HKDF-SHA256 to derive two traffic keys (one per
//! direction) and two key confirmation keys. Binding the derived keys to the transcript prevents
//! man-in-the-middle and transcript substitution attacks.
//!
//! Each direction uses a 12-byte nonce derived from a counter incremented for each message, so no
//! nonce is ever transmitted. On counter overflow the connection is closed.
//!
//! # Security
//!
//! ## Requirements
//!
//! - **Pre-Shared Namespace**: Peers must agree on a unique, application-specific namespace
//!   out-of-band to prevent cross-application replay attacks.
//! - **Time Synchronization**: Peer clocks must be synchronized to within the `synchrony_bound`
//!   to correctly validate timestamps.
//!
//! ## Provided
//!
//! - **Mutual Authentication**: Both parties prove ownership of their static private keys through
//!   signatures.
//! - **Forward Secrecy**: Ephemeral encryption keys ensure that any compromise of long-term static
//!   keys doesn't expose the contents of previous sessions.
//! - **Tamper Evidence**: Any modified, dropped, or reordered message fails decryption and closes
//!   the connection.
//!
//! ## Not Provided
//!
//! - **Anonymity**: Peer identities are visible to network observers during handshakes.
//! - **Padding**: Messages are encrypted as-is, allowing an attacker to perform traffic analysis.
//! - **Handshake Timeout**: Abandoned handshakes are only stopped by cancelling the connection's
//!   scope (or one of its ancestors).

use chacha20poly1305::{
    aead::{generic_array::typenum::Unsigned, AeadCore},
    ChaCha20Poly1305,
};
use std::time::Duration;

mod cipher;
mod connection;
pub mod handshake;
mod nonce;
pub mod x25519;

pub use connection::{SecureConnection, State};

// When encrypting data, an authentication tag is appended to the ciphertext.
// This constant represents the size of the authentication tag in bytes.
pub const AUTHENTICATION_TAG_LENGTH: usize = <ChaCha20Poly1305 as AeadCore>::TagSize::USIZE;

/// Configuration for a [SecureConnection].
///
/// # Warning
///
/// Synchronize `namespace`, `synchrony_bound`, and `max_handshake_age` across all peers.
/// Mismatched configurations cause handshakes to fail.
#[derive(Clone)]
pub struct Config {
    /// Configuration of the wrapped connection (used by [crate::establish_secure]).
    pub connection: crate::connection::Config,

    /// Unique prefix for all signed messages. Should be application-specific.
    /// Prevents replay attacks across different applications using the same keys.
    pub namespace: Vec<u8>,

    /// Maximum time drift allowed for future timestamps. Handles clock skew.
    pub synchrony_bound: Duration,

    /// Maximum age of handshake messages before rejection.
    pub max_handshake_age: Duration,
}

impl Config {
    /// Create a configuration for `namespace` with default bounds.
    pub fn new(namespace: &[u8]) -> Self {
        Self {
            connection: crate::connection::Config::default(),
            namespace: namespace.to_vec(),
            synchrony_bound: Duration::from_secs(5),
            max_handshake_age: Duration::from_secs(10),
        }
    }

    /// See [Config]
    pub fn with_connection(mut self, connection: crate::connection::Config) -> Self {
        self.connection = connection;
        self
    }
    /// See [Config]
    pub fn with_synchrony_bound(mut self, synchrony_bound: Duration) -> Self {
        self.synchrony_bound = synchrony_bound;
        self
    }
    /// See [Config]
    pub fn with_max_handshake_age(mut self, max_handshake_age: Duration) -> Self {
        self.max_handshake_age = max_handshake_age;
        self
    }
}
