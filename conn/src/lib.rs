//! Upgrade raw connections into authenticated, encrypted, cancellable channels.
//!
//! A [RawConnection] is any bidirectional byte transport produced by a
//! [commonware_runtime::Network] (a TCP socket, a deterministic in-memory pipe, ...), split into
//! a [commonware_runtime::Sink] and a [commonware_runtime::Stream]. Wrapping one in a
//! [connection::Connection] binds it to a [scope::Scope] and spawns two forwarders (stream to
//! inbound queue, outbound queue to sink) that live exactly as long as the scope. Wrapping that
//! connection in a [secure::SecureConnection] runs a mutual handshake against an
//! [identity::Identities] store and then transparently encrypts everything that crosses it.
//!
//! There is exactly one lifecycle per logical connection: closing a connection, cancelling its
//! scope (or any ancestor of it), or hitting an I/O or integrity failure all resolve the same
//! [scope::Done] signal and tear down both forwarders.
//!
//! # Status
//!
//! `commonware-conn` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use commonware_runtime::{Clock, Metrics, Sink, Spawner, Stream};
use rand::{CryptoRng, Rng};
use std::sync::Arc;
use thiserror::Error;

pub mod connection;
pub mod identity;
pub mod metrics;
pub mod raw;
pub mod scope;
pub mod secure;
mod utils;

pub use connection::Connection;
pub use identity::{Identities, PeerId, Peerstore};
pub use raw::RawConnection;
pub use scope::{Cause, Done, Scope};
pub use secure::SecureConnection;

/// Errors that can occur when interacting with a connection.
#[derive(Error, Debug)]
pub enum Error {
    // Lifecycle errors
    #[error("connection closed")]
    Closed,

    // Transport errors
    #[error("send failed")]
    SendFailed,
    #[error("recv failed")]
    RecvFailed,
    #[error("send zero size")]
    SendZeroSize,
    #[error("send too large: {0} bytes")]
    SendTooLarge(usize),
    #[error("recv too large: {0} bytes")]
    RecvTooLarge(usize),
    #[error("connection failed")]
    ConnectionFailed,
    #[error("bind failed")]
    BindFailed,

    // Authentication errors
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("peer key mismatch: {0}")]
    PeerKeyMismatch(PeerId),
    #[error("wrong peer: {0}")]
    WrongPeer(PeerId),
    #[error("handshake uses our identity")]
    HandshakeUsesOurKey,
    #[error("cannot dial self")]
    DialSelf,
    #[error("invalid signature")]
    InvalidSignature,

    // Handshake errors
    #[error("missing local identity")]
    MissingLocalIdentity,
    #[error("unable to decode: {0}")]
    UnableToDecode(commonware_codec::Error),
    #[error("invalid peer public key")]
    InvalidPeerPublicKey,
    #[error("timestamp too old: {0}")]
    InvalidTimestampOld(u64),
    #[error("timestamp too future: {0}")]
    InvalidTimestampFuture(u64),
    #[error("shared secret was not contributory")]
    SharedSecretNotContributory,
    #[error("HKDF expansion failed")]
    HKDFExpansion,
    #[error("key confirmation failed")]
    ConfirmationFailed,
    #[error("invalid key confirmation")]
    InvalidConfirmation,

    // Integrity errors
    #[error("nonce overflow")]
    NonceOverflow,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

impl Error {
    /// Classify the error into the [Cause] it attaches to a scope when it tears a
    /// connection down.
    pub fn cause(&self) -> Cause {
        match self {
            Error::Closed => Cause::Closed,
            Error::SendFailed
            | Error::RecvFailed
            | Error::SendZeroSize
            | Error::SendTooLarge(_)
            | Error::RecvTooLarge(_)
            | Error::ConnectionFailed
            | Error::BindFailed => Cause::Transport,
            Error::UnknownPeer(_)
            | Error::PeerKeyMismatch(_)
            | Error::WrongPeer(_)
            | Error::HandshakeUsesOurKey
            | Error::DialSelf
            | Error::InvalidSignature => Cause::Authentication,
            Error::MissingLocalIdentity
            | Error::UnableToDecode(_)
            | Error::InvalidPeerPublicKey
            | Error::InvalidTimestampOld(_)
            | Error::InvalidTimestampFuture(_)
            | Error::SharedSecretNotContributory
            | Error::HKDFExpansion
            | Error::ConfirmationFailed
            | Error::InvalidConfirmation => Cause::Handshake,
            Error::NonceOverflow | Error::EncryptionFailed | Error::DecryptionFailed => {
                Cause::Integrity
            }
        }
    }
}

/// Wrap `raw` in a [Connection] bound to a child of `scope` and upgrade it to a
/// [SecureConnection].
///
/// Any handshake failure is returned here, after the underlying connection has been closed.
pub async fn establish_secure<E, Si, St, I>(
    context: E,
    scope: Scope,
    raw: RawConnection<Si, St>,
    identities: Arc<I>,
    config: secure::Config,
) -> Result<SecureConnection, Error>
where
    E: Spawner + Clock + Metrics + Rng + CryptoRng,
    Si: Sink,
    St: Stream,
    I: Identities,
{
    let connection = Connection::wrap(context.clone(), scope, config.connection.clone(), raw);
    SecureConnection::establish(context, config, connection, identities).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_causes() {
        assert_eq!(Error::Closed.cause(), Cause::Closed);
        assert_eq!(Error::RecvFailed.cause(), Cause::Transport);
        assert_eq!(
            Error::UnknownPeer(PeerId::from([7u8; 32])).cause(),
            Cause::Authentication
        );
        assert_eq!(Error::InvalidTimestampOld(0).cause(), Cause::Handshake);
        assert_eq!(Error::DecryptionFailed.cause(), Cause::Integrity);
    }
}
