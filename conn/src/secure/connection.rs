use super::{
    cipher::{self, DirectionalCipher},
    handshake::{Hello, KeyConfirmation},
    nonce, x25519, Config, AUTHENTICATION_TAG_LENGTH,
};
use crate::{Connection, Done, Error, Identities, PeerId, Scope};
use bytes::Bytes;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305};
use commonware_codec::{DecodeExt as _, Encode as _};
use commonware_runtime::Clock;
use commonware_utils::SystemTimeExt as _;
use rand::{CryptoRng, Rng};
use std::{net::SocketAddr, sync::Arc};
use tracing::debug;

/// Concatenate both hellos, smallest first, so both sides compute the same transcript.
///
/// Returns the transcript and whether our hello is the first one.
fn create_handshake_transcript(ours: &[u8], theirs: &[u8]) -> (Vec<u8>, bool) {
    let first = ours < theirs;
    let (a, b) = if first { (ours, theirs) } else { (theirs, ours) };
    let mut transcript = Vec::with_capacity(a.len() + b.len());
    transcript.extend_from_slice(a);
    transcript.extend_from_slice(b);
    (transcript, first)
}

/// Observable state of a [SecureConnection].
///
/// The handshake runs inside [SecureConnection::establish] (or [SecureConnection::dial]), so a
/// returned connection starts out [State::Established]. A failed handshake never produces a
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Application messages are encrypted and exchanged.
    Established,
    /// Terminal: the connection was closed, cancelled, or failed.
    Closed,
}

/// Traffic ciphers and counters for one session.
struct Session {
    send: ChaCha20Poly1305,
    send_nonce: nonce::Info,
    recv: ChaCha20Poly1305,
    recv_nonce: nonce::Info,
}

/// A [Connection] whose peer has been authenticated and whose traffic is encrypted.
pub struct SecureConnection {
    inner: Connection,
    peer: PeerId,
    max_message_size: usize,

    /// Dropped (and zeroized) once the connection is closed.
    session: Option<Session>,
}

impl SecureConnection {
    /// Authenticate the peer on the other side of `inner` and derive session keys.
    ///
    /// Any peer registered in `identities` is accepted. On failure, `inner` is closed with the
    /// failure's [Cause](crate::Cause) and the error is returned.
    ///
    /// `context` supplies the ephemeral key material and the clock hellos are checked against.
    pub async fn establish<E: Clock + Rng + CryptoRng, I: Identities>(
        context: E,
        config: Config,
        inner: Connection,
        identities: Arc<I>,
    ) -> Result<Self, Error> {
        Self::upgrade(context, config, inner, identities.as_ref(), None).await
    }

    /// Like [SecureConnection::establish], but additionally requires the remote side to
    /// authenticate as `peer`.
    pub async fn dial<E: Clock + Rng + CryptoRng, I: Identities>(
        context: E,
        config: Config,
        inner: Connection,
        identities: Arc<I>,
        peer: PeerId,
    ) -> Result<Self, Error> {
        Self::upgrade(context, config, inner, identities.as_ref(), Some(peer)).await
    }

    async fn upgrade<E: Clock + Rng + CryptoRng, I: Identities>(
        mut context: E,
        config: Config,
        mut inner: Connection,
        identities: &I,
        expected: Option<PeerId>,
    ) -> Result<Self, Error> {
        match handshake(&mut context, &config, &mut inner, identities, expected).await {
            Ok((peer, session)) => {
                debug!(%peer, address = %inner.address(), "handshake complete");
                let max_message_size = inner
                    .max_message_size()
                    .saturating_sub(AUTHENTICATION_TAG_LENGTH);
                Ok(Self {
                    inner,
                    peer,
                    max_message_size,
                    session: Some(session),
                })
            }
            Err(err) => {
                debug!(?err, address = %inner.address(), "handshake failed");
                inner.metrics().handshakes_failed.inc();
                inner.shutdown(err.cause()).await;
                Err(err)
            }
        }
    }

    /// The authenticated remote peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Address of the remote endpoint.
    pub fn address(&self) -> SocketAddr {
        self.inner.address()
    }

    /// Maximum size of a message accepted by [SecureConnection::send].
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Current [State] of the connection.
    pub fn state(&self) -> State {
        if self.session.is_none() || self.inner.is_closed() {
            State::Closed
        } else {
            State::Established
        }
    }

    /// The scope bound to the wrapped connection.
    pub fn context(&self) -> Scope {
        self.inner.context()
    }

    /// Resolves once the connection is closed.
    pub fn done(&self) -> Done {
        self.inner.done()
    }

    /// Returns `true` once the connection is closed (or closing).
    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Encrypt `msg` and enqueue it for transmission.
    ///
    /// Same contract as [Connection::send]. A nonce is only consumed once the outbound queue has
    /// capacity, and the ciphertext is enqueued without yielding, so dropping the returned future
    /// before completion never desynchronizes the nonce sequence.
    pub async fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
        if self.session.is_none() || self.inner.is_closed() {
            return Err(Error::Closed);
        }
        if msg.is_empty() {
            return Err(Error::SendZeroSize);
        }
        if msg.len() > self.max_message_size {
            return Err(Error::SendTooLarge(msg.len()));
        }
        if let Err(err) = self.inner.reserve().await {
            self.session = None;
            return Err(err);
        }

        // No await between consuming the nonce and enqueueing the ciphertext
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Closed);
        };
        let sealed = session.send_nonce.next().and_then(|nonce| {
            session
                .send
                .encrypt(&nonce, msg)
                .map_err(|_| Error::EncryptionFailed)
        });
        let sealed = match sealed {
            Ok(sealed) => sealed,
            Err(err) => return Err(self.fail(err).await),
        };
        if let Err(err) = self.inner.enqueue(Bytes::from(sealed)) {
            self.session = None;
            return Err(err);
        }
        Ok(())
    }

    /// Wait for the next inbound message and decrypt it.
    ///
    /// Same contract as [Connection::receive]. A message that fails integrity verification closes
    /// the connection and is reported as [Error::DecryptionFailed].
    pub async fn receive(&mut self) -> Result<Bytes, Error> {
        if self.session.is_none() {
            return Err(Error::Closed);
        }
        let sealed = match self.inner.receive().await {
            Ok(sealed) => sealed,
            Err(err) => {
                self.session = None;
                return Err(err);
            }
        };

        let Some(session) = self.session.as_mut() else {
            return Err(Error::Closed);
        };
        let opened = session.recv_nonce.next().and_then(|nonce| {
            session
                .recv
                .decrypt(&nonce, sealed.as_ref())
                .map_err(|_| Error::DecryptionFailed)
        });
        match opened {
            Ok(msg) => Ok(Bytes::from(msg)),
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Close the connection, drop (and zeroize) the session ciphers, and wait for the forwarders
    /// to exit.
    ///
    /// Closing an already closed connection is a no-op.
    pub async fn close(&mut self) {
        self.session = None;
        self.inner.close().await;
    }

    async fn fail(&mut self, err: Error) -> Error {
        debug!(?err, peer = %self.peer, "closing secure connection");
        self.session = None;
        self.inner.shutdown(err.cause()).await;
        err
    }
}

/// Run both handshake rounds over `inner`, returning the authenticated peer and session ciphers.
async fn handshake<E: Clock + Rng + CryptoRng, I: Identities>(
    context: &mut E,
    config: &Config,
    inner: &mut Connection,
    identities: &I,
    expected: Option<PeerId>,
) -> Result<(PeerId, Session), Error> {
    let local = identities.local().ok_or(Error::MissingLocalIdentity)?;
    if expected == Some(local.id()) {
        return Err(Error::DialSelf);
    }

    // Send our hello (round 1)
    let secret = x25519::new(context);
    let ours = Hello::sign(
        &local,
        &config.namespace,
        x25519::PublicKey::from(&secret),
        context.current().epoch_millis(),
    )
    .encode();
    inner.send(&ours).await?;

    // Verify their hello
    let theirs = inner.receive().await?;
    let hello = Hello::decode(theirs.as_ref()).map_err(Error::UnableToDecode)?;
    hello.verify(
        &local,
        identities,
        &config.namespace,
        config.synchrony_bound,
        config.max_handshake_age,
        context.current(),
    )?;
    let peer = hello.peer();
    if let Some(expected) = expected {
        if peer != expected {
            return Err(Error::WrongPeer(peer));
        }
    }

    // Derive ciphers bound to the transcript
    let shared = x25519::agree(secret, &hello.ephemeral())?;
    let (transcript, first) = create_handshake_transcript(&ours, &theirs);
    let DirectionalCipher {
        f2s,
        s2f,
        f2s_confirmation,
        s2f_confirmation,
    } = cipher::derive_directional(shared.as_bytes(), &config.namespace, &transcript)?;
    let (send, recv, our_confirmation, their_confirmation) = if first {
        (f2s, s2f, f2s_confirmation, s2f_confirmation)
    } else {
        (s2f, f2s, s2f_confirmation, f2s_confirmation)
    };

    // Exchange key confirmations (round 2)
    let confirmation = KeyConfirmation::create(&our_confirmation, &transcript)?;
    inner.send(&confirmation.encode()).await?;
    let msg = inner.receive().await?;
    KeyConfirmation::decode(msg.as_ref())
        .map_err(Error::UnableToDecode)?
        .verify(&their_confirmation, &transcript)?;

    Ok((
        peer,
        Session {
            send,
            send_nonce: nonce::Info::default(),
            recv,
            recv_nonce: nonce::Info::default(),
        },
    ))
}
