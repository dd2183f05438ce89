//! Messages exchanged while establishing a [SecureConnection](super::SecureConnection).

use super::{x25519, AUTHENTICATION_TAG_LENGTH};
use crate::{
    identity::{Identity, PublicKey, PEER_ID_LENGTH, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH},
    Error, Identities, PeerId,
};
use bytes::{Buf, BufMut};
use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Nonce,
};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt as _, Write};
use commonware_utils::{union_unique, SystemTimeExt as _};
use std::time::{Duration, SystemTime};

/// Construct the signed payload, prefixed with the namespace so signatures cannot be replayed
/// across applications.
fn payload(
    namespace: &[u8],
    peer: &PeerId,
    ephemeral: &x25519::PublicKey,
    timestamp: u64,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(PEER_ID_LENGTH + x25519::PUBLIC_KEY_LENGTH + u64::SIZE);
    msg.put_slice(peer.as_ref());
    msg.put_slice(ephemeral.as_bytes());
    msg.put_u64(timestamp);
    union_unique(namespace, &msg)
}

/// First handshake message: a signed claim of identity carrying ephemeral key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    peer: PeerId,
    public_key: PublicKey,
    ephemeral: x25519::PublicKey,
    timestamp: u64,
    signature: [u8; SIGNATURE_LENGTH],
}

impl Hello {
    /// Claim `identity` and sign over `ephemeral` and `timestamp` (milliseconds since the unix
    /// epoch).
    pub fn sign(
        identity: &Identity,
        namespace: &[u8],
        ephemeral: x25519::PublicKey,
        timestamp: u64,
    ) -> Self {
        let peer = identity.id();
        let signature = identity.sign(&payload(namespace, &peer, &ephemeral, timestamp));
        Self {
            peer,
            public_key: identity.public_key(),
            ephemeral,
            timestamp,
            signature,
        }
    }

    /// The identity claimed by the sender.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The sender's static public key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// The sender's ephemeral public key.
    pub fn ephemeral(&self) -> x25519::PublicKey {
        self.ephemeral
    }

    /// When the hello was created (milliseconds since the unix epoch).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Verify a hello received from the remote side at `now`.
    ///
    /// Checks, in order, that the hello is fresh, that it is signed by the key it carries, that it
    /// does not claim our own identity, and that the key is the one `identities` has registered for
    /// the claimed peer.
    pub fn verify<I: Identities + ?Sized>(
        &self,
        local: &Identity,
        identities: &I,
        namespace: &[u8],
        synchrony_bound: Duration,
        max_handshake_age: Duration,
        now: SystemTime,
    ) -> Result<(), Error> {
        // Verify that the timestamp in the hello is recent
        //
        // This prevents an adversary from replaying a recorded hello (for example, after
        // compromising the ephemeral key that accompanied it).
        let current = now.epoch();
        let timestamp = Duration::from_millis(self.timestamp);
        if timestamp + max_handshake_age < current {
            return Err(Error::InvalidTimestampOld(self.timestamp));
        }
        if timestamp > current + synchrony_bound {
            return Err(Error::InvalidTimestampFuture(self.timestamp));
        }

        // Verify the signature
        if !self.public_key.is_valid() {
            return Err(Error::InvalidPeerPublicKey);
        }
        let payload = payload(namespace, &self.peer, &self.ephemeral, self.timestamp);
        if !self.public_key.verify(&payload, &self.signature) {
            return Err(Error::InvalidSignature);
        }

        // Reject our own hello reflected back at us
        if self.peer == local.id() || self.public_key == local.public_key() {
            return Err(Error::HandshakeUsesOurKey);
        }

        // Verify that the claimed peer owns the key
        match identities.lookup(&self.peer) {
            None => Err(Error::UnknownPeer(self.peer)),
            Some(registered) if registered != self.public_key => {
                Err(Error::PeerKeyMismatch(self.peer))
            }
            Some(_) => Ok(()),
        }
    }
}

impl Write for Hello {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.peer.as_ref());
        buf.put_slice(self.public_key.as_ref());
        buf.put_slice(self.ephemeral.as_bytes());
        self.timestamp.write(buf);
        self.signature.write(buf);
    }
}

impl Read for Hello {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let peer = <[u8; PEER_ID_LENGTH]>::read(buf)?;
        let public_key = <[u8; PUBLIC_KEY_LENGTH]>::read(buf)?;
        let ephemeral = <[u8; x25519::PUBLIC_KEY_LENGTH]>::read(buf)?;
        let timestamp = u64::read(buf)?;
        let signature = <[u8; SIGNATURE_LENGTH]>::read(buf)?;
        Ok(Self {
            peer: PeerId::from(peer),
            public_key: PublicKey::from(public_key),
            ephemeral: x25519::PublicKey::from(ephemeral),
            timestamp,
            signature,
        })
    }
}

impl FixedSize for Hello {
    const SIZE: usize = PEER_ID_LENGTH
        + PUBLIC_KEY_LENGTH
        + x25519::PUBLIC_KEY_LENGTH
        + u64::SIZE
        + SIGNATURE_LENGTH;
}

/// Second handshake message: proves the sender derived the same keys.
///
/// The confirmation is the authentication tag of an empty message sealed under the sender's
/// confirmation key, with the handshake transcript as associated data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyConfirmation {
    tag: [u8; AUTHENTICATION_TAG_LENGTH],
}

impl KeyConfirmation {
    pub(super) fn create(cipher: &ChaCha20Poly1305, transcript: &[u8]) -> Result<Self, Error> {
        let sealed = cipher
            .encrypt(
                &Nonce::default(),
                Payload {
                    msg: &[],
                    aad: transcript,
                },
            )
            .map_err(|_| Error::ConfirmationFailed)?;
        let tag = sealed
            .as_slice()
            .try_into()
            .map_err(|_| Error::ConfirmationFailed)?;
        Ok(Self { tag })
    }

    pub(super) fn verify(&self, cipher: &ChaCha20Poly1305, transcript: &[u8]) -> Result<(), Error> {
        cipher
            .decrypt(
                &Nonce::default(),
                Payload {
                    msg: &self.tag,
                    aad: transcript,
                },
            )
            .map_err(|_| Error::InvalidConfirmation)?;
        Ok(())
    }
}

impl Write for KeyConfirmation {
    fn write(&self, buf: &mut impl BufMut) {
        self.tag.write(buf);
    }
}

impl Read for KeyConfirmation {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let tag = <[u8; AUTHENTICATION_TAG_LENGTH]>::read(buf)?;
        Ok(Self { tag })
    }
}

impl FixedSize for KeyConfirmation {
    const SIZE: usize = AUTHENTICATION_TAG_LENGTH;
}
