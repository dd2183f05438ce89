//! Peer identities and the store the handshake consults to authenticate them.
//!
//! A peer is named by a [PeerId] and proves that it owns the name by signing with the ed25519
//! key registered for it. [Identities] is the read-only view the handshake needs; [Peerstore] is
//! an in-memory implementation that tolerates any number of concurrent lookups.

use commonware_utils::hex;
use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use zeroize::{Zeroize, Zeroizing};

/// Length of a [PeerId] (in bytes).
pub const PEER_ID_LENGTH: usize = 32;

/// Length of a [PublicKey] (in bytes).
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of a signature (in bytes).
pub const SIGNATURE_LENGTH: usize = 64;

/// Identifier of a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

impl PeerId {
    /// Derive an identifier from a public key (`sha256(public_key)`).
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(Sha256::digest(public_key.as_ref()).into())
    }
}

impl From<[u8; PEER_ID_LENGTH]> for PeerId {
    fn from(value: [u8; PEER_ID_LENGTH]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// An ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Returns `true` if the key is a valid ed25519 point.
    pub fn is_valid(&self) -> bool {
        VerificationKey::try_from(self.0).is_ok()
    }

    /// Verify that `signature` was produced over `msg` by the owner of this key.
    pub fn verify(&self, msg: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> bool {
        let Ok(key) = VerificationKey::try_from(self.0) else {
            return false;
        };
        key.verify(&Signature::from(*signature), msg).is_ok()
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    fn from(value: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

/// The local peer's identifier and signing key.
///
/// The signing seed is zeroized when the [Identity] is dropped.
#[derive(Clone)]
pub struct Identity {
    id: PeerId,
    public_key: PublicKey,
    seed: Zeroizing<[u8; 32]>,
}

impl Identity {
    /// Create an identity named `id` that signs with the ed25519 key derived from `seed`.
    pub fn new(id: PeerId, seed: [u8; 32]) -> Self {
        let public_key = PublicKey(SigningKey::from(seed).verification_key().to_bytes());
        Self {
            id,
            public_key,
            seed: Zeroizing::new(seed),
        }
    }

    /// Create an identity from `seed`, named after its public key.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let public_key = PublicKey(SigningKey::from(seed).verification_key().to_bytes());
        Self {
            id: PeerId::from_public_key(&public_key),
            public_key,
            seed: Zeroizing::new(seed),
        }
    }

    /// Generate a new random identity, named after its public key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        let identity = Self::from_seed(seed);
        seed.zeroize();
        identity
    }

    /// The identifier this identity claims.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The public key peers must have registered for [Identity::id].
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Sign `msg`.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        SigningKey::from(*self.seed).sign(msg).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Read-only view of the peer registry consulted during handshakes.
///
/// Implementations must tolerate concurrent lookups from any number of handshakes.
pub trait Identities: Send + Sync + 'static {
    /// The public key registered for `peer`, if any.
    fn lookup(&self, peer: &PeerId) -> Option<PublicKey>;

    /// The identity this side presents during handshakes.
    fn local(&self) -> Option<Identity>;
}

/// An in-memory [Identities] implementation.
#[derive(Default)]
pub struct Peerstore {
    peers: RwLock<HashMap<PeerId, PublicKey>>,
    local: RwLock<Option<Identity>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Peerstore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store presenting `identity` to peers.
    pub fn with_local(identity: Identity) -> Self {
        let store = Self::default();
        store.register_local(identity);
        store
    }

    /// Register `public_key` for `peer`, returning the key it replaces (if any).
    pub fn register(&self, peer: PeerId, public_key: PublicKey) -> Option<PublicKey> {
        write(&self.peers).insert(peer, public_key)
    }

    /// Forget `peer`.
    pub fn remove(&self, peer: &PeerId) -> Option<PublicKey> {
        write(&self.peers).remove(peer)
    }

    /// Set the identity this side presents during handshakes.
    pub fn register_local(&self, identity: Identity) {
        *write(&self.local) = Some(identity);
    }
}

impl Identities for Peerstore {
    fn lookup(&self, peer: &PeerId) -> Option<PublicKey> {
        read(&self.peers).get(peer).copied()
    }

    fn local(&self) -> Option<Identity> {
        read(&self.local).clone()
    }
}
