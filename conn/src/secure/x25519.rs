//! Ephemeral X25519 keys used to agree on a shared secret during the handshake.

use crate::Error;
use rand::{CryptoRng, RngCore};
pub use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

/// Length of an encoded [PublicKey] (in bytes).
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Generate a new ephemeral secret.
pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> EphemeralSecret {
    EphemeralSecret::random_from_rng(rng)
}

/// Complete the exchange with `peer`, rejecting secrets `peer` could have forced.
pub fn agree(secret: EphemeralSecret, peer: &PublicKey) -> Result<SharedSecret, Error> {
    let shared = secret.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(Error::SharedSecretNotContributory);
    }
    Ok(shared)
}
