use crate::Error;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, KeySizeUser};
use hkdf::{hmac::digest::typenum::Unsigned, Hkdf};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// The size of the key used by the ChaCha20Poly1305 cipher.
const CHACHA_KEY_SIZE: usize = <ChaCha20Poly1305 as KeySizeUser>::KeySize::USIZE;

/// A constant prefix used for the salt hash in the HKDF key derivation.
/// This prevents key derivation collisions with other applications.
const BASE_KDF_PREFIX: &[u8] = b"commonware-conn/KDF/v1/";

// Infos for directional keys ("first" is the side whose hello sorts first in the transcript).
const TRAFFIC_INFO_F2S: &[u8] = b"f2s/traffic";
const TRAFFIC_INFO_S2F: &[u8] = b"s2f/traffic";
const CONFIRMATION_INFO_F2S: &[u8] = b"f2s/confirmation";
const CONFIRMATION_INFO_S2F: &[u8] = b"s2f/confirmation";

/// All ciphers needed for a bidirectional session.
///
/// Each cipher zeroizes its key when dropped.
pub struct DirectionalCipher {
    /// Protects traffic from the first party to the second.
    pub f2s: ChaCha20Poly1305,
    /// Protects traffic from the second party to the first.
    pub s2f: ChaCha20Poly1305,
    /// Used by the first party to confirm the handshake.
    pub f2s_confirmation: ChaCha20Poly1305,
    /// Used by the second party to confirm the handshake.
    pub s2f_confirmation: ChaCha20Poly1305,
}

/// Derive directional ciphers from the shared secret, the application namespace, and the
/// handshake transcript.
pub fn derive_directional(
    ikm: &[u8],
    namespace: &[u8],
    transcript: &[u8],
) -> Result<DirectionalCipher, Error> {
    let infos = [
        TRAFFIC_INFO_F2S,
        TRAFFIC_INFO_S2F,
        CONFIRMATION_INFO_F2S,
        CONFIRMATION_INFO_S2F,
    ];
    let [f2s, s2f, f2s_confirmation, s2f_confirmation] =
        derive::<4>(ikm, &[namespace, transcript], &infos)?;
    Ok(DirectionalCipher {
        f2s,
        s2f,
        f2s_confirmation,
        s2f_confirmation,
    })
}

/// HKDF-SHA256 over `ikm`, salted with the hash of the prefix and every salt (in order), expanded
/// once per info into a ChaCha20Poly1305 key.
pub fn derive<const N: usize>(
    ikm: &[u8],
    salts: &[&[u8]],
    infos: &[&[u8]; N],
) -> Result<[ChaCha20Poly1305; N], Error> {
    let mut hasher = Sha256::new();
    hasher.update(BASE_KDF_PREFIX);
    for salt in salts {
        hasher.update(salt);
    }
    let mut salt: [u8; 32] = hasher.finalize().into();

    // HKDF-Extract
    let prk = Hkdf::<Sha256>::new(Some(&salt), ikm);
    salt.zeroize();

    // HKDF-Expand
    let mut ciphers = Vec::with_capacity(N);
    let mut key = [0u8; CHACHA_KEY_SIZE];
    for info in infos {
        let expanded = prk.expand(info, &mut key);
        if expanded.is_err() {
            key.zeroize();
            return Err(Error::HKDFExpansion);
        }
        ciphers.push(ChaCha20Poly1305::new(Key::from_slice(&key)));
    }
    key.zeroize();
    ciphers.try_into().map_err(|_| Error::HKDFExpansion)
}
