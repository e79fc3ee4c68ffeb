//! Curve25519 authenticated-box envelope used by the room engine.
//!
//! NaCl's `crypto_box` combines X25519 key agreement with a stream cipher and
//! Poly1305 authentication. We realize the same construction with
//! XChaCha20-Poly1305 (its 24-byte nonce matches the wire contract exactly)
//! keyed by HKDF-SHA256 over the X25519 shared secret, the way the teacher's
//! `sealed_sender` module derives its AEAD key from an ECDH output.
//!
//! Only the room ever calls `seal`/`open` — peer-to-peer envelopes are
//! forwarded verbatim and never touch this module.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{aead::Aead, KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::schema::SealedMsg;

pub const NONCE_LEN: usize = 24;
pub const PUBKEY_LEN: usize = 32;
const HKDF_INFO: &[u8] = b"ghostroom:box:v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("random number generator failure")]
    Rng,
    #[error("malformed base64 encoding")]
    BadEncoding,
    #[error("public key must be exactly 32 bytes")]
    BadKeyLength,
    #[error("authentication failed")]
    AuthFailed,
}

/// A room's curve25519 keypair. The secret half never leaves this struct and
/// is never serialized.
pub struct RoomKeyPair {
    secret: StaticSecret,
    public: PublicKey,
    spub: String,
}

impl std::fmt::Debug for RoomKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKeyPair")
            .field("spub", &self.spub)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl RoomKeyPair {
    /// Generate a fresh keypair from the OS RNG. A RNG failure here is
    /// treated as fatal to the process by the caller (see `Room::spawn`) —
    /// continuing without real randomness would risk nonce reuse.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        OsRng.try_fill_bytes(&mut seed).map_err(|_| CryptoError::Rng)?;
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        let spub = STANDARD.encode(public.as_bytes());
        Ok(Self {
            secret,
            public,
            spub,
        })
    }

    pub fn spub(&self) -> &str {
        &self.spub
    }

    pub fn public_bytes(&self) -> [u8; PUBKEY_LEN] {
        *self.public.as_bytes()
    }
}

/// Decode a base64 `spub` into its raw 32-byte form.
pub fn decode_pubkey(b64: &str) -> Result<[u8; PUBKEY_LEN], CryptoError> {
    let bytes = STANDARD.decode(b64).map_err(|_| CryptoError::BadEncoding)?;
    bytes.try_into().map_err(|_| CryptoError::BadKeyLength)
}

pub fn encode_pubkey(bytes: &[u8; PUBKEY_LEN]) -> String {
    STANDARD.encode(bytes)
}

/// Seal `plaintext` so only the holder of `to_pub`'s matching secret key can
/// open it. `from` in the resulting envelope is always this room's own spub.
pub fn seal(
    room: &RoomKeyPair,
    to_pub: &[u8; PUBKEY_LEN],
    plaintext: &[u8],
) -> Result<SealedMsg, CryptoError> {
    let to_public = PublicKey::from(*to_pub);
    let shared = room.secret.diffie_hellman(&to_public);
    let key = derive_box_key(shared.as_bytes());
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::AuthFailed)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|_| CryptoError::Rng)?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::AuthFailed)?;

    Ok(SealedMsg {
        from: room.spub.clone(),
        to: STANDARD.encode(to_pub),
        nonce: STANDARD.encode(nonce_bytes),
        data: STANDARD.encode(ciphertext),
    })
}

/// Open a server-addressed envelope. Returns `Err` on any decode or
/// authentication failure — callers must drop the frame silently rather than
/// distinguishing the failure reason to the remote peer (see spec §7).
pub fn open(room: &RoomKeyPair, msg: &SealedMsg) -> Result<Vec<u8>, CryptoError> {
    let from_bytes = decode_pubkey(&msg.from)?;
    let nonce_bytes = STANDARD
        .decode(&msg.nonce)
        .map_err(|_| CryptoError::BadEncoding)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::BadEncoding);
    }
    let ciphertext = STANDARD
        .decode(&msg.data)
        .map_err(|_| CryptoError::BadEncoding)?;

    let from_public = PublicKey::from(from_bytes);
    let shared = room.secret.diffie_hellman(&from_public);
    let key = derive_box_key(shared.as_bytes());
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::AuthFailed)?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| CryptoError::AuthFailed)
}

fn derive_box_key(shared: &[u8; PUBKEY_LEN]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .expect("HKDF output length is valid");
    key
}
