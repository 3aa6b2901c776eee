//! Envelope encryption for secret values.
//!
//! Every project owns an X25519 keypair. Sealing a value generates a fresh
//! ephemeral keypair, agrees a shared secret with the project's public key,
//! derives an AES-256-GCM key from it and encrypts under a random IV. The GCM
//! tag travels detached as the envelope `mac`, so a wrong key, a flipped bit
//! or a truncated field all surface as [`ConfidantError::Decryption`] and no
//! plaintext is ever returned partially.
//!
//! These functions are pure: no shared state, safe to call from any task.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as DalekPublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{ConfidantError, Result};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const MAC_LEN: usize = 16;

const KDF_DOMAIN: &[u8] = b"confidant/envelope/v1";

// =============================================================================
// Keys
// =============================================================================

/// A project's public key. Hex-encoded when displayed or stored.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            ConfidantError::validation(format!(
                "public key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl FromStr for PublicKey {
    type Err = ConfidantError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ConfidantError::validation(format!("invalid public key hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

/// A project's private key. Zeroized on drop, never printed.
#[derive(Clone)]
pub struct PrivateKey(Zeroizing<[u8; KEY_LEN]>);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            ConfidantError::validation(format!("private key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self(Zeroizing::new(array)))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex encoding of the key, for handing back to the project owner once.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(*self.0))
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.0);
        PublicKey(DalekPublicKey::from(&secret).to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl FromStr for PrivateKey {
    type Err = ConfidantError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim())
                .map_err(|_| ConfidantError::validation("invalid private key hex"))?,
        );
        Self::from_bytes(&bytes)
    }
}

/// A project keypair, generated once at project creation.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

/// Generate a new random keypair.
pub fn generate_keypair() -> Keypair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = DalekPublicKey::from(&secret);
    Keypair {
        public: PublicKey(public.to_bytes()),
        private: PrivateKey(Zeroizing::new(secret.to_bytes())),
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A sealed value. Same structure for every call, different bytes every call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_public_key: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub mac: Vec<u8>,
}

impl Envelope {
    /// Compact JSON form stored in the version history.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored envelope. Anything unparseable is a decryption failure.
    pub fn decode(encoded: &str) -> Result<Self> {
        serde_json::from_str(encoded)
            .map_err(|e| ConfidantError::decryption(format!("malformed envelope: {}", e)))
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn derive_key(
    shared: &[u8; KEY_LEN],
    ephemeral_public: &[u8; KEY_LEN],
    recipient_public: &[u8; KEY_LEN],
) -> Zeroizing<[u8; KEY_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(KDF_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral_public);
    hasher.update(recipient_public);
    Zeroizing::new(hasher.finalize().into())
}

/// Seal `plaintext` so that only the holder of `recipient`'s private key can
/// open it.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Envelope> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = DalekPublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&DalekPublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(ConfidantError::encryption(
            "recipient public key is a low-order point",
        ));
    }

    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), &recipient.0);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| ConfidantError::encryption(e.to_string()))?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(
            Nonce::from_slice(&iv),
            ephemeral_public.as_bytes(),
            &mut buffer,
        )
        .map_err(|_| ConfidantError::encryption("AEAD encryption failed"))?;

    Ok(Envelope {
        iv: iv.to_vec(),
        ephemeral_public_key: ephemeral_public.as_bytes().to_vec(),
        ciphertext: buffer,
        mac: tag.to_vec(),
    })
}

/// Open an envelope with the matching private key.
pub fn open(envelope: &Envelope, private: &PrivateKey) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.iv.len() != IV_LEN
        || envelope.ephemeral_public_key.len() != KEY_LEN
        || envelope.mac.len() != MAC_LEN
    {
        return Err(ConfidantError::decryption("malformed envelope fields"));
    }

    let mut ephemeral_public = [0u8; KEY_LEN];
    ephemeral_public.copy_from_slice(&envelope.ephemeral_public_key);

    let secret = StaticSecret::from(*private.0);
    let recipient_public = DalekPublicKey::from(&secret);
    let shared = secret.diffie_hellman(&DalekPublicKey::from(ephemeral_public));
    if !shared.was_contributory() {
        return Err(ConfidantError::decryption(
            "ephemeral public key is a low-order point",
        ));
    }

    let key = derive_key(
        shared.as_bytes(),
        &ephemeral_public,
        recipient_public.as_bytes(),
    );
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| ConfidantError::decryption(e.to_string()))?;

    let mut buffer = Zeroizing::new(envelope.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.iv),
            &envelope.ephemeral_public_key,
            &mut buffer[..],
            Tag::from_slice(&envelope.mac),
        )
        .map_err(|_| ConfidantError::decryption("MAC verification failed"))?;

    Ok(buffer)
}

/// Seal a string value and return the stored (encoded) form.
pub fn seal_value(value: &str, recipient: &PublicKey) -> Result<String> {
    seal(value.as_bytes(), recipient)?.encode()
}

/// Open a stored (encoded) envelope back into the original string.
pub fn open_value(encoded: &str, private: &PrivateKey) -> Result<String> {
    let envelope = Envelope::decode(encoded)?;
    let plaintext = open(&envelope, private)?;
    String::from_utf8(plaintext.to_vec())
        .map_err(|_| ConfidantError::decryption("sealed value is not valid UTF-8"))
}
