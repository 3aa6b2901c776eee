//! Cryptography for confidant.
//!
//! - [`engine`]: per-project keypairs and the envelope scheme that seals secret
//!   values (X25519 + AES-256-GCM, fresh ephemeral key per seal).
//! - [`keywrap`]: passphrase wrapping (age scrypt) for project private keys the
//!   server is allowed to keep.

pub mod engine;
pub mod keywrap;

pub use engine::{
    Envelope, Keypair, PrivateKey, PublicKey, generate_keypair, open, open_value, seal, seal_value,
};
pub use keywrap::{unwrap_private_key, wrap_private_key};
