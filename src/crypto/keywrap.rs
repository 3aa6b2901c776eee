//! Passphrase wrapping for project private keys.
//!
//! Projects created with `store_private_key` keep their private key in the
//! database, wrapped with the server passphrase using `age` scrypt so the
//! stored blob is useless without it.

use std::io::{Read, Write};

use age::secrecy::SecretString;
use zeroize::Zeroizing;

use super::engine::PrivateKey;
use crate::error::{ConfidantError, Result};

/// Wrap a private key with a passphrase. Returns the age-encrypted bytes.
pub fn wrap_private_key(key: &PrivateKey, passphrase: SecretString) -> Result<Vec<u8>> {
    let encryptor = age::Encryptor::with_user_passphrase(passphrase);

    let mut wrapped = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut wrapped)
        .map_err(|e| ConfidantError::encryption(format!("failed to wrap key: {}", e)))?;
    writer.write_all(key.as_bytes())?;
    writer.finish()?;

    Ok(wrapped)
}

/// Unwrap a private key previously wrapped with [`wrap_private_key`].
pub fn unwrap_private_key(wrapped: &[u8], passphrase: SecretString) -> Result<PrivateKey> {
    let decryptor = age::Decryptor::new(wrapped)
        .map_err(|e| ConfidantError::decryption(format!("invalid wrapped key: {}", e)))?;

    let identity = age::scrypt::Identity::new(passphrase);
    let mut reader = decryptor
        .decrypt(std::iter::once(&identity as &dyn age::Identity))
        .map_err(|e| ConfidantError::decryption(format!("failed to unwrap key: {}", e)))?;

    let mut bytes = Zeroizing::new(Vec::new());
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| ConfidantError::decryption(e.to_string()))?;

    PrivateKey::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    #[test]
    fn test_wrap_unwrap_with_wrong_passphrase() {
        let keys = generate_keypair();
        let wrapped =
            wrap_private_key(&keys.private, SecretString::from("correct horse".to_string()))
                .unwrap();
        assert!(!wrapped.windows(32).any(|w| w == keys.private.as_bytes()));

        let unwrapped =
            unwrap_private_key(&wrapped, SecretString::from("correct horse".to_string())).unwrap();
        assert_eq!(unwrapped.public_key(), keys.public);

        let err = unwrap_private_key(&wrapped, SecretString::from("battery staple".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfidantError::Decryption(_)));
    }
}
