//! Encryption for PII at rest.
//!
//! Paystack authorization codes and bank account numbers are encrypted
//! before they touch the database and decrypted only at charge / payout
//! time. AES-256-GCM with a random 96-bit nonce prepended to the
//! ciphertext; the whole blob is Base64 encoded for storage in a text
//! column. The key is derived from the configured secret by SHA-256 so
//! operators can supply a passphrase of any length.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Ciphertext is malformed")]
    Malformed,
    #[error("Decryption failed")]
    Decrypt,
}

/// Encrypts and decrypts small PII strings.
#[derive(Clone)]
pub struct PiiCipher {
    key: [u8; 32],
}

impl PiiCipher {
    pub fn new(secret: &Secret<String>) -> Self {
        let key = Sha256::digest(secret.expose_secret().as_bytes()).into();
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let cipher =
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption is infallible for small inputs");
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        STANDARD.encode(blob)
    }

    pub fn decrypt(&self, blob_b64: &str) -> Result<Secret<String>, Error> {
        let blob = STANDARD.decode(blob_b64).map_err(|_| Error::Malformed)?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::Malformed);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher =
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Decrypt)?;
        String::from_utf8(plaintext)
            .map(Secret::new)
            .map_err(|_| Error::Malformed)
    }
}

/// The only form of an account number that may appear in logs or API
/// responses: its last four digits.
pub fn last4(account_number: &str) -> String {
    let len = account_number.chars().count();
    let skip = len.saturating_sub(4);
    let tail: String = account_number.chars().skip(skip).collect();
    format!("****{tail}")
}

#[cfg(test)]
mod test {
    use super::*;

    fn cipher() -> PiiCipher {
        PiiCipher::new(&Secret::new("pii-test-key".to_owned()))
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let auth_code = "AUTH_8dfhjjdt";
        let blob = cipher().encrypt(auth_code);
        assert_ne!(blob, auth_code);
        let plain = cipher().decrypt(&blob).unwrap();
        assert_eq!(plain.expose_secret(), auth_code);
    }

    #[test]
    fn fresh_nonce_every_encryption() {
        let blob1 = cipher().encrypt("0123456789");
        let blob2 = cipher().encrypt("0123456789");
        assert_ne!(blob1, blob2);
    }

    #[test]
    fn wrong_key_fails() {
        let blob = cipher().encrypt("0123456789");
        let other = PiiCipher::new(&Secret::new("other".to_owned()));
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn last4_redaction() {
        assert_eq!(last4("0123456789"), "****6789");
        assert_eq!(last4("89"), "****89");
    }
}
