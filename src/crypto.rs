// Optional authenticated encryption for collection payloads (spec §6.3
// `password` option). Gated entirely by `Config::password`; when absent,
// callers never touch this module. A key is derived with HKDF-SHA256 from
// the password and a per-database salt; each payload is sealed with
// AES-256-GCM under a fresh random nonce, so reusing the same key across
// many documents never reuses a nonce.

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{DbError, Result};

const NONCE_LEN: usize = 12;

pub struct PagePayloadCipher {
    cipher: Aes256Gcm,
}

impl PagePayloadCipher {
    pub fn derive(password: &str, salt: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(b"tinydb-page-payload-v1", &mut key)
            .expect("32-byte output is always valid for HKDF-SHA256");
        let cipher = Aes256Gcm::new_from_slice(&key).expect("derived key is exactly 32 bytes");
        Self { cipher }
    }

    /// Seals `plaintext`, binding it to `aad` (typically the owning
    /// collection's name, so ciphertext cannot be silently moved between
    /// collections). Returns `nonce || ciphertext || tag`.
    pub fn encrypt(&self, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .expect("encryption under a freshly derived key cannot fail");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn decrypt(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(DbError::Corruption("encrypted payload shorter than a nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| DbError::Corruption("payload decryption failed: wrong password or corrupted data".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_matching_password_and_salt() {
        let cipher = PagePayloadCipher::derive("hunter2", b"fixed-salt-bytes");
        let sealed = cipher.encrypt(b"users", b"hello world");
        let opened = cipher.decrypt(b"users", &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn wrong_password_fails_to_decrypt() {
        let sealed = PagePayloadCipher::derive("right", b"salt").encrypt(b"users", b"secret");
        let err = PagePayloadCipher::derive("wrong", b"salt").decrypt(b"users", &sealed).unwrap_err();
        assert!(matches!(err, DbError::Corruption(_)));
    }

    #[test]
    fn mismatched_aad_fails_to_decrypt() {
        let cipher = PagePayloadCipher::derive("pw", b"salt");
        let sealed = cipher.encrypt(b"users", b"secret");
        assert!(cipher.decrypt(b"orders", &sealed).is_err());
    }
}
