use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod password;

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;

pub const MIN_SECRET_LENGTH: usize = 32;
const FALLBACK_SECRET: &str = "clave-default-cambiar-en-produccion";

#[derive(Debug)]
pub enum CryptoError {
    InvalidKey,
    Encrypt,
    Integrity,
    Encoding,
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "invalid key material"),
            Self::Encrypt => write!(f, "encryption failure"),
            Self::Integrity => write!(f, "authentication tag mismatch"),
            Self::Encoding => write!(f, "decrypted payload is not valid utf-8"),
        }
    }
}

impl Error for CryptoError {}

/// Process-wide symmetric key shared by every envelope in the room.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LENGTH]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

/// Derives the room key from the configured secret.
///
/// Secrets shorter than 32 characters are ignored in favour of the fixed
/// fallback string, so misconfigured deployments stay mutually readable.
pub fn derive_key(secret: Option<&str>) -> EncryptionKey {
    let material = match secret {
        Some(value) if value.len() >= MIN_SECRET_LENGTH => value,
        _ => FALLBACK_SECRET,
    };
    let digest = Sha256::digest(material.as_bytes());
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&digest);
    EncryptionKey(key)
}

/// AEAD envelope with the authentication tag carried separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub nonce: [u8; NONCE_LENGTH],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LENGTH],
}

/// Seals a plaintext message under a fresh random nonce.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<SealedMessage, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut sealed = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;
    if sealed.len() < TAG_LENGTH {
        return Err(CryptoError::Encrypt);
    }
    let tag_bytes = sealed.split_off(sealed.len() - TAG_LENGTH);
    let mut tag = [0u8; TAG_LENGTH];
    tag.copy_from_slice(&tag_bytes);
    let mut nonce_out = [0u8; NONCE_LENGTH];
    nonce_out.copy_from_slice(&nonce[..]);
    Ok(SealedMessage {
        nonce: nonce_out,
        ciphertext: sealed,
        tag,
    })
}

/// Opens a sealed message, verifying nonce, ciphertext and tag together.
pub fn decrypt(sealed: &SealedMessage, key: &EncryptionKey) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
    let mut joined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LENGTH);
    joined.extend_from_slice(&sealed.ciphertext);
    joined.extend_from_slice(&sealed.tag);
    let nonce = Nonce::from_slice(&sealed.nonce);
    let clear = cipher
        .decrypt(nonce, joined.as_ref())
        .map_err(|_| CryptoError::Integrity)?;
    String::from_utf8(clear).map_err(|_| CryptoError::Encoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_key() -> EncryptionKey {
        derive_key(Some("una-clave-larga-para-pruebas-unitarias-123456"))
    }

    #[test]
    fn seal_roundtrip() {
        let key = room_key();
        let sealed = encrypt("hola mundo cifrado", &key).unwrap();
        assert_eq!(sealed.nonce.len(), NONCE_LENGTH);
        assert_eq!(sealed.tag.len(), TAG_LENGTH);
        let clear = decrypt(&sealed, &key).unwrap();
        assert_eq!(clear, "hola mundo cifrado");
    }

    #[test]
    fn rejects_wrong_key() {
        let sealed = encrypt("mensaje", &room_key()).unwrap();
        let other = derive_key(Some("otra-clave-igual-de-larga-pero-distinta-9876"));
        assert!(matches!(
            decrypt(&sealed, &other),
            Err(CryptoError::Integrity)
        ));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = room_key();
        let mut sealed = encrypt("mensaje", &key).unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(matches!(decrypt(&sealed, &key), Err(CryptoError::Integrity)));
    }

    #[test]
    fn rejects_tampered_tag() {
        let key = room_key();
        let mut sealed = encrypt("mensaje", &key).unwrap();
        sealed.tag[TAG_LENGTH - 1] ^= 0x80;
        assert!(matches!(decrypt(&sealed, &key), Err(CryptoError::Integrity)));
    }

    #[test]
    fn rejects_tampered_nonce() {
        let key = room_key();
        let mut sealed = encrypt("mensaje", &key).unwrap();
        sealed.nonce[0] ^= 0xff;
        assert!(matches!(decrypt(&sealed, &key), Err(CryptoError::Integrity)));
    }

    #[test]
    fn nonces_are_unique() {
        let key = room_key();
        let first = encrypt("repetido", &key).unwrap();
        let second = encrypt("repetido", &key).unwrap();
        assert_ne!(first.nonce, second.nonce);
    }

    #[test]
    fn short_secret_falls_back() {
        assert!(derive_key(Some("corta")) == derive_key(None));
        assert!(room_key() != derive_key(None));
    }
}
