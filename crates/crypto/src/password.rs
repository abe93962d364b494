use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha512;
use subtle::ConstantTimeEq;

const SALT_LENGTH: usize = 16;
const DERIVED_LENGTH: usize = 64;
const ITERATIONS: u32 = 100_000;

/// PBKDF2 output stored alongside the account row, both fields base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRecord {
    pub hash: String,
    pub salt: String,
}

/// Hashes a password with PBKDF2-HMAC-SHA512 under a fresh random salt.
pub fn hash_password(password: &str) -> PasswordRecord {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    let derived = derive(password, &salt);
    PasswordRecord {
        hash: Base64.encode(derived),
        salt: Base64.encode(salt),
    }
}

/// Verifies a password against a stored record in constant time.
pub fn verify_password(password: &str, record: &PasswordRecord) -> bool {
    let salt = match Base64.decode(&record.salt) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let expected = match Base64.decode(&record.hash) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let derived = derive(password, &salt);
    derived.ct_eq(expected.as_slice()).into()
}

fn derive(password: &str, salt: &[u8]) -> [u8; DERIVED_LENGTH] {
    let mut output = [0u8; DERIVED_LENGTH];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, ITERATIONS, &mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_original_password() {
        let record = hash_password("contrasena-segura");
        assert!(verify_password("contrasena-segura", &record));
    }

    #[test]
    fn rejects_wrong_password() {
        let record = hash_password("contrasena-segura");
        assert!(!verify_password("contrasena-insegura", &record));
    }

    #[test]
    fn salts_differ_between_calls() {
        let first = hash_password("igual");
        let second = hash_password("igual");
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn rejects_mangled_record() {
        let mut record = hash_password("contrasena-segura");
        record.salt = "%%no-es-base64%%".to_string();
        assert!(!verify_password("contrasena-segura", &record));
    }
}
