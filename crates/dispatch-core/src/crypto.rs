// Dispatch core — Safety Layer encryption-at-rest.
//
// AES-256-GCM authenticated encryption. The master key is derived via
// PBKDF2-HMAC-SHA256 from machine-specific identifiers plus a per-install
// salt file generated on first use. Every stored value additionally gets
// its own random salt (used to derive a per-value subkey via HKDF) and its
// own random nonce, so no two ciphertexts for the same plaintext collide.
//
// Envelope (ASCII, single line): `ENC:v1:<b64(salt)>:<b64(nonce)>:<b64(ciphertext)>`.
// A value not starting with `ENC:v1:` is plaintext and is returned unchanged
// by `decrypt` — this is the pre-encryption migration path.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult};

const ENVELOPE_PREFIX: &str = "ENC:v1:";
const SALT_FILE_LEN: usize = 16;
const PBKDF2_ROUNDS: u32 = 100_000;
const PER_VALUE_SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Master symmetric key, held only in zeroizing memory.
pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    /// Derive the master key for this install.
    ///
    /// Honors the `ENC_MASTER_KEY` environment-variable override (base64,
    /// 32 bytes) before falling back to PBKDF2 over the machine identifier
    /// and the install's salt file (created at `salt_path` if absent).
    pub fn load_or_create(salt_path: &Path) -> EngineResult<Self> {
        if let Ok(b64) = std::env::var("ENC_MASTER_KEY") {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64.trim())
                .map_err(|e| EngineError::Crypto(format!("invalid ENC_MASTER_KEY: {e}")))?;
            if bytes.len() != 32 {
                return Err(EngineError::Crypto("ENC_MASTER_KEY must decode to 32 bytes".into()));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(MasterKey(Zeroizing::new(key)));
        }

        let salt = load_or_create_salt_file(salt_path)?;
        let machine_id = machine_identifier();

        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(machine_id.as_bytes(), &salt, PBKDF2_ROUNDS, &mut key);
        Ok(MasterKey(Zeroizing::new(key)))
    }

    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MasterKey(Zeroizing::new(bytes))
    }
}

/// A best-effort, stable-enough machine identifier. Not a security boundary
/// by itself — the per-install salt file is what makes the derived key
/// unguessable without filesystem access to this machine.
fn machine_identifier() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".into());
    let home = dirs::home_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    format!("{host}:{home}")
}

fn load_or_create_salt_file(path: &Path) -> EngineResult<Vec<u8>> {
    if let Ok(existing) = std::fs::read(path) {
        if existing.len() == SALT_FILE_LEN {
            return Ok(existing);
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut salt = vec![0u8; SALT_FILE_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
    std::fs::write(path, &salt)?;
    Ok(salt)
}

/// Encrypt `plaintext`, returning a self-describing `ENC:v1:...` envelope.
pub fn encrypt(plaintext: &str, master: &MasterKey) -> EngineResult<String> {
    let mut salt = [0u8; PER_VALUE_SALT_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_bytes);

    let subkey = derive_subkey(master, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&subkey)
        .map_err(|e| EngineError::Crypto(format!("bad key length: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| EngineError::Crypto("encryption failed".into()))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(format!(
        "{ENVELOPE_PREFIX}{}:{}:{}",
        b64.encode(salt),
        b64.encode(nonce_bytes),
        b64.encode(ciphertext),
    ))
}

/// Decrypt a value produced by `encrypt`. A value that is not a `ENC:v1:`
/// envelope is treated as plaintext and returned unchanged (pre-encryption
/// migration compatibility).
pub fn decrypt(value: &str, master: &MasterKey) -> EngineResult<String> {
    let Some(payload) = value.strip_prefix(ENVELOPE_PREFIX) else {
        return Ok(value.to_string());
    };

    let mut parts = payload.splitn(3, ':');
    let (salt_b64, nonce_b64, ct_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(s), Some(n), Some(c)) => (s, n, c),
        _ => return Err(EngineError::Crypto("malformed envelope".into())),
    };

    let b64 = base64::engine::general_purpose::STANDARD;
    let salt = b64.decode(salt_b64).map_err(|e| EngineError::Crypto(e.to_string()))?;
    let nonce_bytes = b64.decode(nonce_b64).map_err(|e| EngineError::Crypto(e.to_string()))?;
    let ciphertext = b64.decode(ct_b64).map_err(|e| EngineError::Crypto(e.to_string()))?;

    if nonce_bytes.len() != NONCE_LEN {
        return Err(EngineError::Crypto("invalid nonce length".into()));
    }

    let subkey = derive_subkey(master, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&subkey)
        .map_err(|e| EngineError::Crypto(format!("bad key length: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| EngineError::Crypto("decryption failed — wrong key or corrupted data".into()))?;
    String::from_utf8(plaintext).map_err(|e| EngineError::Crypto(e.to_string()))
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

/// Derive a per-value AES-256 subkey from the master key and a per-value
/// salt via HKDF-SHA256. Keeps the master key itself out of direct use in
/// any single AEAD invocation.
fn derive_subkey(master: &MasterKey, salt: &[u8]) -> EngineResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), master.0.as_slice());
    let mut subkey = [0u8; 32];
    hk.expand(b"dispatch-core-envelope", &mut subkey)
        .map_err(|e| EngineError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(subkey)
}

pub fn default_salt_path(base_dir: &Path) -> PathBuf {
    base_dir.join(".encryption_key_salt")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::from_bytes([0xAB; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key();
        let plaintext = "sk-live-abc123_secret_token";
        let enc = encrypt(plaintext, &key).unwrap();
        assert!(is_encrypted(&enc));
        assert_eq!(decrypt(&enc, &key).unwrap(), plaintext);
    }

    #[test]
    fn plaintext_passthrough_on_decrypt() {
        let key = test_key();
        assert_eq!(decrypt("not-encrypted", &key).unwrap(), "not-encrypted");
        assert!(!is_encrypted("not-encrypted"));
    }

    #[test]
    fn two_encryptions_produce_different_envelopes() {
        let key = test_key();
        let a = encrypt("same-input", &key).unwrap();
        let b = encrypt("same-input", &key).unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt(&a, &key).unwrap(), "same-input");
        assert_eq!(decrypt(&b, &key).unwrap(), "same-input");
    }

    #[test]
    fn wrong_key_fails_via_aead_tag() {
        let k1 = test_key();
        let k2 = MasterKey::from_bytes([0xCD; 32]);
        let enc = encrypt("secret", &k1).unwrap();
        assert!(decrypt(&enc, &k2).is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = test_key();
        let enc = encrypt("secret-value", &key).unwrap();
        let mut tampered = enc.clone();
        tampered.push('x');
        assert!(decrypt(&tampered, &key).is_err());
    }

    #[test]
    fn malformed_envelope_is_rejected() {
        let key = test_key();
        assert!(decrypt("ENC:v1:onlyonepart", &key).is_err());
    }

    #[test]
    fn salt_file_created_on_first_use_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_salt_path(dir.path());
        assert!(!path.exists());
        let salt1 = load_or_create_salt_file(&path).unwrap();
        assert!(path.exists());
        let salt2 = load_or_create_salt_file(&path).unwrap();
        assert_eq!(salt1, salt2);
    }

    #[test]
    fn master_key_is_stable_for_same_salt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_salt_path(dir.path());
        let k1 = MasterKey::load_or_create(&path).unwrap();
        let k2 = MasterKey::load_or_create(&path).unwrap();
        // Same plaintext under both derivations must decrypt interchangeably.
        let enc = encrypt("x", &k1).unwrap();
        assert_eq!(decrypt(&enc, &k2).unwrap(), "x");
    }

    #[test]
    fn env_override_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_salt_path(dir.path());
        let raw_key = [0x11u8; 32];
        let b64 = base64::engine::general_purpose::STANDARD.encode(raw_key);
        std::env::set_var("ENC_MASTER_KEY", &b64);
        let k = MasterKey::load_or_create(&path).unwrap();
        std::env::remove_var("ENC_MASTER_KEY");
        assert_eq!(k.0.as_slice(), raw_key.as_slice());
    }
}
