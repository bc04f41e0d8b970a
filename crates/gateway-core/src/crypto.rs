// ── Keystone Gateway: Field Encryption ──────────────────────────────────────
// AES-256-GCM encryption for credential-store fields at rest. The master key
// lives in the OS keychain, never on disk in plaintext. Ciphertext is packed
// as `nonce || ciphertext+tag`, base64-encoded, and tagged with `ENC_PREFIX`
// so a reader can tell an encrypted field from a legacy plaintext one.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::RngCore;

use crate::error::{GatewayError, GatewayResult};

const KEYRING_SERVICE: &str = "keystone-gateway";
const KEYRING_USER: &str = "db-encryption-key";
const ENC_PREFIX: &str = "enc:";
const NONCE_LEN: usize = 12;

/// Fetches the master key from the OS keychain, generating and storing a
/// fresh random 32-byte key on first run.
pub fn get_master_key() -> GatewayResult<[u8; 32]> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .map_err(|e| GatewayError::Keyring(e.to_string()))?;

    match entry.get_password() {
        Ok(existing) => {
            let decoded = B64
                .decode(existing)
                .map_err(|e| GatewayError::Keyring(format!("stored key is not valid base64: {e}")))?;
            if decoded.len() != 32 {
                return Err(GatewayError::Keyring("stored key has unexpected length".into()));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&decoded);
            Ok(key)
        }
        Err(keyring::Error::NoEntry) => {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            entry
                .set_password(&B64.encode(key))
                .map_err(|e| GatewayError::Keyring(e.to_string()))?;
            Ok(key)
        }
        Err(e) => Err(GatewayError::Keyring(e.to_string())),
    }
}

/// Encrypts `plaintext`, returning a base64 string prefixed with `enc:`.
pub fn encrypt(key: &[u8; 32], plaintext: &str) -> GatewayResult<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| GatewayError::Other(format!("encryption failed: {e}")))?;

    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);

    Ok(format!("{ENC_PREFIX}{}", B64.encode(packed)))
}

/// Decrypts a value produced by [`encrypt`]. If `value` does not carry the
/// `enc:` prefix, it is returned unchanged — legacy plaintext rows are
/// readable until the next write re-encrypts them.
pub fn decrypt(key: &[u8; 32], value: &str) -> GatewayResult<String> {
    let Some(encoded) = value.strip_prefix(ENC_PREFIX) else {
        return Ok(value.to_string());
    };

    let packed = B64
        .decode(encoded)
        .map_err(|e| GatewayError::Other(format!("decrypt: invalid base64: {e}")))?;
    if packed.len() < NONCE_LEN {
        return Err(GatewayError::Other("decrypt: payload too short".into()));
    }
    let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| GatewayError::Other(format!("decryption failed: {e}")))?;

    String::from_utf8(plaintext).map_err(|e| GatewayError::Other(format!("decrypt: invalid utf8: {e}")))
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENC_PREFIX)
}
