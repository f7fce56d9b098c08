//! Payload decryption for `private-encrypted-` channels.
//!
//! Payloads arrive as `{"ciphertext": <base64>, "nonce": <base64>}` sealed
//! with the NaCl secretbox construction (XSalsa20-Poly1305, 24-byte nonce,
//! 16-byte Poly1305 tag bundled with the ciphertext) under the channel's
//! shared secret.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crypto_secretbox::XSalsa20Poly1305;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use serde_json::{Value, json};

use crate::error::PusherError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Turns an encrypted channel payload into the plaintext event data
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, shared_secret: &str, payload: &Value) -> Result<Value, PusherError>;
}

/// Default decryptor using the secretbox construction
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretBoxDecryptor;

impl Decryptor for SecretBoxDecryptor {
    fn decrypt(&self, shared_secret: &str, payload: &Value) -> Result<Value, PusherError> {
        decrypt_payload(shared_secret, payload)
    }
}

fn decode_base64(field: &str, encoded: &str) -> Result<Vec<u8>, PusherError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| PusherError::DecryptionError(format!("{field} is not valid base64: {e}")))
}

fn cipher_for(shared_secret: &str) -> Result<XSalsa20Poly1305, PusherError> {
    let key = decode_base64("shared_secret", shared_secret)?;
    if key.len() != KEY_LEN {
        return Err(PusherError::DecryptionError(format!(
            "shared secret must be {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    XSalsa20Poly1305::new_from_slice(&key)
        .map_err(|_| PusherError::DecryptionError("invalid key length".to_string()))
}

/// Decrypt an encrypted channel payload and parse the plaintext as JSON
pub fn decrypt_payload(shared_secret: &str, payload: &Value) -> Result<Value, PusherError> {
    let Value::Object(fields) = payload else {
        return Err(PusherError::DecryptionError(
            "payload is not an object".to_string(),
        ));
    };
    let field = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| PusherError::DecryptionError(format!("payload has no {name}")))
    };

    let ciphertext = decode_base64("ciphertext", field("ciphertext")?)?;
    let nonce = decode_base64("nonce", field("nonce")?)?;
    if nonce.len() != NONCE_LEN {
        return Err(PusherError::DecryptionError(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }

    let plaintext = cipher_for(shared_secret)?
        .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| PusherError::DecryptionError("authentication failed".to_string()))?;

    let text = String::from_utf8(plaintext)
        .map_err(|_| PusherError::DecryptionError("plaintext is not UTF-8".to_string()))?;
    serde_json::from_str(&text)
        .map_err(|e| PusherError::DecryptionError(format!("plaintext is not JSON: {e}")))
}

/// Seal `plaintext` into the wire payload shape. This is what a server does
/// before broadcasting on an encrypted channel.
pub fn encrypt_payload(
    shared_secret: &str,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Value, PusherError> {
    let ciphertext = cipher_for(shared_secret)?
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| PusherError::DecryptionError("encryption failed".to_string()))?;

    Ok(json!({
        "ciphertext": STANDARD.encode(ciphertext),
        "nonce": STANDARD.encode(nonce),
    }))
}
