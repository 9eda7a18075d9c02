use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use uuid::Uuid;

use crate::error::{CollectorError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Fixed IV for the upstream protocol's AES-CBC envelope. A protocol constant, not a secret.
const IV: &[u8; 16] = b"7Fk9Lm3Np8Qr4Sv2";

fn empty_envelope() -> serde_json::Value {
    serde_json::json!({"data_headers": {}, "data": {}})
}

fn aes_cbc_encrypt(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new_from_slices(key, IV)
        .expect("session key is always 32 bytes and IV is always 16 bytes")
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn aes_cbc_decrypt(key: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key, IV).ok()?;
    cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()
}

/// Generates a fresh per-call session key: a random 128-bit UUID, hex-encoded to 32 ASCII
/// bytes, used directly as the AES-256 key (never reused across calls).
pub fn new_session_key() -> [u8; 32] {
    let id = Uuid::new_v4();
    let hex = hex::encode(id.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(hex.as_bytes());
    key
}

/// Derives the session id the server expects on the next request from a server-issued `sid`.
pub fn derive_session_id(server_sid: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(server_sid.as_bytes());
    hasher.update(b"c!SID!n");
    hex::encode(hasher.finalize())
}

/// Encrypts the viewer-id field for embedding back into the outgoing payload: AES-CBC under
/// the same session key, then base64, matching the upstream's in-payload field encoding.
pub fn encrypt_viewer_id(viewer_id: i64, key: &[u8; 32]) -> String {
    let ciphertext = aes_cbc_encrypt(key, viewer_id.to_string().as_bytes());
    let mut wire = ciphertext;
    wire.extend_from_slice(key);
    BASE64.encode(wire)
}

/// Serializes, pads, and encrypts a request payload. Returns the raw `<ciphertext><key>` body
/// ready to POST; the key is appended in the clear, as the upstream protocol expects.
pub fn build_request_body(payload: &serde_json::Value, key: &[u8; 32]) -> Result<Vec<u8>> {
    let packed = rmp_serde::to_vec(payload)
        .map_err(|e| CollectorError::Decode(format!("failed to encode msgpack payload: {e}")))?;
    let mut body = aes_cbc_encrypt(key, &packed);
    body.extend_from_slice(key);
    Ok(body)
}

/// Decodes a base64-encoded response body. Never fails: a malformed or non-map response
/// yields the empty envelope `{"data_headers": {}, "data": {}}`, leaving interpretation to
/// the caller.
pub fn decode_response(body_b64: &[u8]) -> serde_json::Value {
    let Ok(raw) = BASE64.decode(body_b64.trim_ascii()) else {
        return empty_envelope();
    };
    if raw.len() < 32 {
        return empty_envelope();
    }
    let (ciphertext, key) = raw.split_at(raw.len() - 32);
    let Some(plain) = aes_cbc_decrypt(key, ciphertext) else {
        return empty_envelope();
    };
    match rmp_serde::from_slice::<serde_json::Value>(&plain) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => empty_envelope(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_payload_through_the_same_envelope_shape() {
        let key = new_session_key();
        let payload = serde_json::json!({
            "data_headers": {"sid": "abc123"},
            "data": {"viewer_id": "42", "carrier": "google"},
        });

        let body = build_request_body(&payload, &key).expect("encode should succeed");
        let body_b64 = BASE64.encode(body);

        let decoded = decode_response(body_b64.as_bytes());
        assert_eq!(decoded, payload);
    }

    #[test]
    fn malformed_base64_decodes_to_empty_envelope() {
        let decoded = decode_response(b"not valid base64 !!!");
        assert_eq!(decoded, empty_envelope());
    }

    #[test]
    fn truncated_body_decodes_to_empty_envelope() {
        let short = BASE64.encode(b"too short");
        assert_eq!(decode_response(short.as_bytes()), empty_envelope());
    }

    #[test]
    fn decoding_a_non_map_payload_yields_empty_envelope() {
        let key = new_session_key();
        let packed = rmp_serde::to_vec(&serde_json::json!([1, 2, 3])).unwrap();
        let mut body = super::aes_cbc_encrypt(&key, &packed);
        body.extend_from_slice(&key);
        let decoded = decode_response(BASE64.encode(body).as_bytes());
        assert_eq!(decoded, empty_envelope());
    }

    #[test]
    fn session_keys_are_not_reused() {
        let a = new_session_key();
        let b = new_session_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn derive_session_id_matches_the_upstream_suffix_scheme() {
        let expected = {
            let mut hasher = Md5::new();
            hasher.update(b"serversid");
            hasher.update(b"c!SID!n");
            hex::encode(hasher.finalize())
        };
        assert_eq!(derive_session_id("serversid"), expected);
    }
}
