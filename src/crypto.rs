//! Chapter payload decryption and the session-key handshake.
//!
//! Payloads are `base64(IV || AES-128-CBC(PKCS7, key, plaintext))`, where the
//! plaintext may additionally be gzip-compressed. Until a session key has been
//! negotiated the fixed default key is used.

use std::io::Read as _;

use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _};
use rand::RngCore as _;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const IV_LEN: usize = 16;
pub const KEY_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub const DEFAULT_CONTENT_KEY_HEX: &str = "243F6A8885A308D313198A2E03707344";
const DEFAULT_CONTENT_KEY: [u8; KEY_LEN] = [
    0x24, 0x3f, 0x6a, 0x88, 0x85, 0xa3, 0x08, 0xd3, 0x13, 0x19, 0x8a, 0x2e, 0x03, 0x70, 0x73, 0x44,
];

#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("payload is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("payload too short: {len} bytes (need at least {min})")]
    TooShort { len: usize, min: usize },
    #[error("content key must be {} hex characters", KEY_LEN * 2)]
    InvalidKey,
    #[error("cipher or padding validation failed")]
    BadPadding,
    #[error("decompress payload: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("decrypted payload is not valid utf-8")]
    InvalidUtf8,
    #[error("session key material too short: {len} bytes")]
    KeyMaterialTooShort { len: usize },
}

/// Decrypts a chapter payload to text, gunzipping transparently.
pub fn decrypt(payload_b64: &str, content_key_hex: Option<&str>) -> Result<String, DecryptError> {
    let key = resolve_key(content_key_hex)?;
    let plain = decrypt_with_key(payload_b64, &key)?;
    let plain = if plain.starts_with(&GZIP_MAGIC) {
        gunzip(&plain)?
    } else {
        plain
    };
    String::from_utf8(plain).map_err(|_| DecryptError::InvalidUtf8)
}

/// Derives the per-session content key from the blob issued by the key endpoint.
pub fn derive_session_key(server_blob_b64: &str) -> Result<String, DecryptError> {
    let material = decrypt_with_key(server_blob_b64, &DEFAULT_CONTENT_KEY)?;
    if material.len() < KEY_LEN {
        return Err(DecryptError::KeyMaterialTooShort {
            len: material.len(),
        });
    }
    Ok(hex::encode_upper(&material[..KEY_LEN]))
}

/// Builds the payload submitted to the key-issuing endpoint: the device id
/// (little endian) followed by eight zero bytes, under the default key.
pub fn build_key_request(device_id: u64) -> String {
    let mut plain = [0_u8; 16];
    plain[..8].copy_from_slice(&device_id.to_le_bytes());
    encrypt_with_key(&plain, &DEFAULT_CONTENT_KEY)
}

/// Encrypts `plaintext` with a fresh random IV; the inverse of [`decrypt`].
pub fn encrypt(plaintext: &[u8], content_key_hex: Option<&str>) -> Result<String, DecryptError> {
    let key = resolve_key(content_key_hex)?;
    Ok(encrypt_with_key(plaintext, &key))
}

pub fn parse_content_key(content_key_hex: &str) -> Result<[u8; KEY_LEN], DecryptError> {
    let bytes = hex::decode(content_key_hex.trim()).map_err(|_| DecryptError::InvalidKey)?;
    bytes.try_into().map_err(|_| DecryptError::InvalidKey)
}

fn resolve_key(content_key_hex: Option<&str>) -> Result<[u8; KEY_LEN], DecryptError> {
    match content_key_hex {
        Some(hex) => parse_content_key(hex),
        None => Ok(DEFAULT_CONTENT_KEY),
    }
}

fn encrypt_with_key(plaintext: &[u8], key: &[u8; KEY_LEN]) -> String {
    let mut iv = [0_u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext =
        Aes128CbcEnc::new(&(*key).into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    base64::engine::general_purpose::STANDARD.encode(out)
}

fn decrypt_with_key(payload_b64: &str, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, DecryptError> {
    let compact = payload_b64
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>();
    let raw = base64::engine::general_purpose::STANDARD.decode(compact)?;

    let min = IV_LEN + 1;
    if raw.len() < min {
        return Err(DecryptError::TooShort {
            len: raw.len(),
            min,
        });
    }

    let (iv, ciphertext) = raw.split_at(IV_LEN);
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(DecryptError::BadPadding);
    }
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| DecryptError::BadPadding)?;

    Aes128CbcDec::new(&(*key).into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DecryptError::BadPadding)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, DecryptError> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(DecryptError::Decompress)?;
    Ok(out)
}
