//! Symmetric crypto envelope for the rchat line protocol.
//!
//! Every application frame travels as `base64(nonce || AES-256-GCM(plaintext) || tag)`.
//! One key per server instance; clients receive it as a base64 string during
//! key exchange and rebuild the same [`Cipher`] from it.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{ChatError, ChatResult};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Shared symmetric cipher.
pub struct Cipher {
    key: LessSafeKey,
    raw: [u8; KEY_LEN],
    rng: SystemRandom,
}

impl Cipher {
    /// Generate a fresh random key.
    pub fn generate() -> ChatResult<Self> {
        let rng = SystemRandom::new();
        let mut raw = [0u8; KEY_LEN];
        rng.fill(&mut raw)
            .map_err(|_| ChatError::Crypto("system RNG failure".into()))?;
        Self::from_bytes(raw)
    }

    /// Build a cipher from raw key bytes.
    pub fn from_bytes(raw: [u8; KEY_LEN]) -> ChatResult<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, &raw)
            .map_err(|_| ChatError::Crypto("invalid AES-256 key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            raw,
            rng: SystemRandom::new(),
        })
    }

    /// Rebuild a cipher from the string form sent during key exchange.
    pub fn from_key_string(key: &str) -> ChatResult<Self> {
        let bytes = BASE64.decode(key.trim())?;
        let raw: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            ChatError::Crypto(format!(
                "key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Self::from_bytes(raw)
    }

    /// String form of the key, suitable for a single protocol line.
    pub fn key_string(&self) -> String {
        BASE64.encode(self.raw)
    }

    /// Encrypt a UTF-8 frame into a base64 line.
    pub fn encrypt(&self, plaintext: &str) -> ChatResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| ChatError::Crypto("system RNG failure".into()))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| ChatError::Crypto("seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend(in_out);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a base64 line back into its UTF-8 frame.
    pub fn decrypt(&self, line: &str) -> ChatResult<String> {
        let data = BASE64.decode(line.trim())?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(ChatError::Crypto(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| ChatError::Crypto("bad nonce".into()))?;
        let mut sealed = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut sealed)
            .map_err(|_| ChatError::Crypto("authentication tag mismatch".into()))?;

        String::from_utf8(plain.to_vec())
            .map_err(|e| ChatError::Codec(format!("plaintext is not UTF-8: {e}")))
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("key", &"<redacted>").finish()
    }
}
