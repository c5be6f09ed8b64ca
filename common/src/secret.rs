//! Encryption at rest for environment variables and provider tokens.
//!
//! A single process-wide key (32 bytes, base64) is loaded at startup.
//! Ciphertexts are `base64(nonce || aes-256-gcm(plaintext))`; decryption
//! happens only at property access and plaintext is never logged.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::project::EnvVar;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encryption key must be 32 base64-encoded bytes")]
    InvalidKey,
    #[error("failed to encrypt secret")]
    Encrypt,
    #[error("failed to decrypt secret")]
    Decrypt,
    #[error("decrypted payload is not valid: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Process-wide symmetric key. Cheap to clone; holds only the raw key bytes.
#[derive(Clone)]
pub struct Key {
    bytes: [u8; 32],
    rng: SystemRandom,
}

impl Key {
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = BASE64.decode(encoded.trim()).map_err(|_| Error::InvalidKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidKey)?;
        Ok(Self {
            bytes,
            rng: SystemRandom::new(),
        })
    }

    fn sealing_key(&self) -> Result<LessSafeKey, Error> {
        UnboundKey::new(&AES_256_GCM, &self.bytes)
            .map(LessSafeKey::new)
            .map_err(|_| Error::InvalidKey)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, Error> {
        let key = self.sealing_key()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| Error::Encrypt)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Encrypt)?;

        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&in_out);
        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, Error> {
        let payload = BASE64.decode(ciphertext.trim()).map_err(|_| Error::Decrypt)?;
        if payload.len() < NONCE_LEN {
            return Err(Error::Decrypt);
        }

        let key = self.sealing_key()?;
        let (nonce_bytes, sealed) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| Error::Decrypt)?;

        let mut in_out = sealed.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Decrypt)?;
        Ok(plaintext.to_vec())
    }

    /// Encrypt an env-var list as a JSON array. An empty list encrypts to an
    /// empty string so unset stays distinguishable from set-to-nothing.
    pub fn seal_env_vars(&self, vars: &[EnvVar]) -> Result<String, Error> {
        if vars.is_empty() {
            return Ok(String::new());
        }
        let json = serde_json::to_vec(vars)?;
        self.encrypt(&json)
    }

    pub fn open_env_vars(&self, ciphertext: &str) -> Result<Vec<EnvVar>, Error> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        let plaintext = self.decrypt(ciphertext)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Encrypt a provider access token.
    pub fn seal_token(&self, token: &str) -> Result<String, Error> {
        self.encrypt(token.as_bytes())
    }

    pub fn open_token(&self, ciphertext: &str) -> Result<String, Error> {
        let plaintext = self.decrypt(ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| Error::Decrypt)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key::from_base64(&BASE64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn env_vars_round_trip() {
        let key = key();
        let vars = vec![
            EnvVar {
                key: "DATABASE_URL".into(),
                value: "postgres://localhost/app".into(),
            },
            EnvVar {
                key: "SECRET".into(),
                value: "hunter2".into(),
            },
        ];

        let sealed = key.seal_env_vars(&vars).unwrap();
        assert_ne!(sealed, serde_json::to_string(&vars).unwrap());
        assert_eq!(key.open_env_vars(&sealed).unwrap(), vars);
    }

    #[test]
    fn empty_list_is_the_empty_string() {
        let key = key();
        assert_eq!(key.seal_env_vars(&[]).unwrap(), "");
        assert_eq!(key.open_env_vars("").unwrap(), Vec::<EnvVar>::new());
    }

    #[test]
    fn ciphertexts_are_nondeterministic_but_stable() {
        let key = key();
        let a = key.seal_token("tok_123").unwrap();
        let b = key.seal_token("tok_123").unwrap();
        assert_ne!(a, b);
        assert_eq!(key.open_token(&a).unwrap(), "tok_123");
        assert_eq!(key.open_token(&b).unwrap(), "tok_123");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = key().seal_token("tok_123").unwrap();
        let other = Key::from_base64(&BASE64.encode([9u8; 32])).unwrap();
        assert!(matches!(other.open_token(&sealed), Err(Error::Decrypt)));
    }
}
