use crate::error::CryptoError;
use aes_gcm_siv::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::error;

const SENSITIVE_KEYS: [&str; 4] = ["password", "client_secret", "token", "refresh_token"];
const ENCRYPTED_PREFIX: &str = "enc:";
const NONCE_LEN: usize = 12;

/// Protects sensitive account settings at rest.
///
/// The symmetric key is derived from `CALSYNC_SECRET_KEY` via SHA-256;
/// encrypted values carry the `enc:` prefix followed by the URL-safe base64
/// encoding of nonce plus ciphertext.
pub struct SettingsCipher {
    cipher: Aes256GcmSiv,
}

impl SettingsCipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let cipher = Aes256GcmSiv::new_from_slice(&digest).expect("SHA-256 digest is a valid key");
        Self { cipher }
    }

    pub fn from_env() -> Result<Self, CryptoError> {
        let secret = std::env::var("CALSYNC_SECRET_KEY")
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or(CryptoError::MissingSecretKey)?;
        Ok(Self::new(&secret))
    }

    fn encrypt_value(&self, value: &str) -> Result<String, CryptoError> {
        if value.starts_with(ENCRYPTED_PREFIX) {
            return Ok(value.to_string());
        }
        let nonce = Aes256GcmSiv::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, value.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTED_PREFIX}{}", URL_SAFE_NO_PAD.encode(combined)))
    }

    fn decrypt_value(&self, value: &str) -> Result<String, CryptoError> {
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(value.to_string());
        };

        let combined = URL_SAFE_NO_PAD.decode(encoded).map_err(|err| {
            error!("Entschlüsselung des Geheimnisses fehlgeschlagen: {err}");
            CryptoError::Decrypt
        })?;
        if combined.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|err| {
                error!("Entschlüsselung des Geheimnisses fehlgeschlagen: {err}");
                CryptoError::Decrypt
            })?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }

    /// A copy of `settings` with sensitive values encrypted.
    pub fn encrypt_settings(&self, settings: &Value) -> Result<Value, CryptoError> {
        self.transform(settings, None, &|cipher, value| cipher.encrypt_value(value))
    }

    /// A copy of `settings` with encrypted values restored.
    pub fn decrypt_settings(&self, settings: &Value) -> Result<Value, CryptoError> {
        self.transform(settings, None, &|cipher, value| cipher.decrypt_value(value))
    }

    fn transform(
        &self,
        value: &Value,
        key: Option<&str>,
        apply: &dyn Fn(&Self, &str) -> Result<String, CryptoError>,
    ) -> Result<Value, CryptoError> {
        match value {
            Value::Object(map) => {
                let mut transformed = serde_json::Map::with_capacity(map.len());
                for (child_key, child) in map {
                    transformed.insert(
                        child_key.clone(),
                        self.transform(child, Some(child_key), apply)?,
                    );
                }
                Ok(Value::Object(transformed))
            }
            Value::Array(items) => {
                let mut transformed = Vec::with_capacity(items.len());
                for item in items {
                    transformed.push(self.transform(item, key, apply)?);
                }
                Ok(Value::Array(transformed))
            }
            Value::String(text) => {
                let sensitive = key.is_some_and(|key| SENSITIVE_KEYS.contains(&key));
                if sensitive && !text.is_empty() {
                    Ok(Value::String(apply(self, text)?))
                } else {
                    Ok(value.clone())
                }
            }
            _ => Ok(value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_sensitive_fields() {
        let cipher = SettingsCipher::new("test-secret");
        let settings = json!({
            "host": "imap.example.com",
            "username": "alex",
            "password": "hunter2",
            "nested": {"refresh_token": "tok-1", "port": 993},
        });

        let encrypted = cipher.encrypt_settings(&settings).expect("encrypt");
        assert_eq!(encrypted["host"], "imap.example.com");
        let stored_password = encrypted["password"].as_str().expect("string");
        assert!(stored_password.starts_with("enc:"));
        assert!(encrypted["nested"]["refresh_token"]
            .as_str()
            .expect("string")
            .starts_with("enc:"));

        let decrypted = cipher.decrypt_settings(&encrypted).expect("decrypt");
        assert_eq!(decrypted, settings);
    }

    #[test]
    fn encrypting_twice_does_not_double_wrap() {
        let cipher = SettingsCipher::new("test-secret");
        let settings = json!({"password": "hunter2"});
        let once = cipher.encrypt_settings(&settings).expect("encrypt");
        let twice = cipher.encrypt_settings(&once).expect("encrypt again");
        assert_eq!(once, twice);
    }

    #[test]
    fn decrypting_with_wrong_key_fails() {
        let cipher = SettingsCipher::new("first");
        let other = SettingsCipher::new("second");
        let encrypted = cipher
            .encrypt_settings(&json!({"password": "hunter2"}))
            .expect("encrypt");
        assert!(other.decrypt_settings(&encrypted).is_err());
    }

    #[test]
    fn plain_values_pass_through_decryption() {
        let cipher = SettingsCipher::new("test-secret");
        let settings = json!({"password": "legacy-plaintext"});
        let decrypted = cipher.decrypt_settings(&settings).expect("decrypt");
        assert_eq!(decrypted, settings);
    }
}
