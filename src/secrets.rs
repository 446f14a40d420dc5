//! AI key storage
//!
//! A manually entered API key is kept encrypted in the `ai_settings` row.
//! The cipher key is the SHA-256 digest of the application secret, so any
//! process started with the same secret can read it back.

use crate::db::{Database, DbError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("stored key cannot be decrypted with the current secret")]
    InvalidToken,
    #[error("encryption failed")]
    Encrypt,
    #[error("unknown key source `{0}` (expected system_variable or manual)")]
    UnknownSource(String),
    #[error("a manual key is required when the source is manual")]
    MissingManualKey,
    #[error("no AI key configured")]
    NoKey,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Where the AI key comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiKeySource {
    SystemVariable,
    Manual,
}

impl AiKeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiKeySource::SystemVariable => "system_variable",
            AiKeySource::Manual => "manual",
        }
    }
}

impl FromStr for AiKeySource {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "system_variable" => Ok(AiKeySource::SystemVariable),
            "manual" => Ok(AiKeySource::Manual),
            other => Err(SecretError::UnknownSource(other.to_string())),
        }
    }
}

impl std::fmt::Display for AiKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AES-256-GCM cipher keyed from the application secret
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self { cipher: Aes256Gcm::new(key) }
    }

    /// Encrypt to base64 of `nonce || ciphertext`
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut token = nonce_bytes.to_vec();
        token.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(token))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, SecretError> {
        let raw = BASE64
            .decode(token.trim())
            .map_err(|_| SecretError::InvalidToken)?;
        if raw.len() <= NONCE_SIZE {
            return Err(SecretError::InvalidToken);
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretError::InvalidToken)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::InvalidToken)
    }
}

/// What the settings endpoint reports; never contains the key itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AiKeyStatus {
    pub source: AiKeySource,
    pub has_manual_key: bool,
    pub updated_at: Option<String>,
}

/// Persist the key source. A manual source needs a key; a system source
/// keeps any previously stored manual key as a fallback.
pub fn save_ai_key(
    db: &Database,
    cipher: &KeyCipher,
    source: AiKeySource,
    manual_key: Option<&str>,
) -> Result<(), SecretError> {
    let manual_key = manual_key.map(str::trim).filter(|k| !k.is_empty());

    let encrypted = match (source, manual_key) {
        (_, Some(key)) => Some(cipher.encrypt(key)?),
        (AiKeySource::Manual, None) => return Err(SecretError::MissingManualKey),
        (AiKeySource::SystemVariable, None) => db
            .get_ai_key_settings()?
            .and_then(|row| row.encrypted_key),
    };

    db.save_ai_key_settings(source.as_str(), encrypted.as_deref())?;
    tracing::info!(source = %source, "AI key settings saved");
    Ok(())
}

pub fn ai_key_status(db: &Database) -> Result<AiKeyStatus, SecretError> {
    let row = db.get_ai_key_settings()?;
    Ok(match row {
        Some(row) => AiKeyStatus {
            source: row.source.parse().unwrap_or(AiKeySource::SystemVariable),
            has_manual_key: row.encrypted_key.is_some(),
            updated_at: Some(row.updated_at),
        },
        None => AiKeyStatus {
            source: AiKeySource::SystemVariable,
            has_manual_key: false,
            updated_at: None,
        },
    })
}

/// Key to hand to the assistant.
///
/// Manual source: the stored key, and a key that no longer decrypts clears
/// the settings. Otherwise: `env_key`, then a stored manual key.
pub fn resolve_ai_key(
    db: &Database,
    cipher: &KeyCipher,
    env_key: Option<&str>,
) -> Result<String, SecretError> {
    let env_key = env_key.map(str::trim).filter(|k| !k.is_empty());
    let row = db.get_ai_key_settings()?;

    let source = row
        .as_ref()
        .and_then(|r| r.source.parse().ok())
        .unwrap_or(AiKeySource::SystemVariable);
    let stored = row.as_ref().and_then(|r| r.encrypted_key.as_deref());

    match (source, stored) {
        (AiKeySource::Manual, Some(token)) => match cipher.decrypt(token) {
            Ok(key) => Ok(key),
            Err(e) => {
                tracing::warn!("stored AI key is unreadable, clearing settings");
                db.clear_ai_key_settings()?;
                Err(e)
            }
        },
        (AiKeySource::Manual, None) => Err(SecretError::NoKey),
        (AiKeySource::SystemVariable, _) => {
            if let Some(key) = env_key {
                return Ok(key.to_string());
            }
            stored
                .and_then(|token| cipher.decrypt(token).ok())
                .ok_or(SecretError::NoKey)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(dir.path().join("lab.sqlite3")).unwrap();
        (dir, db)
    }

    // ==========================================================================
    // CIPHER
    // ==========================================================================

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = KeyCipher::from_secret("s3cret");
        let token = cipher.encrypt("sk-test-123").unwrap();
        assert_ne!(token, "sk-test-123");
        assert_eq!(cipher.decrypt(&token).unwrap(), "sk-test-123");
    }

    #[test]
    fn test_nonce_is_random() {
        let cipher = KeyCipher::from_secret("s3cret");
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_secret_is_invalid_token() {
        let token = KeyCipher::from_secret("a").encrypt("key").unwrap();
        let err = KeyCipher::from_secret("b").decrypt(&token).unwrap_err();
        assert!(matches!(err, SecretError::InvalidToken));
    }

    #[test]
    fn test_tampered_token_is_invalid() {
        let cipher = KeyCipher::from_secret("a");
        let mut raw = BASE64.decode(cipher.encrypt("key").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(cipher.decrypt(&BASE64.encode(raw)), Err(SecretError::InvalidToken)));
        assert!(matches!(cipher.decrypt("not base64!"), Err(SecretError::InvalidToken)));
        assert!(matches!(cipher.decrypt(""), Err(SecretError::InvalidToken)));
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("manual".parse::<AiKeySource>().unwrap(), AiKeySource::Manual);
        assert_eq!(" System_Variable ".parse::<AiKeySource>().unwrap(), AiKeySource::SystemVariable);
        assert!("env".parse::<AiKeySource>().is_err());
    }

    // ==========================================================================
    // SETTINGS AND RESOLUTION
    // ==========================================================================

    #[test]
    fn test_manual_requires_key() {
        let (_dir, db) = temp_db();
        let cipher = KeyCipher::from_secret("x");
        let err = save_ai_key(&db, &cipher, AiKeySource::Manual, Some("  ")).unwrap_err();
        assert!(matches!(err, SecretError::MissingManualKey));
    }

    #[test]
    fn test_manual_key_resolves() {
        let (_dir, db) = temp_db();
        let cipher = KeyCipher::from_secret("x");
        save_ai_key(&db, &cipher, AiKeySource::Manual, Some("sk-manual")).unwrap();

        // Manual wins over the environment
        assert_eq!(resolve_ai_key(&db, &cipher, Some("sk-env")).unwrap(), "sk-manual");

        let status = ai_key_status(&db).unwrap();
        assert_eq!(status.source, AiKeySource::Manual);
        assert!(status.has_manual_key);
    }

    #[test]
    fn test_system_source_prefers_env_then_stored() {
        let (_dir, db) = temp_db();
        let cipher = KeyCipher::from_secret("x");
        save_ai_key(&db, &cipher, AiKeySource::Manual, Some("sk-manual")).unwrap();
        save_ai_key(&db, &cipher, AiKeySource::SystemVariable, None).unwrap();

        assert_eq!(resolve_ai_key(&db, &cipher, Some("sk-env")).unwrap(), "sk-env");
        assert_eq!(resolve_ai_key(&db, &cipher, None).unwrap(), "sk-manual");
    }

    #[test]
    fn test_no_key_anywhere() {
        let (_dir, db) = temp_db();
        let cipher = KeyCipher::from_secret("x");
        assert!(matches!(resolve_ai_key(&db, &cipher, Some(" ")), Err(SecretError::NoKey)));
    }

    #[test]
    fn test_corrupt_manual_key_clears_settings() {
        let (_dir, db) = temp_db();
        save_ai_key(&db, &KeyCipher::from_secret("old"), AiKeySource::Manual, Some("sk")).unwrap();

        let err = resolve_ai_key(&db, &KeyCipher::from_secret("new"), None).unwrap_err();
        assert!(matches!(err, SecretError::InvalidToken));
        assert!(db.get_ai_key_settings().unwrap().is_none());
    }
}
