use crate::database::ServerDatabase;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tasksync_core::{errors::ServerError, SyncResult};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signed requests older or newer than this are rejected.
pub const SIGNATURE_WINDOW_SECS: i64 = 300;

pub const API_KEY_PREFIX: &str = "rpa_";
pub const SECRET_PREFIX: &str = "rps_";

pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
}

#[derive(Clone)]
pub struct AuthState {
    db: Arc<ServerDatabase>,
}

impl AuthState {
    pub fn new(db: Arc<ServerDatabase>) -> Self {
        Self { db }
    }

    pub fn hash_token(token: &str) -> SyncResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2.hash_password(token.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    pub fn verify_token_hash(token: &str, hash: &str) -> SyncResult<bool> {
        let parsed_hash = PasswordHash::new(hash)?;
        let argon2 = Argon2::default();
        Ok(argon2.verify_password(token.as_bytes(), &parsed_hash).is_ok())
    }

    pub fn generate_api_credentials() -> ApiCredentials {
        let mut rng = rand::thread_rng();
        let api_key_bytes: [u8; 32] = rng.gen();
        let secret_bytes: [u8; 32] = rng.gen();

        ApiCredentials {
            api_key: format!("{}{}", API_KEY_PREFIX, hex::encode(api_key_bytes)),
            secret: format!("{}{}", SECRET_PREFIX, hex::encode(secret_bytes)),
        }
    }

    /// Store a credential pair. The key is kept as an argon2 hash; the secret is kept as
    /// is so signatures can be recomputed.
    pub async fn save_credentials(
        &self,
        credentials: &ApiCredentials,
        name: &str,
    ) -> SyncResult<Uuid> {
        let api_key_hash = Self::hash_token(&credentials.api_key)?;
        let id = self
            .db
            .insert_credentials(&api_key_hash, &credentials.secret, name)
            .await?;
        tracing::info!("SERVER: Stored credentials {} ({})", id, name);
        Ok(id)
    }

    pub fn create_hmac_signature(
        secret: &str,
        timestamp: i64,
        identity: &str,
        api_key: &str,
        body: &str,
    ) -> SyncResult<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ServerError::Auth(format!("Invalid HMAC key: {}", e)))?;

        let message = format!("{}.{}.{}.{}", timestamp, identity, api_key, body);
        mac.update(message.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Recompute the signature with `secret` and compare in constant time.
    pub fn verify_signature(
        secret: &str,
        api_key: &str,
        signature: &str,
        timestamp: i64,
        identity: &str,
        body: &str,
    ) -> bool {
        match Self::create_hmac_signature(secret, timestamp, identity, api_key, body) {
            Ok(expected) => expected.as_bytes().ct_eq(signature.as_bytes()).into(),
            Err(_) => false,
        }
    }

    pub fn timestamp_in_window(timestamp: i64, now: i64) -> bool {
        (now - timestamp).abs() <= SIGNATURE_WINDOW_SECS
    }

    /// Check a signed authentication request against the active credentials.
    pub async fn verify_hmac(
        &self,
        api_key: &str,
        signature: &str,
        timestamp: i64,
        identity: &str,
        body: &str,
    ) -> SyncResult<bool> {
        let now = chrono::Utc::now().timestamp();
        if !Self::timestamp_in_window(timestamp, now) {
            tracing::warn!("SERVER: HMAC timestamp outside 5-minute window");
            return Ok(false);
        }

        if !api_key.starts_with(API_KEY_PREFIX) {
            tracing::warn!(
                "SERVER: HMAC verification failed: API key must start with {}",
                API_KEY_PREFIX
            );
            return Ok(false);
        }

        if identity.trim().is_empty() {
            tracing::warn!("SERVER: HMAC verification failed: empty identity");
            return Ok(false);
        }

        for credentials in self.db.active_credentials().await? {
            if Self::verify_token_hash(api_key, &credentials.api_key_hash).unwrap_or(false) {
                let valid = Self::verify_signature(
                    &credentials.secret,
                    api_key,
                    signature,
                    timestamp,
                    identity,
                    body,
                );
                if valid {
                    self.db.touch_credentials(&credentials.id).await?;
                } else {
                    tracing::warn!("SERVER: Signature mismatch for credentials {}", credentials.id);
                }
                return Ok(valid);
            }
        }

        tracing::warn!("SERVER: Unknown API key");
        Ok(false)
    }
}
