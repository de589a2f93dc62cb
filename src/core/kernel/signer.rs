use crate::core::config::CredentialConfig;
use crate::core::errors::SessionError;
use crate::core::traits::{AuthToken, TokenSource};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;

const NONCE_LEN: usize = 16;

/// Compute `hex(HMAC-SHA256(secret, "{timestamp}\n{nonce}\n{data}"))`.
pub fn client_signature(
    secret: &str,
    timestamp: i64,
    nonce: &str,
    data: &str,
) -> Result<String, SessionError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| SessionError::AuthError(format!("Invalid secret key: {}", e)))?;

    mac.update(format!("{}\n{}\n{}", timestamp, nonce, data).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// HMAC signer for the `client_signature` login grant
///
/// Every token carries a fresh millisecond timestamp and random nonce, so a
/// captured login frame cannot be replayed on a later connection.
pub struct HmacSigner {
    client_id: String,
    client_secret: Secret<String>,
    data: String,
}

impl HmacSigner {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret: Secret::new(client_secret),
            data: String::new(),
        }
    }

    pub fn from_credentials(credentials: &CredentialConfig) -> Self {
        Self::new(
            credentials.client_id().to_string(),
            credentials.client_secret().to_string(),
        )
    }

    /// Optional free-form data included in the signed payload.
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    fn sign(&self, timestamp: i64, nonce: &str) -> Result<AuthToken, SessionError> {
        let signature = client_signature(self.client_secret.expose_secret(), timestamp, nonce, &self.data)?;
        Ok(AuthToken::new(json!({
            "grant_type": "client_signature",
            "client_id": self.client_id,
            "timestamp": timestamp,
            "signature": signature,
            "nonce": nonce,
            "data": self.data,
        })))
    }
}

#[async_trait]
impl TokenSource for HmacSigner {
    async fn mint_token(&self) -> Result<AuthToken, SessionError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        self.sign(timestamp, &nonce)
    }
}

/// JWT claims for bearer authentication
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Signs a short-lived HS256 JWT and presents it as a bearer token
pub struct JwtSigner {
    subject: String,
    key: Secret<String>,
    ttl: chrono::Duration,
}

impl JwtSigner {
    pub fn new(subject: String, key: String) -> Self {
        Self {
            subject,
            key: Secret::new(key),
            ttl: chrono::Duration::minutes(5),
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn sign_jwt(&self) -> Result<String, SessionError> {
        let claims = Claims {
            sub: self.subject.clone(),
            exp: (chrono::Utc::now() + self.ttl)
                .timestamp()
                .try_into()
                .unwrap_or(0),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.key.expose_secret().as_bytes()),
        )
        .map_err(|e| SessionError::AuthError(format!("Failed to sign JWT: {}", e)))
    }
}

#[async_trait]
impl TokenSource for JwtSigner {
    async fn mint_token(&self) -> Result<AuthToken, SessionError> {
        let token = self.sign_jwt()?;
        Ok(AuthToken::new(json!({
            "grant_type": "bearer",
            "access_token": token,
        })))
    }
}

/// A pre-issued bearer token, handed out unchanged on every authentication
pub struct StaticToken {
    token: Secret<String>,
}

impl StaticToken {
    pub fn new(token: String) -> Self {
        Self {
            token: Secret::new(token),
        }
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn mint_token(&self) -> Result<AuthToken, SessionError> {
        if self.token.expose_secret().is_empty() {
            return Err(SessionError::AuthError("empty bearer token".to_string()));
        }
        Ok(AuthToken::new(json!({
            "grant_type": "bearer",
            "access_token": self.token.expose_secret(),
        })))
    }
}
