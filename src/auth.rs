//! Device token mint/verify.
//!
//! Tokens are HMAC-SHA256 JWTs shared between the dialogue server and the
//! MQTT broker: the broker reads the embedded ACL to scope publish and
//! subscribe rights to the device's own topics, the server re-verifies the
//! same token on connect.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::AuthError;

/// One MQTT ACL rule embedded in the token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRule {
    pub permission: String,
    pub action: String,
    pub topic: String,
}

/// JWT claims carried by device tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The broker authenticates on `username`; it is always the device id.
    pub username: String,
    pub user_id: u64,
    pub device_id: String,
    pub acl: Vec<AclRule>,
    pub exp: i64,
    pub iat: i64,
}

/// Verified identity extracted from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub device_id: String,
    pub user_id: u64,
}

/// Mints and verifies device JWTs with a shared HMAC secret.
pub struct AuthToken {
    secret: Vec<u8>,
    topic_root: String,
}

impl AuthToken {
    pub fn new(secret: &str) -> Self {
        Self::with_topic_root(secret, "vox_topic")
    }

    pub fn with_topic_root(secret: &str, topic_root: &str) -> Self {
        if secret.is_empty() {
            tracing::error!("JWT secret is empty; all token verification will fail");
        }
        let topic_root = if topic_root.is_empty() {
            "vox_topic"
        } else {
            topic_root
        };
        Self {
            secret: secret.as_bytes().to_vec(),
            topic_root: topic_root.to_string(),
        }
    }

    /// Generate a token valid for `expiry_secs`, carrying the MQTT ACL that
    /// confines the device to its own in/out/status topics.
    pub fn generate_token(
        &self,
        user_id: u64,
        device_id: &str,
        expiry_secs: i64,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let acl = vec![
            AclRule {
                permission: "allow".into(),
                action: "publish".into(),
                topic: format!("{}/{}/+/in", self.topic_root, device_id),
            },
            AclRule {
                permission: "allow".into(),
                action: "publish".into(),
                topic: format!("{}/{}/status/#", self.topic_root, device_id),
            },
            AclRule {
                permission: "allow".into(),
                action: "subscribe".into(),
                topic: format!("{}/{}/+/out", self.topic_root, device_id),
            },
            AclRule {
                permission: "allow".into(),
                action: "subscribe".into(),
                topic: format!("{}/{}/status/#", self.topic_root, device_id),
            },
        ];

        let claims = Claims {
            username: device_id.to_string(),
            user_id,
            device_id: device_id.to_string(),
            acl,
            exp: now + expiry_secs,
            iat: now,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Verify signature and expiry, returning the embedded identity.
    pub fn verify_token(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        // Claims carry no `aud`; jsonwebtoken would otherwise reject.
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(VerifiedToken {
            device_id: data.claims.device_id,
            user_id: data.claims.user_id,
        })
    }

    /// Verify a token and require that its device id matches the one the
    /// transport saw. The mismatch check runs before any provider is
    /// touched.
    pub fn verify_for_device(
        &self,
        token: &str,
        request_device_id: &str,
    ) -> Result<VerifiedToken, AuthError> {
        let verified = self.verify_token(token)?;
        if verified.device_id != request_device_id {
            return Err(AuthError::DeviceMismatch {
                request: request_device_id.to_string(),
                token: verified.device_id,
            });
        }
        Ok(verified)
    }
}

/// Strip a `Bearer ` prefix from an Authorization header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_verify() {
        let auth = AuthToken::new("test-secret");
        let token = auth.generate_token(42, "aa:bb:cc", 3600).unwrap();
        let verified = auth.verify_token(&token).unwrap();
        assert_eq!(verified.device_id, "aa:bb:cc");
        assert_eq!(verified.user_id, 42);
    }

    #[test]
    fn test_acl_topics() {
        let auth = AuthToken::with_topic_root("s", "devices");
        let token = auth.generate_token(1, "d1", 3600).unwrap();
        // Decode without verification helpers: just re-verify and check via
        // claims on a second decode.
        let data = jsonwebtoken::decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"s"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        let topics: Vec<&str> = data.claims.acl.iter().map(|r| r.topic.as_str()).collect();
        assert!(topics.contains(&"devices/d1/+/in"));
        assert!(topics.contains(&"devices/d1/+/out"));
        assert!(topics.contains(&"devices/d1/status/#"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let auth = AuthToken::new("right");
        let token = auth.generate_token(1, "d1", 3600).unwrap();
        let other = AuthToken::new("wrong");
        assert!(matches!(
            other.verify_token(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_rejected() {
        let auth = AuthToken::new("s");
        let token = auth.generate_token(1, "d1", -120).unwrap();
        assert!(auth.verify_token(&token).is_err());
    }

    #[test]
    fn test_device_mismatch() {
        let auth = AuthToken::new("s");
        let token = auth.generate_token(1, "real-device", 3600).unwrap();
        let err = auth.verify_for_device(&token, "other-device").unwrap_err();
        assert!(matches!(err, AuthError::DeviceMismatch { .. }));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
