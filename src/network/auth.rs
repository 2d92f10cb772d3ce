//! Player Identity
//!
//! `authorize{token}` carries a JWT minted by an external identity provider.
//! The server never issues tokens. A [`TokenVerifier`] is built once from
//! [`AuthConfig`] at startup, so a bad key fails the boot instead of every
//! authorization, and turns each token into an [`Identity`]: a player id
//! derived from the subject plus the instant the identity lapses.

use std::collections::HashSet;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::error::SyncError;
use crate::core::time::Timestamp;
use crate::game::state::PlayerId;

/// Domain separator for player id derivation.
const PLAYER_ID_DOMAIN: &[u8] = b"tactics-sync-player:";

/// Where tokens come from and how they are checked.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Required `iss`; any issuer when unset.
    pub issuer: Option<String>,
    /// Required `aud`; unchecked when unset.
    pub audience: Option<String>,
    /// RS256 public key (PEM). Takes precedence over `secret`.
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Accept expired tokens. Local development only.
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Read `AUTH_ISSUER`, `AUTH_AUDIENCE`, `AUTH_PUBLIC_KEY_PEM`,
    /// `AUTH_SECRET` and `AUTH_SKIP_EXPIRY`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            issuer: var("AUTH_ISSUER"),
            audience: var("AUTH_AUDIENCE"),
            public_key_pem: var("AUTH_PUBLIC_KEY_PEM"),
            secret: var("AUTH_SECRET"),
            skip_expiry: matches!(var("AUTH_SKIP_EXPIRY").as_deref(), Some("1" | "true")),
        }
    }

    /// An HS256 config, as used by tests and local setups.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Self::default()
        }
    }
}

/// Claims read from a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Provider-side user id.
    pub sub: String,
    /// Expiry, Unix seconds; 0 when absent.
    #[serde(default)]
    pub exp: u64,
    /// Issued at, Unix seconds.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience, a string or a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
}

/// Stable player id for a provider subject: hex of the first 16 bytes of a
/// domain-separated SHA-256.
pub fn player_id_for(subject: &str) -> PlayerId {
    let digest = Sha256::new()
        .chain_update(PLAYER_ID_DOMAIN)
        .chain_update(subject.as_bytes())
        .finalize();
    hex::encode(&digest[..16])
}

/// Who a session acts as after `authorize`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Player id used in teams and requests.
    pub player_id: PlayerId,
    /// Provider subject the id was derived from.
    pub subject: String,
    /// When the token stops being valid; `None` if it never does.
    pub expires_at: Option<Timestamp>,
}

impl Identity {
    fn from_claims(claims: TokenClaims, honour_expiry: bool) -> Self {
        let expires_at = (honour_expiry && claims.exp > 0)
            .then(|| Timestamp::from_millis(claims.exp.saturating_mul(1000).min(i64::MAX as u64) as i64));
        Self {
            player_id: player_id_for(&claims.sub),
            subject: claims.sub,
            expires_at,
        }
    }

    /// Whether the identity has lapsed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Why a token was refused.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Neither a public key nor a secret is configured.
    #[error("no token key configured")]
    NotConfigured,
    /// The configured public key does not parse.
    #[error("bad public key: {0}")]
    BadKey(String),
    /// Not a JWT.
    #[error("malformed token")]
    Malformed,
    /// Signature does not match the key.
    #[error("bad signature")]
    BadSignature,
    /// Past its `exp`.
    #[error("token expired")]
    Expired,
    /// `iss` is not the configured issuer.
    #[error("unexpected issuer")]
    WrongIssuer,
    /// `aud` does not include the configured audience.
    #[error("unexpected audience")]
    WrongAudience,
    /// `sub` is empty.
    #[error("token has no subject")]
    NoSubject,
    /// Anything else the decoder reports.
    #[error("{0}")]
    Other(String),
}

impl From<AuthError> for SyncError {
    fn from(err: AuthError) -> Self {
        SyncError::unauthorized(format!("Authorization failed: {err}"))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
            ErrorKind::InvalidAudience => AuthError::WrongAudience,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::Malformed
            }
            _ => AuthError::Other(err.to_string()),
        }
    }
}

/// Checks tokens against one key.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
    honour_expiry: bool,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .field("honour_expiry", &self.honour_expiry)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Build the key and validation rules once.
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let (key, algorithm) = match (&config.public_key_pem, &config.secret) {
            (Some(pem), _) => (
                DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| AuthError::BadKey(e.to_string()))?,
                Algorithm::RS256,
            ),
            (None, Some(secret)) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
            (None, None) => return Err(AuthError::NotConfigured),
        };

        let mut validation = Validation::new(algorithm);
        // `exp` is optional: tokens without one never lapse.
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = !config.skip_expiry;
        validation.leeway = 0;
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Ok(Self {
            key,
            validation,
            honour_expiry: !config.skip_expiry,
        })
    }

    /// Verify `token` and derive the identity it grants.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = decode::<TokenClaims>(token, &self.key, &self.validation)?.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::NoSubject);
        }
        let identity = Identity::from_claims(claims, self.honour_expiry);
        if identity.is_expired(Timestamp::now()) {
            return Err(AuthError::Expired);
        }
        Ok(identity)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn now_secs() -> u64 {
        (Timestamp::now().as_millis() / 1000) as u64
    }

    fn claims(sub: &str, exp: u64) -> TokenClaims {
        TokenClaims {
            sub: sub.into(),
            exp,
            iat: now_secs(),
            iss: Some("lobby".into()),
            aud: Some(serde_json::json!(["tactics", "chat"])),
        }
    }

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn verifier(config: AuthConfig) -> TokenVerifier {
        TokenVerifier::new(&config).unwrap()
    }

    #[test]
    fn test_verified_identity_carries_expiry() {
        let exp = now_secs() + 3600;
        let identity = verifier(AuthConfig::with_secret(SECRET))
            .verify(&sign(&claims("alice", exp), SECRET))
            .unwrap();

        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.player_id, player_id_for("alice"));
        assert_eq!(identity.expires_at, Some(Timestamp::from_millis(exp as i64 * 1000)));
        assert!(!identity.is_expired(Timestamp::now()));
        assert!(identity.is_expired(Timestamp::from_millis(exp as i64 * 1000)));
    }

    #[test]
    fn test_token_without_exp_never_lapses() {
        let identity = verifier(AuthConfig::with_secret(SECRET))
            .verify(&sign(&claims("bob", 0), SECRET))
            .unwrap();
        assert_eq!(identity.expires_at, None);
    }

    #[test]
    fn test_refusals() {
        let verifier = verifier(AuthConfig::with_secret(SECRET));

        let expired = sign(&claims("alice", 1), SECRET);
        assert!(matches!(verifier.verify(&expired), Err(AuthError::Expired)));

        let forged = sign(&claims("alice", now_secs() + 60), "some-other-secret-entirely!!");
        assert!(matches!(verifier.verify(&forged), Err(AuthError::BadSignature)));

        let anonymous = sign(&claims("", now_secs() + 60), SECRET);
        assert!(matches!(verifier.verify(&anonymous), Err(AuthError::NoSubject)));

        assert!(matches!(verifier.verify("not-a-jwt"), Err(AuthError::Malformed)));
    }

    #[test]
    fn test_issuer_and_audience_rules() {
        let token = sign(&claims("alice", now_secs() + 60), SECRET);

        let wrong_issuer = AuthConfig {
            issuer: Some("elsewhere".into()),
            ..AuthConfig::with_secret(SECRET)
        };
        assert!(matches!(verifier(wrong_issuer).verify(&token), Err(AuthError::WrongIssuer)));

        let listed_audience = AuthConfig {
            issuer: Some("lobby".into()),
            audience: Some("tactics".into()),
            ..AuthConfig::with_secret(SECRET)
        };
        assert!(verifier(listed_audience).verify(&token).is_ok());

        let other_audience = AuthConfig {
            audience: Some("billing".into()),
            ..AuthConfig::with_secret(SECRET)
        };
        assert!(matches!(verifier(other_audience).verify(&token), Err(AuthError::WrongAudience)));
    }

    #[test]
    fn test_skip_expiry_accepts_stale_tokens() {
        let config = AuthConfig {
            skip_expiry: true,
            ..AuthConfig::with_secret(SECRET)
        };
        let identity = verifier(config).verify(&sign(&claims("alice", 1), SECRET)).unwrap();
        assert_eq!(identity.expires_at, None);
    }

    #[test]
    fn test_verifier_needs_a_key() {
        assert!(matches!(TokenVerifier::new(&AuthConfig::default()), Err(AuthError::NotConfigured)));

        let bad_pem = AuthConfig {
            public_key_pem: Some("-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----".into()),
            ..AuthConfig::default()
        };
        assert!(matches!(TokenVerifier::new(&bad_pem), Err(AuthError::BadKey(_))));
    }

    #[test]
    fn test_player_id_is_stable_and_distinct() {
        let alice = player_id_for("alice");
        assert_eq!(alice, player_id_for("alice"));
        assert_ne!(alice, player_id_for("bob"));
        assert_eq!(alice.len(), 32);
        assert!(alice.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_refusal_is_unauthorized_on_the_wire() {
        let err: SyncError = AuthError::Expired.into();
        assert_eq!(err.code(), 403);
    }
}
