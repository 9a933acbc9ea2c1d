//! Operator Tokens
//!
//! Anchoring, retries, signer registration and multisig votes are operator
//! actions. An operator presents a JWT once per connection and the server
//! reads the operator name from its `sub` claim. Tokens are minted
//! elsewhere; this module only checks them. With no key configured the
//! operator gate is open.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key that operator tokens are signed with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorKey {
    /// Shared HS256 secret.
    Hmac(String),
    /// RS256 public key, PEM encoded.
    RsaPem(String),
}

impl OperatorKey {
    fn algorithm(&self) -> Algorithm {
        match self {
            OperatorKey::Hmac(_) => Algorithm::HS256,
            OperatorKey::RsaPem(_) => Algorithm::RS256,
        }
    }

    fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        match self {
            OperatorKey::Hmac(secret) => Ok(DecodingKey::from_secret(secret.as_bytes())),
            OperatorKey::RsaPem(pem) => {
                DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| AuthError::Key(e.to_string()))
            }
        }
    }
}

/// Operator token settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Verification key; `None` leaves operator actions open.
    pub key: Option<OperatorKey>,
    /// Required `iss`, if any.
    pub issuer: Option<String>,
    /// Required `aud`, if any.
    pub audience: Option<String>,
    /// Accept expired tokens. Local setups only.
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Settings for a shared HS256 secret.
    pub fn hmac(secret: impl Into<String>) -> Self {
        Self { key: Some(OperatorKey::Hmac(secret.into())), ..Self::default() }
    }

    /// Read `IOT_OPERATOR_*` variables. A public key wins over a secret.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let key = var("IOT_OPERATOR_PUBLIC_KEY_PEM")
            .map(OperatorKey::RsaPem)
            .or_else(|| var("IOT_OPERATOR_SECRET").map(OperatorKey::Hmac));
        Self {
            key,
            issuer: var("IOT_OPERATOR_ISSUER"),
            audience: var("IOT_OPERATOR_AUDIENCE"),
            skip_expiry: var("IOT_OPERATOR_SKIP_EXPIRY")
                .map_or(false, |v| matches!(v.trim(), "1" | "true")),
        }
    }

    /// Is the operator gate closed?
    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims.clear();
        validation.leeway = 0;
        validation.validate_exp = !self.skip_expiry;
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

/// Claims read from an operator token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorClaims {
    /// Operator name.
    pub sub: String,
    /// Expiry, unix seconds; 0 when absent.
    #[serde(default)]
    pub exp: u64,
    /// Issue time, unix seconds.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience, a string or a list.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

impl OperatorClaims {
    /// Name recorded as proposer or voter.
    pub fn operator(&self) -> &str {
        &self.sub
    }
}

/// Why an operator token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No key configured, so there is nothing to check against.
    #[error("operator authentication not configured")]
    NotConfigured,
    /// Operator action without a token.
    #[error("operator token required")]
    MissingToken,
    /// Not a JWT.
    #[error("malformed operator token")]
    Malformed,
    /// Signed with another key.
    #[error("operator token signature mismatch")]
    BadSignature,
    /// Past `exp`.
    #[error("operator token expired")]
    Expired,
    /// `iss` differs from the configured issuer.
    #[error("operator token has the wrong issuer")]
    WrongIssuer,
    /// `aud` differs from the configured audience.
    #[error("operator token has the wrong audience")]
    WrongAudience,
    /// Empty `sub`.
    #[error("operator token names no operator")]
    NoOperator,
    /// Configured key is unusable.
    #[error("operator key unusable: {0}")]
    Key(String),
    /// Any other decoding failure.
    #[error("operator token rejected: {0}")]
    Rejected(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
            ErrorKind::InvalidAudience => AuthError::WrongAudience,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::Malformed,
            _ => AuthError::Rejected(err.to_string()),
        }
    }
}

/// Check an operator token against `config`.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<OperatorClaims, AuthError> {
    let key = config.key.as_ref().ok_or(AuthError::NotConfigured)?;
    let validation = config.validation(key.algorithm());
    let claims = decode::<OperatorClaims>(token, &key.decoding_key()?, &validation)?.claims;
    if claims.sub.trim().is_empty() {
        return Err(AuthError::NoOperator);
    }
    Ok(claims)
}

/// Gate an operator action.
///
/// `Ok(None)` means the gate is open. With a key configured a token is
/// required and its claims are returned.
pub fn authorize_operator(
    token: Option<&str>,
    config: &AuthConfig,
) -> Result<Option<OperatorClaims>, AuthError> {
    if !config.is_configured() {
        return Ok(None);
    }
    let token = token.ok_or(AuthError::MissingToken)?;
    validate_token(token, config).map(Some)
}
