//! Signing credentials and SigV4 key derivation.

use crate::error::{SignerError, SignerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

pub const ACCESS_KEY_ID_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_ENV: &str = "AWS_SESSION_TOKEN";

/// Access key pair used to sign links.
#[derive(Clone)]
pub struct SigningCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl SigningCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Attach a temporary session token, sent as `X-Amz-Security-Token`.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Use configured keys, falling back to the standard AWS environment
    /// variables for whichever are missing.
    pub fn resolve(
        access_key_id: Option<&str>,
        secret_access_key: Option<&str>,
    ) -> SignerResult<Self> {
        Self::resolve_with(access_key_id, secret_access_key, |name| {
            std::env::var(name).ok()
        })
    }

    /// Like [`resolve`](Self::resolve) with an explicit variable lookup.
    pub fn resolve_with(
        access_key_id: Option<&str>,
        secret_access_key: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> SignerResult<Self> {
        let pick = |configured: Option<&str>, var: &str| {
            configured
                .map(str::to_string)
                .or_else(|| lookup(var))
                .filter(|value| !value.trim().is_empty())
        };

        let access_key_id = pick(access_key_id, ACCESS_KEY_ID_ENV).ok_or_else(|| {
            SignerError::MissingCredentials(format!(
                "access key id not configured and {ACCESS_KEY_ID_ENV} is unset"
            ))
        })?;
        let secret_access_key = pick(secret_access_key, SECRET_ACCESS_KEY_ENV).ok_or_else(|| {
            SignerError::MissingCredentials(format!(
                "secret access key not configured and {SECRET_ACCESS_KEY_ENV} is unset"
            ))
        })?;

        let mut credentials = Self::new(access_key_id, secret_access_key);
        credentials.session_token = lookup(SESSION_TOKEN_ENV).filter(|t| !t.is_empty());
        Ok(credentials)
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Derive the per-day, per-region signing key.
    pub(crate) fn signing_key(&self, date: &str, region: &str) -> SignerResult<SigningKey> {
        let secret = format!("AWS4{}", self.secret_access_key);
        let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
        let k_region = hmac_sha256(&k_date, region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, b"s3")?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        Ok(SigningKey(k_signing))
    }
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Derived SigV4 signing key.
pub(crate) struct SigningKey(Vec<u8>);

impl SigningKey {
    /// Hex signature of a string to sign.
    pub(crate) fn sign(&self, string_to_sign: &str) -> SignerResult<String> {
        hmac_sha256(&self.0, string_to_sign.as_bytes()).map(hex::encode)
    }

    /// Constant-time check of a hex signature.
    pub(crate) fn verify(&self, string_to_sign: &str, signature_hex: &str) -> SignerResult<()> {
        let expected = hex::decode(signature_hex).map_err(|_| SignerError::VerificationFailed)?;
        let mut mac = self.mac()?;
        mac.update(string_to_sign.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| SignerError::VerificationFailed)
    }

    fn mac(&self) -> SignerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.0).map_err(|e| SignerError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey([REDACTED])")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> SignerResult<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_configured_keys_take_precedence() {
        let creds = SigningCredentials::resolve_with(
            Some("configured"),
            Some("secret"),
            env(&[(ACCESS_KEY_ID_ENV, "from-env")]),
        )
        .unwrap();
        assert_eq!(creds.access_key_id(), "configured");
        assert!(creds.session_token().is_none());
    }

    #[test]
    fn test_falls_back_to_environment() {
        let creds = SigningCredentials::resolve_with(
            None,
            None,
            env(&[
                (ACCESS_KEY_ID_ENV, "env-id"),
                (SECRET_ACCESS_KEY_ENV, "env-secret"),
                (SESSION_TOKEN_ENV, "session"),
            ]),
        )
        .unwrap();
        assert_eq!(creds.access_key_id(), "env-id");
        assert_eq!(creds.session_token(), Some("session"));
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let result =
            SigningCredentials::resolve_with(Some("id"), None, env(&[(SECRET_ACCESS_KEY_ENV, "")]));
        assert!(matches!(result, Err(SignerError::MissingCredentials(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = SigningCredentials::new("id", "very-secret").with_session_token("zzz-session");
        let debug = format!("{creds:?}");
        assert!(debug.contains("\"id\""));
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("zzz-session"));
    }

    #[test]
    fn test_sign_then_verify() {
        let key = SigningCredentials::new("id", "secret")
            .signing_key("20240101", "us-east-1")
            .unwrap();
        let signature = key.sign("payload").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(key.verify("payload", &signature).is_ok());
        assert!(key.verify("payload2", &signature).is_err());
        assert!(key.verify("payload", "not-hex").is_err());
    }
}
