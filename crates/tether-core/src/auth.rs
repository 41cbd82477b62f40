//! Credential validation boundary.
//!
//! Token issuance and verification live outside this crate. The core only
//! asks a [`CredentialValidator`] whether a bearer credential is authorized
//! and which scopes it grants, then gates session creation on the answer.

use crate::error::{Result, TetherError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Outcome of validating one credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthDecision {
    pub authorized: bool,
    pub scopes: HashSet<String>,
}

impl AuthDecision {
    pub fn allow<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            authorized: true,
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Fail unless authorized with `scope` granted.
    pub fn require(&self, scope: &str) -> Result<()> {
        if !self.authorized {
            return Err(TetherError::Unauthorized);
        }
        if !self.has_scope(scope) {
            return Err(TetherError::InsufficientScope {
                scope: scope.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Decide on a raw credential (without any `Bearer ` prefix).
    async fn validate(&self, credential: &str) -> AuthDecision;
}

/// Strip an optional `Bearer ` scheme prefix.
pub fn bearer_token(credential: &str) -> &str {
    let trimmed = credential.trim();
    match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => trimmed[7..].trim_start(),
        _ => trimmed,
    }
}

/// Validate `credential` and require `scope`.
pub async fn authorize(
    validator: &dyn CredentialValidator,
    credential: &str,
    scope: &str,
) -> Result<AuthDecision> {
    let token = bearer_token(credential);
    if token.is_empty() {
        return Err(TetherError::Unauthorized);
    }
    let decision = validator.validate(token).await;
    if let Err(e) = decision.require(scope) {
        debug!("Credential rejected for scope {}: {}", scope, e);
        return Err(e);
    }
    Ok(decision)
}

/// Fixed token to scopes table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialValidator {
    tokens: HashMap<String, HashSet<String>>,
}

impl StaticCredentialValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token<I, S>(mut self, token: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens
            .insert(token.into(), scopes.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl CredentialValidator for StaticCredentialValidator {
    async fn validate(&self, credential: &str) -> AuthDecision {
        match self.tokens.get(credential) {
            Some(scopes) => AuthDecision {
                authorized: true,
                scopes: scopes.clone(),
            },
            None => AuthDecision::deny(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_prefix() {
        assert_eq!(bearer_token("Bearer abc"), "abc");
        assert_eq!(bearer_token("bearer   abc"), "abc");
        assert_eq!(bearer_token("abc"), "abc");
        assert_eq!(bearer_token("  "), "");
    }

    #[test]
    fn test_require_scope() {
        let decision = AuthDecision::allow(["a", "b"]);
        assert!(decision.require("a").is_ok());
        assert!(matches!(
            decision.require("c"),
            Err(TetherError::InsufficientScope { .. })
        ));
        assert!(matches!(
            AuthDecision::deny().require("a"),
            Err(TetherError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_static_validator() {
        let validator = StaticCredentialValidator::new().with_token("t1", ["provider:call"]);
        assert!(authorize(&validator, "Bearer t1", "provider:call").await.is_ok());
        assert!(matches!(
            authorize(&validator, "", "provider:call").await,
            Err(TetherError::Unauthorized)
        ));
        assert!(matches!(
            authorize(&validator, "t2", "provider:call").await,
            Err(TetherError::Unauthorized)
        ));
    }
}
