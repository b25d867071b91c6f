//! Credential checks for the `auth` message
//!
//! The hub only records the outcome; deciding whether a token is good is
//! up to the `Authenticator`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use vibe_core::{HubSettings, Result, TokenIdentity};

/// Result of verifying a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuthOutcome {
    pub fn granted(user_id: Option<String>, session_id: Option<String>) -> Self {
        Self {
            ok: true,
            user_id,
            session_id,
        }
    }

    pub fn denied() -> Self {
        Self::default()
    }
}

/// Verifies tokens presented in `auth` frames (allows mocking in tests)
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthOutcome>;
}

/// Fixed token table from `hub.auth_tokens`
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, TokenIdentity>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, TokenIdentity>) -> Self {
        Self { tokens }
    }

    pub fn from_settings(settings: &HubSettings) -> Self {
        Self::new(settings.auth_tokens.clone())
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: TokenIdentity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn verify(&self, token: &str) -> Result<AuthOutcome> {
        match self.tokens.get(token) {
            Some(identity) if !token.is_empty() => Ok(AuthOutcome::granted(
                identity.user_id.clone(),
                identity.session_id.clone(),
            )),
            _ => {
                debug!("Rejected unknown token");
                Ok(AuthOutcome::denied())
            }
        }
    }
}

/// Accepts every token. Development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthenticator;

#[async_trait]
impl Authenticator for AllowAllAuthenticator {
    async fn verify(&self, _token: &str) -> Result<AuthOutcome> {
        Ok(AuthOutcome::granted(None, None))
    }
}
