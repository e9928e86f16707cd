//! Sensitive-action gate
//!
//! Any action with a real-world side effect must pass this authorization
//! boundary with a signed token before anything downstream may execute it.
//! The orchestrator itself only ever proposes; this module is the boundary
//! the execution layer is required to call.

use crate::error::OrchestrationError;
use crate::models::ProposedAction;
use crate::telemetry::digest_of;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedToken {
    pub key_id: String,
    pub signature: String,
}

#[async_trait]
pub trait ActionGate: Send + Sync {
    async fn authorize(&self, action: &ProposedAction, token: Option<&SignedToken>) -> Result<()>;
}

/// Gate verifying a keyed SHA256 signature over the canonical action.
pub struct StaticKeyGate {
    key_id: String,
    key: String,
}

impl StaticKeyGate {
    pub fn new(key_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            key: key.into(),
        }
    }

    fn signature_for(&self, action: &ProposedAction) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update(digest_of(action).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Issue a token for an action. Lives here for tooling and tests; the
    /// orchestration core never calls it.
    pub fn sign(&self, action: &ProposedAction) -> SignedToken {
        SignedToken {
            key_id: self.key_id.clone(),
            signature: self.signature_for(action),
        }
    }
}

#[async_trait]
impl ActionGate for StaticKeyGate {
    async fn authorize(&self, action: &ProposedAction, token: Option<&SignedToken>) -> Result<()> {
        if !action.requires_authorization {
            return Ok(());
        }

        let token = token.ok_or_else(|| {
            OrchestrationError::AuthorizationDenied(
                "action requires a signed token and none was supplied".into(),
            )
        })?;

        if token.key_id != self.key_id || token.signature != self.signature_for(action) {
            return Err(OrchestrationError::AuthorizationDenied(
                "signature does not match the proposed action".into(),
            ));
        }

        Ok(())
    }
}

/// Default gate for deployments with no execution layer wired up.
pub struct DenyAllGate;

#[async_trait]
impl ActionGate for DenyAllGate {
    async fn authorize(&self, action: &ProposedAction, _token: Option<&SignedToken>) -> Result<()> {
        if action.requires_authorization {
            return Err(OrchestrationError::AuthorizationDenied(
                "no execution authority is configured".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionKind;

    fn trade_action() -> ProposedAction {
        ProposedAction {
            kind: ActionKind::Buy,
            symbol: Some("NVDA".into()),
            rationale: "staged entry near support".into(),
            requires_authorization: true,
        }
    }

    #[tokio::test]
    async fn test_valid_token_passes() {
        let gate = StaticKeyGate::new("ops", "secret");
        let action = trade_action();
        let token = gate.sign(&action);
        assert!(gate.authorize(&action, Some(&token)).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_token_is_denied() {
        let gate = StaticKeyGate::new("ops", "secret");
        let err = gate.authorize(&trade_action(), None).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AuthorizationDenied(_)));
    }

    #[tokio::test]
    async fn test_token_is_bound_to_the_action() {
        let gate = StaticKeyGate::new("ops", "secret");
        let action = trade_action();
        let token = gate.sign(&action);

        let mut other = action.clone();
        other.kind = ActionKind::Sell;
        assert!(gate.authorize(&other, Some(&token)).await.is_err());
    }

    #[tokio::test]
    async fn test_hold_passes_without_token() {
        let gate = DenyAllGate;
        let action = ProposedAction {
            kind: ActionKind::Hold,
            symbol: None,
            rationale: "no change".into(),
            requires_authorization: false,
        };
        assert!(gate.authorize(&action, None).await.is_ok());
    }
}
