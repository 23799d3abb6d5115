//! Node-to-node authentication tokens.
//!
//! A subscribing node proves its identity with a short-lived token signed by
//! its Ed25519 node key and addressed to one specific peer. A fresh token is
//! minted for every call.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshlog_core::{codec, NodeId, NodeKeypair, NodePublicKey, NodeSignature};

use crate::error::{Result, SyncError};

/// Metadata key the token is sent under.
pub const AUTHORIZATION_METADATA_KEY: &str = "authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub issuer: NodeId,
    pub audience: NodeId,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Signed claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub claims: TokenClaims,
    pub signature: NodeSignature,
}

impl AuthToken {
    /// Encode as `hex(cbor(claims)).hex(signature)`.
    pub fn encode(&self) -> Result<String> {
        let claims = codec::encode(&self.claims)?;
        Ok(format!(
            "{}.{}",
            hex::encode(claims),
            hex::encode(self.signature.as_bytes())
        ))
    }

    pub fn decode(value: &str) -> Result<Self> {
        let (claims, signature) = value
            .split_once('.')
            .ok_or_else(|| SyncError::Auth("malformed token".into()))?;
        let claims = hex::decode(claims).map_err(|e| SyncError::Auth(e.to_string()))?;
        let signature = hex::decode(signature).map_err(|e| SyncError::Auth(e.to_string()))?;
        Ok(Self {
            claims: codec::decode(&claims)?,
            signature: NodeSignature::from_slice(&signature)?,
        })
    }

    /// Check the signature, the audience, and expiry at `now_ms`.
    pub fn verify(&self, issuer_key: &NodePublicKey, audience: NodeId, now_ms: i64) -> Result<()> {
        if self.claims.audience != audience {
            return Err(SyncError::Auth(format!(
                "token is for node {}, not {}",
                self.claims.audience, audience
            )));
        }
        if now_ms >= self.claims.expires_at_ms {
            return Err(SyncError::Auth("token expired".into()));
        }
        let message = codec::encode(&self.claims)?;
        issuer_key
            .verify(&message, &self.signature)
            .map_err(|e| SyncError::Auth(e.to_string()))
    }
}

/// Issues tokens addressed to a target node.
pub trait TokenFactory: Send + Sync {
    fn create_token(&self, audience: NodeId) -> Result<AuthToken>;
}

/// Signs tokens with this node's identity key.
pub struct NodeTokenFactory {
    node_id: NodeId,
    keypair: NodeKeypair,
    ttl: Duration,
}

impl NodeTokenFactory {
    pub fn new(node_id: NodeId, keypair: NodeKeypair, ttl: Duration) -> Self {
        Self {
            node_id,
            keypair,
            ttl,
        }
    }
}

impl TokenFactory for NodeTokenFactory {
    fn create_token(&self, audience: NodeId) -> Result<AuthToken> {
        let now = now_millis();
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            issuer: self.node_id,
            audience,
            issued_at_ms: now,
            expires_at_ms: now.saturating_add(ttl_ms),
        };
        let signature = self.keypair.sign(&codec::encode(&claims)?);
        Ok(AuthToken { claims, signature })
    }
}

/// Attaches a freshly signed token to every call made to one peer.
#[derive(Clone)]
pub struct AuthInterceptor {
    factory: Arc<dyn TokenFactory>,
    target: NodeId,
}

impl AuthInterceptor {
    pub fn new(factory: Arc<dyn TokenFactory>, target: NodeId) -> Self {
        Self { factory, target }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Value for the [`AUTHORIZATION_METADATA_KEY`] header of the next call.
    pub fn authorization(&self) -> Result<String> {
        self.factory.create_token(self.target)?.encode()
    }
}

pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
