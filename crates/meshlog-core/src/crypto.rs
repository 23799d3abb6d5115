//! Cryptographic primitives for meshlog.
//!
//! Two key families are in play:
//!
//! - **Payer keys** (secp256k1, recoverable ECDSA). Clients sign their
//!   envelopes with these; the payer's [`Address`] is always recovered from
//!   the signature and never read from plaintext.
//! - **Node keys** (Ed25519). Nodes use these to sign the auth tokens they
//!   present when subscribing to a peer.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use k256::ecdsa::{
    RecoveryId, Signature as EcdsaSignature, SigningKey as EcdsaSigningKey,
    VerifyingKey as EcdsaVerifyingKey,
};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

use crate::error::{CoreError, Result};

/// Domain prefix hashed in front of every payer-signed client envelope.
pub const PAYER_SIGNATURE_DOMAIN: &[u8] = b"meshlog-payer-v1";

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The prehash a payer signs for a given unsigned client envelope.
pub fn payer_signature_digest(unsigned_client_envelope: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(PAYER_SIGNATURE_DOMAIN);
    hasher.update(unsigned_client_envelope);
    hasher.finalize().into()
}

/// A 20-byte account address derived from a secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Last 20 bytes of keccak256 over the uncompressed key without its 0x04 prefix.
    pub fn from_public_key(key: &EcdsaVerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let hash = keccak256(&point.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&hash[12..]);
        Self(out)
    }

    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase `0x`-prefixed hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A 65-byte recoverable ECDSA signature: `r ‖ s ‖ v`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature(pub [u8; 65]);

impl RecoverableSignature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 65] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidSignature)?;
        Ok(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// Recover the signer's address from a 32-byte prehash.
    ///
    /// Accepts both raw (0/1) and Ethereum-style (27/28) recovery bytes.
    pub fn recover_address(&self, prehash: &[u8; 32]) -> Result<Address> {
        let v = match self.0[64] {
            v @ (27 | 28) => v - 27,
            v => v,
        };
        let recovery_id = RecoveryId::from_byte(v).ok_or(CoreError::InvalidSignature)?;
        let signature =
            EcdsaSignature::from_slice(&self.0[..64]).map_err(|_| CoreError::InvalidSignature)?;

        let key = EcdsaVerifyingKey::recover_from_prehash(prehash, &signature, recovery_id)
            .map_err(|_| CoreError::RecoveryFailed)?;

        Ok(Address::from_public_key(&key))
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoverableSig({}...)", &hex::encode(self.0)[..16])
    }
}

/// A secp256k1 keypair held by a paying client.
#[derive(Clone)]
pub struct PayerKeypair {
    signing_key: EcdsaSigningKey,
}

impl PayerKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: EcdsaSigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Create from a 32-byte secret scalar.
    pub fn from_secret(secret: &[u8; 32]) -> Result<Self> {
        let signing_key =
            EcdsaSigningKey::from_slice(secret).map_err(|_| CoreError::InvalidPublicKey)?;
        Ok(Self { signing_key })
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self.signing_key.verifying_key())
    }

    /// Sign an unsigned client envelope under [`PAYER_SIGNATURE_DOMAIN`].
    pub fn sign_client_envelope(&self, unsigned_client_envelope: &[u8]) -> Result<RecoverableSignature> {
        let digest = payer_signature_digest(unsigned_client_envelope);
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| CoreError::SigningFailed(e.to_string()))?;

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(RecoverableSignature(out))
    }
}

impl fmt::Debug for PayerKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayerKeypair({})", self.address())
    }
}

/// A 32-byte Ed25519 node public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePublicKey(pub [u8; 32]);

impl NodePublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &NodeSignature) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePub({})", &self.to_hex()[..16])
    }
}

/// A 64-byte Ed25519 signature made by a node key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NodeSignature(pub [u8; 64]);

impl NodeSignature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidSignature)?;
        Ok(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for NodeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeSig({}...)", &hex::encode(self.0)[..16])
    }
}

/// The Ed25519 identity keypair of a node.
#[derive(Clone)]
pub struct NodeKeypair {
    signing_key: SigningKey,
}

impl NodeKeypair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> NodePublicKey {
        NodePublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> NodeSignature {
        NodeSignature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeypair({:?})", self.public_key())
    }
}
