//! Role-keyed Ed25519 signing and the reveal-token MAC.
//!
//! Three roles — agent, human, auditor — each own one Ed25519 keypair seeded
//! once at process start. The reveal-token MAC key is a *separate* secret:
//! it is never derived from or equal to any role's signing seed.

use std::collections::BTreeMap;
use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signing seed must be exactly 32 bytes, got {0}")]
    InvalidSeedLength(usize),
    #[error("public key bytes did not decode to a valid Ed25519 point")]
    InvalidPublicKey,
    #[error("signature bytes were malformed")]
    InvalidSignature,
    #[error("no key registered for role {0}")]
    UnknownRole(Role),
    #[error("MAC key must be at least 16 bytes, got {0}")]
    MacKeyTooShort(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Human,
    Auditor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Agent => "agent",
            Role::Human => "human",
            Role::Auditor => "auditor",
        };
        f.write_str(s)
    }
}

/// Fixed `actor.type` → signing role mapping: agent/system sign as agent,
/// human as human, auditor as auditor. Unknown actor types are rejected by
/// the event schema layer before reaching here.
pub fn required_role_for_actor(actor_type: &str) -> Option<Role> {
    match actor_type {
        "agent" | "system" => Some(Role::Agent),
        "human" => Some(Role::Human),
        "auditor" => Some(Role::Auditor),
        _ => None,
    }
}

pub struct RoleKeyPair {
    pub role: Role,
    pub key_id: String,
    signing_key: SigningKey,
}

impl RoleKeyPair {
    pub fn from_seed(role: Role, seed: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| CryptoError::InvalidSeedLength(seed.len()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let key_id = ledger_codec::sha256_hex(signing_key.verifying_key().as_bytes())[..16].to_string();
        Ok(Self {
            role,
            key_id,
            signing_key,
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_b64(&self) -> String {
        base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            self.verifying_key().as_bytes(),
        )
    }

    pub fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.signing_key.sign(bytes).to_bytes().to_vec()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub key_id: String,
    pub algorithm: String,
    pub public_key_b64: String,
}

/// Process-global, read-only-after-init registry of the three role keypairs.
pub struct KeyRegistry {
    keys: BTreeMap<Role, RoleKeyPair>,
}

impl KeyRegistry {
    pub fn from_seeds(
        agent_seed: &[u8],
        human_seed: &[u8],
        auditor_seed: &[u8],
    ) -> Result<Self, CryptoError> {
        let mut keys = BTreeMap::new();
        keys.insert(Role::Agent, RoleKeyPair::from_seed(Role::Agent, agent_seed)?);
        keys.insert(Role::Human, RoleKeyPair::from_seed(Role::Human, human_seed)?);
        keys.insert(
            Role::Auditor,
            RoleKeyPair::from_seed(Role::Auditor, auditor_seed)?,
        );
        Ok(Self { keys })
    }

    pub fn key(&self, role: Role) -> Result<&RoleKeyPair, CryptoError> {
        self.keys.get(&role).ok_or(CryptoError::UnknownRole(role))
    }

    pub fn sign(&self, role: Role, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.key(role)?.sign(bytes))
    }

    pub fn verify(
        verifying_key_bytes: &[u8],
        bytes: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let key_bytes: [u8; 32] = verifying_key_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        Ok(verifying_key.verify(bytes, &signature).is_ok())
    }

    pub fn verify_with_role(
        &self,
        role: Role,
        bytes: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let key = self.key(role)?;
        Self::verify(key.verifying_key().as_bytes(), bytes, signature)
    }

    pub fn public_manifest(&self) -> BTreeMap<String, PublicKeyInfo> {
        self.keys
            .values()
            .map(|k| {
                (
                    k.role.to_string(),
                    PublicKeyInfo {
                        key_id: k.key_id.clone(),
                        algorithm: "Ed25519".to_string(),
                        public_key_b64: k.public_key_b64(),
                    },
                )
            })
            .collect()
    }
}

type HmacSha256 = Hmac<Sha256>;

/// The reveal-token MAC key. Constructed from a process secret distinct from
/// any role's signing seed (see `reveal_mac_secret` in `ledger-settings`).
pub struct MacKey {
    secret: Vec<u8>,
}

impl MacKey {
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() < 16 {
            return Err(CryptoError::MacKeyTooShort(secret.len()));
        }
        Ok(Self {
            secret: secret.to_vec(),
        })
    }

    pub fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(bytes);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn verify(&self, bytes: &[u8], tag: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(bytes);
        mac.verify_slice(tag).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let registry = KeyRegistry::from_seeds(&seed(1), &seed(2), &seed(3)).unwrap();
        let payload = ledger_codec::to_canonical_bytes(&json!({"a": 1, "b": "ok"})).unwrap();
        let sig = registry.sign(Role::Agent, &payload).unwrap();
        assert!(registry
            .verify_with_role(Role::Agent, &payload, &sig)
            .unwrap());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let registry = KeyRegistry::from_seeds(&seed(1), &seed(2), &seed(3)).unwrap();
        let payload = ledger_codec::to_canonical_bytes(&json!({"a": 1, "b": "ok"})).unwrap();
        let sig = registry.sign(Role::Agent, &payload).unwrap();
        let tampered = ledger_codec::to_canonical_bytes(&json!({"a": 2, "b": "ok"})).unwrap();
        assert!(!registry
            .verify_with_role(Role::Agent, &tampered, &sig)
            .unwrap());
    }

    #[test]
    fn mac_key_rejects_tampered_body() {
        let mac_key = MacKey::new(b"reveal-process-secret-not-a-signing-seed").unwrap();
        let tag = mac_key.sign(b"claims-body");
        assert!(mac_key.verify(b"claims-body", &tag));
        assert!(!mac_key.verify(b"other-body", &tag));
    }

    #[test]
    fn required_role_mapping_is_fixed() {
        assert_eq!(required_role_for_actor("agent"), Some(Role::Agent));
        assert_eq!(required_role_for_actor("system"), Some(Role::Agent));
        assert_eq!(required_role_for_actor("human"), Some(Role::Human));
        assert_eq!(required_role_for_actor("auditor"), Some(Role::Auditor));
        assert_eq!(required_role_for_actor("bogus"), None);
    }
}
