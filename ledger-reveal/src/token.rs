//! Reveal-token issuance: MAC-protected claims, persisted single-use state.

use chrono::{DateTime, Duration, Utc};
use ledger_crypto::MacKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RevealError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    Human,
    Auditor,
}

impl Subject {
    pub fn from_actor_type(actor_type: &str) -> Option<Self> {
        match actor_type {
            "human" => Some(Subject::Human),
            "auditor" => Some(Subject::Auditor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub jti: Uuid,
    pub subject: String,
    pub disclosure_id: Uuid,
    pub issued_to: Subject,
    #[serde(with = "ledger_codec::rfc3339")]
    pub iat: DateTime<Utc>,
    #[serde(with = "ledger_codec::rfc3339")]
    pub exp: DateTime<Utc>,
}

/// The opaque transport token: claims plus their MAC tag, base64-encoded as
/// one string so it can travel through a query param or CLI flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealEnvelope {
    pub claims: TokenClaims,
    pub mac: String,
}

impl RevealEnvelope {
    pub fn seal(claims: TokenClaims, mac_key: &MacKey) -> Result<Self, RevealError> {
        let bytes = ledger_codec::to_canonical_bytes(&claims)?;
        let mac = hex::encode(mac_key.sign(&bytes));
        Ok(Self { claims, mac })
    }

    /// MAC-verifies the envelope and returns the claims. Does not check
    /// expiry or single-use state — that's the store record's job.
    pub fn open(&self, mac_key: &MacKey) -> Result<&TokenClaims, RevealError> {
        let bytes = ledger_codec::to_canonical_bytes(&self.claims)?;
        let tag = hex::decode(&self.mac).map_err(|_| RevealError::MalformedEnvelope)?;
        if !mac_key.verify(&bytes, &tag) {
            return Err(RevealError::MalformedEnvelope);
        }
        Ok(&self.claims)
    }

    pub fn encode(&self) -> Result<String, RevealError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            bytes,
        ))
    }

    pub fn decode(token: &str) -> Result<Self, RevealError> {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, token)
            .map_err(|_| RevealError::MalformedEnvelope)?;
        let envelope: RevealEnvelope = serde_json::from_slice(&bytes)?;
        Ok(envelope)
    }
}

/// The persisted, authoritative single-use record — `reveal:token:{token_id}`
/// in the same `StorageBackend` the ledger store uses. The envelope is a
/// transport convenience; this record is what `reveal()` actually checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: Uuid,
    pub disclosure_id: Uuid,
    pub subject: String,
    pub issued_to_actor: Subject,
    #[serde(with = "ledger_codec::rfc3339")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "ledger_codec::rfc3339::option")]
    pub used_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Mints a fresh envelope plus the record that must be persisted alongside
/// it. `ttl_seconds` is `reveal_token_ttl_seconds` from settings.
pub fn request_token(
    disclosure_id: Uuid,
    subject: &str,
    issued_to_actor: Subject,
    ttl_seconds: i64,
    now: DateTime<Utc>,
    mac_key: &MacKey,
) -> Result<(RevealEnvelope, TokenRecord), RevealError> {
    let jti = Uuid::new_v4();
    let exp = now + Duration::seconds(ttl_seconds);
    let claims = TokenClaims {
        jti,
        subject: subject.to_string(),
        disclosure_id,
        issued_to: issued_to_actor,
        iat: now,
        exp,
    };
    let envelope = RevealEnvelope::seal(claims, mac_key)?;
    let record = TokenRecord {
        token_id: jti,
        disclosure_id,
        subject: subject.to_string(),
        issued_to_actor,
        expires_at: exp,
        used_at: None,
    };
    Ok((envelope, record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac_key() -> MacKey {
        MacKey::new(b"reveal-process-secret-distinct-from-signing").unwrap()
    }

    #[test]
    fn envelope_round_trips_through_base64_transport() {
        let now = Utc::now();
        let key = mac_key();
        let (envelope, record) =
            request_token(Uuid::new_v4(), "auditor-1", Subject::Auditor, 3600, now, &key).unwrap();
        let token = envelope.encode().unwrap();
        let decoded = RevealEnvelope::decode(&token).unwrap();
        let claims = decoded.open(&key).unwrap();
        assert_eq!(claims.jti, record.token_id);
        assert_eq!(claims.disclosure_id, record.disclosure_id);
    }

    #[test]
    fn tampered_envelope_fails_to_open() {
        let now = Utc::now();
        let key = mac_key();
        let (mut envelope, _) =
            request_token(Uuid::new_v4(), "auditor-1", Subject::Auditor, 3600, now, &key).unwrap();
        envelope.claims.subject = "someone-else".to_string();
        assert!(matches!(envelope.open(&key), Err(RevealError::MalformedEnvelope)));
    }
}
