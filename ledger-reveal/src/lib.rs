//! Selective-disclosure reveal: token issuance and single-use redemption
//! against a published disclosure's detail index.
//!
//! The MAC envelope is a transport convenience — the persisted
//! [`token::TokenRecord`] (`reveal:token:{token_id}` in the same
//! `StorageBackend` the ledger store uses) is authoritative for single-use
//! and expiry. An envelope that MAC-verifies but whose `token_id` is absent
//! from the store fails [`RevealError::NotIssued`].

pub mod reveal;
pub mod token;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RevealError {
    #[error("reveal token is malformed or failed MAC verification")]
    MalformedEnvelope,
    #[error("no reveal token issued with this id")]
    NotIssued,
    #[error("token was issued for a different disclosure")]
    ScopeMismatch,
    #[error("token has already been redeemed")]
    AlreadyUsed,
    #[error("token has expired")]
    Expired,
    #[error("requesting actor does not match the token's issued-to actor")]
    ActorMismatch,
    #[error("no detail evidence is indexed for this metric/group")]
    NoDetail,
    #[error("reveal token store error: {0}")]
    TokenStore(String),
    #[error("canonicalization failed: {0}")]
    Codec(#[from] ledger_codec::CodecError),
    #[error("signing or verification failed: {0}")]
    Crypto(#[from] ledger_crypto::CryptoError),
    #[error("ledger store error: {0}")]
    Store(#[from] ledger_store::StoreError),
    #[error("disclosure compiler error: {0}")]
    Disclosure(#[from] ledger_disclosure::DisclosureError),
    #[error("merkle tree error: {0}")]
    Merkle(#[from] ledger_merkle::MerkleError),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub use reveal::{reveal, store_token_record, RevealResponse};
pub use token::{request_token, RevealEnvelope, Subject, TokenClaims, TokenRecord};
