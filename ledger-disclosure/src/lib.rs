//! Disclosure policy catalog, metric compute, Merkle commitment, statement
//! signing and anchoring.
//!
//! A disclosure takes one named [`policy::DisclosurePolicy`], a period, and
//! the ledger's event log, and produces a signed [`statement::SignedStatement`]
//! whose commitments are anchored externally and whose publication is itself
//! appended to the chain as a `DisclosurePublished` event. See
//! [`publisher::publish`] for the end-to-end flow.

pub mod anchor;
pub mod commitment;
pub mod compute;
pub mod policy;
pub mod publisher;
pub mod run_store;
pub mod statement;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DisclosureError {
    #[error("group_by dimension '{0}' is not permitted by this policy")]
    GroupByNotAllowed(String),
    #[error("period_end {period_end} is inside the policy's {delay_days}-day settlement delay")]
    PeriodTooRecent {
        period_end: DateTime<Utc>,
        delay_days: i64,
    },
    #[error("this policy's proof_level does not expose per-metric proofs")]
    ProofLevelGated,
    #[error("unknown policy id '{0}'")]
    UnknownPolicy(String),
    #[error("event hash '{0}' is not valid hex-encoded SHA-256")]
    MalformedEventHash(String),
    #[error("anchor backend unavailable: {0}")]
    AnchorUnavailable(String),
    #[error("anchor write timed out")]
    ExternalTimeout,
    #[error("disclosure run not found for id {0}")]
    RunNotFound(Uuid),
    #[error("disclosure run record store error: {0}")]
    RunStore(String),
    #[error("canonicalization failed: {0}")]
    Codec(#[from] ledger_codec::CodecError),
    #[error("signing or verification failed: {0}")]
    Crypto(#[from] ledger_crypto::CryptoError),
    #[error("ledger store error: {0}")]
    Store(#[from] ledger_store::StoreError),
    #[error("projection replay failed: {0}")]
    Projection(#[from] ledger_projection::ProjectionError),
    #[error("merkle tree error: {0}")]
    Merkle(#[from] ledger_merkle::MerkleError),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub use anchor::{anchor_write, AnchorClient, AnchorWriteResult, FakeAnchorClient};
pub use commitment::{build_details_root, build_leaves, build_summary_commitment, Leaf};
pub use compute::{compute_disclosure, ComputeInput, ComputeOutput, GroupedRow};
pub use policy::{get_policy, DisclosurePolicy};
pub use publisher::{publish, DisclosureRun, PublishRequest};
pub use run_store::{load_run, store_run, DetailIndexEntry, StoredRun};
pub use statement::{sign_statement, DisclosureStatement, SignedStatement};
