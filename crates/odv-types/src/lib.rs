//! Shared types for the ODV off-chain core.
//!
//! This crate defines the state model every other crate consumes: chain
//! primitives, the closed set of on-chain datum variants, signed feed
//! types, the cross-process signature-collection artifact, and the
//! workspace-wide error taxonomy. It performs no I/O.

pub mod artifact;
pub mod common;
pub mod datum;
pub mod errors;
pub mod feeds;
pub mod tx;

pub use artifact::{ArtifactError, CollectedSignature, SignerGroup, SigningArtifact, TxPhase};
pub use common::{
	Address, AssetId, KeyHash, OutputRef, PolicyId, SignatureBytes, Timestamp, TxId, Value,
	VerificationKey,
};
pub use datum::{
	AggState, FeeConfig, Node, OracleDatum, OracleSettings, PendingRound, RewardAccount,
	RewardEscrow, TransportState, TxOutput, Utxo, MIN_TRANSPORT_PAIRS, SETTINGS_VERSION,
};
pub use errors::{OdvError, Result};
pub use feeds::{ConsensusResult, FeedRejection, FeedSet, SignedFeed};
pub use tx::{Redeemer, SignedTx, TxBody};
