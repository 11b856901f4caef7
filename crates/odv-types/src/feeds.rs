//! Signed feed types and the per-round consensus result.

use crate::common::{KeyHash, SignatureBytes, Timestamp, VerificationKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single node's signed observation for one round. Ephemeral; never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedFeed {
	/// Observed value as a fixed-point integer.
	pub value: u64,
	#[serde(rename = "timestampMs")]
	pub timestamp_ms: Timestamp,
	/// Full key so the signature can be checked; identity is its hash.
	#[serde(rename = "verificationKey")]
	pub verification_key: VerificationKey,
	pub signature: SignatureBytes,
}

impl SignedFeed {
	/// Canonical bytes the feed signature covers: big-endian value then
	/// big-endian timestamp, matching on-chain verification.
	pub fn signing_payload(value: u64, timestamp_ms: Timestamp) -> [u8; 16] {
		let mut payload = [0u8; 16];
		payload[..8].copy_from_slice(&value.to_be_bytes());
		payload[8..].copy_from_slice(&timestamp_ms.to_be_bytes());
		payload
	}

	pub fn payload(&self) -> [u8; 16] {
		Self::signing_payload(self.value, self.timestamp_ms)
	}
}

/// The feed submission format: one entry per claimed node identity.
/// Map keys make duplicate identities structurally impossible.
pub type FeedSet = BTreeMap<KeyHash, SignedFeed>;

/// Why a feed was dropped from a round. Per-feed and non-aborting; only
/// a quorum loss aborts the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedRejection {
	InvalidFeedSignature,
	UnknownNode,
	/// Identity key in the map does not hash from the embedded key.
	DuplicateNode,
	StaleFeed,
	FutureFeed,
	OutOfRange,
	Outlier,
}

/// Output of a successful aggregation, consumed once by the
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
	pub value: u64,
	/// The aggregation's own reference time, not an average of inputs.
	pub timestamp_ms: Timestamp,
	pub contributors: BTreeSet<KeyHash>,
	pub outliers: BTreeSet<KeyHash>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signing_payload_is_big_endian() {
		let payload = SignedFeed::signing_payload(0x0102, 0x0304);
		assert_eq!(&payload[..8], &[0, 0, 0, 0, 0, 0, 1, 2]);
		assert_eq!(&payload[8..], &[0, 0, 0, 0, 0, 0, 3, 4]);
	}

	#[test]
	fn feed_set_roundtrips_through_json() {
		let mut feeds = FeedSet::new();
		feeds.insert(
			KeyHash([1u8; 28]),
			SignedFeed {
				value: 101,
				timestamp_ms: 1_700_000_000_000,
				verification_key: VerificationKey([2u8; 32]),
				signature: SignatureBytes([3u8; 64]),
			},
		);
		let encoded = serde_json::to_vec(&feeds).unwrap();
		let decoded: FeedSet = serde_json::from_slice(&encoded).unwrap();
		assert_eq!(feeds, decoded);
	}
}
