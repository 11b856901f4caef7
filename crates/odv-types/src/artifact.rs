//! The cross-process signature-collection artifact.
//!
//! Cooperating signers never share memory; they exchange this artifact
//! over any transport (file, queue, direct call) and merge copies
//! idempotently. The merge is associative and commutative over the
//! collected signature set, so delivery order and duplication do not
//! matter.

use crate::common::{KeyHash, SignatureBytes, Timestamp, VerificationKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
	#[error("Artifact bodies differ; refusing to merge")]
	BodyMismatch,

	#[error("Artifact signer groups differ; refusing to merge")]
	GroupMismatch,

	#[error("Key {0} is not a member of any required signer group")]
	UnauthorizedSigner(KeyHash),

	#[error("Key {0} already signed this body")]
	AlreadySigned(KeyHash),

	#[error("Invalid signer group {name}: {reason}")]
	InvalidGroup { name: String, reason: String },

	#[error("Artifact serialization error: {0}")]
	Serialization(String),
}

/// Signing lifecycle phase. `Draft` through `ReadySubmit` are derived
/// from collected signatures; the rest are assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPhase {
	Draft,
	PartiallySigned,
	ReadySubmit,
	Submitted,
	Confirmed,
	Failed,
}

impl std::fmt::Display for TxPhase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			TxPhase::Draft => "Draft",
			TxPhase::PartiallySigned => "PartiallySigned",
			TxPhase::ReadySubmit => "ReadySubmit",
			TxPhase::Submitted => "Submitted",
			TxPhase::Confirmed => "Confirmed",
			TxPhase::Failed => "Failed",
		};
		write!(f, "{}", name)
	}
}

/// One collected signature together with the full key that produced
/// it, so any holder of the artifact can re-verify it against the body
/// hash without separate key distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedSignature {
	#[serde(rename = "verificationKey")]
	pub verification_key: VerificationKey,
	pub signature: SignatureBytes,
}

/// A set of authorized signers with a per-group threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerGroup {
	pub name: String,
	pub threshold: u32,
	pub members: Vec<KeyHash>,
}

impl SignerGroup {
	pub fn new(name: impl Into<String>, threshold: u32, members: Vec<KeyHash>) -> Self {
		Self {
			name: name.into(),
			threshold,
			members,
		}
	}

	fn validate(&self) -> Result<(), ArtifactError> {
		if self.members.is_empty() {
			return Err(ArtifactError::InvalidGroup {
				name: self.name.clone(),
				reason: "no members".into(),
			});
		}
		if self.threshold == 0 || self.threshold as usize > self.members.len() {
			return Err(ArtifactError::InvalidGroup {
				name: self.name.clone(),
				reason: format!(
					"threshold {} outside 1..={}",
					self.threshold,
					self.members.len()
				),
			});
		}
		let unique: BTreeSet<_> = self.members.iter().collect();
		if unique.len() != self.members.len() {
			return Err(ArtifactError::InvalidGroup {
				name: self.name.clone(),
				reason: "duplicate members".into(),
			});
		}
		Ok(())
	}

	pub fn contains(&self, key: &KeyHash) -> bool {
		self.members.contains(key)
	}

	pub fn collected(&self, signatures: &BTreeMap<KeyHash, CollectedSignature>) -> usize {
		self.members
			.iter()
			.filter(|m| signatures.contains_key(m))
			.count()
	}

	pub fn is_satisfied(&self, signatures: &BTreeMap<KeyHash, CollectedSignature>) -> bool {
		self.collected(signatures) >= self.threshold as usize
	}
}

mod hex_bytes {
	use serde::{de, Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&hex::encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(deserializer)?;
		hex::decode(&s).map_err(de::Error::custom)
	}
}

/// The exchanged artifact: unsigned body bytes, required signer groups,
/// and the signatures collected so far.
///
/// The body is immutable once any signature exists; a required change
/// means discarding the artifact and rebuilding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningArtifact {
	#[serde(rename = "unsignedBodyBytes", with = "hex_bytes")]
	pub unsigned_body: Vec<u8>,
	#[serde(rename = "requiredSignerGroups")]
	pub groups: Vec<SignerGroup>,
	#[serde(rename = "collectedSignatures")]
	pub signatures: BTreeMap<KeyHash, CollectedSignature>,
	#[serde(rename = "createdAt")]
	pub created_at: Timestamp,
}

impl SigningArtifact {
	pub fn new(
		unsigned_body: Vec<u8>,
		groups: Vec<SignerGroup>,
		created_at: Timestamp,
	) -> Result<Self, ArtifactError> {
		for group in &groups {
			group.validate()?;
		}
		Ok(Self {
			unsigned_body,
			groups,
			signatures: BTreeMap::new(),
			created_at,
		})
	}

	/// SHA3-256 of the unsigned body; the exact bytes every signature
	/// must cover.
	pub fn body_hash(&self) -> [u8; 32] {
		Sha3_256::digest(&self.unsigned_body).into()
	}

	pub fn phase(&self) -> TxPhase {
		if self.signatures.is_empty() {
			TxPhase::Draft
		} else if self.is_ready() {
			TxPhase::ReadySubmit
		} else {
			TxPhase::PartiallySigned
		}
	}

	/// True once every required group has reached its threshold.
	pub fn is_ready(&self) -> bool {
		self.groups.iter().all(|g| g.is_satisfied(&self.signatures))
	}

	pub fn is_member(&self, key: &KeyHash) -> bool {
		self.groups.iter().any(|g| g.contains(key))
	}

	/// Records a signature after membership and duplicate checks. The
	/// signer's identity is derived from the embedded key, never taken
	/// from the caller. The cryptographic check against
	/// [`Self::body_hash`] happens in the orchestrator.
	pub fn add_signature(
		&mut self,
		verification_key: VerificationKey,
		signature: SignatureBytes,
	) -> Result<(), ArtifactError> {
		let key = verification_key.key_hash();
		if !self.is_member(&key) {
			return Err(ArtifactError::UnauthorizedSigner(key));
		}
		if self.signatures.contains_key(&key) {
			return Err(ArtifactError::AlreadySigned(key));
		}
		self.signatures.insert(
			key,
			CollectedSignature {
				verification_key,
				signature,
			},
		);
		Ok(())
	}

	/// Checks that another copy describes the same body and groups, the
	/// precondition for [`Self::merge`].
	pub fn ensure_compatible(&self, other: &SigningArtifact) -> Result<(), ArtifactError> {
		if self.unsigned_body != other.unsigned_body {
			return Err(ArtifactError::BodyMismatch);
		}
		if self.groups != other.groups {
			return Err(ArtifactError::GroupMismatch);
		}
		Ok(())
	}

	/// Unions another copy's signatures into this one. Re-merging the
	/// same copy is a no-op. Purely structural: a holder that received
	/// the copy over an untrusted channel re-verifies each incoming
	/// signature against [`Self::body_hash`] before merging, as the
	/// orchestrator does.
	pub fn merge(&mut self, other: &SigningArtifact) -> Result<(), ArtifactError> {
		self.ensure_compatible(other)?;
		for (key, entry) in &other.signatures {
			self.signatures.entry(*key).or_insert(*entry);
		}
		Ok(())
	}

	pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
		serde_json::to_vec(self).map_err(|e| ArtifactError::Serialization(e.to_string()))
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
		let artifact: SigningArtifact =
			serde_json::from_slice(bytes).map_err(|e| ArtifactError::Serialization(e.to_string()))?;
		for group in &artifact.groups {
			group.validate()?;
		}
		Ok(artifact)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn vkey(i: u8) -> VerificationKey {
		VerificationKey([i; 32])
	}

	fn key(i: u8) -> KeyHash {
		vkey(i).key_hash()
	}

	fn sig(i: u8) -> SignatureBytes {
		SignatureBytes([i; 64])
	}

	fn artifact(threshold: u32) -> SigningArtifact {
		SigningArtifact::new(
			b"tx-body".to_vec(),
			vec![SignerGroup::new(
				"nodes",
				threshold,
				vec![key(1), key(2), key(3)],
			)],
			1_000,
		)
		.unwrap()
	}

	#[test]
	fn encode_decode_is_identity() {
		let mut a = artifact(2);
		a.add_signature(vkey(1), sig(1)).unwrap();
		let decoded = SigningArtifact::decode(&a.encode().unwrap()).unwrap();
		assert_eq!(a, decoded);
	}

	#[test]
	fn phase_transitions_at_threshold_never_before() {
		let mut a = artifact(2);
		assert_eq!(a.phase(), TxPhase::Draft);
		a.add_signature(vkey(1), sig(1)).unwrap();
		assert_eq!(a.phase(), TxPhase::PartiallySigned);
		a.add_signature(vkey(2), sig(2)).unwrap();
		assert_eq!(a.phase(), TxPhase::ReadySubmit);
	}

	#[test]
	fn merge_of_independent_copies_collects_both_signatures() {
		let base = artifact(2);
		let mut left = base.clone();
		let mut right = base.clone();
		left.add_signature(vkey(1), sig(1)).unwrap();
		right.add_signature(vkey(2), sig(2)).unwrap();

		let mut merged_lr = left.clone();
		merged_lr.merge(&right).unwrap();
		let mut merged_rl = right.clone();
		merged_rl.merge(&left).unwrap();

		assert_eq!(merged_lr.signatures, merged_rl.signatures);
		assert_eq!(merged_lr.signatures.len(), 2);
		assert_eq!(merged_lr.phase(), TxPhase::ReadySubmit);
	}

	#[test]
	fn merge_is_idempotent() {
		let mut a = artifact(2);
		a.add_signature(vkey(1), sig(1)).unwrap();
		let copy = a.clone();
		a.merge(&copy).unwrap();
		assert_eq!(a.signatures.len(), 1);
	}

	#[test]
	fn merge_rejects_differing_bodies() {
		let mut a = artifact(2);
		let mut b = artifact(2);
		b.unsigned_body = b"other-body".to_vec();
		assert!(matches!(a.merge(&b), Err(ArtifactError::BodyMismatch)));
	}

	#[test]
	fn double_signing_is_rejected() {
		let mut a = artifact(2);
		a.add_signature(vkey(1), sig(1)).unwrap();
		assert!(matches!(
			a.add_signature(vkey(1), sig(1)),
			Err(ArtifactError::AlreadySigned(_))
		));
	}

	#[test]
	fn unauthorized_key_is_rejected() {
		let mut a = artifact(2);
		assert!(matches!(
			a.add_signature(vkey(9), sig(9)),
			Err(ArtifactError::UnauthorizedSigner(_))
		));
	}

	#[test]
	fn group_threshold_must_not_exceed_membership() {
		let result = SigningArtifact::new(
			b"tx".to_vec(),
			vec![SignerGroup::new("nodes", 4, vec![key(1), key(2)])],
			0,
		);
		assert!(matches!(result, Err(ArtifactError::InvalidGroup { .. })));
	}
}
