//! Transaction wire format.
//!
//! The unsigned body is the exact byte sequence every signer covers;
//! cooperating signers must derive it identically, so encoding is
//! canonical CBOR over deterministic containers.

use crate::common::{AssetId, KeyHash, OutputRef, SignatureBytes, Timestamp};
use crate::datum::TxOutput;
use crate::errors::OdvError;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;

/// Contract entry point a transaction invokes. One per mutating intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Redeemer {
	Deploy,
	Aggregate,
	CalculateRewards,
	NodeCollect,
	PlatformCollect,
	Pause,
	Resume,
	Remove,
	AddNodes,
	RemoveNodes,
	UpdateSettings,
	Resize,
	MintAuth,
}

/// Unsigned transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBody {
	pub inputs: Vec<OutputRef>,
	/// Read-only inputs (settings, reference scripts); never consumed.
	pub reference_inputs: Vec<OutputRef>,
	pub outputs: Vec<TxOutput>,
	/// Net token mint per asset; negative burns.
	pub mint: BTreeMap<AssetId, i64>,
	pub validity_start: Option<Timestamp>,
	pub validity_end: Option<Timestamp>,
	pub required_signers: Vec<KeyHash>,
	pub redeemer: Redeemer,
}

impl TxBody {
	/// Canonical body bytes; the payload every collected signature
	/// covers through its SHA3-256 hash.
	pub fn to_cbor(&self) -> Result<Vec<u8>, OdvError> {
		let mut bytes = Vec::new();
		ciborium::into_writer(self, &mut bytes)
			.map_err(|e| OdvError::Serialization(e.to_string()))?;
		Ok(bytes)
	}

	pub fn from_cbor(bytes: &[u8]) -> Result<Self, OdvError> {
		ciborium::from_reader(bytes).map_err(|e| OdvError::Serialization(e.to_string()))
	}

	pub fn hash(&self) -> Result<[u8; 32], OdvError> {
		Ok(Sha3_256::digest(self.to_cbor()?).into())
	}
}

/// A body plus the signatures that authorize it, ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
	pub body_bytes: Vec<u8>,
	pub signatures: BTreeMap<KeyHash, SignatureBytes>,
}

impl SignedTx {
	pub fn to_cbor(&self) -> Result<Vec<u8>, OdvError> {
		let mut bytes = Vec::new();
		ciborium::into_writer(self, &mut bytes)
			.map_err(|e| OdvError::Serialization(e.to_string()))?;
		Ok(bytes)
	}

	pub fn from_cbor(bytes: &[u8]) -> Result<Self, OdvError> {
		ciborium::from_reader(bytes).map_err(|e| OdvError::Serialization(e.to_string()))
	}

	pub fn body(&self) -> Result<TxBody, OdvError> {
		TxBody::from_cbor(&self.body_bytes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::common::{Address, TxId, Value};

	fn body() -> TxBody {
		TxBody {
			inputs: vec![OutputRef::new(TxId([1u8; 32]), 0)],
			reference_inputs: vec![OutputRef::new(TxId([2u8; 32]), 1)],
			outputs: vec![TxOutput {
				address: Address::new("addr_test1example"),
				value: Value::from_coin(2_000_000),
				datum: None,
			}],
			mint: BTreeMap::new(),
			validity_start: Some(1_000),
			validity_end: Some(2_000),
			required_signers: vec![KeyHash([3u8; 28])],
			redeemer: Redeemer::Aggregate,
		}
	}

	#[test]
	fn body_bytes_are_stable() {
		assert_eq!(body().to_cbor().unwrap(), body().to_cbor().unwrap());
		assert_eq!(body().hash().unwrap(), body().hash().unwrap());
	}

	#[test]
	fn body_roundtrips_through_cbor() {
		let b = body();
		assert_eq!(TxBody::from_cbor(&b.to_cbor().unwrap()).unwrap(), b);
	}

	#[test]
	fn any_field_change_changes_the_hash() {
		let mut b = body();
		let original = b.hash().unwrap();
		b.validity_end = Some(2_001);
		assert_ne!(b.hash().unwrap(), original);
	}
}
