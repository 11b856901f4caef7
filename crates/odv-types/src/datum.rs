//! On-chain datum variants for the oracle contract.
//!
//! Each oracle output carries exactly one variant of [`OracleDatum`].
//! The set is closed and versioned; decoding anything else is an error,
//! never a fallback to schema inspection.

use crate::common::{Address, AssetId, KeyHash, OutputRef, Timestamp, Value};
use crate::errors::OdvError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current settings schema version. Bumped on any field-shape change;
/// decoders reject versions they do not know.
pub const SETTINGS_VERSION: u16 = 1;

/// Minimum transport/agg-state pair count a deployment may hold.
pub const MIN_TRANSPORT_PAIRS: usize = 4;

/// An oracle node: the key that signs feeds and the key that collects
/// rewards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
	pub feed_key: KeyHash,
	pub payment_key: KeyHash,
}

/// Fee parameters for a round. A `fee_token` of `None` means rewards are
/// denominated in the base currency and paid directly; `Some` routes
/// rewards through the escrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
	pub fee_token: Option<AssetId>,
	pub node_fee: u64,
	pub platform_fee: u64,
}

/// Mutable oracle settings. Exactly one instance exists per deployment
/// and only governance operations may replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleSettings {
	pub version: u16,
	pub nodes: Vec<Node>,
	pub signature_threshold: u32,
	pub fee: FeeConfig,
	/// How long an aggregation round stays fresh on chain, in ms.
	pub aggregation_liveness_ms: u64,
	/// Clock-skew bound applied to feed timestamps, in ms.
	pub time_uncertainty_ms: u64,
	/// IQR fence multiplier in percent (150 = 1.5 x IQR).
	pub iqr_fence_multiplier: u32,
	/// Set while the oracle is paused; cleared on resume.
	pub paused_at: Option<Timestamp>,
}

impl OracleSettings {
	/// Fails fast on settings no deployment should ever carry.
	pub fn validate(&self) -> Result<(), OdvError> {
		if self.version != SETTINGS_VERSION {
			return Err(OdvError::Validation(format!(
				"unsupported settings version {}",
				self.version
			)));
		}
		if self.nodes.is_empty() {
			return Err(OdvError::Validation("node set is empty".into()));
		}
		if self.signature_threshold == 0 {
			return Err(OdvError::Validation("signature threshold is zero".into()));
		}
		if self.signature_threshold as usize > self.nodes.len() {
			return Err(OdvError::Validation(format!(
				"signature threshold {} exceeds node count {}",
				self.signature_threshold,
				self.nodes.len()
			)));
		}
		let mut seen = std::collections::BTreeSet::new();
		for node in &self.nodes {
			if !seen.insert(node.feed_key) {
				return Err(OdvError::Validation(format!(
					"duplicate node identity {}",
					node.feed_key
				)));
			}
		}
		if self.iqr_fence_multiplier == 0 {
			return Err(OdvError::Validation("IQR fence multiplier is zero".into()));
		}
		if self.aggregation_liveness_ms == 0 || self.time_uncertainty_ms == 0 {
			return Err(OdvError::Validation(
				"timing parameters must be positive".into(),
			));
		}
		Ok(())
	}

	pub fn is_paused(&self) -> bool {
		self.paused_at.is_some()
	}

	pub fn is_member(&self, feed_key: &KeyHash) -> bool {
		self.nodes.iter().any(|n| &n.feed_key == feed_key)
	}

	/// Position of a node in the ordered node set, which is also its
	/// slot in the reward account balances.
	pub fn node_index(&self, feed_key: &KeyHash) -> Option<usize> {
		self.nodes.iter().position(|n| &n.feed_key == feed_key)
	}

	pub fn node_feed_keys(&self) -> impl Iterator<Item = KeyHash> + '_ {
		self.nodes.iter().map(|n| n.feed_key)
	}
}

/// Accumulated reward balances: one platform bucket plus one bucket per
/// node, positionally aligned with the settings node list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardAccount {
	pub platform: u64,
	pub node_balances: Vec<u64>,
}

impl RewardAccount {
	pub fn for_node_count(count: usize) -> Self {
		Self {
			platform: 0,
			node_balances: vec![0; count],
		}
	}

	pub fn credit_node(&mut self, index: usize, amount: u64) -> Result<(), OdvError> {
		match self.node_balances.get_mut(index) {
			Some(balance) => {
				*balance = balance.checked_add(amount).ok_or_else(|| {
					OdvError::Validation(format!("node {} reward balance overflow", index))
				})?;
				Ok(())
			}
			None => Err(OdvError::Validation(format!(
				"node index {} outside reward account of {} slots",
				index,
				self.node_balances.len()
			))),
		}
	}

	pub fn credit_platform(&mut self, amount: u64) -> Result<(), OdvError> {
		self.platform = self
			.platform
			.checked_add(amount)
			.ok_or_else(|| OdvError::Validation("platform reward balance overflow".into()))?;
		Ok(())
	}

	pub fn debit_node(&mut self, index: usize, amount: u64) -> Result<(), OdvError> {
		match self.node_balances.get_mut(index) {
			Some(balance) if *balance >= amount => {
				*balance -= amount;
				Ok(())
			}
			Some(balance) => Err(OdvError::Validation(format!(
				"node balance {} cannot cover debit {}",
				balance, amount
			))),
			None => Err(OdvError::Validation(format!(
				"node index {} outside reward account",
				index
			))),
		}
	}

	pub fn debit_platform(&mut self, amount: u64) -> Result<(), OdvError> {
		if self.platform < amount {
			return Err(OdvError::Validation(format!(
				"platform balance {} cannot cover debit {}",
				self.platform, amount
			)));
		}
		self.platform -= amount;
		Ok(())
	}

	pub fn total(&self) -> u64 {
		self.platform + self.node_balances.iter().sum::<u64>()
	}
}

/// A round committed into a transport output, awaiting reward
/// processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRound {
	/// Consensus value the round settled on.
	pub value: u64,
	/// Feed value per contributing node, sorted by node identity.
	pub feeds: BTreeMap<KeyHash, u64>,
	pub timestamp: Timestamp,
	/// Reward owed to each contributing node.
	pub node_reward: u64,
	/// Total fee amount carried into the transport by this round.
	pub fees_paid: u64,
}

/// On-chain state of a transport output. Local pool locking is
/// bookkeeping on top of this, never written to chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
	Empty,
	Filled(PendingRound),
}

impl TransportState {
	pub fn is_empty(&self) -> bool {
		matches!(self, TransportState::Empty)
	}
}

/// Aggregation-state slot contents. A slot with `expiry` in the future
/// is fresh and may not be rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggState {
	pub value: u64,
	pub created_at: Timestamp,
	pub expiry: Timestamp,
}

impl AggState {
	pub fn is_expired(&self, now: Timestamp) -> bool {
		now >= self.expiry
	}
}

/// A reward owed to a departed node, parked at the escrow contract
/// until the holder of the beneficiary key withdraws it. The escrowed
/// amount lives in the output's value, not the datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEscrow {
	/// Payment key whose signature releases the escrow.
	pub beneficiary: KeyHash,
}

/// The closed set of datum variants the oracle contract understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleDatum {
	Settings(OracleSettings),
	RewardAccount(RewardAccount),
	Transport(TransportState),
	/// `None` marks an uninitialized slot, writable like an expired one.
	AggState(Option<AggState>),
	Escrow(RewardEscrow),
}

impl OracleDatum {
	/// Canonical CBOR bytes. All cooperating signers must derive the
	/// same bytes from the same datum.
	pub fn to_cbor(&self) -> Result<Vec<u8>, OdvError> {
		let mut bytes = Vec::new();
		ciborium::into_writer(self, &mut bytes)
			.map_err(|e| OdvError::Serialization(e.to_string()))?;
		Ok(bytes)
	}

	pub fn from_cbor(bytes: &[u8]) -> Result<Self, OdvError> {
		ciborium::from_reader(bytes).map_err(|e| OdvError::Serialization(e.to_string()))
	}

	pub fn as_settings(&self) -> Option<&OracleSettings> {
		match self {
			OracleDatum::Settings(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_reward_account(&self) -> Option<&RewardAccount> {
		match self {
			OracleDatum::RewardAccount(a) => Some(a),
			_ => None,
		}
	}

	pub fn as_transport(&self) -> Option<&TransportState> {
		match self {
			OracleDatum::Transport(t) => Some(t),
			_ => None,
		}
	}

	pub fn as_agg_state(&self) -> Option<&Option<AggState>> {
		match self {
			OracleDatum::AggState(a) => Some(a),
			_ => None,
		}
	}

	pub fn as_escrow(&self) -> Option<&RewardEscrow> {
		match self {
			OracleDatum::Escrow(e) => Some(e),
			_ => None,
		}
	}
}

/// A transaction output as the core sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
	pub address: Address,
	pub value: Value,
	pub datum: Option<OracleDatum>,
}

/// An unspent output together with its ledger reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
	pub reference: OutputRef,
	pub output: TxOutput,
}

impl Utxo {
	pub fn has_asset(&self, asset: &AssetId) -> bool {
		self.output.value.asset_amount(asset) > 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::common::PolicyId;

	fn settings() -> OracleSettings {
		OracleSettings {
			version: SETTINGS_VERSION,
			nodes: (0..4u8)
				.map(|i| Node {
					feed_key: KeyHash([i; 28]),
					payment_key: KeyHash([i + 100; 28]),
				})
				.collect(),
			signature_threshold: 3,
			fee: FeeConfig {
				fee_token: Some(AssetId::new(PolicyId([1u8; 28]), "Fee")),
				node_fee: 100,
				platform_fee: 40,
			},
			aggregation_liveness_ms: 300_000,
			time_uncertainty_ms: 60_000,
			iqr_fence_multiplier: 150,
			paused_at: None,
		}
	}

	#[test]
	fn settings_validation_accepts_sane_config() {
		assert!(settings().validate().is_ok());
	}

	#[test]
	fn settings_validation_rejects_threshold_above_membership() {
		let mut s = settings();
		s.signature_threshold = 5;
		assert!(s.validate().is_err());
	}

	#[test]
	fn settings_validation_rejects_duplicate_nodes() {
		let mut s = settings();
		s.nodes.push(s.nodes[0]);
		assert!(s.validate().is_err());
	}

	#[test]
	fn datum_roundtrips_through_cbor() {
		let datum = OracleDatum::Settings(settings());
		let decoded = OracleDatum::from_cbor(&datum.to_cbor().unwrap()).unwrap();
		assert_eq!(datum, decoded);

		let datum = OracleDatum::AggState(Some(AggState {
			value: 42,
			created_at: 1_000,
			expiry: 2_000,
		}));
		let decoded = OracleDatum::from_cbor(&datum.to_cbor().unwrap()).unwrap();
		assert_eq!(datum, decoded);
	}

	#[test]
	fn reward_account_rejects_negative_balance() {
		let mut account = RewardAccount::for_node_count(2);
		account.credit_node(0, 50).unwrap();
		assert!(account.debit_node(0, 60).is_err());
		assert_eq!(account.node_balances[0], 50);
	}

	#[test]
	fn reward_account_rejects_overflowing_credit() {
		let mut account = RewardAccount::for_node_count(1);
		account.credit_node(0, u64::MAX).unwrap();
		assert!(account.credit_node(0, 1).is_err());
		assert_eq!(account.node_balances[0], u64::MAX);

		account.platform = u64::MAX;
		assert!(account.credit_platform(1).is_err());
		assert_eq!(account.platform, u64::MAX);
	}

	#[test]
	fn agg_state_expiry_is_inclusive() {
		let slot = AggState {
			value: 1,
			created_at: 0,
			expiry: 100,
		};
		assert!(!slot.is_expired(99));
		assert!(slot.is_expired(100));
	}
}
