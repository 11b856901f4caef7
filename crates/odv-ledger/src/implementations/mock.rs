//! In-memory ledger backend.
//!
//! Applies submitted transactions to a UTXO map, so input contention
//! and duplicate submissions behave like the real ledger: the second
//! spender of an output gets `InputConsumed`, a resubmission of known
//! bytes gets `DuplicateTransaction`. Used across the workspace tests.

use crate::{LedgerError, LedgerQuery};
use async_trait::async_trait;
use odv_types::{Address, AssetId, OutputRef, SignedTx, Timestamp, TxId, TxOutput, Utxo, Value};
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
	outputs: BTreeMap<OutputRef, TxOutput>,
	consumed: BTreeSet<OutputRef>,
	known: BTreeSet<TxId>,
	seed_counter: u64,
}

pub struct MockLedger {
	state: Mutex<MockState>,
	time_ms: AtomicU64,
	transient_failures: AtomicU32,
}

impl MockLedger {
	pub fn new(time_ms: Timestamp) -> Self {
		Self {
			state: Mutex::new(MockState::default()),
			time_ms: AtomicU64::new(time_ms),
			transient_failures: AtomicU32::new(0),
		}
	}

	/// Places an output on the ledger outside any transaction, returning
	/// its reference. Seeded references are deterministic per ledger.
	pub fn seed_output(&self, output: TxOutput) -> OutputRef {
		let mut state = self.state.lock().expect("mock state poisoned");
		state.seed_counter += 1;
		let digest = Sha3_256::digest(state.seed_counter.to_be_bytes());
		let reference = OutputRef::new(TxId(digest.into()), 0);
		state.outputs.insert(reference, output);
		reference
	}

	/// Simulates a competing confirmed transaction consuming an output.
	pub fn consume_externally(&self, reference: &OutputRef) {
		let mut state = self.state.lock().expect("mock state poisoned");
		state.outputs.remove(reference);
		state.consumed.insert(*reference);
	}

	/// The next `count` backend calls fail with a transient error.
	pub fn fail_next_requests(&self, count: u32) {
		self.transient_failures.store(count, Ordering::SeqCst);
	}

	pub fn set_time(&self, time_ms: Timestamp) {
		self.time_ms.store(time_ms, Ordering::SeqCst);
	}

	pub fn advance_time(&self, delta_ms: u64) {
		self.time_ms.fetch_add(delta_ms, Ordering::SeqCst);
	}

	pub fn utxo(&self, reference: &OutputRef) -> Option<Utxo> {
		let state = self.state.lock().expect("mock state poisoned");
		state.outputs.get(reference).map(|output| Utxo {
			reference: *reference,
			output: output.clone(),
		})
	}

	fn maybe_fail(&self) -> Result<(), LedgerError> {
		let remaining = self.transient_failures.load(Ordering::SeqCst);
		if remaining > 0 {
			self.transient_failures.store(remaining - 1, Ordering::SeqCst);
			return Err(LedgerError::Transient("injected failure".into()));
		}
		Ok(())
	}
}

#[async_trait]
impl LedgerQuery for MockLedger {
	async fn outputs_at(&self, address: &Address) -> Result<Vec<Utxo>, LedgerError> {
		self.maybe_fail()?;
		let state = self.state.lock().expect("mock state poisoned");
		Ok(state
			.outputs
			.iter()
			.filter(|(_, output)| &output.address == address)
			.map(|(reference, output)| Utxo {
				reference: *reference,
				output: output.clone(),
			})
			.collect())
	}

	async fn outputs_by_asset(
		&self,
		address: &Address,
		asset: &AssetId,
	) -> Result<Vec<Utxo>, LedgerError> {
		let utxos = self.outputs_at(address).await?;
		Ok(utxos.into_iter().filter(|u| u.has_asset(asset)).collect())
	}

	async fn output_by_ref(&self, reference: &OutputRef) -> Result<Option<Utxo>, LedgerError> {
		self.maybe_fail()?;
		Ok(self.utxo(reference))
	}

	async fn current_time_ms(&self) -> Result<Timestamp, LedgerError> {
		Ok(self.time_ms.load(Ordering::SeqCst))
	}

	async fn submit(&self, signed_bytes: Vec<u8>) -> Result<TxId, LedgerError> {
		self.maybe_fail()?;
		let tx_id = TxId(Sha3_256::digest(&signed_bytes).into());

		let signed = SignedTx::from_cbor(&signed_bytes)
			.map_err(|e| LedgerError::Rejected(e.to_string()))?;
		let body = signed
			.body()
			.map_err(|e| LedgerError::Rejected(e.to_string()))?;

		let mut state = self.state.lock().expect("mock state poisoned");
		if state.known.contains(&tx_id) {
			return Err(LedgerError::DuplicateTransaction(tx_id));
		}
		for input in &body.inputs {
			if state.consumed.contains(input) || !state.outputs.contains_key(input) {
				return Err(LedgerError::InputConsumed(*input));
			}
		}

		// The ledger conserves value: inputs plus mint must equal the
		// outputs exactly, per asset and in coin.
		let mut in_coin = 0u128;
		let mut in_assets: BTreeMap<AssetId, i128> = BTreeMap::new();
		for input in &body.inputs {
			if let Some(output) = state.outputs.get(input) {
				tally(&output.value, &mut in_coin, &mut in_assets);
			}
		}
		for (asset, amount) in &body.mint {
			*in_assets.entry(asset.clone()).or_insert(0) += *amount as i128;
		}
		let mut out_coin = 0u128;
		let mut out_assets: BTreeMap<AssetId, i128> = BTreeMap::new();
		for output in &body.outputs {
			tally(&output.value, &mut out_coin, &mut out_assets);
		}
		in_assets.retain(|_, amount| *amount != 0);
		out_assets.retain(|_, amount| *amount != 0);
		if in_coin != out_coin || in_assets != out_assets {
			return Err(LedgerError::Rejected(format!(
				"value imbalance: {} coin in, {} coin out",
				in_coin, out_coin
			)));
		}

		for input in &body.inputs {
			state.outputs.remove(input);
			state.consumed.insert(*input);
		}
		for (index, output) in body.outputs.into_iter().enumerate() {
			state
				.outputs
				.insert(OutputRef::new(tx_id, index as u32), output);
		}
		state.known.insert(tx_id);
		Ok(tx_id)
	}

	async fn is_confirmed(&self, tx_id: &TxId) -> Result<bool, LedgerError> {
		let state = self.state.lock().expect("mock state poisoned");
		Ok(state.known.contains(tx_id))
	}
}

fn tally(value: &Value, coin: &mut u128, assets: &mut BTreeMap<AssetId, i128>) {
	*coin += value.coin as u128;
	for (asset, amount) in &value.assets {
		*assets.entry(asset.clone()).or_insert(0) += *amount as i128;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use odv_types::{Redeemer, TxBody, Value};

	fn tx(inputs: Vec<OutputRef>, outputs: Vec<TxOutput>) -> Vec<u8> {
		let body = TxBody {
			inputs,
			reference_inputs: vec![],
			outputs,
			mint: BTreeMap::new(),
			validity_start: None,
			validity_end: None,
			required_signers: vec![],
			redeemer: Redeemer::Aggregate,
		};
		SignedTx {
			body_bytes: body.to_cbor().unwrap(),
			signatures: BTreeMap::new(),
		}
		.to_cbor()
		.unwrap()
	}

	#[tokio::test]
	async fn spend_moves_outputs_and_blocks_double_spend() {
		let ledger = MockLedger::new(0);
		let address = Address::new("addr_test1x");
		let reference = ledger.seed_output(TxOutput {
			address: address.clone(),
			value: Value::from_coin(1_000_000),
			datum: None,
		});

		let bytes = tx(
			vec![reference],
			vec![TxOutput {
				address: address.clone(),
				value: Value::from_coin(1_000_000),
				datum: None,
			}],
		);
		let tx_id = ledger.submit(bytes).await.unwrap();
		assert!(ledger.is_confirmed(&tx_id).await.unwrap());

		// A second spend of the same input must conflict.
		let conflicting = tx(vec![reference], vec![]);
		assert!(matches!(
			ledger.submit(conflicting).await,
			Err(LedgerError::InputConsumed(_))
		));

		let at_address = ledger.outputs_at(&address).await.unwrap();
		assert_eq!(at_address.len(), 1);
		assert_eq!(at_address[0].reference, OutputRef::new(tx_id, 0));
	}

	#[tokio::test]
	async fn unbalanced_body_is_rejected() {
		let ledger = MockLedger::new(0);
		let address = Address::new("addr_test1x");
		let reference = ledger.seed_output(TxOutput {
			address: address.clone(),
			value: Value::from_coin(1_000_000),
			datum: None,
		});

		// Creates coin from nowhere.
		let inflating = tx(
			vec![reference],
			vec![TxOutput {
				address: address.clone(),
				value: Value::from_coin(2_000_000),
				datum: None,
			}],
		);
		assert!(matches!(
			ledger.submit(inflating).await,
			Err(LedgerError::Rejected(_))
		));

		// The input survives a rejected submission.
		assert!(ledger.utxo(&reference).is_some());
	}

	#[tokio::test]
	async fn mint_balances_new_tokens() {
		let ledger = MockLedger::new(0);
		let address = Address::new("addr_test1x");
		let reference = ledger.seed_output(TxOutput {
			address: address.clone(),
			value: Value::from_coin(1_000_000),
			datum: None,
		});
		let asset = AssetId::new(odv_types::PolicyId([7u8; 28]), "Marker");

		let body = TxBody {
			inputs: vec![reference],
			reference_inputs: vec![],
			outputs: vec![TxOutput {
				address: address.clone(),
				value: Value::from_coin(1_000_000).with_asset(asset.clone(), 1),
				datum: None,
			}],
			mint: [(asset, 1i64)].into_iter().collect(),
			validity_start: None,
			validity_end: None,
			required_signers: vec![],
			redeemer: Redeemer::MintAuth,
		};
		let bytes = SignedTx {
			body_bytes: body.to_cbor().unwrap(),
			signatures: BTreeMap::new(),
		}
		.to_cbor()
		.unwrap();
		assert!(ledger.submit(bytes).await.is_ok());
	}
}
