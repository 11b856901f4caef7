//! Rotating resource pool for transport and aggregation-state outputs.
//!
//! Prevents two local operations from targeting the same rotating
//! output and pairs a free transport with a writable agg-state slot for
//! each round. Locking here is local bookkeeping only; true mutual
//! exclusion is the ledger's job, which rejects a transaction whose
//! input is already consumed. Exhaustion is backpressure, not failure.

use dashmap::DashSet;
use odv_types::{
	AggState, AssetId, OdvError, OutputRef, Timestamp, TransportState, Utxo,
	MIN_TRANSPORT_PAIRS,
};
use tracing::{debug, warn};

/// Classified view of the oracle's rotating outputs at one snapshot.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
	pub transports: Vec<(Utxo, TransportState)>,
	pub agg_states: Vec<(Utxo, Option<AggState>)>,
}

impl PoolSnapshot {
	pub fn pair_count(&self) -> usize {
		self.transports.len().min(self.agg_states.len())
	}

	pub fn filled_transports(&self) -> impl Iterator<Item = &Utxo> {
		self.transports
			.iter()
			.filter(|(_, state)| !state.is_empty())
			.map(|(utxo, _)| utxo)
	}
}

/// A transport/agg-state pair reserved for one round.
#[derive(Debug, Clone)]
pub struct ResourcePair {
	pub transport: Utxo,
	pub agg_state: Utxo,
}

impl ResourcePair {
	pub fn references(&self) -> [OutputRef; 2] {
		[self.transport.reference, self.agg_state.reference]
	}
}

/// Pool over the oracle's transport/agg-state outputs, identified by
/// their marker assets.
pub struct ResourcePool {
	transport_asset: AssetId,
	agg_state_asset: AssetId,
	locked: DashSet<OutputRef>,
}

impl ResourcePool {
	pub fn new(transport_asset: AssetId, agg_state_asset: AssetId) -> Self {
		Self {
			transport_asset,
			agg_state_asset,
			locked: DashSet::new(),
		}
	}

	/// Classifies a ledger snapshot into the pool's two output kinds,
	/// ordered by output reference for stable selection.
	pub fn classify(&self, utxos: &[Utxo]) -> PoolSnapshot {
		let mut snapshot = PoolSnapshot::default();
		for utxo in utxos {
			if utxo.has_asset(&self.transport_asset) {
				match utxo.output.datum.as_ref().and_then(|d| d.as_transport()) {
					Some(state) => snapshot.transports.push((utxo.clone(), state.clone())),
					None => warn!(reference = %utxo.reference, "transport output without transport datum"),
				}
			} else if utxo.has_asset(&self.agg_state_asset) {
				match utxo.output.datum.as_ref().and_then(|d| d.as_agg_state()) {
					Some(state) => snapshot.agg_states.push((utxo.clone(), *state)),
					None => warn!(reference = %utxo.reference, "agg-state output without agg-state datum"),
				}
			}
		}
		snapshot.transports.sort_by_key(|(u, _)| u.reference);
		snapshot.agg_states.sort_by_key(|(u, _)| u.reference);
		snapshot
	}

	/// Reserves the lowest-indexed free transport with the
	/// lowest-indexed writable agg-state slot. The pair stays locked
	/// until [`Self::release`] or confirmation consumes it.
	///
	/// The `DashSet` insert is the reservation itself, so two tasks
	/// racing over the same snapshot cannot both win a reference; the
	/// loser moves on to the next candidate.
	pub fn select_pair(&self, utxos: &[Utxo], now: Timestamp) -> Result<ResourcePair, OdvError> {
		let snapshot = self.classify(utxos);

		for (transport, state) in &snapshot.transports {
			if !state.is_empty() || !self.locked.insert(transport.reference) {
				continue;
			}

			for (agg_state, slot) in &snapshot.agg_states {
				if writable(slot, now) && self.locked.insert(agg_state.reference) {
					debug!(
						transport = %transport.reference,
						agg_state = %agg_state.reference,
						"reserved resource pair"
					);
					return Ok(ResourcePair {
						transport: transport.clone(),
						agg_state: agg_state.clone(),
					});
				}
			}

			// No writable slot; the transport reservation must not leak.
			self.locked.remove(&transport.reference);
			return Err(OdvError::NoAvailableResource);
		}

		Err(OdvError::NoAvailableResource)
	}

	/// Releases local locks. Idempotent; releasing an unlocked
	/// reference is a no-op.
	pub fn release(&self, references: &[OutputRef]) {
		for reference in references {
			self.locked.remove(reference);
		}
	}

	pub fn is_locked(&self, reference: &OutputRef) -> bool {
		self.locked.contains(reference)
	}

	pub fn locked_count(&self) -> usize {
		self.locked.len()
	}

	/// Admission check for removing `count` pairs: only Empty/expired,
	/// unlocked pairs may go, and the pool may not drop below the
	/// minimum. Returns the pairs to consume, lowest-indexed first.
	pub fn admit_shrink(
		&self,
		utxos: &[Utxo],
		count: usize,
		now: Timestamp,
	) -> Result<Vec<ResourcePair>, OdvError> {
		let snapshot = self.classify(utxos);
		let pairs = snapshot.pair_count();

		if pairs < count + MIN_TRANSPORT_PAIRS {
			return Err(OdvError::Validation(format!(
				"removing {} of {} pairs would drop below the {}-pair minimum",
				count, pairs, MIN_TRANSPORT_PAIRS
			)));
		}

		let free_transports: Vec<&Utxo> = snapshot
			.transports
			.iter()
			.filter(|(utxo, state)| state.is_empty() && !self.locked.contains(&utxo.reference))
			.map(|(utxo, _)| utxo)
			.collect();
		let free_agg_states: Vec<&Utxo> = snapshot
			.agg_states
			.iter()
			.filter(|(utxo, state)| writable(state, now) && !self.locked.contains(&utxo.reference))
			.map(|(utxo, _)| utxo)
			.collect();

		if free_transports.len() < count || free_agg_states.len() < count {
			return Err(OdvError::ResourceBusy(format!(
				"only {} transport / {} agg-state pairs are free to remove",
				free_transports.len(),
				free_agg_states.len()
			)));
		}

		Ok(free_transports
			.into_iter()
			.zip(free_agg_states)
			.take(count)
			.map(|(transport, agg_state)| ResourcePair {
				transport: transport.clone(),
				agg_state: agg_state.clone(),
			})
			.collect())
	}
}

/// An agg-state slot is writable when uninitialized or expired; a fresh
/// slot may never be rewritten before its window elapses.
fn writable(state: &Option<AggState>, now: Timestamp) -> bool {
	match state {
		None => true,
		Some(slot) => slot.is_expired(now),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use odv_types::{Address, OracleDatum, PendingRound, PolicyId, TxId, TxOutput, Value};
	use std::collections::BTreeMap;

	fn policy() -> PolicyId {
		PolicyId([5u8; 28])
	}

	fn transport_asset() -> AssetId {
		AssetId::new(policy(), "RewardTransport")
	}

	fn agg_asset() -> AssetId {
		AssetId::new(policy(), "AggregationState")
	}

	fn pool() -> ResourcePool {
		ResourcePool::new(transport_asset(), agg_asset())
	}

	fn reference(i: u8) -> OutputRef {
		OutputRef::new(TxId([i; 32]), 0)
	}

	fn transport_utxo(i: u8, state: TransportState) -> Utxo {
		Utxo {
			reference: reference(i),
			output: TxOutput {
				address: Address::new("addr_test1contract"),
				value: Value::from_coin(2_000_000).with_asset(transport_asset(), 1),
				datum: Some(OracleDatum::Transport(state)),
			},
		}
	}

	fn agg_utxo(i: u8, state: Option<AggState>) -> Utxo {
		Utxo {
			reference: reference(i),
			output: TxOutput {
				address: Address::new("addr_test1contract"),
				value: Value::from_coin(2_000_000).with_asset(agg_asset(), 1),
				datum: Some(OracleDatum::AggState(state)),
			},
		}
	}

	fn filled_round() -> TransportState {
		TransportState::Filled(PendingRound {
			value: 100,
			feeds: BTreeMap::new(),
			timestamp: 0,
			node_reward: 10,
			fees_paid: 40,
		})
	}

	fn empty_pairs(count: u8) -> Vec<Utxo> {
		let mut utxos = Vec::new();
		for i in 0..count {
			utxos.push(transport_utxo(i, TransportState::Empty));
			utxos.push(agg_utxo(100 + i, None));
		}
		utxos
	}

	#[test]
	fn selects_lowest_indexed_free_pair() {
		let pool = pool();
		let utxos = empty_pairs(3);
		let pair = pool.select_pair(&utxos, 1_000).unwrap();
		assert_eq!(pair.transport.reference, reference(0));
		assert_eq!(pair.agg_state.reference, reference(100));
	}

	#[test]
	fn locked_pair_is_not_selected_twice() {
		let pool = pool();
		let utxos = empty_pairs(2);
		let first = pool.select_pair(&utxos, 1_000).unwrap();
		let second = pool.select_pair(&utxos, 1_000).unwrap();
		assert_ne!(first.transport.reference, second.transport.reference);
		assert_ne!(first.agg_state.reference, second.agg_state.reference);

		assert!(matches!(
			pool.select_pair(&utxos, 1_000),
			Err(OdvError::NoAvailableResource)
		));
	}

	#[test]
	fn failed_selection_leaves_no_reservation_behind() {
		let pool = pool();
		// Two free transports but a single agg-state slot: the second
		// selection must fail without keeping its transport locked.
		let utxos = vec![
			transport_utxo(0, TransportState::Empty),
			transport_utxo(1, TransportState::Empty),
			agg_utxo(100, None),
		];
		let first = pool.select_pair(&utxos, 1_000).unwrap();
		assert_eq!(first.transport.reference, reference(0));

		assert!(matches!(
			pool.select_pair(&utxos, 1_000),
			Err(OdvError::NoAvailableResource)
		));
		assert!(!pool.is_locked(&reference(1)));
		assert_eq!(pool.locked_count(), 2);
	}

	#[test]
	fn release_is_idempotent_and_frees_the_pair() {
		let pool = pool();
		let utxos = empty_pairs(1);
		let pair = pool.select_pair(&utxos, 1_000).unwrap();
		pool.release(&pair.references());
		pool.release(&pair.references());
		assert_eq!(pool.locked_count(), 0);
		assert!(pool.select_pair(&utxos, 1_000).is_ok());
	}

	#[test]
	fn fresh_agg_state_is_never_selected() {
		let pool = pool();
		let fresh = AggState {
			value: 7,
			created_at: 500,
			expiry: 2_000,
		};
		let utxos = vec![
			transport_utxo(0, TransportState::Empty),
			agg_utxo(100, Some(fresh)),
		];
		assert!(matches!(
			pool.select_pair(&utxos, 1_000),
			Err(OdvError::NoAvailableResource)
		));
		// Writable once the window elapses.
		assert!(pool.select_pair(&utxos, 2_000).is_ok());
	}

	#[test]
	fn filled_transport_is_never_selected() {
		let pool = pool();
		let utxos = vec![
			transport_utxo(0, filled_round()),
			agg_utxo(100, None),
		];
		assert!(matches!(
			pool.select_pair(&utxos, 1_000),
			Err(OdvError::NoAvailableResource)
		));
	}

	#[test]
	fn shrink_of_free_pairs_is_admitted() {
		let pool = pool();
		let utxos = empty_pairs(6);
		let removed = pool.admit_shrink(&utxos, 2, 1_000).unwrap();
		assert_eq!(removed.len(), 2);
	}

	#[test]
	fn shrink_below_minimum_is_rejected() {
		let pool = pool();
		let utxos = empty_pairs(5);
		assert!(matches!(
			pool.admit_shrink(&utxos, 2, 1_000),
			Err(OdvError::Validation(_))
		));
	}

	#[test]
	fn shrink_with_filled_pair_is_busy() {
		let pool = pool();
		// Six pairs with all but one transport filled: removing 2 must
		// report busy even though the count admits it.
		let mut utxos = vec![
			transport_utxo(0, TransportState::Empty),
			transport_utxo(1, filled_round()),
			transport_utxo(2, filled_round()),
			transport_utxo(3, filled_round()),
			transport_utxo(4, filled_round()),
			transport_utxo(5, filled_round()),
		];
		for i in 0..6u8 {
			utxos.push(agg_utxo(100 + i, None));
		}
		assert!(matches!(
			pool.admit_shrink(&utxos, 2, 1_000),
			Err(OdvError::ResourceBusy(_))
		));
	}
}
