//! Settings and membership transitions.
//!
//! Each function maps the current on-chain settings (and reward
//! account, where membership changes resize it) to the replacement
//! datums, rejecting transitions the contract would never accept. All
//! pure; the orchestrator wraps the results into transaction bodies.

use odv_types::{KeyHash, Node, OdvError, OracleSettings, RewardAccount, Timestamp};
use std::collections::BTreeSet;
use tracing::info;

/// Outcome of a membership removal. The departed balances are set
/// aside, not folded anywhere: the orchestrator routes them to escrow
/// outputs or to the platform bucket depending on the payout policy.
#[derive(Debug, Clone)]
pub struct NodeRemoval {
	pub settings: OracleSettings,
	pub account: RewardAccount,
	/// Removed nodes still owed rewards, with the amount each is owed.
	pub departed: Vec<(Node, u64)>,
}

pub fn pause(settings: &OracleSettings, now: Timestamp) -> Result<OracleSettings, OdvError> {
	if settings.is_paused() {
		return Err(OdvError::Validation("oracle is already paused".into()));
	}
	let mut updated = settings.clone();
	updated.paused_at = Some(now);
	info!(paused_at = now, "pausing oracle");
	Ok(updated)
}

pub fn resume(settings: &OracleSettings) -> Result<OracleSettings, OdvError> {
	if !settings.is_paused() {
		return Err(OdvError::Validation("oracle is not paused".into()));
	}
	let mut updated = settings.clone();
	updated.paused_at = None;
	Ok(updated)
}

/// Appends new nodes and grows the reward account by one zeroed slot
/// each. Duplicate identities, within the batch or against the current
/// set, are refused.
pub fn add_nodes(
	settings: &OracleSettings,
	account: &RewardAccount,
	added: &[Node],
) -> Result<(OracleSettings, RewardAccount), OdvError> {
	if added.is_empty() {
		return Err(OdvError::Validation("no nodes to add".into()));
	}
	let mut updated = settings.clone();
	let mut account = account.clone();
	for node in added {
		if updated.is_member(&node.feed_key) {
			return Err(OdvError::Validation(format!(
				"node {} is already a member",
				node.feed_key
			)));
		}
		updated.nodes.push(*node);
		account.node_balances.push(0);
	}
	updated.validate()?;
	info!(added = added.len(), total = updated.nodes.len(), "adding nodes");
	Ok((updated, account))
}

/// Drops the named nodes, keeping the positional alignment between the
/// node list and the reward slots. Balances of removed nodes come out
/// as [`NodeRemoval::departed`] for the caller to route. The threshold
/// must stay satisfiable by the remaining set.
pub fn remove_nodes(
	settings: &OracleSettings,
	account: &RewardAccount,
	removed: &[KeyHash],
) -> Result<NodeRemoval, OdvError> {
	if removed.is_empty() {
		return Err(OdvError::Validation("no nodes to remove".into()));
	}
	for key in removed {
		if !settings.is_member(key) {
			return Err(OdvError::Validation(format!("node {key} is not a member")));
		}
	}
	// The same key may be named more than once; count identities.
	let removed: BTreeSet<KeyHash> = removed.iter().copied().collect();
	let remaining = settings.nodes.len() - removed.len();
	if remaining == 0 {
		return Err(OdvError::Validation(
			"cannot remove the last node".into(),
		));
	}
	if settings.signature_threshold as usize > remaining {
		return Err(OdvError::Validation(format!(
			"threshold {} unsatisfiable by {} remaining nodes",
			settings.signature_threshold, remaining
		)));
	}

	let mut updated = settings.clone();
	let mut balances = Vec::with_capacity(remaining);
	let mut departed = Vec::new();
	let mut nodes = Vec::with_capacity(remaining);
	for (node, balance) in updated.nodes.iter().zip(&account.node_balances) {
		if removed.contains(&node.feed_key) {
			if *balance > 0 {
				departed.push((*node, *balance));
			}
		} else {
			nodes.push(*node);
			balances.push(*balance);
		}
	}
	updated.nodes = nodes;
	updated.validate()?;

	info!(
		removed = removed.len(),
		owed = departed.len(),
		"removing nodes"
	);
	Ok(NodeRemoval {
		settings: updated,
		account: RewardAccount {
			platform: account.platform,
			node_balances: balances,
		},
		departed,
	})
}

/// Full settings replacement. Accrued balances follow their node
/// identity into the new set; balances of departed nodes go to the
/// platform.
pub fn replace_settings(
	current: &OracleSettings,
	account: &RewardAccount,
	replacement: OracleSettings,
) -> Result<(OracleSettings, RewardAccount), OdvError> {
	replacement.validate()?;

	let mut carried = vec![0u64; replacement.nodes.len()];
	let mut platform = account.platform;
	for (node, balance) in current.nodes.iter().zip(&account.node_balances) {
		match replacement.node_index(&node.feed_key) {
			Some(index) => carried[index] = *balance,
			None => {
				platform = platform
					.checked_add(*balance)
					.ok_or_else(|| OdvError::Validation("platform balance overflow".into()))?;
			}
		}
	}

	Ok((
		replacement,
		RewardAccount {
			platform,
			node_balances: carried,
		},
	))
}

#[cfg(test)]
mod tests {
	use super::*;
	use odv_types::{FeeConfig, SETTINGS_VERSION};

	fn key(i: u8) -> KeyHash {
		KeyHash([i; 28])
	}

	fn node(i: u8) -> Node {
		Node {
			feed_key: key(i),
			payment_key: key(i + 100),
		}
	}

	fn settings() -> OracleSettings {
		OracleSettings {
			version: SETTINGS_VERSION,
			nodes: (0..4).map(node).collect(),
			signature_threshold: 3,
			fee: FeeConfig {
				fee_token: None,
				node_fee: 100,
				platform_fee: 40,
			},
			aggregation_liveness_ms: 300_000,
			time_uncertainty_ms: 60_000,
			iqr_fence_multiplier: 150,
			paused_at: None,
		}
	}

	fn account() -> RewardAccount {
		RewardAccount {
			platform: 10,
			node_balances: vec![100, 200, 300, 400],
		}
	}

	#[test]
	fn pause_and_resume_gate_each_other() {
		let s = settings();
		let paused = pause(&s, 5_000).unwrap();
		assert_eq!(paused.paused_at, Some(5_000));
		assert!(pause(&paused, 6_000).is_err());

		let resumed = resume(&paused).unwrap();
		assert!(!resumed.is_paused());
		assert!(resume(&resumed).is_err());
	}

	#[test]
	fn add_nodes_grows_reward_slots() {
		let (s, a) = add_nodes(&settings(), &account(), &[node(8), node(9)]).unwrap();
		assert_eq!(s.nodes.len(), 6);
		assert_eq!(a.node_balances, vec![100, 200, 300, 400, 0, 0]);
	}

	#[test]
	fn add_rejects_duplicate_identity() {
		assert!(add_nodes(&settings(), &account(), &[node(0)]).is_err());
	}

	#[test]
	fn remove_sets_departed_balance_aside() {
		let removal = remove_nodes(&settings(), &account(), &[key(1)]).unwrap();
		assert_eq!(removal.settings.nodes.len(), 3);
		assert_eq!(removal.account.node_balances, vec![100, 300, 400]);
		// The platform gains nothing; the 200 owed to node 1 is handed
		// back for routing.
		assert_eq!(removal.account.platform, 10);
		assert_eq!(removal.departed, vec![(node(1), 200)]);
		assert_eq!(removal.account.total() + 200, account().total());
	}

	#[test]
	fn remove_keeps_threshold_satisfiable() {
		// Threshold 3 with 4 nodes: removing 2 leaves too few.
		assert!(remove_nodes(&settings(), &account(), &[key(0), key(1)]).is_err());
	}

	#[test]
	fn remove_counts_repeated_keys_once() {
		// The same member named five times removes one identity; the
		// remaining-count checks must see the deduplicated set.
		let removal =
			remove_nodes(&settings(), &account(), &[key(1), key(1), key(1), key(1), key(1)])
				.unwrap();
		assert_eq!(removal.settings.nodes.len(), 3);
		assert_eq!(removal.departed, vec![(node(1), 200)]);

		// Repeats do not slip past the threshold check either.
		assert!(remove_nodes(&settings(), &account(), &[key(0), key(1), key(0)]).is_err());
	}

	#[test]
	fn replace_carries_balances_by_identity() {
		let mut replacement = settings();
		// Drop node 0, keep 1-3 in a new order, add node 7.
		replacement.nodes = vec![node(3), node(1), node(2), node(7)];

		let (s, a) = replace_settings(&settings(), &account(), replacement).unwrap();
		assert_eq!(s.nodes[0].feed_key, key(3));
		assert_eq!(a.node_balances, vec![400, 200, 300, 0]);
		assert_eq!(a.platform, 110);
		assert_eq!(a.total(), account().total());
	}

	#[test]
	fn replace_rejects_invalid_settings() {
		let mut replacement = settings();
		replacement.signature_threshold = 9;
		assert!(replace_settings(&settings(), &account(), replacement).is_err());
	}
}
