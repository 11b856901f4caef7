//! Reward accrual and collection arithmetic.
//!
//! Rounds carry their fees into transport outputs; processing folds a
//! batch of those rounds into the reward account, crediting each
//! contributing node its per-round reward and sweeping the remainder to
//! the platform bucket. Every batch conserves value: what the rounds
//! carried in is exactly what the account gains.

use odv_types::{AssetId, FeeConfig, KeyHash, OdvError, OracleSettings, PendingRound, RewardAccount};
use tracing::{debug, warn};

/// Smallest base-currency amount a payout output may carry. Anything
/// below this cannot form a valid ledger output.
pub const MIN_OUTPUT_COIN: u64 = 2_000_000;

/// How accrued rewards leave the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutPolicy {
	/// Rewards are a custom token held in escrow until collected.
	TokenEscrow(AssetId),
	/// Rewards are base currency paid straight to the payment key.
	DirectBaseCurrency,
}

impl PayoutPolicy {
	pub fn for_fee(fee: &FeeConfig) -> Self {
		match &fee.fee_token {
			Some(asset) => PayoutPolicy::TokenEscrow(asset.clone()),
			None => PayoutPolicy::DirectBaseCurrency,
		}
	}
}

/// Split of one round's carried fees between its contributors and the
/// platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSplit {
	/// Per-node reward, one entry per contributor.
	pub node_shares: Vec<(KeyHash, u64)>,
	/// Whatever the node shares leave behind, platform fee included.
	pub platform_share: u64,
}

/// Result of folding a batch of rounds into the reward account.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
	pub account: RewardAccount,
	/// Rounds actually folded; the rest wait for the next batch.
	pub processed: usize,
	/// Total fees the processed rounds carried in.
	pub total_fees: u64,
}

/// Computes reward splits and applies them to the account.
pub struct RewardCalculator {
	fee: FeeConfig,
	batch_size: usize,
}

impl RewardCalculator {
	pub fn new(fee: FeeConfig, batch_size: usize) -> Self {
		Self { fee, batch_size }
	}

	/// Fee a round must carry in: one node fee per contributor plus the
	/// platform fee.
	pub fn round_fee(&self, contributing: usize) -> Result<u64, OdvError> {
		self.fee
			.node_fee
			.checked_mul(contributing as u64)
			.and_then(|total| total.checked_add(self.fee.platform_fee))
			.ok_or_else(|| OdvError::Validation("round fee overflows".into()))
	}

	/// Splits one round's carried fees. The platform takes everything
	/// the node shares leave behind, so the split always sums to
	/// `fees_paid`.
	pub fn split_round(&self, round: &PendingRound) -> Result<RoundSplit, OdvError> {
		let node_total = round
			.node_reward
			.checked_mul(round.feeds.len() as u64)
			.ok_or_else(|| OdvError::Validation("node reward total overflows".into()))?;
		let platform_share = round.fees_paid.checked_sub(node_total).ok_or_else(|| {
			OdvError::Validation(format!(
				"round carried {} but owes {} to nodes",
				round.fees_paid, node_total
			))
		})?;
		Ok(RoundSplit {
			node_shares: round
				.feeds
				.keys()
				.map(|key| (*key, round.node_reward))
				.collect(),
			platform_share,
		})
	}

	/// Folds up to one batch of rounds into the account. Contributors
	/// that have since left the node set forfeit their share to the
	/// platform, so the batch still conserves the carried fees.
	pub fn apply_rounds(
		&self,
		settings: &OracleSettings,
		account: &RewardAccount,
		rounds: &[PendingRound],
	) -> Result<BatchOutcome, OdvError> {
		if account.node_balances.len() != settings.nodes.len() {
			return Err(OdvError::Validation(format!(
				"reward account has {} slots for {} nodes",
				account.node_balances.len(),
				settings.nodes.len()
			)));
		}

		let mut account = account.clone();
		let mut total_fees = 0u64;
		let batch = rounds.len().min(self.batch_size);

		for round in &rounds[..batch] {
			let split = self.split_round(round)?;
			let mut platform_gain = split.platform_share;
			for (feed_key, share) in &split.node_shares {
				match settings.node_index(feed_key) {
					Some(index) => account.credit_node(index, *share)?,
					None => {
						warn!(node = %feed_key, share, "contributor left the node set; share goes to platform");
						platform_gain = platform_gain.checked_add(*share).ok_or_else(|| {
							OdvError::Validation("platform share overflow".into())
						})?;
					}
				}
			}
			account.credit_platform(platform_gain)?;
			total_fees = total_fees
				.checked_add(round.fees_paid)
				.ok_or_else(|| OdvError::Validation("batch fee total overflow".into()))?;
		}

		debug!(processed = batch, total_fees, "folded reward batch");
		Ok(BatchOutcome {
			account,
			processed: batch,
			total_fees,
		})
	}
}

/// Everything a node has accrued, located by its feed key. Collection
/// always takes the full balance.
pub fn node_collect_amount(
	settings: &OracleSettings,
	account: &RewardAccount,
	feed_key: &KeyHash,
) -> Result<(usize, u64), OdvError> {
	let index = settings
		.node_index(feed_key)
		.ok_or(OdvError::UnauthorizedSigner(*feed_key))?;
	let amount = account
		.node_balances
		.get(index)
		.copied()
		.ok_or_else(|| OdvError::Validation(format!("no reward slot for node index {index}")))?;
	if amount == 0 {
		return Err(OdvError::Validation(
			"no rewards accrued for this node".into(),
		));
	}
	Ok((index, amount))
}

/// The platform's accrued balance, in full.
pub fn platform_collect_amount(account: &RewardAccount) -> Result<u64, OdvError> {
	if account.platform == 0 {
		return Err(OdvError::Validation(
			"no platform rewards accrued".into(),
		));
	}
	Ok(account.platform)
}

/// Rejects payouts too small to form a ledger output. Token-escrow
/// payouts ride on a fixed coin buffer and pass regardless of the token
/// amount.
pub fn ensure_payout_viable(policy: &PayoutPolicy, amount: u64) -> Result<(), OdvError> {
	match policy {
		PayoutPolicy::TokenEscrow(_) => Ok(()),
		PayoutPolicy::DirectBaseCurrency if amount >= MIN_OUTPUT_COIN => Ok(()),
		PayoutPolicy::DirectBaseCurrency => Err(OdvError::Validation(format!(
			"payout {amount} is below the {MIN_OUTPUT_COIN} minimum output"
		))),
	}
}
