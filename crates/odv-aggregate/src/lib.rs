//! Feed aggregation: signed observations in, one consensus value out.
//!
//! The whole pipeline is a pure function of (feeds, settings, reference
//! time). Cooperating signers run it independently and must reach
//! byte-identical results, so every step is exact integer arithmetic
//! with no floating point and no ambient state.
//!
//! Gates, in order, each shrinking the candidate pool: signature and
//! membership, freshness, admissible value range, quorum, IQR outlier
//! rejection, quorum again. Survivors yield the median.

use odv_account::verify_signature;
use odv_types::{
	ConsensusResult, FeedRejection, FeedSet, KeyHash, OdvError, OracleSettings, Timestamp,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Fewer surviving values than this and quartiles are not meaningful;
/// outlier detection is skipped entirely.
const MIN_VALUES_FOR_OUTLIERS: usize = 4;

/// Everything a round's aggregation produced: the consensus plus the
/// per-feed rejections, which are data for reporting, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationReport {
	pub consensus: ConsensusResult,
	pub rejections: Vec<(KeyHash, FeedRejection)>,
}

/// Aggregates one round of signed feeds under a settings snapshot.
pub struct FeedAggregator {
	settings: OracleSettings,
	min_value: u64,
	max_value: u64,
}

impl FeedAggregator {
	pub fn new(settings: OracleSettings) -> Self {
		Self {
			settings,
			min_value: 0,
			max_value: u64::MAX,
		}
	}

	/// Restricts the admissible feed value range; values outside it are
	/// rejected before quorum is counted.
	pub fn with_value_range(mut self, min_value: u64, max_value: u64) -> Self {
		self.min_value = min_value;
		self.max_value = max_value;
		self
	}

	/// Runs the full pipeline against `now_ms`, the aggregation's own
	/// reference time. Deterministic and side-effect-free.
	pub fn aggregate(
		&self,
		feeds: &FeedSet,
		now_ms: Timestamp,
	) -> Result<AggregationReport, OdvError> {
		let required = self.settings.signature_threshold as usize;
		let mut rejections = Vec::new();
		let mut admitted: Vec<(KeyHash, u64)> = Vec::new();

		for (node, feed) in feeds {
			if let Some(rejection) = self.screen_feed(node, feed, now_ms) {
				debug!(%node, ?rejection, "feed rejected");
				rejections.push((*node, rejection));
				continue;
			}
			admitted.push((*node, feed.value));
		}

		if admitted.len() < required {
			return Err(OdvError::InsufficientQuorum {
				collected: admitted.len(),
				required,
			});
		}

		let outlier_nodes = detect_outliers(&admitted, self.settings.iqr_fence_multiplier);
		for node in &outlier_nodes {
			rejections.push((*node, FeedRejection::Outlier));
		}

		let survivors: Vec<(KeyHash, u64)> = admitted
			.into_iter()
			.filter(|(node, _)| !outlier_nodes.contains(node))
			.collect();

		if survivors.len() < required {
			return Err(OdvError::InsufficientQuorum {
				collected: survivors.len(),
				required,
			});
		}

		let mut values: Vec<u64> = survivors.iter().map(|(_, v)| *v).collect();
		values.sort_unstable();
		let value = median(&values);

		let contributors: BTreeSet<KeyHash> = survivors.iter().map(|(n, _)| *n).collect();
		info!(
			value,
			contributors = contributors.len(),
			outliers = outlier_nodes.len(),
			"consensus reached"
		);

		Ok(AggregationReport {
			consensus: ConsensusResult {
				value,
				timestamp_ms: now_ms,
				contributors,
				outliers: outlier_nodes,
			},
			rejections,
		})
	}

	fn screen_feed(
		&self,
		node: &KeyHash,
		feed: &odv_types::SignedFeed,
		now_ms: Timestamp,
	) -> Option<FeedRejection> {
		// The map key is the claimed identity; it must be the hash of
		// the key that actually signed.
		if feed.verification_key.key_hash() != *node {
			return Some(FeedRejection::DuplicateNode);
		}
		if !self.settings.is_member(node) {
			return Some(FeedRejection::UnknownNode);
		}
		if !verify_signature(&feed.verification_key, &feed.payload(), &feed.signature) {
			return Some(FeedRejection::InvalidFeedSignature);
		}

		// Saturating bounds: a hostile timestamp near u64::MAX must land
		// in FutureFeed, not wrap.
		let window = self.settings.time_uncertainty_ms;
		if feed.timestamp_ms.saturating_add(window) < now_ms {
			return Some(FeedRejection::StaleFeed);
		}
		if feed.timestamp_ms > now_ms.saturating_add(window) {
			return Some(FeedRejection::FutureFeed);
		}

		if feed.value < self.min_value || feed.value > self.max_value {
			return Some(FeedRejection::OutOfRange);
		}

		None
	}
}

/// Interpolated quartile at `quarter`/4 of the sorted range, scaled by
/// 4 so the result stays exact in integers.
fn quartile_x4(sorted: &[u64], quarter: u64) -> i128 {
	let n = sorted.len() as u64;
	let pos = (n - 1) * quarter;
	let base = (pos / 4) as usize;
	let frac = (pos % 4) as i128;
	let low = sorted[base] as i128;
	let high = sorted.get(base + 1).map(|v| *v as i128).unwrap_or(low);
	low * (4 - frac) + high * frac
}

/// IQR fence check over the admitted values. `multiplier` is in
/// percent (150 = 1.5 x IQR). All comparisons run at x400 scale so the
/// interpolated quartiles and the percent multiplier stay exact.
fn detect_outliers(admitted: &[(KeyHash, u64)], multiplier: u32) -> BTreeSet<KeyHash> {
	if admitted.len() < MIN_VALUES_FOR_OUTLIERS {
		return BTreeSet::new();
	}

	let mut sorted: Vec<u64> = admitted.iter().map(|(_, v)| *v).collect();
	sorted.sort_unstable();

	let q1_x4 = quartile_x4(&sorted, 1);
	let q3_x4 = quartile_x4(&sorted, 3);
	let iqr_x4 = q3_x4 - q1_x4;
	let fence_x400 = iqr_x4 * multiplier as i128;

	let lower_x400 = q1_x4 * 100 - fence_x400;
	let upper_x400 = q3_x4 * 100 + fence_x400;

	admitted
		.iter()
		.filter(|(_, value)| {
			let scaled = *value as i128 * 400;
			scaled < lower_x400 || scaled > upper_x400
		})
		.map(|(node, _)| *node)
		.collect()
}

/// Median of a sorted slice; an even count takes the floor of the mean
/// of the two middle values, keeping the result integer-exact.
fn median(sorted: &[u64]) -> u64 {
	let n = sorted.len();
	if n % 2 == 1 {
		sorted[n / 2]
	} else {
		let a = sorted[n / 2 - 1] as u128;
		let b = sorted[n / 2] as u128;
		((a + b) / 2) as u64
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use odv_account::FeedSigner;
	use odv_types::{FeeConfig, Node, SignedFeed, SETTINGS_VERSION};

	const NOW: Timestamp = 1_700_000_000_000;

	fn signers(count: usize) -> Vec<FeedSigner> {
		(0..count as u8)
			.map(|i| FeedSigner::from_seed([i + 1; 32]))
			.collect()
	}

	fn settings_for(signers: &[FeedSigner], threshold: u32) -> OracleSettings {
		OracleSettings {
			version: SETTINGS_VERSION,
			nodes: signers
				.iter()
				.map(|s| Node {
					feed_key: s.key_hash(),
					payment_key: s.key_hash(),
				})
				.collect(),
			signature_threshold: threshold,
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

	fn feed_set(signers: &[FeedSigner], values: &[u64]) -> FeedSet {
		signers
			.iter()
			.zip(values)
			.map(|(s, v)| (s.key_hash(), s.sign_feed(*v, NOW)))
			.collect()
	}

	#[test]
	fn three_clustered_values_reach_their_median() {
		let signers = signers(3);
		let aggregator = FeedAggregator::new(settings_for(&signers, 3));
		let report = aggregator
			.aggregate(&feed_set(&signers, &[100, 101, 102]), NOW)
			.unwrap();
		assert_eq!(report.consensus.value, 101);
		assert!(report.consensus.outliers.is_empty());
		assert!(report.rejections.is_empty());
		assert_eq!(report.consensus.timestamp_ms, NOW);
	}

	#[test]
	fn aggregation_is_deterministic() {
		let signers = signers(5);
		let aggregator = FeedAggregator::new(settings_for(&signers, 3));
		let feeds = feed_set(&signers, &[100, 104, 101, 103, 102]);
		let first = aggregator.aggregate(&feeds, NOW).unwrap();
		let second = aggregator.aggregate(&feeds, NOW).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn below_threshold_fails_quorum() {
		let signers = signers(3);
		let aggregator = FeedAggregator::new(settings_for(&signers, 3));
		let feeds = feed_set(&signers[..2], &[100, 101]);
		assert!(matches!(
			aggregator.aggregate(&feeds, NOW),
			Err(OdvError::InsufficientQuorum {
				collected: 2,
				required: 3
			})
		));
	}

	#[test]
	fn far_outlier_is_excluded_and_quorum_still_holds() {
		let signers = signers(4);
		let aggregator = FeedAggregator::new(settings_for(&signers, 3));
		let report = aggregator
			.aggregate(&feed_set(&signers, &[100, 101, 102, 10_000]), NOW)
			.unwrap();
		assert_eq!(report.consensus.value, 101);
		assert_eq!(report.consensus.outliers.len(), 1);
		assert!(report.consensus.outliers.contains(&signers[3].key_hash()));
		assert_eq!(report.consensus.contributors.len(), 3);
	}

	#[test]
	fn outlier_loss_below_threshold_fails_quorum() {
		let signers = signers(4);
		let aggregator = FeedAggregator::new(settings_for(&signers, 4));
		let result = aggregator.aggregate(&feed_set(&signers, &[100, 101, 102, 10_000]), NOW);
		assert!(matches!(
			result,
			Err(OdvError::InsufficientQuorum {
				collected: 3,
				required: 4
			})
		));
	}

	#[test]
	fn even_count_takes_floor_of_middle_mean() {
		let signers = signers(4);
		// Wide enough that nothing is fenced: IQR is large relative to spread.
		let aggregator = FeedAggregator::new(settings_for(&signers, 4));
		let report = aggregator
			.aggregate(&feed_set(&signers, &[100, 101, 102, 103]), NOW)
			.unwrap();
		assert_eq!(report.consensus.value, 101); // floor((101 + 102) / 2)
	}

	#[test]
	fn stale_and_future_feeds_are_dropped() {
		let signers = signers(4);
		let aggregator = FeedAggregator::new(settings_for(&signers, 3));
		let mut feeds = feed_set(&signers[..3], &[100, 101, 102]);
		// 61s old against a 60s uncertainty bound.
		feeds.insert(
			signers[3].key_hash(),
			signers[3].sign_feed(500, NOW - 61_000),
		);
		let report = aggregator.aggregate(&feeds, NOW).unwrap();
		assert_eq!(report.consensus.value, 101);
		assert!(report
			.rejections
			.contains(&(signers[3].key_hash(), FeedRejection::StaleFeed)));
	}

	#[test]
	fn extreme_timestamp_is_rejected_as_future_not_a_panic() {
		let signers = signers(4);
		let aggregator = FeedAggregator::new(settings_for(&signers, 3));
		let mut feeds = feed_set(&signers[..3], &[100, 101, 102]);
		// Validly signed, but claiming a timestamp at the end of time.
		feeds.insert(
			signers[3].key_hash(),
			signers[3].sign_feed(500, u64::MAX),
		);
		let report = aggregator.aggregate(&feeds, NOW).unwrap();
		assert_eq!(report.consensus.value, 101);
		assert!(report
			.rejections
			.contains(&(signers[3].key_hash(), FeedRejection::FutureFeed)));
	}

	#[test]
	fn invalid_signature_and_unknown_node_shrink_the_pool() {
		let signers = signers(3);
		let outsider = FeedSigner::from_seed([99u8; 32]);
		let aggregator = FeedAggregator::new(settings_for(&signers, 3));

		let mut feeds = feed_set(&signers, &[100, 101, 102]);
		feeds.insert(outsider.key_hash(), outsider.sign_feed(101, NOW));
		let report = aggregator.aggregate(&feeds, NOW).unwrap();
		assert!(report
			.rejections
			.contains(&(outsider.key_hash(), FeedRejection::UnknownNode)));

		// Tamper with one member's value after signing.
		let mut feeds = feed_set(&signers, &[100, 101, 102]);
		if let Some(feed) = feeds.get_mut(&signers[0].key_hash()) {
			feed.value = 105;
		}
		let result = aggregator.aggregate(&feeds, NOW);
		assert!(matches!(result, Err(OdvError::InsufficientQuorum { .. })));
	}

	#[test]
	fn mismatched_identity_is_rejected() {
		let signers = signers(3);
		let aggregator = FeedAggregator::new(settings_for(&signers, 2));
		let mut feeds = feed_set(&signers[..2], &[100, 101]);
		// Claim node 2's identity with node 0's signed feed.
		feeds.insert(signers[2].key_hash(), signers[0].sign_feed(102, NOW));
		let report = aggregator.aggregate(&feeds, NOW).unwrap();
		assert!(report
			.rejections
			.contains(&(signers[2].key_hash(), FeedRejection::DuplicateNode)));
	}

	#[test]
	fn out_of_range_values_are_rejected_before_quorum() {
		let signers = signers(3);
		let aggregator =
			FeedAggregator::new(settings_for(&signers, 3)).with_value_range(50, 1_000);
		let result = aggregator.aggregate(&feed_set(&signers, &[100, 101, 2_000]), NOW);
		assert!(matches!(result, Err(OdvError::InsufficientQuorum { .. })));
	}

	#[test]
	fn interpolated_quartiles_are_exact() {
		// [10, 20, 30, 40]: Q1 at rank 0.75 = 17.5, Q3 at rank 2.25 = 32.5.
		let sorted = [10, 20, 30, 40];
		assert_eq!(quartile_x4(&sorted, 1), 70); // 17.5 * 4
		assert_eq!(quartile_x4(&sorted, 3), 130); // 32.5 * 4
	}
}
