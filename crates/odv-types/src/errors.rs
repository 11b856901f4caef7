//! Error taxonomy for the ODV off-chain core.
//!
//! Every retryable category spells out the caller's next action in its
//! message; only validation and signature-protocol failures are final
//! with no suggested remedy.

use crate::common::KeyHash;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OdvError>;

#[derive(Debug, Error)]
pub enum OdvError {
	/// Bad configuration or intent; rejected before any network access.
	#[error("Validation error: {0}")]
	Validation(String),

	/// A round lost quorum; safe to retry once more feeds arrive.
	#[error("Insufficient quorum: {collected} of {required} required feeds; retry when more feeds arrive")]
	InsufficientQuorum { collected: usize, required: usize },

	/// Every transport/agg-state pair is taken; back off and retry.
	#[error("No transport/agg-state pair available; wait for a round to confirm and retry")]
	NoAvailableResource,

	/// The targeted resource is in use; back off and retry.
	#[error("Resource busy: {0}; wait and retry")]
	ResourceBusy(String),

	#[error("Unauthorized signer: {0}")]
	UnauthorizedSigner(KeyHash),

	#[error("Key {0} already signed this body")]
	AlreadySigned(KeyHash),

	#[error("Signature does not verify against the body hash")]
	InvalidSignature,

	/// An input was consumed by a competing confirmed transaction.
	#[error("Stale inputs: a competing transaction consumed an input; rebuild against a fresh snapshot")]
	StaleInputs,

	/// Advisory: the round cannot plausibly confirm inside its window.
	#[error("Round expires in {remaining_ms}ms, under the {margin_ms}ms margin; rebuild with a fresh window")]
	ExpiringRound { remaining_ms: u64, margin_ms: u64 },

	/// Transient backend failure that survived bounded retry.
	#[error("Backend error: {0}; retry after backoff")]
	Backend(String),

	#[error("Serialization error: {0}")]
	Serialization(String),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl OdvError {
	/// Whether the caller may retry without changing anything.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			OdvError::InsufficientQuorum { .. }
				| OdvError::NoAvailableResource
				| OdvError::ResourceBusy(_)
				| OdvError::Backend(_)
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retryable_classification() {
		assert!(OdvError::NoAvailableResource.is_retryable());
		assert!(OdvError::Backend("timeout".into()).is_retryable());
		assert!(!OdvError::StaleInputs.is_retryable());
		assert!(!OdvError::Validation("bad".into()).is_retryable());
	}
}
