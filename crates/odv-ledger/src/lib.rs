//! Ledger-backend collaborators for the ODV off-chain core.
//!
//! The core depends only on the abstract [`LedgerQuery`] and
//! [`ScriptProvider`] contracts defined here, selected at construction
//! time. [`LedgerService`] wraps a backend with bounded-backoff retry
//! for transient failures and normalizes submission outcomes:
//! "already known" is success, a consumed input is `StaleInputs`.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use odv_types::{
	Address, AssetId, OdvError, OutputRef, SignedTx, Timestamp, TxId, Utxo,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod implementations {
	pub mod mock;
}
pub mod scripts;

pub use scripts::{CompiledScript, ScriptError, ScriptProvider, ScriptRole, StaticScriptProvider};

#[derive(Debug, Error)]
pub enum LedgerError {
	/// Network or service hiccup; safe to retry.
	#[error("Transient backend failure: {0}")]
	Transient(String),

	/// The ledger already holds this transaction.
	#[error("Transaction {0} already known to the ledger")]
	DuplicateTransaction(TxId),

	/// A competing confirmed transaction consumed this input.
	#[error("Input {0} already consumed")]
	InputConsumed(OutputRef),

	/// Permanent rejection (malformed bytes, script failure).
	#[error("Backend rejected request: {0}")]
	Rejected(String),
}

/// Read/submit capability of a ledger backend.
#[async_trait]
pub trait LedgerQuery: Send + Sync {
	async fn outputs_at(&self, address: &Address) -> Result<Vec<Utxo>, LedgerError>;

	async fn outputs_by_asset(
		&self,
		address: &Address,
		asset: &AssetId,
	) -> Result<Vec<Utxo>, LedgerError>;

	async fn output_by_ref(&self, reference: &OutputRef) -> Result<Option<Utxo>, LedgerError>;

	/// Current ledger time in epoch milliseconds.
	async fn current_time_ms(&self) -> Result<Timestamp, LedgerError>;

	async fn submit(&self, signed_bytes: Vec<u8>) -> Result<TxId, LedgerError>;

	async fn is_confirmed(&self, tx_id: &TxId) -> Result<bool, LedgerError>;
}

/// Bounds for transient-failure retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub max_retries: u32,
	pub initial_backoff_ms: u64,
	pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 5,
			initial_backoff_ms: 500,
			max_backoff_ms: 30_000,
		}
	}
}

/// Result of an idempotent broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
	Accepted(TxId),
	/// The backend had already seen the transaction; treated as success.
	AlreadyKnown(TxId),
}

impl SubmitOutcome {
	pub fn tx_id(&self) -> TxId {
		match self {
			SubmitOutcome::Accepted(id) | SubmitOutcome::AlreadyKnown(id) => *id,
		}
	}
}

/// Backend wrapper adding retry and submission-outcome normalization.
pub struct LedgerService {
	backend: Arc<dyn LedgerQuery>,
	retry: RetryPolicy,
}

impl LedgerService {
	pub fn new(backend: Arc<dyn LedgerQuery>, retry: RetryPolicy) -> Self {
		Self { backend, retry }
	}

	fn backoff(&self) -> backoff::ExponentialBackoff {
		let cap = self
			.retry
			.max_backoff_ms
			.saturating_mul(self.retry.max_retries as u64 + 1);
		ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(self.retry.initial_backoff_ms))
			.with_max_interval(Duration::from_millis(self.retry.max_backoff_ms))
			.with_max_elapsed_time(Some(Duration::from_millis(cap)))
			.build()
	}

	fn classify(error: LedgerError) -> backoff::Error<LedgerError> {
		match error {
			LedgerError::Transient(_) => {
				warn!("transient ledger failure, backing off: {}", error);
				backoff::Error::transient(error)
			}
			other => backoff::Error::permanent(other),
		}
	}

	fn surface(error: LedgerError) -> OdvError {
		match error {
			LedgerError::InputConsumed(_) => OdvError::StaleInputs,
			other => OdvError::Backend(other.to_string()),
		}
	}

	pub async fn outputs_at(&self, address: &Address) -> Result<Vec<Utxo>, OdvError> {
		backoff::future::retry(self.backoff(), || async {
			self.backend.outputs_at(address).await.map_err(Self::classify)
		})
		.await
		.map_err(Self::surface)
	}

	pub async fn outputs_by_asset(
		&self,
		address: &Address,
		asset: &AssetId,
	) -> Result<Vec<Utxo>, OdvError> {
		backoff::future::retry(self.backoff(), || async {
			self.backend
				.outputs_by_asset(address, asset)
				.await
				.map_err(Self::classify)
		})
		.await
		.map_err(Self::surface)
	}

	pub async fn output_by_ref(&self, reference: &OutputRef) -> Result<Option<Utxo>, OdvError> {
		backoff::future::retry(self.backoff(), || async {
			self.backend
				.output_by_ref(reference)
				.await
				.map_err(Self::classify)
		})
		.await
		.map_err(Self::surface)
	}

	pub async fn current_time_ms(&self) -> Result<Timestamp, OdvError> {
		backoff::future::retry(self.backoff(), || async {
			self.backend.current_time_ms().await.map_err(Self::classify)
		})
		.await
		.map_err(Self::surface)
	}

	/// Single idempotent broadcast. A duplicate-transaction response is
	/// success; a consumed input surfaces as `StaleInputs` so the caller
	/// rebuilds, never retried here with the same body.
	pub async fn submit(&self, tx: &SignedTx) -> Result<SubmitOutcome, OdvError> {
		let bytes = tx.to_cbor()?;
		let result = backoff::future::retry(self.backoff(), || {
			let bytes = bytes.clone();
			async move { self.backend.submit(bytes).await.map_err(Self::classify) }
		})
		.await;

		match result {
			Ok(tx_id) => {
				info!(%tx_id, "transaction accepted");
				Ok(SubmitOutcome::Accepted(tx_id))
			}
			Err(LedgerError::DuplicateTransaction(tx_id)) => {
				debug!(%tx_id, "transaction already known, treating as success");
				Ok(SubmitOutcome::AlreadyKnown(tx_id))
			}
			Err(other) => Err(Self::surface(other)),
		}
	}

	/// Polls until the transaction confirms or the timeout elapses.
	pub async fn await_confirmation(
		&self,
		tx_id: &TxId,
		timeout: Duration,
		poll_interval: Duration,
	) -> Result<bool, OdvError> {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let confirmed = backoff::future::retry(self.backoff(), || async {
				self.backend.is_confirmed(tx_id).await.map_err(Self::classify)
			})
			.await
			.map_err(Self::surface)?;

			if confirmed {
				return Ok(true);
			}
			if tokio::time::Instant::now() >= deadline {
				warn!(%tx_id, "confirmation timed out");
				return Ok(false);
			}
			tokio::time::sleep(poll_interval).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::implementations::mock::MockLedger;
	use super::*;
	use odv_types::{Redeemer, TxBody, TxOutput, Value};
	use std::collections::BTreeMap;

	fn seeded_ledger() -> (Arc<MockLedger>, OutputRef, Address) {
		let ledger = Arc::new(MockLedger::new(1_000));
		let address = Address::new("addr_test1contract");
		let reference = ledger.seed_output(TxOutput {
			address: address.clone(),
			value: Value::from_coin(5_000_000),
			datum: None,
		});
		(ledger, reference, address)
	}

	fn spend(reference: OutputRef, address: &Address) -> SignedTx {
		let body = TxBody {
			inputs: vec![reference],
			reference_inputs: vec![],
			outputs: vec![TxOutput {
				address: address.clone(),
				value: Value::from_coin(5_000_000),
				datum: None,
			}],
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
	}

	#[tokio::test]
	async fn duplicate_submission_is_success() {
		let (ledger, reference, address) = seeded_ledger();
		let service = LedgerService::new(ledger, RetryPolicy::default());
		let tx = spend(reference, &address);

		let first = service.submit(&tx).await.unwrap();
		let second = service.submit(&tx).await.unwrap();
		assert!(matches!(first, SubmitOutcome::Accepted(_)));
		assert!(matches!(second, SubmitOutcome::AlreadyKnown(_)));
		assert_eq!(first.tx_id(), second.tx_id());
	}

	#[tokio::test]
	async fn consumed_input_surfaces_stale_inputs() {
		let (ledger, reference, address) = seeded_ledger();
		ledger.consume_externally(&reference);
		let service = LedgerService::new(ledger, RetryPolicy::default());

		let result = service.submit(&spend(reference, &address)).await;
		assert!(matches!(result, Err(OdvError::StaleInputs)));
	}

	#[tokio::test]
	async fn transient_failures_are_retried() {
		let (ledger, reference, address) = seeded_ledger();
		ledger.fail_next_requests(2);
		let service = LedgerService::new(
			ledger,
			RetryPolicy {
				max_retries: 5,
				initial_backoff_ms: 1,
				max_backoff_ms: 5,
			},
		);

		let outcome = service.submit(&spend(reference, &address)).await.unwrap();
		assert!(matches!(outcome, SubmitOutcome::Accepted(_)));
	}
}
