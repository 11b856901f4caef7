//! Wallet collaborator for the ODV off-chain core.
//!
//! Holds private keys and produces signatures over body hashes; raw key
//! material never crosses into the rest of the workspace. Also provides
//! the node-side feed signing helper and signature verification used by
//! the aggregator and orchestrator.

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use odv_types::{KeyHash, SignatureBytes, SignedFeed, Timestamp, VerificationKey};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
	#[error("Signing failed: {0}")]
	SigningFailed(String),

	#[error("Wallet does not hold key {0}")]
	UnknownKey(KeyHash),

	#[error("Invalid key material: {0}")]
	InvalidKey(String),
}

/// Signing capability over held keys.
#[async_trait]
pub trait WalletInterface: Send + Sync {
	/// Hashes of every key this wallet can sign with.
	fn owned_keys(&self) -> Vec<KeyHash>;

	/// Signs a 32-byte body hash with the named key, returning the full
	/// verification key alongside so the recipient can check the
	/// signature without further key distribution.
	async fn sign(
		&self,
		body_hash: &[u8; 32],
		key: &KeyHash,
	) -> Result<(VerificationKey, SignatureBytes), AccountError>;
}

/// Wallet backed by in-process Ed25519 keys.
#[derive(Default)]
pub struct LocalWallet {
	keys: HashMap<KeyHash, SigningKey>,
}

impl LocalWallet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_seed(mut self, seed: [u8; 32]) -> Self {
		let key = SigningKey::from_bytes(&seed);
		let hash = VerificationKey(key.verifying_key().to_bytes()).key_hash();
		self.keys.insert(hash, key);
		self
	}

	pub fn key_hashes(&self) -> Vec<KeyHash> {
		self.keys.keys().copied().collect()
	}
}

#[async_trait]
impl WalletInterface for LocalWallet {
	fn owned_keys(&self) -> Vec<KeyHash> {
		self.key_hashes()
	}

	async fn sign(
		&self,
		body_hash: &[u8; 32],
		key: &KeyHash,
	) -> Result<(VerificationKey, SignatureBytes), AccountError> {
		let signing_key = self.keys.get(key).ok_or(AccountError::UnknownKey(*key))?;
		let signature = signing_key.sign(body_hash);
		Ok((
			VerificationKey(signing_key.verifying_key().to_bytes()),
			SignatureBytes(signature.to_bytes()),
		))
	}
}

/// Service wrapper selecting the wallet implementation at construction.
pub struct AccountService {
	wallet: Box<dyn WalletInterface>,
}

impl AccountService {
	pub fn new(wallet: Box<dyn WalletInterface>) -> Self {
		Self { wallet }
	}

	pub fn owned_keys(&self) -> Vec<KeyHash> {
		self.wallet.owned_keys()
	}

	pub async fn sign(
		&self,
		body_hash: &[u8; 32],
		key: &KeyHash,
	) -> Result<(VerificationKey, SignatureBytes), AccountError> {
		self.wallet.sign(body_hash, key).await
	}
}

/// Verifies an Ed25519 signature over arbitrary message bytes.
pub fn verify_signature(
	verification_key: &VerificationKey,
	message: &[u8],
	signature: &SignatureBytes,
) -> bool {
	let Ok(key) = VerifyingKey::from_bytes(&verification_key.0) else {
		return false;
	};
	let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
	key.verify(message, &signature).is_ok()
}

/// Node-side helper producing signed feeds over the canonical
/// `(value, timestamp)` payload.
pub struct FeedSigner {
	key: SigningKey,
}

impl FeedSigner {
	pub fn from_seed(seed: [u8; 32]) -> Self {
		Self {
			key: SigningKey::from_bytes(&seed),
		}
	}

	pub fn verification_key(&self) -> VerificationKey {
		VerificationKey(self.key.verifying_key().to_bytes())
	}

	pub fn key_hash(&self) -> KeyHash {
		self.verification_key().key_hash()
	}

	pub fn sign_feed(&self, value: u64, timestamp_ms: Timestamp) -> SignedFeed {
		let payload = SignedFeed::signing_payload(value, timestamp_ms);
		let signature = self.key.sign(&payload);
		SignedFeed {
			value,
			timestamp_ms,
			verification_key: self.verification_key(),
			signature: SignatureBytes(signature.to_bytes()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signed_feed_verifies_against_payload() {
		let signer = FeedSigner::from_seed([7u8; 32]);
		let feed = signer.sign_feed(101, 1_700_000_000_000);
		assert!(verify_signature(
			&feed.verification_key,
			&feed.payload(),
			&feed.signature
		));

		// Any payload change invalidates the signature.
		let tampered = SignedFeed::signing_payload(102, 1_700_000_000_000);
		assert!(!verify_signature(
			&feed.verification_key,
			&tampered,
			&feed.signature
		));
	}

	#[tokio::test]
	async fn wallet_signs_with_held_keys_only() {
		let wallet = LocalWallet::new().with_seed([1u8; 32]);
		let held = wallet.key_hashes()[0];
		let service = AccountService::new(Box::new(wallet));

		let body_hash = [9u8; 32];
		let (vk, signature) = service.sign(&body_hash, &held).await.unwrap();
		assert_eq!(vk.key_hash(), held);
		assert!(verify_signature(&vk, &body_hash, &signature));

		let missing = KeyHash([0u8; 28]);
		assert!(matches!(
			service.sign(&body_hash, &missing).await,
			Err(AccountError::UnknownKey(_))
		));
	}
}
