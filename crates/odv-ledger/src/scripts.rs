//! Script Provider collaborator.
//!
//! The core treats compiled on-chain scripts as opaque bytecode plus a
//! hash, keyed by role. It never inspects script internals.

use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
	#[error("No script provisioned for role {0:?}")]
	Missing(ScriptRole),
}

/// Named on-chain script roles the core references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptRole {
	Manager,
	MintingPolicy,
	Escrow,
}

/// Opaque compiled script bytecode and its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
	pub bytes: Vec<u8>,
	pub hash: [u8; 28],
}

impl CompiledScript {
	pub fn from_bytes(bytes: Vec<u8>) -> Self {
		let digest = Sha3_256::digest(&bytes);
		let mut hash = [0u8; 28];
		hash.copy_from_slice(&digest[..28]);
		Self { bytes, hash }
	}
}

pub trait ScriptProvider: Send + Sync {
	fn script(&self, role: ScriptRole) -> Result<CompiledScript, ScriptError>;
}

/// Provider backed by a fixed in-memory role map, loaded at startup.
#[derive(Default)]
pub struct StaticScriptProvider {
	scripts: HashMap<ScriptRole, CompiledScript>,
}

impl StaticScriptProvider {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_script(mut self, role: ScriptRole, bytes: Vec<u8>) -> Self {
		self.scripts.insert(role, CompiledScript::from_bytes(bytes));
		self
	}
}

impl ScriptProvider for StaticScriptProvider {
	fn script(&self, role: ScriptRole) -> Result<CompiledScript, ScriptError> {
		self.scripts
			.get(&role)
			.cloned()
			.ok_or(ScriptError::Missing(role))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn provider_returns_provisioned_roles_only() {
		let provider =
			StaticScriptProvider::new().with_script(ScriptRole::Manager, vec![1, 2, 3]);
		let script = provider.script(ScriptRole::Manager).unwrap();
		assert_eq!(script.bytes, vec![1, 2, 3]);
		assert!(matches!(
			provider.script(ScriptRole::Escrow),
			Err(ScriptError::Missing(ScriptRole::Escrow))
		));
	}

	#[test]
	fn script_hash_tracks_bytes() {
		let a = CompiledScript::from_bytes(vec![1]);
		let b = CompiledScript::from_bytes(vec![2]);
		assert_ne!(a.hash, b.hash);
	}
}
