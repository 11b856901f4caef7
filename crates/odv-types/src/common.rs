//! Chain primitives shared across the workspace.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::fmt;

/// Epoch timestamp in milliseconds.
pub type Timestamp = u64;

fn parse_fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], String> {
	let bytes = hex::decode(s).map_err(|e| e.to_string())?;
	bytes
		.try_into()
		.map_err(|_| format!("expected {} hex-encoded bytes", N))
}

macro_rules! hex_newtype {
	($name:ident, $len:expr, $doc:expr) => {
		#[doc = $doc]
		#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
		pub struct $name(pub [u8; $len]);

		impl $name {
			pub fn as_bytes(&self) -> &[u8; $len] {
				&self.0
			}

			pub fn to_hex(&self) -> String {
				hex::encode(self.0)
			}

			pub fn from_hex(s: &str) -> Result<Self, String> {
				parse_fixed_hex::<$len>(s).map(Self)
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.to_hex())
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($name), self.to_hex())
			}
		}

		impl Serialize for $name {
			fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
				serializer.serialize_str(&self.to_hex())
			}
		}

		impl<'de> Deserialize<'de> for $name {
			fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
				let s = String::deserialize(deserializer)?;
				Self::from_hex(&s).map_err(de::Error::custom)
			}
		}
	};
}

hex_newtype!(TxId, 32, "Transaction identifier (32-byte hash).");
hex_newtype!(
	KeyHash,
	28,
	"Verification-key hash identifying a node or operator."
);
hex_newtype!(PolicyId, 28, "Minting-policy hash scoping native tokens.");
hex_newtype!(SignatureBytes, 64, "Raw Ed25519 signature bytes.");
hex_newtype!(
	VerificationKey,
	32,
	"Raw Ed25519 verification key; hashed into a [`KeyHash`] identity."
);

impl VerificationKey {
	/// Derives the on-chain identity for this key: the first 28 bytes of
	/// its SHA3-256 digest.
	pub fn key_hash(&self) -> KeyHash {
		let digest = Sha3_256::digest(self.0);
		let mut out = [0u8; 28];
		out.copy_from_slice(&digest[..28]);
		KeyHash(out)
	}
}

/// Reference to a ledger output: producing transaction plus output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
	pub tx_id: TxId,
	pub index: u32,
}

impl OutputRef {
	pub fn new(tx_id: TxId, index: u32) -> Self {
		Self { tx_id, index }
	}
}

impl fmt::Display for OutputRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.tx_id, self.index)
	}
}

/// Ledger address, kept opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
	pub fn new(addr: impl Into<String>) -> Self {
		Self(addr.into())
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A native token asset, scoped by its minting policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId {
	pub policy: PolicyId,
	pub name: String,
}

impl AssetId {
	pub fn new(policy: PolicyId, name: impl Into<String>) -> Self {
		Self {
			policy,
			name: name.into(),
		}
	}
}

impl fmt::Display for AssetId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.policy, self.name)
	}
}

/// Multi-asset value attached to an output: base currency plus native
/// tokens. Zero-amount assets are normalized away.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Value {
	pub coin: u64,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub assets: BTreeMap<AssetId, u64>,
}

impl Value {
	pub fn from_coin(coin: u64) -> Self {
		Self {
			coin,
			assets: BTreeMap::new(),
		}
	}

	pub fn with_asset(mut self, asset: AssetId, amount: u64) -> Self {
		if amount > 0 {
			self.assets.insert(asset, amount);
		}
		self
	}

	pub fn asset_amount(&self, asset: &AssetId) -> u64 {
		self.assets.get(asset).copied().unwrap_or(0)
	}

	pub fn add_asset(&mut self, asset: AssetId, amount: u64) {
		if amount == 0 {
			return;
		}
		*self.assets.entry(asset).or_insert(0) += amount;
	}

	/// Removes up to `amount` of `asset`, returning how much was removed.
	pub fn remove_asset(&mut self, asset: &AssetId, amount: u64) -> u64 {
		match self.assets.get_mut(asset) {
			Some(held) => {
				let taken = amount.min(*held);
				*held -= taken;
				if *held == 0 {
					self.assets.remove(asset);
				}
				taken
			}
			None => 0,
		}
	}

	pub fn contains(&self, other: &Value) -> bool {
		self.coin >= other.coin
			&& other
				.assets
				.iter()
				.all(|(asset, amount)| self.asset_amount(asset) >= *amount)
	}
}
