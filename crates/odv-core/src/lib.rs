//! Transaction orchestration for the ODV off-chain core.
//!
//! One intent per mutating operation. The orchestrator turns an intent
//! into a canonical unsigned body plus its required signer groups,
//! collects countersignatures through the exchange artifact, and
//! broadcasts once every group reaches threshold. Validation happens
//! before any input is resolved; a body carrying signatures is
//! immutable, so any required change means discarding and rebuilding.

use odv_account::{verify_signature, AccountService, WalletInterface};
use odv_aggregate::FeedAggregator;
use odv_config::OracleConfig;
use odv_ledger::{
	LedgerQuery, LedgerService, RetryPolicy, ScriptProvider, ScriptRole, SubmitOutcome,
};
use odv_pool::ResourcePool;
use odv_rewards::{
	ensure_payout_viable, node_collect_amount, platform_collect_amount, PayoutPolicy,
	RewardCalculator, MIN_OUTPUT_COIN,
};
use odv_types::{
	Address, AggState, ArtifactError, AssetId, FeedSet, KeyHash, Node, OdvError, OracleDatum,
	OracleSettings, OutputRef, PendingRound, PolicyId, Redeemer, RewardAccount, RewardEscrow,
	SignatureBytes, SignerGroup, SigningArtifact, Timestamp, TransportState, TxBody, TxOutput,
	TxPhase, Utxo, Value, VerificationKey, MIN_TRANSPORT_PAIRS,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub mod governance;

/// Token name of the platform governance NFT.
const AUTH_TOKEN_NAME: &str = "PlatformAuth";

/// One mutating operation against the oracle.
#[derive(Debug, Clone)]
pub enum OracleIntent {
	/// Initial mint of settings, reward account, and `pairs` rotating
	/// transport/agg-state pairs.
	Deploy { settings: OracleSettings, pairs: usize },
	/// Aggregate one round of signed feeds into a transport pair.
	Aggregate { feeds: FeedSet },
	/// Fold filled transports into the reward account, one batch at most.
	ProcessRewards,
	CollectNodeReward {
		feed_key: KeyHash,
		payout_address: Address,
	},
	CollectPlatformReward { payout_address: Address },
	Pause,
	Resume,
	/// Full teardown, burning every oracle token.
	Remove,
	AddNodes { nodes: Vec<Node> },
	RemoveNodes { keys: Vec<KeyHash> },
	UpdateSettings { settings: OracleSettings },
	ResizePool { target: usize },
	MintAuthToken { recipient: Address },
}

/// A built transaction mid-signing: the canonical body, the exchange
/// artifact collecting signatures over it, and the pool locks it holds.
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
	pub body: TxBody,
	pub artifact: SigningArtifact,
	locked: Vec<OutputRef>,
}

impl PreparedTransaction {
	pub fn phase(&self) -> TxPhase {
		self.artifact.phase()
	}
}

/// On-chain oracle state resolved at one snapshot.
struct OracleState {
	settings_utxo: Utxo,
	settings: OracleSettings,
	reward_utxo: Utxo,
	reward_account: RewardAccount,
	utxos: Vec<Utxo>,
	now: Timestamp,
}

struct OracleAssets {
	settings: AssetId,
	reward_account: AssetId,
	transport: AssetId,
	agg_state: AssetId,
	auth: AssetId,
}

/// Builder wiring the orchestrator's collaborators together.
#[derive(Default)]
pub struct OrchestratorBuilder {
	backend: Option<Arc<dyn LedgerQuery>>,
	wallet: Option<Box<dyn WalletInterface>>,
	scripts: Option<Arc<dyn ScriptProvider>>,
	config: Option<OracleConfig>,
	platform_group: Option<SignerGroup>,
}

impl OrchestratorBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_backend(mut self, backend: Arc<dyn LedgerQuery>) -> Self {
		self.backend = Some(backend);
		self
	}

	pub fn with_wallet(mut self, wallet: Box<dyn WalletInterface>) -> Self {
		self.wallet = Some(wallet);
		self
	}

	pub fn with_scripts(mut self, scripts: Arc<dyn ScriptProvider>) -> Self {
		self.scripts = Some(scripts);
		self
	}

	pub fn with_config(mut self, config: OracleConfig) -> Self {
		self.config = Some(config);
		self
	}

	pub fn with_platform_group(mut self, group: SignerGroup) -> Self {
		self.platform_group = Some(group);
		self
	}

	pub fn build(self) -> Result<TransactionOrchestrator, OdvError> {
		let backend = self
			.backend
			.ok_or_else(|| OdvError::Validation("ledger backend not configured".into()))?;
		let wallet = self
			.wallet
			.ok_or_else(|| OdvError::Validation("wallet not configured".into()))?;
		let scripts = self
			.scripts
			.ok_or_else(|| OdvError::Validation("script provider not configured".into()))?;
		let config = self
			.config
			.ok_or_else(|| OdvError::Validation("configuration not loaded".into()))?;
		let platform_group = self
			.platform_group
			.ok_or_else(|| OdvError::Validation("platform signer group not configured".into()))?;

		config
			.validate()
			.map_err(|e| OdvError::Validation(e.to_string()))?;
		let policy = config
			.policy()
			.map_err(|e| OdvError::Validation(e.to_string()))?;
		let assets = OracleAssets {
			settings: AssetId::new(policy, config.token_names.settings.clone()),
			reward_account: AssetId::new(policy, config.token_names.reward_account.clone()),
			transport: AssetId::new(policy, config.token_names.transport.clone()),
			agg_state: AssetId::new(policy, config.token_names.agg_state.clone()),
			auth: AssetId::new(policy, AUTH_TOKEN_NAME),
		};
		let retry = RetryPolicy {
			max_retries: config.backend.max_retries,
			initial_backoff_ms: config.backend.initial_backoff_ms,
			max_backoff_ms: config.backend.max_backoff_ms,
		};

		Ok(TransactionOrchestrator {
			ledger: LedgerService::new(backend, retry),
			account: AccountService::new(wallet),
			scripts,
			pool: ResourcePool::new(assets.transport.clone(), assets.agg_state.clone()),
			contract_address: Address::new(config.oracle.contract_address.clone()),
			funding_address: Address::new(config.oracle.funding_address.clone()),
			policy,
			assets,
			platform_group,
			submit_margin_ms: config.timing.submit_margin_ms,
			batch_size: config.pool.collect_batch_size,
		})
	}
}

/// Builds, countersigns, and submits oracle transactions.
pub struct TransactionOrchestrator {
	ledger: LedgerService,
	account: AccountService,
	scripts: Arc<dyn ScriptProvider>,
	pool: ResourcePool,
	contract_address: Address,
	funding_address: Address,
	policy: PolicyId,
	assets: OracleAssets,
	platform_group: SignerGroup,
	submit_margin_ms: u64,
	batch_size: usize,
}

impl TransactionOrchestrator {
	pub async fn build(&self, intent: OracleIntent) -> Result<PreparedTransaction, OdvError> {
		match intent {
			OracleIntent::Deploy { settings, pairs } => self.build_deploy(settings, pairs).await,
			OracleIntent::Aggregate { feeds } => self.build_aggregate(feeds).await,
			OracleIntent::ProcessRewards => self.build_process_rewards().await,
			OracleIntent::CollectNodeReward {
				feed_key,
				payout_address,
			} => self.build_node_collect(feed_key, payout_address).await,
			OracleIntent::CollectPlatformReward { payout_address } => {
				self.build_platform_collect(payout_address).await
			}
			OracleIntent::Pause => self.build_pause().await,
			OracleIntent::Resume => self.build_resume().await,
			OracleIntent::Remove => self.build_remove().await,
			OracleIntent::AddNodes { nodes } => self.build_add_nodes(nodes).await,
			OracleIntent::RemoveNodes { keys } => self.build_remove_nodes(keys).await,
			OracleIntent::UpdateSettings { settings } => self.build_update_settings(settings).await,
			OracleIntent::ResizePool { target } => self.build_resize(target).await,
			OracleIntent::MintAuthToken { recipient } => self.build_mint_auth(recipient).await,
		}
	}

	/// Signs the body hash with a wallet-held key and records the result.
	pub async fn countersign(
		&self,
		prepared: &mut PreparedTransaction,
		key: &KeyHash,
	) -> Result<TxPhase, OdvError> {
		let body_hash = prepared.artifact.body_hash();
		let (verification_key, signature) = self
			.account
			.sign(&body_hash, key)
			.await
			.map_err(|e| OdvError::Validation(e.to_string()))?;
		self.record_signature(prepared, &verification_key, signature)
	}

	/// Records an externally produced signature after checking
	/// membership, uniqueness, and that it verifies against the body
	/// hash.
	pub fn record_signature(
		&self,
		prepared: &mut PreparedTransaction,
		verification_key: &VerificationKey,
		signature: SignatureBytes,
	) -> Result<TxPhase, OdvError> {
		let key = verification_key.key_hash();
		if !prepared.artifact.is_member(&key) {
			return Err(OdvError::UnauthorizedSigner(key));
		}
		if prepared.artifact.signatures.contains_key(&key) {
			return Err(OdvError::AlreadySigned(key));
		}
		if !verify_signature(verification_key, &prepared.artifact.body_hash(), &signature) {
			return Err(OdvError::InvalidSignature);
		}
		prepared
			.artifact
			.add_signature(*verification_key, signature)
			.map_err(artifact_error)?;
		let phase = prepared.artifact.phase();
		debug!(signer = %key, %phase, "signature recorded");
		Ok(phase)
	}

	/// Unions a copy of the artifact that circulated to other signers.
	/// The copy arrived over an untrusted channel, so every signature it
	/// carries that we do not already hold is re-verified against our
	/// own body hash before it counts.
	pub fn merge_artifact(
		&self,
		prepared: &mut PreparedTransaction,
		other: &SigningArtifact,
	) -> Result<TxPhase, OdvError> {
		prepared
			.artifact
			.ensure_compatible(other)
			.map_err(artifact_error)?;
		let body_hash = prepared.artifact.body_hash();
		for (key, entry) in &other.signatures {
			if prepared.artifact.signatures.contains_key(key) {
				continue;
			}
			if entry.verification_key.key_hash() != *key
				|| !verify_signature(&entry.verification_key, &body_hash, &entry.signature)
			{
				return Err(OdvError::InvalidSignature);
			}
		}
		prepared.artifact.merge(other).map_err(artifact_error)?;
		Ok(prepared.artifact.phase())
	}

	/// Single idempotent broadcast, allowed only once every signer group
	/// reached its threshold. An aggregate round too close to its expiry
	/// is refused with an advisory instead of being sent to die on
	/// chain.
	pub async fn submit(&self, prepared: &PreparedTransaction) -> Result<SubmitOutcome, OdvError> {
		if !prepared.artifact.is_ready() {
			return Err(OdvError::Validation(format!(
				"transaction is {}; every signer group must reach its threshold before submit",
				prepared.phase()
			)));
		}

		if prepared.body.redeemer == Redeemer::Aggregate {
			if let Some(end) = prepared.body.validity_end {
				let now = self.ledger.current_time_ms().await?;
				let remaining_ms = end.saturating_sub(now);
				if remaining_ms < self.submit_margin_ms {
					return Err(OdvError::ExpiringRound {
						remaining_ms,
						margin_ms: self.submit_margin_ms,
					});
				}
			}
		}

		let tx = odv_types::SignedTx {
			body_bytes: prepared.artifact.unsigned_body.clone(),
			signatures: prepared
				.artifact
				.signatures
				.iter()
				.map(|(key, entry)| (*key, entry.signature))
				.collect(),
		};
		match self.ledger.submit(&tx).await {
			Ok(outcome) => {
				self.pool.release(&prepared.locked);
				info!(tx_id = %outcome.tx_id(), redeemer = ?prepared.body.redeemer, "submitted");
				Ok(outcome)
			}
			Err(error) => {
				if matches!(error, OdvError::StaleInputs) {
					// The reserved pair is gone; free the locks so the
					// rebuild can take a fresh one.
					self.pool.release(&prepared.locked);
				}
				Err(error)
			}
		}
	}

	/// Drops a pre-submit transaction, releasing its pool locks. Zero
	/// on-chain effect.
	pub fn abandon(&self, prepared: PreparedTransaction) {
		self.pool.release(&prepared.locked);
		debug!(phase = %prepared.phase(), "transaction abandoned");
	}

	async fn load_state(&self) -> Result<OracleState, OdvError> {
		let utxos = self.ledger.outputs_at(&self.contract_address).await?;
		let now = self.ledger.current_time_ms().await?;

		let settings_utxo = single_by_asset(&utxos, &self.assets.settings, "settings")?;
		let settings = settings_utxo
			.output
			.datum
			.as_ref()
			.and_then(|d| d.as_settings())
			.cloned()
			.ok_or_else(|| {
				OdvError::Validation("settings output carries no settings datum".into())
			})?;
		settings.validate()?;

		let reward_utxo = single_by_asset(&utxos, &self.assets.reward_account, "reward account")?;
		let reward_account = reward_utxo
			.output
			.datum
			.as_ref()
			.and_then(|d| d.as_reward_account())
			.cloned()
			.ok_or_else(|| {
				OdvError::Validation("reward output carries no reward-account datum".into())
			})?;

		Ok(OracleState {
			settings_utxo,
			settings,
			reward_utxo,
			reward_account,
			utxos,
			now,
		})
	}

	fn prepare(
		&self,
		body: TxBody,
		groups: Vec<SignerGroup>,
		created_at: Timestamp,
		locked: Vec<OutputRef>,
	) -> Result<PreparedTransaction, OdvError> {
		let bytes = body.to_cbor()?;
		let artifact = SigningArtifact::new(bytes, groups, created_at).map_err(artifact_error)?;
		Ok(PreparedTransaction {
			body,
			artifact,
			locked,
		})
	}

	fn platform_groups(&self) -> Vec<SignerGroup> {
		vec![self.platform_group.clone()]
	}

	fn contract_output(&self, value: Value, datum: OracleDatum) -> TxOutput {
		TxOutput {
			address: self.contract_address.clone(),
			value,
			datum: Some(datum),
		}
	}

	/// Address of the escrow script that parks token rewards owed to
	/// departed nodes until their payment key withdraws them.
	fn escrow_address(&self) -> Result<Address, OdvError> {
		let script = self
			.scripts
			.script(ScriptRole::Escrow)
			.map_err(|e| OdvError::Validation(e.to_string()))?;
		Ok(Address::new(format!("script_{}", PolicyId(script.hash))))
	}

	/// Greedily selects funding inputs covering `required`, lowest
	/// reference first, and returns the change output going back to the
	/// funding address. A zero requirement selects nothing.
	async fn select_funding(
		&self,
		required: &Value,
	) -> Result<(Vec<OutputRef>, Option<TxOutput>), OdvError> {
		if *required == Value::default() {
			return Ok((vec![], None));
		}
		let mut utxos = self.ledger.outputs_at(&self.funding_address).await?;
		utxos.sort_by_key(|utxo| utxo.reference);

		let mut selected = Vec::new();
		let mut gathered = Value::default();
		for utxo in &utxos {
			if gathered.contains(required) {
				break;
			}
			accumulate(&mut gathered, &utxo.output.value);
			selected.push(utxo.reference);
		}
		if !gathered.contains(required) {
			return Err(OdvError::Validation(format!(
				"funding address {} cannot cover the required {} coin",
				self.funding_address, required.coin
			)));
		}

		let change = value_minus(gathered, required);
		let change = (change != Value::default()).then(|| TxOutput {
			address: self.funding_address.clone(),
			value: change,
			datum: None,
		});
		Ok((selected, change))
	}

	async fn build_deploy(
		&self,
		settings: OracleSettings,
		pairs: usize,
	) -> Result<PreparedTransaction, OdvError> {
		settings.validate()?;
		if pairs < MIN_TRANSPORT_PAIRS {
			return Err(OdvError::Validation(format!(
				"{pairs} transport pairs is below the {MIN_TRANSPORT_PAIRS}-pair minimum"
			)));
		}
		let minting = self
			.scripts
			.script(ScriptRole::MintingPolicy)
			.map_err(|e| OdvError::Validation(e.to_string()))?;
		if minting.hash != self.policy.0 {
			return Err(OdvError::Validation(
				"configured policy does not match the compiled minting policy".into(),
			));
		}

		let now = self.ledger.current_time_ms().await?;
		let node_count = settings.nodes.len();
		let mut outputs = vec![
			self.contract_output(
				Value::from_coin(MIN_OUTPUT_COIN).with_asset(self.assets.settings.clone(), 1),
				OracleDatum::Settings(settings),
			),
			self.contract_output(
				Value::from_coin(MIN_OUTPUT_COIN).with_asset(self.assets.reward_account.clone(), 1),
				OracleDatum::RewardAccount(RewardAccount::for_node_count(node_count)),
			),
		];
		for _ in 0..pairs {
			outputs.push(self.contract_output(
				Value::from_coin(MIN_OUTPUT_COIN).with_asset(self.assets.transport.clone(), 1),
				OracleDatum::Transport(TransportState::Empty),
			));
			outputs.push(self.contract_output(
				Value::from_coin(MIN_OUTPUT_COIN).with_asset(self.assets.agg_state.clone(), 1),
				OracleDatum::AggState(None),
			));
		}

		let mut mint = BTreeMap::new();
		mint.insert(self.assets.settings.clone(), 1i64);
		mint.insert(self.assets.reward_account.clone(), 1);
		mint.insert(self.assets.transport.clone(), pairs as i64);
		mint.insert(self.assets.agg_state.clone(), pairs as i64);

		// Every minted output needs its minimum deposit paid for.
		let required = Value::from_coin(MIN_OUTPUT_COIN.saturating_mul(2 + 2 * pairs as u64));
		let (inputs, change) = self.select_funding(&required).await?;
		outputs.extend(change);

		let body = TxBody {
			inputs,
			reference_inputs: vec![],
			outputs,
			mint,
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer: Redeemer::Deploy,
		};
		info!(pairs, "deploying oracle");
		self.prepare(body, self.platform_groups(), now, vec![])
	}

	async fn build_aggregate(&self, feeds: FeedSet) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		if state.settings.is_paused() {
			return Err(OdvError::Validation(
				"oracle is paused; resume before aggregating".into(),
			));
		}

		let report = FeedAggregator::new(state.settings.clone()).aggregate(&feeds, state.now)?;
		let consensus = &report.consensus;

		let pair = self.pool.select_pair(&state.utxos, state.now)?;
		let locked = pair.references().to_vec();

		let calculator = RewardCalculator::new(state.settings.fee.clone(), self.batch_size);
		let fees_paid = match calculator.round_fee(consensus.contributors.len()) {
			Ok(fees) => fees,
			Err(error) => {
				self.pool.release(&locked);
				return Err(error);
			}
		};
		let round = PendingRound {
			value: consensus.value,
			feeds: consensus
				.contributors
				.iter()
				.filter_map(|key| feeds.get(key).map(|feed| (*key, feed.value)))
				.collect(),
			timestamp: consensus.timestamp_ms,
			node_reward: state.settings.fee.node_fee,
			fees_paid,
		};

		let mut transport_value = pair.transport.output.value.clone();
		add_fee(&mut transport_value, &state.settings.fee.fee_token, fees_paid);

		// The carried fee comes from the funding wallet; consumers refund
		// it out of band.
		let fee_value = match &state.settings.fee.fee_token {
			Some(token) => Value::default().with_asset(token.clone(), fees_paid),
			None => Value::from_coin(fees_paid),
		};
		let (funding, change) = match self.select_funding(&fee_value).await {
			Ok(selected) => selected,
			Err(error) => {
				self.pool.release(&locked);
				return Err(error);
			}
		};

		let expiry = state.now + state.settings.aggregation_liveness_ms;
		let mut outputs = vec![
			self.contract_output(
				transport_value,
				OracleDatum::Transport(TransportState::Filled(round)),
			),
			self.contract_output(
				pair.agg_state.output.value.clone(),
				OracleDatum::AggState(Some(AggState {
					value: consensus.value,
					created_at: state.now,
					expiry,
				})),
			),
		];
		outputs.extend(change);

		let contributors: Vec<KeyHash> = consensus.contributors.iter().copied().collect();
		let group = SignerGroup::new(
			"nodes",
			state.settings.signature_threshold,
			contributors.clone(),
		);
		let mut inputs = locked.clone();
		inputs.extend(funding);
		let body = TxBody {
			inputs,
			reference_inputs: vec![state.settings_utxo.reference],
			outputs,
			mint: BTreeMap::new(),
			validity_start: Some(state.now),
			validity_end: Some(expiry),
			required_signers: contributors,
			redeemer: Redeemer::Aggregate,
		};

		match self.prepare(body, vec![group], state.now, locked.clone()) {
			Ok(prepared) => {
				info!(
					value = consensus.value,
					contributors = consensus.contributors.len(),
					fees_paid,
					"aggregate round built"
				);
				Ok(prepared)
			}
			Err(error) => {
				self.pool.release(&locked);
				Err(error)
			}
		}
	}

	async fn build_process_rewards(&self) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let snapshot = self.pool.classify(&state.utxos);
		let filled: Vec<(Utxo, PendingRound)> = snapshot
			.transports
			.into_iter()
			.filter_map(|(utxo, transport)| match transport {
				TransportState::Filled(round) => Some((utxo, round)),
				TransportState::Empty => None,
			})
			.take(self.batch_size)
			.collect();
		if filled.is_empty() {
			return Err(OdvError::Validation(
				"no filled transports to process".into(),
			));
		}

		let calculator = RewardCalculator::new(state.settings.fee.clone(), self.batch_size);
		let rounds: Vec<PendingRound> = filled.iter().map(|(_, round)| round.clone()).collect();
		let outcome = calculator.apply_rounds(&state.settings, &state.reward_account, &rounds)?;

		let mut reward_value = state.reward_utxo.output.value.clone();
		add_fee(
			&mut reward_value,
			&state.settings.fee.fee_token,
			outcome.total_fees,
		);

		let mut inputs = vec![state.reward_utxo.reference];
		let mut outputs = vec![self.contract_output(
			reward_value,
			OracleDatum::RewardAccount(outcome.account),
		)];
		for (utxo, round) in &filled {
			inputs.push(utxo.reference);
			let mut value = utxo.output.value.clone();
			take_fee(&mut value, &state.settings.fee.fee_token, round.fees_paid)?;
			outputs.push(self.contract_output(value, OracleDatum::Transport(TransportState::Empty)));
		}

		let body = TxBody {
			inputs,
			reference_inputs: vec![state.settings_utxo.reference],
			outputs,
			mint: BTreeMap::new(),
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer: Redeemer::CalculateRewards,
		};
		info!(
			rounds = filled.len(),
			total_fees = outcome.total_fees,
			"reward batch built"
		);
		self.prepare(body, self.platform_groups(), state.now, vec![])
	}

	async fn build_node_collect(
		&self,
		feed_key: KeyHash,
		payout_address: Address,
	) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let (index, amount) = node_collect_amount(&state.settings, &state.reward_account, &feed_key)?;
		let policy = PayoutPolicy::for_fee(&state.settings.fee);
		ensure_payout_viable(&policy, amount)?;

		let mut account = state.reward_account.clone();
		account.debit_node(index, amount)?;
		let mut reward_value = state.reward_utxo.output.value.clone();
		take_fee(&mut reward_value, &state.settings.fee.fee_token, amount)?;

		let payment_key = state.settings.nodes[index].payment_key;
		let (funding, change) = self.select_funding(&payout_buffer(&policy)).await?;
		let mut inputs = vec![state.reward_utxo.reference];
		inputs.extend(funding);
		let mut outputs = vec![
			self.contract_output(reward_value, OracleDatum::RewardAccount(account)),
			TxOutput {
				address: payout_address,
				value: payout_value(&policy, amount),
				datum: None,
			},
		];
		outputs.extend(change);
		let body = TxBody {
			inputs,
			reference_inputs: vec![state.settings_utxo.reference],
			outputs,
			mint: BTreeMap::new(),
			validity_start: None,
			validity_end: None,
			required_signers: vec![payment_key],
			redeemer: Redeemer::NodeCollect,
		};
		info!(node = %feed_key, amount, "node collect built");
		self.prepare(
			body,
			vec![SignerGroup::new("claimant", 1, vec![payment_key])],
			state.now,
			vec![],
		)
	}

	async fn build_platform_collect(
		&self,
		payout_address: Address,
	) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let amount = platform_collect_amount(&state.reward_account)?;
		let policy = PayoutPolicy::for_fee(&state.settings.fee);
		ensure_payout_viable(&policy, amount)?;

		let mut account = state.reward_account.clone();
		account.debit_platform(amount)?;
		let mut reward_value = state.reward_utxo.output.value.clone();
		take_fee(&mut reward_value, &state.settings.fee.fee_token, amount)?;

		let (funding, change) = self.select_funding(&payout_buffer(&policy)).await?;
		let mut inputs = vec![state.reward_utxo.reference];
		inputs.extend(funding);
		let mut outputs = vec![
			self.contract_output(reward_value, OracleDatum::RewardAccount(account)),
			TxOutput {
				address: payout_address,
				value: payout_value(&policy, amount),
				datum: None,
			},
		];
		outputs.extend(change);
		let body = TxBody {
			inputs,
			reference_inputs: vec![state.settings_utxo.reference],
			outputs,
			mint: BTreeMap::new(),
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer: Redeemer::PlatformCollect,
		};
		info!(amount, "platform collect built");
		self.prepare(body, self.platform_groups(), state.now, vec![])
	}

	async fn build_pause(&self) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let updated = governance::pause(&state.settings, state.now)?;
		self.settings_swap(&state, updated, Redeemer::Pause)
	}

	async fn build_resume(&self) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let updated = governance::resume(&state.settings)?;
		self.settings_swap(&state, updated, Redeemer::Resume)
	}

	async fn build_add_nodes(&self, nodes: Vec<Node>) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let (settings, account) =
			governance::add_nodes(&state.settings, &state.reward_account, &nodes)?;
		self.membership_swap(&state, settings, account, Redeemer::AddNodes)
	}

	/// Removes nodes and routes what they are still owed. Token rewards
	/// go to escrow outputs their payment key can withdraw later; base
	/// currency has no claimant address to pay, so it folds into the
	/// platform bucket.
	async fn build_remove_nodes(
		&self,
		keys: Vec<KeyHash>,
	) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let removal = governance::remove_nodes(&state.settings, &state.reward_account, &keys)?;
		let policy = PayoutPolicy::for_fee(&state.settings.fee);

		let mut account = removal.account;
		let mut reward_value = state.reward_utxo.output.value.clone();
		let mut escrow_outputs = Vec::new();
		let mut buffer = Value::default();
		for (node, owed) in &removal.departed {
			match &policy {
				PayoutPolicy::TokenEscrow(token) => {
					take_fee(&mut reward_value, &Some(token.clone()), *owed)?;
					escrow_outputs.push(TxOutput {
						address: self.escrow_address()?,
						value: Value::from_coin(MIN_OUTPUT_COIN).with_asset(token.clone(), *owed),
						datum: Some(OracleDatum::Escrow(RewardEscrow {
							beneficiary: node.payment_key,
						})),
					});
					accumulate(&mut buffer, &Value::from_coin(MIN_OUTPUT_COIN));
				}
				PayoutPolicy::DirectBaseCurrency => {
					account.credit_platform(*owed)?;
				}
			}
		}

		let (funding, change) = self.select_funding(&buffer).await?;
		let mut inputs = vec![state.settings_utxo.reference, state.reward_utxo.reference];
		inputs.extend(funding);
		let mut outputs = vec![
			self.contract_output(
				state.settings_utxo.output.value.clone(),
				OracleDatum::Settings(removal.settings),
			),
			self.contract_output(reward_value, OracleDatum::RewardAccount(account)),
		];
		outputs.extend(escrow_outputs);
		outputs.extend(change);

		let body = TxBody {
			inputs,
			reference_inputs: vec![],
			outputs,
			mint: BTreeMap::new(),
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer: Redeemer::RemoveNodes,
		};
		info!(owed = removal.departed.len(), "node removal built");
		self.prepare(body, self.platform_groups(), state.now, vec![])
	}

	async fn build_update_settings(
		&self,
		settings: OracleSettings,
	) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let (settings, account) =
			governance::replace_settings(&state.settings, &state.reward_account, settings)?;
		self.membership_swap(&state, settings, account, Redeemer::UpdateSettings)
	}

	async fn build_resize(&self, target: usize) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let snapshot = self.pool.classify(&state.utxos);
		let current = snapshot.pair_count();
		if target == current {
			return Err(OdvError::Validation(format!(
				"pool already holds {target} pairs"
			)));
		}

		let mut mint = BTreeMap::new();
		let (inputs, outputs) = if target > current {
			let delta = target - current;
			mint.insert(self.assets.transport.clone(), delta as i64);
			mint.insert(self.assets.agg_state.clone(), delta as i64);
			let mut outputs = Vec::with_capacity(delta * 2 + 1);
			for _ in 0..delta {
				outputs.push(self.contract_output(
					Value::from_coin(MIN_OUTPUT_COIN).with_asset(self.assets.transport.clone(), 1),
					OracleDatum::Transport(TransportState::Empty),
				));
				outputs.push(self.contract_output(
					Value::from_coin(MIN_OUTPUT_COIN).with_asset(self.assets.agg_state.clone(), 1),
					OracleDatum::AggState(None),
				));
			}
			let required =
				Value::from_coin(MIN_OUTPUT_COIN.saturating_mul(2 * delta as u64));
			let (inputs, change) = self.select_funding(&required).await?;
			outputs.extend(change);
			(inputs, outputs)
		} else {
			let delta = current - target;
			let pairs = self.pool.admit_shrink(&state.utxos, delta, state.now)?;
			mint.insert(self.assets.transport.clone(), -(delta as i64));
			mint.insert(self.assets.agg_state.clone(), -(delta as i64));
			let mut reclaimed = Value::default();
			let mut inputs = Vec::with_capacity(delta * 2);
			for pair in &pairs {
				accumulate(&mut reclaimed, &pair.transport.output.value);
				accumulate(&mut reclaimed, &pair.agg_state.output.value);
				inputs.extend(pair.references());
			}
			// Burned markers leave; their deposits return to the wallet.
			let reclaimed = residual_after_burn(reclaimed, &mint);
			let outputs = vec![TxOutput {
				address: self.funding_address.clone(),
				value: reclaimed,
				datum: None,
			}];
			(inputs, outputs)
		};

		let body = TxBody {
			inputs,
			reference_inputs: vec![state.settings_utxo.reference],
			outputs,
			mint,
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer: Redeemer::Resize,
		};
		info!(current, target, "pool resize built");
		self.prepare(body, self.platform_groups(), state.now, vec![])
	}

	async fn build_remove(&self) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let snapshot = self.pool.classify(&state.utxos);
		if snapshot.filled_transports().next().is_some() {
			return Err(OdvError::ResourceBusy(
				"unprocessed rounds remain in the pool".into(),
			));
		}
		if self.pool.locked_count() > 0 {
			return Err(OdvError::ResourceBusy(
				"locally reserved pairs remain in flight".into(),
			));
		}

		let mut inputs = vec![state.settings_utxo.reference, state.reward_utxo.reference];
		let mut consumed = Value::default();
		accumulate(&mut consumed, &state.settings_utxo.output.value);
		accumulate(&mut consumed, &state.reward_utxo.output.value);
		for utxo in snapshot
			.transports
			.iter()
			.map(|(utxo, _)| utxo)
			.chain(snapshot.agg_states.iter().map(|(utxo, _)| utxo))
		{
			inputs.push(utxo.reference);
			accumulate(&mut consumed, &utxo.output.value);
		}

		let mut mint = BTreeMap::new();
		mint.insert(self.assets.settings.clone(), -1i64);
		mint.insert(self.assets.reward_account.clone(), -1);
		mint.insert(
			self.assets.transport.clone(),
			-(snapshot.transports.len() as i64),
		);
		mint.insert(
			self.assets.agg_state.clone(),
			-(snapshot.agg_states.len() as i64),
		);

		// Everything not burned flows back to the funding wallet.
		let residual = residual_after_burn(consumed, &mint);
		let body = TxBody {
			inputs,
			reference_inputs: vec![],
			outputs: vec![TxOutput {
				address: self.funding_address.clone(),
				value: residual,
				datum: None,
			}],
			mint,
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer: Redeemer::Remove,
		};
		info!("oracle teardown built");
		self.prepare(body, self.platform_groups(), state.now, vec![])
	}

	async fn build_mint_auth(&self, recipient: Address) -> Result<PreparedTransaction, OdvError> {
		let state = self.load_state().await?;
		let mut mint = BTreeMap::new();
		mint.insert(self.assets.auth.clone(), 1i64);

		let (inputs, change) = self
			.select_funding(&Value::from_coin(MIN_OUTPUT_COIN))
			.await?;
		let mut outputs = vec![TxOutput {
			address: recipient,
			value: Value::from_coin(MIN_OUTPUT_COIN).with_asset(self.assets.auth.clone(), 1),
			datum: None,
		}];
		outputs.extend(change);

		let body = TxBody {
			inputs,
			reference_inputs: vec![state.settings_utxo.reference],
			outputs,
			mint,
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer: Redeemer::MintAuth,
		};
		self.prepare(body, self.platform_groups(), state.now, vec![])
	}

	/// Spends the settings output and writes it back with a new datum.
	fn settings_swap(
		&self,
		state: &OracleState,
		settings: OracleSettings,
		redeemer: Redeemer,
	) -> Result<PreparedTransaction, OdvError> {
		let body = TxBody {
			inputs: vec![state.settings_utxo.reference],
			reference_inputs: vec![],
			outputs: vec![self.contract_output(
				state.settings_utxo.output.value.clone(),
				OracleDatum::Settings(settings),
			)],
			mint: BTreeMap::new(),
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer,
		};
		self.prepare(body, self.platform_groups(), state.now, vec![])
	}

	/// Spends settings and reward account together; membership changes
	/// must keep the two positionally aligned in one transaction.
	fn membership_swap(
		&self,
		state: &OracleState,
		settings: OracleSettings,
		account: RewardAccount,
		redeemer: Redeemer,
	) -> Result<PreparedTransaction, OdvError> {
		let body = TxBody {
			inputs: vec![state.settings_utxo.reference, state.reward_utxo.reference],
			reference_inputs: vec![],
			outputs: vec![
				self.contract_output(
					state.settings_utxo.output.value.clone(),
					OracleDatum::Settings(settings),
				),
				self.contract_output(
					state.reward_utxo.output.value.clone(),
					OracleDatum::RewardAccount(account),
				),
			],
			mint: BTreeMap::new(),
			validity_start: None,
			validity_end: None,
			required_signers: self.platform_group.members.clone(),
			redeemer,
		};
		self.prepare(body, self.platform_groups(), state.now, vec![])
	}
}

fn accumulate(total: &mut Value, value: &Value) {
	total.coin = total.coin.saturating_add(value.coin);
	for (asset, amount) in &value.assets {
		total.add_asset(asset.clone(), *amount);
	}
}

/// `total - required`; callers guarantee `total.contains(required)`.
fn value_minus(mut total: Value, required: &Value) -> Value {
	total.coin = total.coin.saturating_sub(required.coin);
	for (asset, amount) in &required.assets {
		total.remove_asset(asset, *amount);
	}
	total
}

/// Drops the burned assets from a transaction's gathered input value,
/// leaving what must flow back out.
fn residual_after_burn(mut total: Value, mint: &BTreeMap<AssetId, i64>) -> Value {
	for (asset, amount) in mint {
		if *amount < 0 {
			total.remove_asset(asset, amount.unsigned_abs());
		}
	}
	total
}

fn single_by_asset(utxos: &[Utxo], asset: &AssetId, what: &str) -> Result<Utxo, OdvError> {
	let mut found: Vec<&Utxo> = utxos.iter().filter(|u| u.has_asset(asset)).collect();
	match found.len() {
		1 => Ok(found.remove(0).clone()),
		0 => Err(OdvError::Validation(format!(
			"no {what} output at the contract address"
		))),
		n => Err(OdvError::Validation(format!(
			"{n} {what} outputs at the contract address; expected exactly one"
		))),
	}
}

fn add_fee(value: &mut Value, fee_token: &Option<AssetId>, amount: u64) {
	match fee_token {
		Some(token) => value.add_asset(token.clone(), amount),
		None => value.coin += amount,
	}
}

fn take_fee(value: &mut Value, fee_token: &Option<AssetId>, amount: u64) -> Result<(), OdvError> {
	let short = || OdvError::Validation("output does not carry the expected fee amount".into());
	match fee_token {
		Some(token) => {
			if value.remove_asset(token, amount) != amount {
				return Err(short());
			}
		}
		None => {
			value.coin = value.coin.checked_sub(amount).ok_or_else(short)?;
		}
	}
	Ok(())
}

/// Funding a payout needs beyond the contract's own value: the coin
/// deposit riding under a token payout.
fn payout_buffer(policy: &PayoutPolicy) -> Value {
	match policy {
		PayoutPolicy::TokenEscrow(_) => Value::from_coin(MIN_OUTPUT_COIN),
		PayoutPolicy::DirectBaseCurrency => Value::default(),
	}
}

fn payout_value(policy: &PayoutPolicy, amount: u64) -> Value {
	match policy {
		// The claimant tops the escrow output up to the minimum deposit.
		PayoutPolicy::TokenEscrow(token) => {
			Value::from_coin(MIN_OUTPUT_COIN).with_asset(token.clone(), amount)
		}
		PayoutPolicy::DirectBaseCurrency => Value::from_coin(amount),
	}
}

fn artifact_error(error: ArtifactError) -> OdvError {
	match error {
		ArtifactError::UnauthorizedSigner(key) => OdvError::UnauthorizedSigner(key),
		ArtifactError::AlreadySigned(key) => OdvError::AlreadySigned(key),
		ArtifactError::Serialization(message) => OdvError::Serialization(message),
		other => OdvError::Validation(other.to_string()),
	}
}
