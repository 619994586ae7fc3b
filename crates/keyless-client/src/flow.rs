//! Commit-reveal orchestration
//!
//! One [`CommitRevealFlow`] drives one operation through
//!
//! ```text
//! Idle -> ProofPrepared -> Committed -> Revealed(Success | FailureReported | Error)
//! ```
//!
//! All input validation and a local proof check happen in `prepare`, before
//! anything is sent. Commits are never resubmitted automatically; reveals
//! are retried on transient failures with identical parameters.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use keyless_core::identity::inner_hseed;
use keyless_core::{
    compose, leaf_value, Address, Authorization, Commit, CoreSelection, ExtendedOtp, LeafInput,
    Operation, OtpCode, TreeTarget, WalletRecord,
};
use keyless_worker::{RandomnessQuery, TreeWorker, WorkerError};

use crate::config::ClientConfig;
use crate::error::FlowError;
use crate::registry::Registry;
use crate::relayer::{CommitRequest, Relayer, RelayerError, RelayerReceipt, RevealRequest};

/// How a reveal ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealOutcome {
    Success { tx: Option<String> },
    /// The contract rejected the operation
    FailureReported,
    /// Unexpected failure
    Error,
}

/// Position of a flow in the commit-reveal sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    ProofPrepared,
    Committed,
    Revealed(RevealOutcome),
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Idle => write!(f, "idle"),
            FlowState::ProofPrepared => write!(f, "proof prepared"),
            FlowState::Committed => write!(f, "committed"),
            FlowState::Revealed(RevealOutcome::Success { .. }) => write!(f, "revealed"),
            FlowState::Revealed(RevealOutcome::FailureReported) => write!(f, "reveal rejected"),
            FlowState::Revealed(RevealOutcome::Error) => write!(f, "reveal failed"),
        }
    }
}

/// Failures and side effects reported while a flow runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    CommitError { message: String },
    CommitFailure { message: String },
    /// A transient reveal failure; `remaining` attempts are left
    RevealAttemptFailed { remaining: u32, message: String },
    RevealFailure { message: String },
    RevealError { message: String },
    Success { tx: Option<String> },
    /// Balances and nonces of these addresses changed
    Invalidate { addresses: Vec<Address> },
}

/// Receives state transitions and events of a flow
pub trait FlowObserver: Send {
    fn on_state(&mut self, _state: &FlowState) {}

    fn on_event(&mut self, _event: &FlowEvent) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlowObserver;

impl FlowObserver for NoopFlowObserver {}

/// Retry policy of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSettings {
    pub reveal_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for FlowSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            reveal_attempts: config.reveal_attempts.max(1),
            retry_delay: config.reveal_retry_delay(),
        }
    }
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationIntent {
    pub operation: Operation,
    /// Code as typed by the user
    pub otp: String,
    /// Second code for double-OTP wallets
    pub otp2: Option<String>,
    /// Tree generation proving the operation
    pub generation: CoreSelection,
    pub target: TreeTarget,
    /// Operation index within the current interval
    pub nonce: u16,
}

impl OperationIntent {
    pub fn new(operation: Operation, otp: impl Into<String>) -> Self {
        Self {
            operation,
            otp: otp.into(),
            otp2: None,
            generation: CoreSelection::Current,
            target: TreeTarget::Main,
            nonce: 0,
        }
    }

    pub fn with_second_otp(mut self, otp2: impl Into<String>) -> Self {
        self.otp2 = Some(otp2.into());
        self
    }

    /// Prove with a generation replaced by renewal, as selected by restore
    pub fn with_generation(mut self, generation: CoreSelection) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_target(mut self, target: TreeTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_nonce(mut self, nonce: u16) -> Self {
        self.nonce = nonce;
        self
    }

    /// Parse the typed codes against the wallet's OTP mode
    fn codes(&self, record: &WalletRecord) -> keyless_core::Result<(OtpCode, Option<OtpCode>)> {
        let otp: OtpCode = self.otp.parse()?;
        let otp2 = match (&self.otp2, record.double_otp) {
            (Some(code), true) => Some(code.parse::<OtpCode>()?),
            (None, true) => {
                return Err(keyless_core::Error::InvalidOtp(
                    "wallet requires a second code".to_string(),
                ))
            }
            (Some(_), false) => {
                return Err(keyless_core::Error::InvalidOtp(
                    "wallet does not use a second code".to_string(),
                ))
            }
            (None, false) => None,
        };
        Ok((otp, otp2))
    }
}

/// Proof material bound to one operation
#[derive(Debug, Clone)]
struct PreparedOperation {
    operation: Operation,
    authorization: Authorization,
    extended: ExtendedOtp,
}

/// Drives one operation of one wallet through commit and reveal
pub struct CommitRevealFlow {
    address: Address,
    relayer: Arc<dyn Relayer>,
    worker: Arc<TreeWorker>,
    observer: Box<dyn FlowObserver>,
    settings: FlowSettings,
    state: FlowState,
    prepared: Option<PreparedOperation>,
}

impl CommitRevealFlow {
    pub fn new(address: Address, relayer: Arc<dyn Relayer>, worker: Arc<TreeWorker>) -> Self {
        Self {
            address,
            relayer,
            worker,
            observer: Box::new(NoopFlowObserver),
            settings: FlowSettings::default(),
            state: FlowState::Idle,
            prepared: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn FlowObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// Proof material of the prepared operation
    pub fn prepared(&self) -> Option<(&Authorization, &ExtendedOtp)> {
        self.prepared
            .as_ref()
            .map(|p| (&p.authorization, &p.extended))
    }

    /// Return to idle, dropping any prepared proof
    pub fn reset(&mut self) {
        self.prepared = None;
        if self.state != FlowState::Idle {
            self.transition(FlowState::Idle);
        }
    }

    /// Prepare, commit and reveal
    pub async fn run(
        &mut self,
        registry: &mut Registry,
        intent: &OperationIntent,
        now: u64,
    ) -> Result<RelayerReceipt, FlowError> {
        self.prepare(registry, intent, now).await?;
        self.commit(registry, now).await?;
        self.reveal(registry).await
    }

    /// Validate the intent and build its proof for the slot at `now`
    pub async fn prepare(
        &mut self,
        registry: &mut Registry,
        intent: &OperationIntent,
        now: u64,
    ) -> Result<(), FlowError> {
        if self.state != FlowState::Idle {
            return Err(self.invalid_state("prepare"));
        }

        let record = registry.load(&self.address)?.clone();
        let (otp, otp2) = intent.codes(&record).map_err(FlowError::Validation)?;
        intent.operation.validate().map_err(FlowError::Validation)?;
        record
            .check_spending_limit(intent.target, intent.operation.native_amount())
            .map_err(FlowError::Validation)?;
        let generation = record
            .generation(intent.generation)
            .map_err(FlowError::Validation)?;
        let core = record
            .target_core(intent.generation, intent.target)
            .map_err(FlowError::Validation)?;
        let index = core.slot_index(now, intent.nonce).map_err(FlowError::Validation)?;

        let layers = registry.layers(&core.root)?;
        let hseed = match intent.target {
            TreeTarget::Main => generation.hseed,
            TreeTarget::Inner(i) => inner_hseed(&generation.hseed, i),
        };
        let security = generation.security;
        let input = LeafInput::new(otp, otp2, intent.nonce);

        let eotp = if security.randomness > 0 && intent.target == TreeTarget::Main {
            let query = RandomnessQuery {
                hseed,
                index,
                input,
                bits: security.randomness,
                hasher: security.hasher,
                expected_leaf: layers.leaf(index).map_err(proof_error)?,
            };
            match self.worker.recover_randomness(query).await {
                Ok(recovered) => recovered.eotp,
                Err(WorkerError::RandomnessNotFound { index }) => {
                    return Err(FlowError::Validation(keyless_core::Error::InvalidOtp(format!(
                        "code does not match slot {}",
                        index
                    ))))
                }
                Err(e) => return Err(proof_error(e)),
            }
        } else {
            leaf_value(&hseed, &input, security.hasher).map_err(proof_error)?
        };

        let proof = layers.proof(index).map_err(proof_error)?;
        let authorization = Authorization::new(proof, eotp).map_err(proof_error)?;
        if !authorization.verify(&core.root) {
            warn!(address = %self.address, index, "Proof does not match root");
            return Err(FlowError::Validation(keyless_core::Error::InvalidOtp(format!(
                "code does not match slot {}",
                index
            ))));
        }

        let extended = compose(&eotp, &intent.operation, record.scheme());
        debug!(
            address = %self.address,
            operation = intent.operation.name(),
            generation = ?intent.generation,
            index,
            "Proof prepared"
        );
        self.prepared = Some(PreparedOperation {
            operation: intent.operation.clone(),
            authorization,
            extended,
        });
        self.transition(FlowState::ProofPrepared);
        Ok(())
    }

    /// Submit the commit for the prepared operation
    pub async fn commit(&mut self, registry: &mut Registry, now: u64) -> Result<Commit, FlowError> {
        if self.state != FlowState::ProofPrepared {
            return Err(self.invalid_state("commit"));
        }
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| FlowError::InvalidState {
                action: "commit",
                state: "without a prepared proof".to_string(),
            })?;
        let commit = Commit::new(&prepared.authorization, &prepared.extended, now)
            .map_err(proof_error)?;

        if let Err(e) = registry.begin_commit(&self.address, now) {
            self.reset();
            return Err(e.into());
        }

        let request = CommitRequest::new(self.address, &commit);
        match self.relayer.commit(&request).await {
            Ok(_) => {
                if let Err(e) = registry.record_commit(&self.address, commit.hash, now) {
                    warn!(address = %self.address, error = %e, "Could not store pending commit");
                }
                info!(address = %self.address, hash = %commit.hash.short(), "Commit accepted");
                self.transition(FlowState::Committed);
                Ok(commit)
            }
            Err(RelayerError::Rejected(message)) => {
                warn!(address = %self.address, %message, "Commit rejected");
                self.emit(FlowEvent::CommitFailure {
                    message: message.clone(),
                });
                self.reset();
                Err(FlowError::CommitFailure(message))
            }
            Err(e) => {
                let message = e.to_string();
                warn!(address = %self.address, %message, "Commit could not be submitted");
                self.emit(FlowEvent::CommitError {
                    message: message.clone(),
                });
                self.reset();
                Err(FlowError::CommitError(message))
            }
        }
    }

    /// Reveal the committed operation
    pub async fn reveal(&mut self, registry: &mut Registry) -> Result<RelayerReceipt, FlowError> {
        match &self.state {
            FlowState::Committed => {}
            FlowState::Revealed(RevealOutcome::Success { .. }) => {
                return Err(FlowError::AlreadyRevealed)
            }
            _ => return Err(self.invalid_state("reveal")),
        }
        let request = match &self.prepared {
            Some(prepared) => RevealRequest {
                address: self.address,
                authorization: prepared.authorization.clone(),
                operation: prepared.operation.clone(),
            },
            None => return Err(self.invalid_state("reveal")),
        };

        let attempts = self.settings.reveal_attempts.max(1);
        for attempt in 1..=attempts {
            match self.relayer.reveal(&request).await {
                Ok(receipt) => {
                    if let Err(e) = registry.complete_commit(&self.address) {
                        warn!(
                            address = %self.address,
                            error = %e,
                            "Could not clear pending commit"
                        );
                    }
                    info!(
                        address = %self.address,
                        operation = request.operation.name(),
                        tx = receipt.tx.as_deref().unwrap_or("-"),
                        "Operation revealed"
                    );
                    self.prepared = None;
                    self.transition(FlowState::Revealed(RevealOutcome::Success {
                        tx: receipt.tx.clone(),
                    }));
                    self.emit(FlowEvent::Success {
                        tx: receipt.tx.clone(),
                    });
                    let mut addresses = vec![self.address];
                    addresses.extend(request.operation.affected_addresses());
                    self.emit(FlowEvent::Invalidate { addresses });
                    return Ok(receipt);
                }
                Err(RelayerError::Rejected(message)) => {
                    warn!(address = %self.address, %message, "Reveal rejected");
                    self.prepared = None;
                    self.transition(FlowState::Revealed(RevealOutcome::FailureReported));
                    self.emit(FlowEvent::RevealFailure {
                        message: message.clone(),
                    });
                    return Err(FlowError::RevealFailure(message));
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let remaining = attempts - attempt;
                    warn!(
                        address = %self.address,
                        attempt,
                        remaining,
                        error = %e,
                        "Reveal attempt failed"
                    );
                    self.emit(FlowEvent::RevealAttemptFailed {
                        remaining,
                        message: e.to_string(),
                    });
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(address = %self.address, %message, "Reveal failed");
                    self.transition(FlowState::Revealed(RevealOutcome::Error));
                    self.emit(FlowEvent::RevealError {
                        message: message.clone(),
                    });
                    self.reset();
                    return Err(FlowError::RevealError(message));
                }
            }
        }
        Err(FlowError::RevealError("no reveal attempt was made".to_string()))
    }

    fn transition(&mut self, state: FlowState) {
        debug!(address = %self.address, from = %self.state, to = %state, "Flow transition");
        self.state = state;
        self.observer.on_state(&self.state);
    }

    fn emit(&mut self, event: FlowEvent) {
        self.observer.on_event(&event);
    }

    fn invalid_state(&self, action: &'static str) -> FlowError {
        FlowError::InvalidState {
            action,
            state: self.state.to_string(),
        }
    }
}

fn proof_error(e: impl fmt::Display) -> FlowError {
    FlowError::Proof(e.to_string())
}
