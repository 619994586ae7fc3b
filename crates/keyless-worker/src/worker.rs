//! Tree worker
//!
//! Runs tree builds and randomness searches on the blocking thread pool.
//! Each request gets a token and a fresh cancellation flag; starting a new
//! request raises the previous flag and supersedes its token, so a stale
//! job stops at its next progress check and nothing it posts afterwards
//! reaches subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use keyless_core::{
    build_tree, recover_randomness, BuildObserver, BuildProgress, BuiltTree, TreeRequest,
};

use crate::error::{Result, WorkerError};
use crate::protocol::{BuildSummary, RandomnessQuery, RecoveredRandomness, WorkerMessage};
use crate::token::TokenGate;

/// Capacity of the subscriber channel
const EVENT_CAPACITY: usize = 256;

/// Observer that forwards progress to the async side
struct ChannelObserver {
    token: u64,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    cancel: Arc<AtomicBool>,
}

impl BuildObserver for ChannelObserver {
    fn on_progress(&mut self, progress: BuildProgress) {
        let _ = self.tx.send(WorkerMessage::Working {
            token: self.token,
            current: progress.current,
            total: progress.total,
            stage: progress.stage,
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Background tree builder and randomness searcher
pub struct TreeWorker {
    builds: TokenGate,
    searches: TokenGate,
    build_cancel: Mutex<Arc<AtomicBool>>,
    search_cancel: Mutex<Arc<AtomicBool>>,
    event_tx: broadcast::Sender<WorkerMessage>,
}

impl Default for TreeWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeWorker {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            builds: TokenGate::new(),
            searches: TokenGate::new(),
            build_cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
            search_cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
            event_tx,
        }
    }

    /// Subscribe to messages of current requests
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
        self.event_tx.subscribe()
    }

    /// Whether a message belongs to the latest request of its kind
    pub fn is_current(&self, message: &WorkerMessage) -> bool {
        if message.is_randomness() {
            self.searches.is_current(message.token())
        } else {
            self.builds.is_current(message.token())
        }
    }

    /// Supersede any in-flight build
    pub async fn cancel_build(&self) {
        let (token, _) = supersede(&self.builds, &self.build_cancel).await;
        debug!(token, "Build cancelled");
    }

    /// Build a tree in the background
    ///
    /// Resolves with the tree, or with [`WorkerError::Superseded`] when a
    /// newer build or a cancel arrived first.
    pub async fn build(&self, request: TreeRequest) -> Result<BuiltTree> {
        let (token, cancel) = supersede(&self.builds, &self.build_cancel).await;
        info!(
            token,
            slots = request.params.slot_count(),
            inner = request.inner_trees.len(),
            "Starting tree build"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut observer = ChannelObserver { token, tx, cancel };
        let mut handle = tokio::task::spawn_blocking(move || build_tree(&request, &mut observer));

        let joined = loop {
            tokio::select! {
                Some(message) = rx.recv() => self.dispatch(message),
                joined = &mut handle => break joined,
            }
        };
        while let Ok(message) = rx.try_recv() {
            self.dispatch(message);
        }

        let result = joined?;
        if !self.builds.is_current(token) {
            debug!(token, "Discarding superseded build");
            return Err(WorkerError::Superseded { token });
        }

        match result {
            Ok(tree) => {
                info!(token, root = %tree.root.short(), "Tree build complete");
                self.dispatch(WorkerMessage::Done {
                    token,
                    result: BuildSummary::from(&tree),
                });
                Ok(tree)
            }
            Err(e) => {
                warn!(token, error = %e, "Tree build failed");
                self.dispatch(WorkerMessage::Failed {
                    token,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Search the randomness of one randomized leaf
    pub async fn recover_randomness(&self, query: RandomnessQuery) -> Result<RecoveredRandomness> {
        let (token, cancel) = supersede(&self.searches, &self.search_cancel).await;
        let index = query.index;
        debug!(token, index, bits = query.bits, "Starting randomness search");

        let found = tokio::task::spawn_blocking(move || {
            recover_randomness(
                &query.hseed,
                &query.input,
                query.bits,
                query.hasher,
                &query.expected_leaf,
                || cancel.load(Ordering::Relaxed),
            )
        })
        .await?;

        if !self.searches.is_current(token) {
            debug!(token, "Discarding superseded randomness search");
            return Err(WorkerError::Superseded { token });
        }

        match found {
            Ok(found) => {
                self.dispatch(WorkerMessage::RandomnessRecovered {
                    token,
                    index,
                    found: found.is_some(),
                });
                let (randomness, eotp) = found.ok_or(WorkerError::RandomnessNotFound { index })?;
                Ok(RecoveredRandomness { randomness, eotp })
            }
            Err(e) => {
                self.dispatch(WorkerMessage::Failed {
                    token,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Post a message to subscribers unless its request was superseded
    fn dispatch(&self, message: WorkerMessage) {
        if !self.is_current(&message) {
            debug!(token = message.token(), "Dropping stale worker message");
            return;
        }
        // no subscribers is fine
        let _ = self.event_tx.send(message);
    }
}

/// Issue a token, raise the previous job's flag and install a fresh one
///
/// All three happen under the flag lock, so the flag installed last always
/// belongs to the newest token.
async fn supersede(gate: &TokenGate, slot: &Mutex<Arc<AtomicBool>>) -> (u64, Arc<AtomicBool>) {
    let mut guard = slot.lock().await;
    let token = gate.issue();
    guard.store(true, Ordering::SeqCst);
    let fresh = Arc::new(AtomicBool::new(false));
    *guard = fresh.clone();
    (token, fresh)
}
