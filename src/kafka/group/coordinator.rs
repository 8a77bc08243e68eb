//! Consumer group coordinator and its membership state machine
//!
//! ```text
//! Idle ─start─> Joining ─> Consuming <──> Rebalancing
//!                               │              │
//!                               └──── stop ────┴─> Draining ─> Closed
//! ```
//!
//! All background work runs under one [`ShutdownController`]: the
//! membership task, the error-drain task, and (through the membership task)
//! every claim handler. `stop()` cancels the scope, closes the membership
//! and waits for all of it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{self, Outcome};
use crate::config::GroupSettings;
use crate::kafka::cluster::GroupMembership;
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::DeliveredMessage;
use crate::kafka::session::ClientSession;
use crate::kafka::shutdown::{Closeable, Latch, ShutdownController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    Idle,
    Joining,
    Consuming,
    Rebalancing,
    Draining,
    Closed,
}

impl CoordinatorState {
    fn can_transition(self, to: CoordinatorState) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, to),
            (Idle, Joining)
                | (Idle, Closed)
                | (Joining, Consuming)
                | (Joining, Rebalancing)
                | (Consuming, Rebalancing)
                | (Rebalancing, Consuming)
                | (Rebalancing, Rebalancing)
                | (Joining | Consuming | Rebalancing, Draining)
                | (Joining, Closed)
                | (Draining, Closed)
        )
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Joining => "joining",
            CoordinatorState::Consuming => "consuming",
            CoordinatorState::Rebalancing => "rebalancing",
            CoordinatorState::Draining => "draining",
            CoordinatorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State shared between the coordinator handle and its background tasks
pub(super) struct Shared {
    pub(super) group_id: String,
    state: Mutex<CoordinatorState>,
    generation: AtomicI32,
    assigned: Mutex<Vec<(String, i32)>>,
    /// Opens once the first generation is set up
    pub(super) ready: Latch,
}

impl Shared {
    fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            state: Mutex::new(CoordinatorState::Idle),
            generation: AtomicI32::new(-1),
            assigned: Mutex::new(Vec::new()),
            ready: Latch::new(),
        }
    }

    pub(super) fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    /// Move to `to` if allowed; returns whether the state changed
    pub(super) fn transition(&self, to: CoordinatorState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition(to) {
            return false;
        }
        if *state != to {
            debug!(group_id = %self.group_id, from = %*state, to = %to, "coordinator state");
        }
        *state = to;
        true
    }

    pub(super) fn begin_generation(&self, generation_id: i32, partitions: Vec<(String, i32)>) {
        self.generation.store(generation_id, Ordering::SeqCst);
        *self.assigned.lock() = partitions;
    }

    pub(super) fn end_generation(&self) {
        self.assigned.lock().clear();
    }
}

/// Closes the membership as part of the coordinator's shutdown plan
struct MembershipCloser(Arc<dyn GroupMembership>);

#[async_trait]
impl Closeable for MembershipCloser {
    fn name(&self) -> &str {
        "group membership"
    }

    async fn close(&self) -> Result<()> {
        self.0.close().await
    }
}

pub struct ConsumerGroupCoordinator {
    session: Arc<ClientSession>,
    settings: GroupSettings,
    shared: Arc<Shared>,
    output_tx: Mutex<Option<mpsc::Sender<DeliveredMessage>>>,
    output: Arc<tokio::sync::Mutex<mpsc::Receiver<DeliveredMessage>>>,
    shutdown: ShutdownController,
}

impl ConsumerGroupCoordinator {
    /// Create an idle coordinator; nothing talks to the broker until `start`
    pub fn new(session: Arc<ClientSession>, group_id: &str, settings: GroupSettings) -> Result<Self> {
        settings.validate()?;
        let (output_tx, output_rx) = mpsc::channel(settings.channel_capacity);
        Ok(Self {
            session,
            settings,
            shared: Arc::new(Shared::new(group_id)),
            output_tx: Mutex::new(Some(output_tx)),
            output: Arc::new(tokio::sync::Mutex::new(output_rx)),
            shutdown: ShutdownController::new(),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.shared.group_id
    }

    pub fn state(&self) -> CoordinatorState {
        self.shared.state()
    }

    /// Id of the most recent generation, once one has started
    pub fn generation(&self) -> Option<i32> {
        let id = self.shared.generation.load(Ordering::SeqCst);
        (id >= 0).then_some(id)
    }

    /// Partitions claimed by the current generation
    pub fn assigned(&self) -> Vec<(String, i32)> {
        self.shared.assigned.lock().clone()
    }

    /// The output channel; the same receiver for the coordinator's lifetime
    pub fn messages(&self) -> Arc<tokio::sync::Mutex<mpsc::Receiver<DeliveredMessage>>> {
        self.output.clone()
    }

    /// Next delivered message; `None` once stopped and drained
    pub async fn recv(&self) -> Option<DeliveredMessage> {
        self.output.lock().await.recv().await
    }

    /// Join the group and start consuming
    ///
    /// Returns once the first generation is set up, even if it has no
    /// claims. Fails with `Join` when the membership cannot be created or
    /// the group is not ready within `ready_timeout_ms`.
    pub async fn start<S: AsRef<str>>(&self, topics: &[S]) -> Result<()> {
        if !self.shared.transition(CoordinatorState::Joining) {
            return Err(KafkaError::Join(format!(
                "coordinator for group {} cannot start from state {}",
                self.shared.group_id,
                self.state()
            )));
        }
        let topics: Vec<String> = topics.iter().map(|t| t.as_ref().to_string()).collect();
        info!(group_id = %self.shared.group_id, topics = ?topics, "joining consumer group");

        let membership = match self.create_membership(&topics).await {
            Ok(membership) => membership,
            Err(e) => {
                error!(group_id = %self.shared.group_id, error = %e, "failed to create group membership");
                self.shared.transition(CoordinatorState::Closed);
                return Err(e.into_join());
            }
        };
        self.shutdown
            .register(Arc::new(MembershipCloser(membership.clone())));

        if let Some(errors) = membership.take_errors() {
            self.shutdown
                .spawn("group-error-drain", drain_errors(self.shared.clone(), errors));
        }

        let output = self
            .output_tx
            .lock()
            .take()
            .ok_or(KafkaError::Closed("consumer group"))?;
        self.shutdown.spawn(
            "group-membership",
            run_membership(
                membership,
                output,
                self.shared.clone(),
                self.shutdown.token(),
                self.settings.clone(),
            ),
        );

        self.await_ready().await
    }

    async fn create_membership(&self, topics: &[String]) -> Result<Arc<dyn GroupMembership>> {
        self.session
            .cluster()?
            .join_group(&self.shared.group_id, topics, &self.settings)
            .await
    }

    async fn await_ready(&self) -> Result<()> {
        let cancelled = self.shutdown.token();
        let ready = async {
            tokio::select! {
                _ = self.shared.ready.wait() => Ok(()),
                _ = cancelled.cancelled() => Err(KafkaError::Closed("consumer group")),
            }
        };

        let result = match self.settings.ready_timeout() {
            Some(limit) => match tokio::time::timeout(limit, ready).await {
                Ok(result) => result,
                Err(_) => Err(KafkaError::Join(format!(
                    "group {} not ready within {}ms",
                    self.shared.group_id,
                    limit.as_millis()
                ))),
            },
            None => ready.await,
        };

        match result {
            Ok(()) => {
                info!(
                    group_id = %self.shared.group_id,
                    generation = ?self.generation(),
                    assigned = ?self.assigned(),
                    "consumer group ready"
                );
                Ok(())
            }
            Err(e) => {
                error!(group_id = %self.shared.group_id, error = %e, "consumer group did not become ready");
                self.stop().await;
                Err(e.into_join())
            }
        }
    }

    /// Cancel all group work, leave the group and wait for every background
    /// task to finish
    ///
    /// Safe to call more than once; later calls wait for the first.
    pub async fn stop(&self) {
        if self.shared.transition(CoordinatorState::Draining) {
            info!(group_id = %self.shared.group_id, "stopping consumer group");
        }
        self.output_tx.lock().take();
        self.shutdown.shutdown().await;
        if self.shared.transition(CoordinatorState::Closed) {
            info!(group_id = %self.shared.group_id, "consumer group stopped");
        }
    }
}

#[async_trait]
impl Closeable for ConsumerGroupCoordinator {
    fn name(&self) -> &str {
        "consumer group"
    }

    async fn close(&self) -> Result<()> {
        self.stop().await;
        Ok(())
    }
}

impl Drop for ConsumerGroupCoordinator {
    fn drop(&mut self) {
        match self.state() {
            CoordinatorState::Idle | CoordinatorState::Closed => {}
            state => {
                warn!(
                    group_id = %self.shared.group_id,
                    state = %state,
                    "consumer group dropped without stop(); cancelling background tasks"
                );
                self.shutdown.token().cancel();
            }
        }
    }
}

impl std::fmt::Debug for ConsumerGroupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroupCoordinator")
            .field("group_id", &self.shared.group_id)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

async fn drain_errors(shared: Arc<Shared>, mut errors: mpsc::UnboundedReceiver<KafkaError>) {
    while let Some(e) = errors.recv().await {
        warn!(
            group_id = %shared.group_id,
            error = %e,
            category = e.category(),
            "consumer group error"
        );
    }
    debug!(group_id = %shared.group_id, "group error stream closed");
}

/// Join and consume until cancelled, rejoining after every rebalance
async fn run_membership(
    membership: Arc<dyn GroupMembership>,
    output: mpsc::Sender<DeliveredMessage>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    settings: GroupSettings,
) {
    loop {
        match handler::consume(&membership, &output, &shared, &cancel).await {
            Ok(Outcome::Cancelled) => break,
            Ok(Outcome::Rebalanced) => {
                shared.transition(CoordinatorState::Rebalancing);
                info!(group_id = %shared.group_id, "rebalancing");
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                error!(
                    group_id = %shared.group_id,
                    error = %e,
                    backoff_ms = settings.rebalance_retry_backoff_ms,
                    "consume round failed, rejoining"
                );
                shared.transition(CoordinatorState::Rebalancing);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.rebalance_retry_backoff()) => {}
                }
            }
        }
    }

    // also reached when the coordinator is dropped without stop()
    if let Err(e) = membership.close().await {
        warn!(group_id = %shared.group_id, error = %e, "failed to leave group");
    }
    debug!(group_id = %shared.group_id, "membership task stopped");
}
