//! Group membership handle for the embedded broker

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::group::{generate_member_id, JoinRequest};
use super::log::PartitionLog;
use super::BrokerState;
use crate::config::GroupSettings;
use crate::kafka::cluster::{Claim, Generation, GenerationRelease, GroupMembership};
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{Record, StartOffset};

pub(crate) struct MemoryMembership {
    state: Arc<BrokerState>,
    group_id: String,
    client_id: String,
    topics: Vec<String>,
    settings: GroupSettings,
    /// Allocated up front so a join abandoned mid-way can still leave
    member_id: String,
    joined: Mutex<bool>,
    errors_tx: Mutex<Option<mpsc::UnboundedSender<KafkaError>>>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<KafkaError>>>,
    /// Stops the claim feeders of the current generation
    feeders: Mutex<Option<CancellationToken>>,
    closed: CancellationToken,
}

impl MemoryMembership {
    pub(crate) fn new(
        state: Arc<BrokerState>,
        group_id: &str,
        client_id: &str,
        topics: &[String],
        settings: &GroupSettings,
        closed: CancellationToken,
    ) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            state,
            group_id: group_id.to_string(),
            client_id: client_id.to_string(),
            topics: topics.to_vec(),
            settings: settings.clone(),
            member_id: generate_member_id(client_id),
            joined: Mutex::new(false),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            feeders: Mutex::new(None),
            closed,
        }
    }

    fn stop_feeders(&self) {
        if let Some(token) = self.feeders.lock().take() {
            token.cancel();
        }
    }

    fn start_offset(&self, log: &PartitionLog, topic: &str, partition: i32) -> i64 {
        if let Some(committed) = self.state.groups.committed(&self.group_id, topic, partition) {
            return committed;
        }
        match self.settings.initial_offset {
            StartOffset::Earliest => log.low_watermark(),
            StartOffset::Latest => log.high_watermark(),
            StartOffset::At(o) => o,
        }
    }
}

/// Copy records from a partition log into a claim channel until stopped
async fn feed_claim(
    log: Arc<PartitionLog>,
    topic: String,
    partition: i32,
    mut offset: i64,
    tx: mpsc::Sender<Record>,
    stop: CancellationToken,
) {
    loop {
        while let Some(record) = log.read(&topic, partition, offset) {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                sent = tx.send(record) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            offset += 1;
        }

        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = tx.closed() => return,
            _ = log.wait_for(offset) => {}
        }
    }
}

#[async_trait]
impl GroupMembership for MemoryMembership {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn member_id(&self) -> Option<String> {
        self.joined.lock().then(|| self.member_id.clone())
    }

    async fn join(&self) -> Result<Generation> {
        if self.closed.is_cancelled() {
            return Err(KafkaError::Closed("group membership"));
        }
        self.stop_feeders();

        let errors = self
            .errors_tx
            .lock()
            .clone()
            .ok_or(KafkaError::Closed("group membership"))?;
        let topic_partitions = self.state.partition_counts();
        let request = JoinRequest {
            group_id: &self.group_id,
            member_id: Some(&self.member_id),
            client_id: &self.client_id,
            topics: &self.topics,
            strategy: &self.settings.assignment_strategy,
            rebalance_timeout: self.settings.rebalance_timeout(),
            errors: &errors,
        };

        let (member_id, grant) = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(KafkaError::Closed("group membership")),
            joined = self.state.groups.join(request, &topic_partitions) => joined?,
        };
        *self.joined.lock() = true;

        let feeders = self.closed.child_token();
        *self.feeders.lock() = Some(feeders.clone());

        let mut claims = Vec::with_capacity(grant.claims.len());
        for (topic, partition) in grant.claims {
            let log = self.state.log(&topic, partition)?;
            let initial_offset = self.start_offset(&log, &topic, partition);
            let (tx, rx) = mpsc::channel(self.settings.claim_buffer);
            tokio::spawn(feed_claim(
                log,
                topic.clone(),
                partition,
                initial_offset,
                tx,
                feeders.clone(),
            ));
            claims.push(Claim {
                topic,
                partition,
                initial_offset,
                records: rx,
            });
        }

        debug!(
            group_id = %self.group_id,
            member_id = %member_id,
            generation = grant.generation_id,
            claims = claims.len(),
            "memory membership joined"
        );

        Ok(Generation {
            generation_id: grant.generation_id,
            member_id,
            claims,
            revoked: grant.revoked,
            // the join barrier already waits for this member to come back
            released: GenerationRelease::default(),
        })
    }

    fn mark(&self, topic: &str, partition: i32, offset: i64) {
        self.state
            .groups
            .mark(&self.group_id, &self.member_id, topic, partition, offset);
    }

    async fn commit(&self) -> Result<()> {
        // marks are applied to the group synchronously
        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<KafkaError>> {
        self.errors_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.stop_feeders();
        self.closed.cancel();
        // dropping our sender closes the error stream once the group lets go
        // of its clone below
        self.errors_tx.lock().take();

        *self.joined.lock() = false;
        let topic_partitions = self.state.partition_counts();
        if self
            .state
            .groups
            .leave(&self.group_id, &self.member_id, &topic_partitions)
        {
            info!(group_id = %self.group_id, member_id = %self.member_id, "left group");
        }
        Ok(())
    }
}
