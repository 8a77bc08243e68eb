//! One generation of claim handling
//!
//! `consume` joins, starts a handler per claim and returns only after every
//! handler of that generation has stopped and the marked offsets have been
//! committed, and releases the generation only then. The next generation's
//! handlers therefore never overlap with the previous ones on the output
//! channel, and the backend keeps the partitions until the release.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::{CoordinatorState, Shared};
use crate::kafka::cluster::{Claim, GroupMembership};
use crate::kafka::error::Result;
use crate::kafka::messages::DeliveredMessage;

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Outcome {
    /// The group started a new rebalance
    Rebalanced,
    /// The coordinator is shutting down
    Cancelled,
}

pub(super) async fn consume(
    membership: &Arc<dyn GroupMembership>,
    output: &mpsc::Sender<DeliveredMessage>,
    shared: &Shared,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    let generation = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
        joined = membership.join() => joined?,
    };

    let generation_id = generation.generation_id;
    shared.begin_generation(generation_id, generation.partitions());
    shared.transition(CoordinatorState::Consuming);
    shared.ready.open();
    info!(
        group_id = %shared.group_id,
        member_id = %generation.member_id,
        generation = generation_id,
        claims = generation.claims.len(),
        "generation started"
    );

    let stop = cancel.child_token();
    let mut handlers = JoinSet::new();
    for claim in generation.claims {
        handlers.spawn(handle_claim(
            claim,
            membership.clone(),
            output.clone(),
            stop.clone(),
        ));
    }

    let outcome = tokio::select! {
        _ = generation.revoked.cancelled() => Outcome::Rebalanced,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    stop.cancel();
    let mut forwarded = 0u64;
    while let Some(joined) = handlers.join_next().await {
        match joined {
            Ok(count) => forwarded += count,
            Err(e) => warn!(group_id = %shared.group_id, error = %e, "claim handler failed"),
        }
    }

    if let Err(e) = membership.commit().await {
        warn!(group_id = %shared.group_id, error = %e, "offset commit failed");
    }
    shared.end_generation();
    generation.released.release();
    debug!(
        group_id = %shared.group_id,
        generation = generation_id,
        forwarded,
        outcome = ?outcome,
        "generation ended"
    );
    Ok(outcome)
}

/// Forward each record of a claim, then mark it
///
/// A forward blocked on a full channel is abandoned when the generation
/// stops; that record stays unmarked and is delivered again later.
async fn handle_claim(
    mut claim: Claim,
    membership: Arc<dyn GroupMembership>,
    output: mpsc::Sender<DeliveredMessage>,
    stop: CancellationToken,
) -> u64 {
    let mut forwarded = 0;
    loop {
        let record = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = claim.records.recv() => match next {
                Some(record) => record,
                None => break,
            },
        };

        let offset = record.offset;
        let message = DeliveredMessage::new(record, membership.clone());
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = output.send(message) => {
                if sent.is_err() {
                    debug!(topic = %claim.topic, partition = claim.partition, "output channel closed");
                    break;
                }
            }
        }
        membership.mark(&claim.topic, claim.partition, offset);
        forwarded += 1;
    }
    forwarded
}
