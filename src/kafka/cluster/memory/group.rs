//! Consumer group coordination for the embedded broker
//!
//! Group membership is in memory only; committed offsets live alongside it
//! for the lifetime of the broker.
//!
//! # State Machine
//!
//! ```text
//! Empty → PreparingRebalance → Stable → PreparingRebalance → ...
//!   ↑                                            ↓
//!   └──────────── last member leaves ────────────┘
//! ```
//!
//! - **Empty**: no members
//! - **PreparingRebalance**: waiting for every member to rejoin; entered on
//!   any join of a new member or departure of an existing one
//! - **Stable**: assignments computed, members consuming
//!
//! Members that have not rejoined when the rebalance timeout expires are
//! evicted and the generation completes without them.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::assignment::{create_strategy, select_common_strategy, AssignmentInput, MemberAssignment};
use crate::kafka::constants::DEFAULT_ASSIGNMENT_STRATEGY;
use crate::kafka::error::{KafkaError, Result};

/// Consumer group state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Empty,
    PreparingRebalance,
    Stable,
}

#[derive(Debug)]
struct GroupMember {
    topics: Vec<String>,
    strategies: Vec<String>,
    rebalance_timeout: Duration,
    rejoined: bool,
    assignment: MemberAssignment,
    errors: mpsc::UnboundedSender<KafkaError>,
}

/// What a member receives once a generation completes
#[derive(Debug, Clone)]
pub(crate) struct GenerationGrant {
    pub generation_id: i32,
    pub claims: Vec<(String, i32)>,
    pub revoked: CancellationToken,
}

/// One consumer group
#[derive(Debug)]
pub(crate) struct ConsumerGroup {
    group_id: String,
    generation_id: i32,
    state: GroupState,
    protocol_name: Option<String>,
    leader: Option<String>,
    members: BTreeMap<String, GroupMember>,
    rebalance_deadline: Option<Instant>,
    /// Cancelled when the current generation ends
    revoked: CancellationToken,
    generation_tx: watch::Sender<i32>,
    committed: HashMap<(String, i32), i64>,
    commit_count: u64,
}

impl ConsumerGroup {
    fn new(group_id: &str) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            group_id: group_id.to_string(),
            generation_id: 0,
            state: GroupState::Empty,
            protocol_name: None,
            leader: None,
            members: BTreeMap::new(),
            rebalance_deadline: None,
            revoked: CancellationToken::new(),
            generation_tx,
            committed: HashMap::new(),
            commit_count: 0,
        }
    }

    /// Start a rebalance: revoke the current generation and wait for rejoins
    fn start_rebalance(&mut self) {
        self.state = GroupState::PreparingRebalance;
        self.revoked.cancel();
        let timeout = self
            .members
            .values()
            .map(|m| m.rebalance_timeout)
            .max()
            .unwrap_or_default();
        self.rebalance_deadline = Some(Instant::now() + timeout);
        for member in self.members.values_mut() {
            member.rejoined = false;
        }
        info!(
            group_id = %self.group_id,
            generation = self.generation_id,
            members = self.members.len(),
            "group starting rebalance"
        );
    }

    fn all_rejoined(&self) -> bool {
        !self.members.is_empty() && self.members.values().all(|m| m.rejoined)
    }

    /// Compute assignments and publish the next generation
    fn complete_rebalance(&mut self, topic_partitions: &HashMap<String, i32>) {
        self.generation_id += 1;
        self.state = GroupState::Stable;
        self.rebalance_deadline = None;

        if !self
            .leader
            .as_ref()
            .is_some_and(|l| self.members.contains_key(l))
        {
            self.leader = self.members.keys().next().cloned();
        }

        let strategies: Vec<Vec<String>> =
            self.members.values().map(|m| m.strategies.clone()).collect();
        let protocol = select_common_strategy(&strategies)
            .unwrap_or_else(|| DEFAULT_ASSIGNMENT_STRATEGY.to_string());
        let strategy = create_strategy(&protocol)
            .or_else(|| create_strategy(DEFAULT_ASSIGNMENT_STRATEGY));

        let input = AssignmentInput {
            subscriptions: self
                .members
                .iter()
                .map(|(id, m)| (id.clone(), m.topics.clone()))
                .collect(),
            topic_partitions: topic_partitions.clone(),
        };
        let (protocol, mut output) = match strategy {
            Some(strategy) => (strategy.name().to_string(), strategy.assign(&input)),
            None => (protocol, Default::default()),
        };

        for (member_id, member) in self.members.iter_mut() {
            member.assignment = output.remove(member_id).unwrap_or_default();
            debug!(
                group_id = %self.group_id,
                member_id = %member_id,
                partitions = member.assignment.partition_count(),
                "member assignment"
            );
        }
        self.protocol_name = Some(protocol);

        self.revoked = CancellationToken::new();
        self.generation_tx.send_replace(self.generation_id);

        info!(
            group_id = %self.group_id,
            generation = self.generation_id,
            protocol = self.protocol_name.as_deref().unwrap_or_default(),
            leader = self.leader.as_deref().unwrap_or_default(),
            members = self.members.len(),
            "group completed rebalance"
        );
    }

    /// Evict members that missed the rebalance deadline
    fn expire_rebalance(&mut self, topic_partitions: &HashMap<String, i32>) {
        let Some(deadline) = self.rebalance_deadline else {
            return;
        };
        if self.state != GroupState::PreparingRebalance || Instant::now() < deadline {
            return;
        }

        let late: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| !m.rejoined)
            .map(|(id, _)| id.clone())
            .collect();
        for member_id in late {
            warn!(
                group_id = %self.group_id,
                member_id = %member_id,
                "evicting member that missed the rebalance deadline"
            );
            if let Some(member) = self.members.remove(&member_id) {
                let _ = member.errors.send(KafkaError::Protocol(format!(
                    "member {} evicted from group {}: rebalance timeout",
                    member_id, self.group_id
                )));
            }
        }

        if self.members.is_empty() {
            self.become_empty();
        } else {
            self.complete_rebalance(topic_partitions);
        }
    }

    fn become_empty(&mut self) {
        self.state = GroupState::Empty;
        self.leader = None;
        self.protocol_name = None;
        self.rebalance_deadline = None;
        self.revoked.cancel();
    }

    fn grant(&self, member_id: &str) -> Option<GenerationGrant> {
        self.members.get(member_id).map(|m| GenerationGrant {
            generation_id: self.generation_id,
            claims: m.assignment.claims(),
            revoked: self.revoked.clone(),
        })
    }
}

/// All groups of one embedded broker
#[derive(Debug, Default)]
pub(crate) struct GroupCoordinator {
    groups: Mutex<HashMap<String, ConsumerGroup>>,
}

/// Parameters of one JoinGroup
pub(crate) struct JoinRequest<'a> {
    pub group_id: &'a str,
    /// Existing or pre-allocated member id; `None` lets the group pick one
    pub member_id: Option<&'a str>,
    pub client_id: &'a str,
    pub topics: &'a [String],
    pub strategy: &'a str,
    pub rebalance_timeout: Duration,
    pub errors: &'a mpsc::UnboundedSender<KafkaError>,
}

impl GroupCoordinator {
    /// Register (or re-register) a member and wait for the generation that
    /// includes it
    pub(crate) async fn join(
        &self,
        request: JoinRequest<'_>,
        topic_partitions: &HashMap<String, i32>,
    ) -> Result<(String, GenerationGrant)> {
        let (member_id, mut generation_rx, target) = self.begin_join(&request, topic_partitions);

        loop {
            if *generation_rx.borrow() >= target {
                break;
            }

            let deadline = self
                .groups
                .lock()
                .get(request.group_id)
                .and_then(|g| g.rebalance_deadline)
                .unwrap_or_else(|| Instant::now() + request.rebalance_timeout);

            match tokio::time::timeout_at(deadline, generation_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(KafkaError::Protocol(format!(
                        "group {} was removed during join",
                        request.group_id
                    )))
                }
                Err(_) => {
                    if let Some(group) = self.groups.lock().get_mut(request.group_id) {
                        group.expire_rebalance(topic_partitions);
                    }
                }
            }
        }

        let groups = self.groups.lock();
        let grant = groups
            .get(request.group_id)
            .and_then(|g| g.grant(&member_id))
            .ok_or_else(|| {
                KafkaError::Join(format!(
                    "member {} is no longer part of group {}",
                    member_id, request.group_id
                ))
            })?;
        Ok((member_id, grant))
    }

    fn begin_join(
        &self,
        request: &JoinRequest<'_>,
        topic_partitions: &HashMap<String, i32>,
    ) -> (String, watch::Receiver<i32>, i32) {
        let mut groups = self.groups.lock();
        let group = groups
            .entry(request.group_id.to_string())
            .or_insert_with(|| ConsumerGroup::new(request.group_id));

        let member_id = match request.member_id {
            Some(id) => id.to_string(),
            None => generate_member_id(request.client_id),
        };

        debug!(
            group_id = %group.group_id,
            member_id = %member_id,
            state = ?group.state,
            "join group"
        );

        let is_new = !group.members.contains_key(&member_id);
        if is_new {
            group.members.insert(
                member_id.clone(),
                GroupMember {
                    topics: request.topics.to_vec(),
                    strategies: vec![request.strategy.to_lowercase()],
                    rebalance_timeout: request.rebalance_timeout,
                    rejoined: false,
                    assignment: MemberAssignment::default(),
                    errors: request.errors.clone(),
                },
            );
        }

        // a known member rejoining a stable group also forces a rebalance
        if group.state != GroupState::PreparingRebalance {
            group.start_rebalance();
        }

        if let Some(member) = group.members.get_mut(&member_id) {
            member.rejoined = true;
        }

        let target = group.generation_id + 1;
        let generation_rx = group.generation_tx.subscribe();

        if group.all_rejoined() {
            group.complete_rebalance(topic_partitions);
        }

        (member_id, generation_rx, target)
    }

    /// Remove a member; the remaining members rebalance
    pub(crate) fn leave(
        &self,
        group_id: &str,
        member_id: &str,
        topic_partitions: &HashMap<String, i32>,
    ) -> bool {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(group_id) else {
            return false;
        };
        if group.members.remove(member_id).is_none() {
            return false;
        }
        info!(group_id = %group_id, member_id = %member_id, "member left group");

        if group.members.is_empty() {
            group.become_empty();
        } else if group.state == GroupState::PreparingRebalance {
            if group.all_rejoined() {
                group.complete_rebalance(topic_partitions);
            }
        } else {
            group.start_rebalance();
        }
        true
    }

    /// Record a consumed offset; the committed position becomes `offset + 1`
    ///
    /// Ignored for unknown members and for offsets behind the committed
    /// position.
    pub(crate) fn mark(
        &self,
        group_id: &str,
        member_id: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> bool {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(group_id) else {
            return false;
        };
        if !group.members.contains_key(member_id) {
            debug!(group_id, member_id, "ignoring mark from unknown member");
            return false;
        }

        let next = offset + 1;
        let entry = group
            .committed
            .entry((topic.to_string(), partition))
            .or_insert(0);
        if next <= *entry {
            return false;
        }
        *entry = next;
        group.commit_count += 1;
        true
    }

    pub(crate) fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.groups
            .lock()
            .get(group_id)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
    }

    pub(crate) fn commit_count(&self, group_id: &str) -> u64 {
        self.groups
            .lock()
            .get(group_id)
            .map(|g| g.commit_count)
            .unwrap_or(0)
    }

    pub(crate) fn generation(&self, group_id: &str) -> Option<i32> {
        self.groups.lock().get(group_id).map(|g| g.generation_id)
    }

    pub(crate) fn state(&self, group_id: &str) -> Option<GroupState> {
        self.groups.lock().get(group_id).map(|g| g.state)
    }

    pub(crate) fn members(&self, group_id: &str) -> Vec<String> {
        self.groups
            .lock()
            .get(group_id)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver a protocol error to every member of a group
    pub(crate) fn broadcast_error(&self, group_id: &str, message: &str) -> usize {
        self.groups
            .lock()
            .get(group_id)
            .map(|g| {
                g.members
                    .values()
                    .filter(|m| m.errors.send(KafkaError::Protocol(message.to_string())).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Generate a unique member ID for a consumer
///
/// Format: {client_id}-{uuid}
pub(crate) fn generate_member_id(client_id: &str) -> String {
    format!("{}-{}", client_id, Uuid::new_v4())
}
