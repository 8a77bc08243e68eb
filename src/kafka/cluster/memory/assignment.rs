//! Partition assignment strategies for the embedded group coordinator
//!
//! - **Range**: consecutive partition ranges per topic. With 7 partitions
//!   and 3 consumers the split is [0, 1, 2], [3, 4], [5, 6].
//! - **RoundRobin**: all (topic, partition) pairs sorted, dealt to
//!   subscribed members in turn.
//!
//! Members are always sorted by id, so the outcome is deterministic for a
//! given membership.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Input for partition assignment computation
#[derive(Debug, Clone, Default)]
pub(crate) struct AssignmentInput {
    /// member_id -> subscribed topics
    pub subscriptions: HashMap<String, Vec<String>>,
    /// topic -> partition count
    pub topic_partitions: HashMap<String, i32>,
}

impl AssignmentInput {
    /// Member IDs subscribed to a topic, sorted
    pub fn members_for_topic(&self, topic: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, topics)| topics.iter().any(|t| t == topic))
            .map(|(id, _)| id.clone())
            .collect();
        members.sort();
        members
    }
}

/// Partitions assigned to one member: topic -> partition ids
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct MemberAssignment {
    pub topic_partitions: BTreeMap<String, Vec<i32>>,
}

impl MemberAssignment {
    #[cfg(test)]
    pub fn partitions(&self, topic: &str) -> Vec<i32> {
        self.topic_partitions.get(topic).cloned().unwrap_or_default()
    }

    pub fn partition_count(&self) -> usize {
        self.topic_partitions.values().map(Vec::len).sum()
    }

    /// Flattened (topic, partition) pairs in topic then partition order
    pub fn claims(&self) -> Vec<(String, i32)> {
        self.topic_partitions
            .iter()
            .flat_map(|(topic, parts)| {
                let mut parts = parts.clone();
                parts.sort_unstable();
                parts.into_iter().map(move |p| (topic.clone(), p))
            })
            .collect()
    }
}

pub(crate) type AssignmentOutput = HashMap<String, MemberAssignment>;

pub(crate) trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput;
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RangeStrategy;

impl AssignmentStrategy for RangeStrategy {
    fn name(&self) -> &'static str {
        "range"
    }

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput {
        let mut result: AssignmentOutput = input
            .subscriptions
            .keys()
            .map(|id| (id.clone(), MemberAssignment::default()))
            .collect();

        for (topic, &num_partitions) in &input.topic_partitions {
            let members = input.members_for_topic(topic);
            if members.is_empty() || num_partitions <= 0 {
                continue;
            }

            let num_members = members.len() as i32;
            let base_range = num_partitions / num_members;
            let extra = num_partitions % num_members;

            let mut next = 0;
            for (idx, member_id) in members.iter().enumerate() {
                let size = base_range + i32::from((idx as i32) < extra);
                if size == 0 {
                    continue;
                }
                if let Some(assignment) = result.get_mut(member_id) {
                    assignment
                        .topic_partitions
                        .insert(topic.clone(), (next..next + size).collect());
                }
                next += size;
            }
        }

        result
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RoundRobinStrategy;

impl AssignmentStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn assign(&self, input: &AssignmentInput) -> AssignmentOutput {
        let mut result: AssignmentOutput = input
            .subscriptions
            .keys()
            .map(|id| (id.clone(), MemberAssignment::default()))
            .collect();

        let mut all_partitions: Vec<(String, i32)> = input
            .topic_partitions
            .iter()
            .flat_map(|(topic, &count)| (0..count.max(0)).map(move |p| (topic.clone(), p)))
            .collect();
        all_partitions.sort();

        let mut member_ids: Vec<&String> = input.subscriptions.keys().collect();
        member_ids.sort();

        let mut position = 0usize;
        for (topic, partition) in all_partitions {
            let eligible: Vec<&String> = member_ids
                .iter()
                .copied()
                .filter(|id| {
                    input
                        .subscriptions
                        .get(*id)
                        .map(|topics| topics.contains(&topic))
                        .unwrap_or(false)
                })
                .collect();
            if eligible.is_empty() {
                continue;
            }

            let member_id = eligible[position % eligible.len()];
            position += 1;

            if let Some(assignment) = result.get_mut(member_id) {
                assignment
                    .topic_partitions
                    .entry(topic)
                    .or_default()
                    .push(partition);
            }
        }

        result
    }
}

/// Strategy by name (case-insensitive)
pub(crate) fn create_strategy(name: &str) -> Option<Box<dyn AssignmentStrategy>> {
    match name.to_lowercase().as_str() {
        "range" => Some(Box::new(RangeStrategy)),
        "roundrobin" => Some(Box::new(RoundRobinStrategy)),
        _ => None,
    }
}

fn strategy_priority(name: &str) -> i32 {
    match name {
        "roundrobin" => 2,
        "range" => 1,
        _ => 0,
    }
}

/// Highest-priority strategy every member supports
pub(crate) fn select_common_strategy(member_strategies: &[Vec<String>]) -> Option<String> {
    let mut sets = member_strategies.iter().map(|strategies| {
        strategies
            .iter()
            .map(|s| s.to_lowercase())
            .collect::<HashSet<String>>()
    });

    let first = sets.next()?;
    let common = sets.fold(first, |acc, set| acc.intersection(&set).cloned().collect());

    common.into_iter().max_by_key(|name| strategy_priority(name))
}
