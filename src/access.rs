//! Access arbitration.
//!
//! Every (resource location, consumer) pair holds at most one outstanding request. The effective
//! mode of each consumer is recomputed from the full request set by [arbitrate], a pure function,
//! whenever a request changes:
//!
//! - the `EXCLUSIVE` request with the highest priority wins; on equal priority the older request
//!   (the incumbent) wins,
//! - while an exclusive holder exists, every other consumer is `READ_ONLY`,
//! - otherwise every consumer, with or without a request, holds `SHARED`.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::properties::{AccessMode, AccessPriority, ConsumerId, ResourceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub consumer: ConsumerId,
    pub mode: AccessMode,
    pub priority: AccessPriority,
    /// Request age; lower is older.
    pub seq: u64,
}

/// Outcome of [arbitrate] for one resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Grants {
    pub exclusive: Option<ConsumerId>,
    pub modes: BTreeMap<ConsumerId, AccessMode>,
}

impl Grants {
    /// Effective mode of `consumer`, including consumers without a request.
    pub fn mode(&self, consumer: &ConsumerId) -> AccessMode {
        if let Some(mode) = self.modes.get(consumer) {
            return *mode;
        }
        match self.exclusive {
            Some(_) => AccessMode::ReadOnly,
            None => AccessMode::Shared,
        }
    }
}

pub fn arbitrate(requests: &[AccessRequest]) -> Grants {
    let exclusive = requests
        .iter()
        .filter(|r| r.mode == AccessMode::Exclusive)
        .min_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)))
        .map(|r| r.consumer);
    let modes = requests
        .iter()
        .map(|r| {
            let mode = match exclusive {
                Some(winner) if winner == r.consumer => AccessMode::Exclusive,
                Some(_) => AccessMode::ReadOnly,
                None => AccessMode::Shared,
            };
            (r.consumer, mode)
        })
        .collect();
    Grants { exclusive, modes }
}

/// A change of effective mode to be reported as an access mode event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrantChange {
    pub resource: ResourceId,
    pub consumer: ConsumerId,
    pub mode: AccessMode,
}

/// Outstanding requests of a graph, keyed by resource location.
#[derive(Debug, Default)]
pub(crate) struct AccessTable {
    requests: BTreeMap<ResourceId, Vec<AccessRequest>>,
    seq: u64,
}

impl AccessTable {
    /// Replaces the request of `consumer` on `resource`. `READ_ONLY` (or weaker) clears it.
    /// Returns the grant changes to report: only consumers that have, or just cleared, a request
    /// are reported.
    pub(crate) fn request(
        &mut self,
        resource: ResourceId,
        consumer: ConsumerId,
        mode: AccessMode,
        priority: AccessPriority,
    ) -> Vec<GrantChange> {
        let entries = self.requests.entry(resource).or_default();
        let before = arbitrate(entries);
        let previous = entries.iter().position(|r| r.consumer == consumer);
        let mut reported: Vec<ConsumerId> = entries.iter().map(|r| r.consumer).collect();
        if mode.can_write() {
            let unchanged = previous
                .map(|i| entries[i].mode == mode && entries[i].priority == priority)
                .unwrap_or(false);
            if !unchanged {
                self.seq += 1;
                let request = AccessRequest {
                    consumer,
                    mode,
                    priority,
                    seq: self.seq,
                };
                match previous {
                    Some(i) => entries[i] = request,
                    None => {
                        entries.push(request);
                        reported.push(consumer);
                    }
                }
            }
        } else if let Some(i) = previous {
            entries.remove(i);
        }
        let after = arbitrate(entries);
        if entries.is_empty() {
            self.requests.remove(&resource);
        }
        reported
            .into_iter()
            .filter(|c| before.mode(c) != after.mode(c) || (previous.is_none() && *c == consumer))
            .map(|c| GrantChange {
                resource,
                consumer: c,
                mode: after.mode(&c),
            })
            .collect()
    }

    pub(crate) fn mode(&self, resource: ResourceId, consumer: &ConsumerId) -> AccessMode {
        match self.requests.get(&resource) {
            Some(entries) => arbitrate(entries).mode(consumer),
            None => AccessMode::Shared,
        }
    }

    pub(crate) fn requested(
        &self,
        resource: ResourceId,
        consumer: &ConsumerId,
    ) -> Option<AccessRequest> {
        self.requests
            .get(&resource)?
            .iter()
            .find(|r| r.consumer == *consumer)
            .copied()
    }

    /// The mode `consumer` would hold after requesting `mode` at `priority`, without recording
    /// the request.
    pub(crate) fn probe(
        &self,
        resource: ResourceId,
        consumer: ConsumerId,
        mode: AccessMode,
        priority: AccessPriority,
    ) -> AccessMode {
        let mut entries = self.requests.get(&resource).cloned().unwrap_or_default();
        match entries.iter_mut().find(|r| r.consumer == consumer) {
            Some(existing) if existing.mode == mode && existing.priority == priority => {}
            Some(existing) => {
                existing.mode = mode;
                existing.priority = priority;
                existing.seq = self.seq + 1;
            }
            None => entries.push(AccessRequest {
                consumer,
                mode,
                priority,
                seq: self.seq + 1,
            }),
        }
        if !mode.can_write() {
            entries.retain(|r| r.consumer != consumer);
        }
        arbitrate(&entries).mode(&consumer)
    }

    /// Drops every request on a deleted resource.
    pub(crate) fn forget(&mut self, resource: ResourceId) {
        self.requests.remove(&resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        table: &mut AccessTable,
        consumer: ConsumerId,
        mode: AccessMode,
        priority: AccessPriority,
    ) -> Vec<(ConsumerId, AccessMode)> {
        table
            .request(ResourceId(1), consumer, mode, priority)
            .into_iter()
            .map(|c| (c.consumer, c.mode))
            .collect()
    }

    #[test]
    fn higher_priority_preempts_and_release_restores_shared() {
        let mut table = AccessTable::default();
        let (a, b) = (ConsumerId::new(), ConsumerId::new());
        let r = ResourceId(1);

        let changes = request(&mut table, a, AccessMode::Shared, AccessPriority::DeviceSpecific);
        assert_eq!(changes, vec![(a, AccessMode::Shared)]);
        assert_eq!(table.mode(r, &a), AccessMode::Shared);

        let changes = request(&mut table, b, AccessMode::Exclusive, AccessPriority::Highest);
        assert!(changes.contains(&(a, AccessMode::ReadOnly)));
        assert!(changes.contains(&(b, AccessMode::Exclusive)));

        let changes = request(&mut table, b, AccessMode::ReadOnly, AccessPriority::Lowest);
        assert!(changes.contains(&(a, AccessMode::Shared)));
        assert!(changes.contains(&(b, AccessMode::Shared)));
        assert_eq!(table.requested(r, &b), None);
    }

    #[test]
    fn incumbent_keeps_exclusive_on_equal_priority() {
        let mut table = AccessTable::default();
        let (a, b) = (ConsumerId::new(), ConsumerId::new());
        let r = ResourceId(1);
        request(&mut table, a, AccessMode::Exclusive, AccessPriority::GenericManagement);
        let changes = request(&mut table, b, AccessMode::Exclusive, AccessPriority::GenericManagement);
        assert_eq!(changes, vec![(b, AccessMode::ReadOnly)]);
        assert_eq!(table.mode(r, &a), AccessMode::Exclusive);

        // repeating an identical request does not lose incumbency
        request(&mut table, a, AccessMode::Exclusive, AccessPriority::GenericManagement);
        assert_eq!(table.mode(r, &a), AccessMode::Exclusive);

        // the waiting request takes over once the holder leaves
        let changes = request(&mut table, a, AccessMode::ReadOnly, AccessPriority::Lowest);
        assert!(changes.contains(&(b, AccessMode::Exclusive)));
        assert!(changes.contains(&(a, AccessMode::ReadOnly)));
    }

    #[test]
    fn consumers_without_request_follow_the_default() {
        let mut table = AccessTable::default();
        let (a, bystander) = (ConsumerId::new(), ConsumerId::new());
        let r = ResourceId(1);
        assert_eq!(table.mode(r, &bystander), AccessMode::Shared);
        let changes = request(&mut table, a, AccessMode::Exclusive, AccessPriority::Lowest);
        // bystanders lose default access silently
        assert_eq!(changes, vec![(a, AccessMode::Exclusive)]);
        assert_eq!(table.mode(r, &bystander), AccessMode::ReadOnly);
        table.forget(r);
        assert_eq!(table.mode(r, &bystander), AccessMode::Shared);
    }

    #[test]
    fn downgrading_own_request_reports_once() {
        let mut table = AccessTable::default();
        let a = ConsumerId::new();
        request(&mut table, a, AccessMode::Exclusive, AccessPriority::Lowest);
        let changes = request(&mut table, a, AccessMode::Shared, AccessPriority::Lowest);
        assert_eq!(changes, vec![(a, AccessMode::Shared)]);
        let changes = request(&mut table, a, AccessMode::Shared, AccessPriority::Lowest);
        assert!(changes.is_empty());
    }

    #[test]
    fn probing_does_not_record_requests() {
        let mut table = AccessTable::default();
        let (a, b) = (ConsumerId::new(), ConsumerId::new());
        let r = ResourceId(1);
        request(&mut table, a, AccessMode::Exclusive, AccessPriority::DeviceSpecific);
        assert_eq!(
            table.probe(r, b, AccessMode::Exclusive, AccessPriority::Lowest),
            AccessMode::ReadOnly
        );
        assert_eq!(
            table.probe(r, b, AccessMode::Exclusive, AccessPriority::Highest),
            AccessMode::Exclusive
        );
        assert_eq!(
            table.probe(r, a, AccessMode::Exclusive, AccessPriority::DeviceSpecific),
            AccessMode::Exclusive
        );
        assert_eq!(table.requested(r, &b), None);
        assert_eq!(table.mode(r, &a), AccessMode::Exclusive);
    }
}
