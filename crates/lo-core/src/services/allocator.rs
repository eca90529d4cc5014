use std::collections::HashSet;

use crate::error::{OrchestratorError, Result};
use crate::models::{Host, Node, NodeId, PortPlan, PortTriple};

/// Slot, ports and identity handed to a new node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub node_id: NodeId,
    pub slot: u16,
    pub ports: PortTriple,
}

impl Allocation {
    /// The allocation an existing node was created with.
    pub fn of(node: &Node) -> Self {
        Self {
            node_id: node.node_id.clone(),
            slot: node.slot,
            ports: node.ports,
        }
    }
}

/// Derives per-host slots and ports deterministically from a [`PortPlan`].
pub struct PortAllocator {
    plan: PortPlan,
}

impl PortAllocator {
    pub fn new(plan: PortPlan) -> Self {
        Self { plan }
    }

    pub fn ports_for_slot(&self, slot: u16) -> PortTriple {
        let offset = slot * self.plan.stride;
        PortTriple {
            jsonrpc: self.plan.jsonrpc_base + offset,
            channel: self.plan.channel_base + offset,
            p2p: self.plan.p2p_base + offset,
        }
    }

    /// Pick the lowest free slot on `host` and mint a fresh identity.
    ///
    /// `existing` are the live nodes already on the host; `is_known_id` reports
    /// identities that are in use or retired anywhere in the topology.
    pub fn allocate(
        &self,
        host: &Host,
        existing: &[&Node],
        is_known_id: impl Fn(&NodeId) -> bool,
    ) -> Result<Allocation> {
        let used_slots: HashSet<u16> = existing.iter().map(|n| n.slot).collect();
        let used_ports: HashSet<u16> = existing
            .iter()
            .flat_map(|n| n.ports.as_array())
            .collect();

        let slot = (0..self.plan.max_slots_per_host)
            .filter(|s| !used_slots.contains(s))
            .find(|s| {
                self.ports_for_slot(*s)
                    .as_array()
                    .iter()
                    .all(|p| !used_ports.contains(p))
            })
            .ok_or_else(|| OrchestratorError::PortExhausted {
                host: host.address.clone(),
                max_slots: self.plan.max_slots_per_host,
            })?;

        let node_id = loop {
            let candidate = NodeId::generate();
            if !is_known_id(&candidate) {
                break candidate;
            }
        };

        tracing::debug!(host = %host.address, slot, node_id = %node_id.short(), "allocated node slot");
        Ok(Allocation {
            node_id,
            slot,
            ports: self.ports_for_slot(slot),
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortPlan::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::models::{HostCredential, NodeStatus};

    fn host() -> Host {
        Host::new(
            0,
            "10.0.0.1".into(),
            HostCredential::default(),
            "/opt".into(),
            "agA".into(),
        )
    }

    fn node_at(allocation: &Allocation) -> Node {
        Node {
            node_id: allocation.node_id.clone(),
            chain_name: "c".into(),
            host_id: 0,
            slot: allocation.slot,
            ports: allocation.ports,
            group_ids: BTreeSet::from([1]),
            status: NodeStatus::Running,
            version: "v1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn first_allocation_takes_slot_zero() {
        let allocator = PortAllocator::default();
        let alloc = allocator.allocate(&host(), &[], |_| false).unwrap();
        assert_eq!(alloc.slot, 0);
        assert_eq!(
            alloc.ports,
            PortTriple {
                jsonrpc: 8545,
                channel: 20200,
                p2p: 30300
            }
        );
    }

    #[test]
    fn allocation_fills_lowest_gap() {
        let allocator = PortAllocator::default();
        let a = allocator.allocate(&host(), &[], |_| false).unwrap();
        let mut b = allocator.allocate(&host(), &[&node_at(&a)], |_| false).unwrap();
        assert_eq!(b.slot, 1);
        b.slot = 2;
        b.ports = allocator.ports_for_slot(2);
        let (na, nb) = (node_at(&a), node_at(&b));
        let c = allocator.allocate(&host(), &[&na, &nb], |_| false).unwrap();
        assert_eq!(c.slot, 1);
    }

    #[test]
    fn ports_are_pairwise_distinct_across_slots() {
        let allocator = PortAllocator::new(PortPlan {
            stride: 3,
            max_slots_per_host: 20,
            ..PortPlan::default()
        });
        let mut nodes: Vec<Node> = Vec::new();
        for _ in 0..20 {
            let refs: Vec<&Node> = nodes.iter().collect();
            let alloc = allocator.allocate(&host(), &refs, |_| false).unwrap();
            nodes.push(node_at(&alloc));
        }
        let ports: Vec<u16> = nodes.iter().flat_map(|n| n.ports.as_array()).collect();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(ports.len(), unique.len());
    }

    #[test]
    fn exhausted_host_returns_error() {
        let allocator = PortAllocator::new(PortPlan {
            max_slots_per_host: 1,
            ..PortPlan::default()
        });
        let a = allocator.allocate(&host(), &[], |_| false).unwrap();
        let err = allocator
            .allocate(&host(), &[&node_at(&a)], |_| false)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PortExhausted { max_slots: 1, .. }));
    }

    #[test]
    fn slot_whose_ports_are_taken_is_skipped() {
        let allocator = PortAllocator::default();
        let mut squatter = node_at(&allocator.allocate(&host(), &[], |_| false).unwrap());
        squatter.slot = 7;
        let alloc = allocator.allocate(&host(), &[&squatter], |_| false).unwrap();
        assert_eq!(alloc.slot, 1);
    }

    #[test]
    fn known_identities_are_never_reissued() {
        let allocator = PortAllocator::default();
        let taken = std::cell::RefCell::new(Vec::new());
        let alloc = allocator
            .allocate(&host(), &[], |id| {
                let mut seen = taken.borrow_mut();
                let first = seen.is_empty();
                seen.push(id.clone());
                first
            })
            .unwrap();
        let seen = taken.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(alloc.node_id, seen[1]);
    }
}
