// SPDX-License-Identifier: BSD-3-Clause
//! The derived graph of allocation ancestry.
//!
//! When a path is proved infeasible, the allocations the proof depends on
//! are arranged into a DAG: sinks are the allocations nearest the values
//! seeded by the proof, and edges point from each allocation to the ones it
//! was reached from. Consuming sinks peels the graph one layer at a time,
//! which is how each node of the dependency chain claims the core
//! allocations it owns.

use std::fmt::Display;

use crate::alloc::Alloc;
use crate::arc::UArc;

#[derive(Debug)]
struct AllocationNode {
    allocation: UArc<Alloc>,
    /// Indices of parent nodes, that is, allocations this one was reached
    /// from. The caller must not add a duplicate parent.
    parents: Vec<usize>,
    /// Hop distance from the sink this node was grown from.
    level: u64,
}

#[derive(Debug, Default)]
pub struct AllocationGraph {
    nodes: Vec<AllocationNode>,
    sinks: Vec<usize>,
}

impl AllocationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, allocation: &UArc<Alloc>) -> Option<usize> {
        self.nodes.iter().position(|n| n.allocation == *allocation)
    }

    /// Whether the graph already has a node for this allocation.
    pub fn visited(&self, allocation: &UArc<Alloc>) -> bool {
        self.find(allocation).is_some()
    }

    fn ensure_node(&mut self, allocation: &UArc<Alloc>, level: u64) -> usize {
        if let Some(idx) = self.find(allocation) {
            return idx;
        }
        allocation.set_core();
        self.nodes.push(AllocationNode {
            allocation: allocation.clone(),
            parents: Vec::new(),
            level,
        });
        self.nodes.len() - 1
    }

    /// Insert a sink at level 0 unless one already exists for this
    /// allocation. Marks the allocation core.
    pub fn add_new_sink(&mut self, candidate: UArc<Alloc>) {
        if self
            .sinks
            .iter()
            .any(|&s| self.nodes[s].allocation == candidate)
        {
            return;
        }
        let idx = self.ensure_node(&candidate, 0);
        candidate.set_core();
        self.sinks.push(idx);
    }

    /// Record that `target` was reached from `source`: `source` becomes a
    /// parent of `target`. The target node is created at level 0 if absent;
    /// the source node is created one level above the target if absent.
    pub fn add_new_edge(&mut self, source: &UArc<Alloc>, target: &UArc<Alloc>) {
        let target_idx = self.ensure_node(target, 0);
        let target_level = self.nodes[target_idx].level;
        let source_idx = self.ensure_node(source, target_level + 1);
        self.nodes[target_idx].parents.push(source_idx);
    }

    /// Delete every sink holding this allocation and promote the parents of
    /// each deleted sink to sinks, deduplicated against the sinks that
    /// remain.
    pub fn consume_sink_node(&mut self, allocation: &UArc<Alloc>) {
        let (consumed, mut kept): (Vec<usize>, Vec<usize>) = self
            .sinks
            .drain(..)
            .partition(|&s| self.nodes[s].allocation == *allocation);
        for s in consumed {
            for &p in &self.nodes[s].parents {
                if !kept
                    .iter()
                    .any(|&k| self.nodes[k].allocation == self.nodes[p].allocation)
                {
                    kept.push(p);
                }
            }
        }
        self.sinks = kept;
    }

    pub fn consume_sinks_with_allocations(&mut self, allocations: &[UArc<Alloc>]) {
        for a in allocations {
            self.consume_sink_node(a);
        }
    }

    /// The allocations currently held by sinks, in sink order.
    pub fn sink_allocations(&self) -> Vec<UArc<Alloc>> {
        self.sinks
            .iter()
            .map(|&s| self.nodes[s].allocation.clone())
            .collect()
    }

    /// The subset of `allocations` currently held by sinks.
    pub fn sinks_with_allocations(&self, allocations: &[UArc<Alloc>]) -> Vec<UArc<Alloc>> {
        self.sinks
            .iter()
            .map(|&s| &self.nodes[s].allocation)
            .filter(|a| allocations.contains(a))
            .cloned()
            .collect()
    }

    fn print_node(
        &self,
        f: &mut std::fmt::Formatter<'_>,
        idx: usize,
        printed: &mut Vec<usize>,
        depth: usize,
    ) -> std::fmt::Result {
        let node = &self.nodes[idx];
        writeln!(
            f,
            "{}{} (level {})",
            "  ".repeat(depth),
            node.allocation,
            node.level
        )?;
        if printed.contains(&idx) {
            return Ok(());
        }
        printed.push(idx);
        for &p in &node.parents {
            self.print_node(f, p, printed, depth + 1)?;
        }
        Ok(())
    }
}

impl Display for AllocationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut printed = Vec::new();
        for &s in &self.sinks {
            self.print_node(f, s, &mut printed, 0)?;
        }
        Ok(())
    }
}
