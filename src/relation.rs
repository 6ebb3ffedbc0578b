// SPDX-License-Identifier: BSD-3-Clause
//! The base relations a dependency node accumulates.
//!
//! All three relations are additive: entries are inserted as instructions
//! execute and never removed. Relation entries hold shared handles into the
//! values and allocations owned by the node that created them.

use std::collections::HashMap;
use std::fmt::Display;

use crate::alloc::Alloc;
use crate::arc::UArc;
use crate::value::VersionedValue;

/// `equals(value, allocation)`: the value holds the address of the
/// allocation.
#[derive(Debug)]
pub struct PointerEquality {
    value: UArc<VersionedValue>,
    allocation: UArc<Alloc>,
}

impl PointerEquality {
    pub fn new(value: UArc<VersionedValue>, allocation: UArc<Alloc>) -> Self {
        PointerEquality { value, allocation }
    }

    /// The bound allocation when this equality is about `value`.
    pub fn equals(&self, value: &UArc<VersionedValue>) -> Option<&UArc<Alloc>> {
        if self.value == *value {
            Some(&self.allocation)
        } else {
            None
        }
    }

    #[inline]
    pub fn value(&self) -> &UArc<VersionedValue> {
        &self.value
    }

    #[inline]
    pub fn allocation(&self) -> &UArc<Alloc> {
        &self.allocation
    }
}

impl Display for PointerEquality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} == {}", self.value, self.allocation)
    }
}

/// `flowsTo(source, target)`: the target data-depends on the source. When
/// the dependency arose through a store/load pair, the mediating allocation
/// is recorded.
#[derive(Debug)]
pub struct FlowsTo {
    source: UArc<VersionedValue>,
    target: UArc<VersionedValue>,
    via: Option<UArc<Alloc>>,
}

impl FlowsTo {
    pub fn new(
        source: UArc<VersionedValue>,
        target: UArc<VersionedValue>,
        via: Option<UArc<Alloc>>,
    ) -> Self {
        FlowsTo {
            source,
            target,
            via,
        }
    }

    #[inline]
    pub fn source(&self) -> &UArc<VersionedValue> {
        &self.source
    }

    #[inline]
    pub fn target(&self) -> &UArc<VersionedValue> {
        &self.target
    }

    #[inline]
    pub fn via(&self) -> Option<&UArc<Alloc>> {
        self.via.as_ref()
    }
}

impl Display for FlowsTo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.via {
            Some(via) => write!(f, "{} -> {} via {}", self.source, self.target, via),
            None => write!(f, "{} -> {}", self.source, self.target),
        }
    }
}

/// The per-node memory state: the latest value deposited into each
/// allocation, together with the inverse map. At most one entry per
/// allocation is current in one node; an update replaces the value in
/// place, keeping the entry's insertion position so exports stay stable.
#[derive(Debug, Default)]
pub struct StoreTable {
    entries: Vec<(UArc<Alloc>, UArc<VersionedValue>)>,
    storage_of: HashMap<UArc<VersionedValue>, Vec<UArc<Alloc>>>,
}

impl StoreTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, allocation: UArc<Alloc>, value: UArc<VersionedValue>) {
        self.storage_of
            .entry(value.clone())
            .or_default()
            .push(allocation.clone());
        if let Some(entry) = self.entries.iter_mut().find(|(a, _)| *a == allocation) {
            entry.1 = value;
        } else {
            self.entries.push((allocation, value));
        }
    }

    /// The value currently stored in `allocation` in this node.
    pub fn value_in(&self, allocation: &UArc<Alloc>) -> Option<&UArc<VersionedValue>> {
        self.entries
            .iter()
            .find(|(a, _)| a == allocation)
            .map(|(_, v)| v)
    }

    /// The allocations into which `value` was ever deposited in this node.
    pub fn allocations_holding(&self, value: &UArc<VersionedValue>) -> &[UArc<Alloc>] {
        self.storage_of
            .get(value)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(UArc<Alloc>, UArc<VersionedValue>)> {
        self.entries.iter()
    }
}
