// SPDX-License-Identifier: BSD-3-Clause
//! Abstract memory allocations.
//!
//! An allocation names an abstract memory object by its allocation site and
//! base-address expression. Destructive writes do not mutate an allocation;
//! they create a fresh version with the same site and address, and the
//! newer version shadows the older along the dependency chain. The
//! `Unknown` and `UnknownEnvironment` variants are sentinels, created once
//! per engine context and shared everywhere, like the null and top elements
//! of a points-to domain.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arc::UArc;
use crate::expr::ExprRef;
use crate::ir::ValueRef;

#[derive(Debug)]
pub enum AllocKind {
    /// An ordinary allocation, re-versioned on every destructive write.
    Versioned { site: ValueRef, address: ExprRef },
    /// The program environment. All environment allocations alias the
    /// canonical site and address fixed by the first one created.
    Environment { site: ValueRef, address: ExprRef },
    /// An abstract location reachable from `site` through `depth` levels
    /// of memory indirection. The address is derived from the base cell's
    /// content, not copied from the base cell, so an indirect location
    /// never aliases its base allocation in a store projection.
    Indirect {
        site: ValueRef,
        address: ExprRef,
        depth: u64,
    },
    /// A write or read at an address the analysis could not resolve.
    Unknown,
    /// A pointer obtained by reading the environment.
    UnknownEnvironment,
}

#[derive(Debug)]
pub struct Alloc {
    kind: AllocKind,
    /// Whether an unsatisfiability core depends on this allocation.
    /// Monotone: set once, never cleared.
    core: AtomicBool,
}

impl Alloc {
    fn with_kind(kind: AllocKind) -> UArc<Self> {
        UArc::new(Alloc {
            kind,
            core: AtomicBool::new(false),
        })
    }

    pub fn versioned(site: ValueRef, address: ExprRef) -> UArc<Self> {
        Self::with_kind(AllocKind::Versioned { site, address })
    }

    pub fn environment(site: ValueRef, address: ExprRef) -> UArc<Self> {
        Self::with_kind(AllocKind::Environment { site, address })
    }

    pub fn indirect(site: ValueRef, address: ExprRef, depth: u64) -> UArc<Self> {
        Self::with_kind(AllocKind::Indirect {
            site,
            address,
            depth,
        })
    }

    pub fn unknown() -> UArc<Self> {
        Self::with_kind(AllocKind::Unknown)
    }

    pub fn unknown_environment() -> UArc<Self> {
        Self::with_kind(AllocKind::UnknownEnvironment)
    }

    #[inline]
    pub fn kind(&self) -> &AllocKind {
        &self.kind
    }

    #[inline]
    pub fn is_environment(&self) -> bool {
        matches!(
            self.kind,
            AllocKind::Environment { .. } | AllocKind::UnknownEnvironment
        )
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self.kind, AllocKind::Unknown)
    }

    pub fn site(&self) -> Option<&ValueRef> {
        match &self.kind {
            AllocKind::Versioned { site, .. }
            | AllocKind::Environment { site, .. }
            | AllocKind::Indirect { site, .. } => Some(site),
            AllocKind::Unknown | AllocKind::UnknownEnvironment => None,
        }
    }

    pub fn address(&self) -> Option<&ExprRef> {
        match &self.kind {
            AllocKind::Versioned { address, .. }
            | AllocKind::Environment { address, .. }
            | AllocKind::Indirect { address, .. } => Some(address),
            AllocKind::Unknown | AllocKind::UnknownEnvironment => None,
        }
    }

    /// Whether a probe `(site, address)` names this allocation. Versioned
    /// allocations match on both components; environment allocations ignore
    /// the probe site, since every environment allocation aliases the
    /// canonical one. Indirect allocations and sentinels are never found by
    /// site lookup.
    pub fn has_allocation_site(&self, site: &ValueRef, address: &ExprRef) -> bool {
        match &self.kind {
            AllocKind::Versioned {
                site: own_site,
                address: own_address,
            } => own_site == site && own_address == address,
            AllocKind::Environment {
                address: own_address,
                ..
            } => own_address == address,
            AllocKind::Indirect { .. } | AllocKind::Unknown | AllocKind::UnknownEnvironment => {
                false
            }
        }
    }

    #[inline]
    pub fn has_constant_address(&self) -> bool {
        self.constant_address().is_some()
    }

    /// The unsigned value of the base address when it is constant.
    pub fn constant_address(&self) -> Option<u64> {
        self.address().and_then(|a| a.as_constant())
    }

    #[inline]
    pub fn set_core(&self) {
        self.core.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_core(&self) -> bool {
        self.core.load(Ordering::Relaxed)
    }
}

impl Display for Alloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AllocKind::Versioned { site, address } => write!(f, "*{}({})", site, address),
            AllocKind::Environment { address, .. } => write!(f, "*environ({})", address),
            AllocKind::Indirect {
                site,
                address,
                depth,
            } => write!(f, "*{}({})~{}", site, address, depth),
            AllocKind::Unknown => write!(f, "*unknown"),
            AllocKind::UnknownEnvironment => write!(f, "*environ"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::ir::{GlobalName, Value};

    fn site(name: &str) -> ValueRef {
        UArc::new(Value::Global(GlobalName::from(name)))
    }

    #[test]
    fn versioned_identity_is_site_and_address() {
        let s = site("g");
        let addr = Expr::constant(16, 64);
        let a = Alloc::versioned(s.clone(), addr.clone());
        assert!(a.has_allocation_site(&s, &addr));
        assert!(!a.has_allocation_site(&s, &Expr::constant(24, 64)));
        assert!(!a.has_allocation_site(&site("g"), &addr));
    }

    #[test]
    fn environment_identity_ignores_site() {
        let addr = Expr::constant(4096, 64);
        let a1 = Alloc::environment(site("e1"), addr.clone());
        let a2 = Alloc::environment(site("e2"), addr.clone());
        let (s2, addr2) = (a2.site().unwrap().clone(), a2.address().unwrap().clone());
        assert!(a1.has_allocation_site(&s2, &addr2));
        assert!(a2.has_allocation_site(a1.site().unwrap(), a1.address().unwrap()));
    }

    #[test]
    fn core_bit_is_monotone() {
        let a = Alloc::unknown();
        assert!(!a.is_core());
        a.set_core();
        a.set_core();
        assert!(a.is_core());
    }

    #[test]
    fn constant_address_projection() {
        let a = Alloc::versioned(site("g"), Expr::constant(0xDEAD, 64));
        assert!(a.has_constant_address());
        assert_eq!(a.constant_address(), Some(0xDEAD));
    }
}
