// SPDX-License-Identifier: BSD-3-Clause
//! Engine-wide state shared by every node of a dependency chain.
//!
//! The shadow registry, the canonical environment allocation, and the
//! sentinel objects would be process globals in a single-tenant embedding.
//! Holding them in a context object instead keeps tests hermetic and lets a
//! host run several engines side by side. All writes are monotone, so the
//! locks are only contended by first use.

use std::sync::RwLock;

use crate::alloc::Alloc;
use crate::arc::UArc;
use crate::expr::{Array, Expr, ExprRef, UpdateList};
use crate::ir::{GlobalName, Value, ValueRef};
use crate::shadow::ShadowMap;
use crate::value::VersionedValue;

/// Guard applied before a fresh allocation is bound by a pointer equality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EqualityGuard {
    /// Skip the binding when the allocation is already bound by any value.
    #[default]
    OnAllocation,
    /// Skip the binding only when the allocation is already bound by a
    /// version of the same IR value.
    OnPair,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    pub equality_guard: EqualityGuard,
}

#[derive(Debug)]
pub struct EngineContext {
    options: Options,
    shadow: ShadowMap,
    /// The canonical environment allocation site and address, fixed by the
    /// first environment allocation created.
    environment: RwLock<Option<(ValueRef, ExprRef)>>,
    unknown: UArc<Alloc>,
    unknown_environment: UArc<Alloc>,
    unknown_environment_value: UArc<VersionedValue>,
    unknown_array: UArc<Array>,
}

impl EngineContext {
    pub fn new(options: Options) -> Self {
        let environ_array = UArc::new(Array::new("__environ__", 0));
        let content = Expr::read(
            UpdateList::new(environ_array, None),
            Expr::constant(0, 64),
        );
        let unknown_environment_value = VersionedValue::new(
            UArc::new(Value::Global(GlobalName::from("__environ__"))),
            content,
        );
        EngineContext {
            options,
            shadow: ShadowMap::new(),
            environment: RwLock::new(None),
            unknown: Alloc::unknown(),
            unknown_environment: Alloc::unknown_environment(),
            unknown_environment_value,
            unknown_array: UArc::new(Array::new("__unknown__", 0)),
        }
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn shadow(&self) -> &ShadowMap {
        &self.shadow
    }

    /// The abstract location for writes and reads at unresolved addresses.
    #[inline]
    pub fn unknown_allocation(&self) -> &UArc<Alloc> {
        &self.unknown
    }

    /// The abstract location a pointer read from the environment refers to.
    #[inline]
    pub fn unknown_environment_allocation(&self) -> &UArc<Alloc> {
        &self.unknown_environment
    }

    /// The distinguished value representing unobserved environment content.
    #[inline]
    pub fn unknown_environment_value(&self) -> &UArc<VersionedValue> {
        &self.unknown_environment_value
    }

    /// A placeholder expression for unobserved content at `index`: the
    /// result of a load the analysis could not resolve, and the address
    /// of a location reached through one level of indirection.
    pub fn unknown_read(&self, index: ExprRef) -> ExprRef {
        Expr::read(UpdateList::new(self.unknown_array.clone(), None), index)
    }

    /// The canonical environment site and address. The first caller fixes
    /// them; every later environment allocation aliases the same pair.
    pub fn canonical_environment(&self, site: &ValueRef, address: &ExprRef) -> (ValueRef, ExprRef) {
        {
            let read = self.environment.read().unwrap();
            if let Some(pair) = read.as_ref() {
                return pair.clone();
            }
        }
        let mut write = self.environment.write().unwrap();
        write
            .get_or_insert_with(|| (site.clone(), address.clone()))
            .clone()
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_environment_allocation_is_canonical() {
        let ctx = EngineContext::default();
        let s1 = UArc::new(Value::Global(GlobalName::from("environ")));
        let s2 = UArc::new(Value::Global(GlobalName::from("_environ")));
        let a1 = Expr::constant(1, 64);
        let a2 = Expr::constant(2, 64);
        let first = ctx.canonical_environment(&s1, &a1);
        let second = ctx.canonical_environment(&s2, &a2);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
        assert_eq!(second.0, s1);
    }
}
