// SPDX-License-Identifier: BSD-3-Clause
//! Versioned values.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arc::UArc;
use crate::expr::ExprRef;
use crate::ir::ValueRef;

/// One version of an IR value: the value produced by one instruction at one
/// point along the path. Several versions of the same IR value may coexist;
/// the newest along the dependency chain shadows the older ones.
#[derive(Debug)]
pub struct VersionedValue {
    value: ValueRef,
    expr: ExprRef,
    /// Whether an unsatisfiability core depends on this value. Monotone.
    core: AtomicBool,
}

impl VersionedValue {
    pub fn new(value: ValueRef, expr: ExprRef) -> UArc<Self> {
        UArc::new(VersionedValue {
            value,
            expr,
            core: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn has_value(&self, value: &ValueRef) -> bool {
        self.value == *value
    }

    #[inline]
    pub fn value(&self) -> &ValueRef {
        &self.value
    }

    #[inline]
    pub fn expression(&self) -> &ExprRef {
        &self.expr
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

impl Display for VersionedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} := {}", self.value, self.expr)?;
        if self.is_core() {
            write!(f, " (core)")?;
        }
        Ok(())
    }
}
