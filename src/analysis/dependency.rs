// SPDX-License-Identifier: BSD-3-Clause
//! Flow-insensitive value dependency along one symbolic execution path.
//!
//! Dependency nodes form a singly linked chain following the interpolation
//! tree: each node records the relations created by the instructions
//! executed in that tree node and looks through its parent for everything
//! older. The engine is flow-insensitive: it never orders side effects,
//! it accumulates relations that held somewhere along the current prefix,
//! with freshness handled by explicit versioning.
//!
//! The relations are:
//!
//! - `equals(v, m)`: the versioned value `v` holds the address of the
//!   allocation `m`;
//! - `stores(m, v)`: the latest write into `m` deposited `v`;
//! - `flowsTo(s, t)`: `t` data-depends on `s`, possibly via a mediating
//!   allocation recorded on the edge.
//!
//! From these, reachability through memory is derived on demand: a value
//! reaches an allocation in zero steps when some value it transitively
//! depends on holds that allocation's address, and in `i + 1` steps when it
//! transitively depends on a value deposited in an allocation reachable in
//! `i` steps. Store and load consult this derived relation; everything else
//! only adds flow edges. When the executor proves a path infeasible, it
//! seeds core marking from the values in the unsatisfiability proof, grows
//! the allocation graph backwards through the flow edges, and exports the
//! store projection of the core as the interpolant.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::sync::RwLock;

use tracing::{debug, trace, trace_span};

use crate::alloc::Alloc;
use crate::arc::{Arc, UArc};
use crate::context::{EngineContext, EqualityGuard};
use crate::expr::{Array, ExprRef};
use crate::ir::instruction::{
    Binary, GetElementPtr, Instruction, Load, Opcode, Operand, Phi, Store, Unary,
};
use crate::ir::{BlockName, Value, ValueRef};
use crate::relation::{FlowsTo, PointerEquality, StoreTable};
use crate::value::VersionedValue;

use super::graph::AllocationGraph;

/// Whether the site is the program's environment pointer.
pub fn is_environment_allocation(site: &ValueRef) -> bool {
    matches!(
        site.global_symbol(),
        Some("environ" | "_environ" | "__environ")
    )
}

/// Whether the site is a parameter of the program entry point.
pub fn is_main_argument(site: &ValueRef) -> bool {
    site.parameter()
        .map(|p| p.function().get() == "main")
        .unwrap_or(false)
}

/// The outcome of one abstract transition.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execution {
    Committed,
    /// A store targeted the environment. No relations were recorded; the
    /// caller is expected to terminate the path.
    AbortedEnvironmentStore,
}

impl Execution {
    #[inline]
    pub fn is_committed(&self) -> bool {
        matches!(self, Execution::Committed)
    }
}

pub type AddressValuePair = (ExprRef, ExprRef);
pub type ConcreteStoreMap = BTreeMap<u64, AddressValuePair>;
pub type SymbolicStoreMap = Vec<AddressValuePair>;
pub type ConcreteStore = HashMap<ValueRef, ConcreteStoreMap>;
pub type SymbolicStore = HashMap<ValueRef, SymbolicStoreMap>;

/// One node of the dependency chain.
///
/// A node owns every versioned value, allocation, equality, and flow edge
/// it creates; relation entries in descendants may reference them through
/// shared handles, and the parent link keeps ancestors alive for as long as
/// any descendant needs them. Only the node currently being executed into
/// is mutated; parents are read-only for their children.
#[derive(Debug)]
pub struct Dependency {
    context: Arc<EngineContext>,
    parent: Option<Arc<Dependency>>,
    /// Argument values bound at a call site, waiting for the callee to
    /// claim them.
    argument_values: RwLock<Vec<UArc<VersionedValue>>>,
    equalities: Vec<PointerEquality>,
    stores: StoreTable,
    flows: Vec<FlowsTo>,
    values: Vec<UArc<VersionedValue>>,
    allocations: Vec<UArc<Alloc>>,
    /// Allocations of this node needed for the core that dominate the
    /// other core allocations along the chain.
    core_allocations: RwLock<Vec<UArc<Alloc>>>,
    /// The basic block of the last-executed instruction, consulted for phi
    /// resolution.
    incoming_block: Option<UArc<BlockName>>,
}

impl Dependency {
    pub fn new(context: Arc<EngineContext>, parent: Option<Arc<Dependency>>) -> Self {
        Dependency {
            context,
            parent,
            argument_values: RwLock::new(Vec::new()),
            equalities: Vec::new(),
            stores: StoreTable::new(),
            flows: Vec::new(),
            values: Vec::new(),
            allocations: Vec::new(),
            core_allocations: RwLock::new(Vec::new()),
            incoming_block: None,
        }
    }

    #[inline]
    pub fn parent(&self) -> Option<&Arc<Dependency>> {
        self.parent.as_ref()
    }

    #[inline]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    // --------------------------------------------------------------
    // Versioned values

    fn new_versioned_value(&mut self, value: ValueRef, expr: ExprRef) -> UArc<VersionedValue> {
        let v = VersionedValue::new(value, expr);
        self.values.push(v.clone());
        v
    }

    /// The latest versioned value of `value` visible from this node.
    /// IR constants are never reused: each use yields a fresh versioned
    /// value, which keeps constants core-free. A local whose expression
    /// happens to be constant still resolves to its versioned history.
    pub fn latest_value(
        &mut self,
        value: &ValueRef,
        expr: &ExprRef,
    ) -> Option<UArc<VersionedValue>> {
        if matches!(value.as_ref(), Value::Constant(_)) {
            return Some(self.new_versioned_value(value.clone(), expr.clone()));
        }
        self.latest_value_no_constant_check(value)
    }

    /// As [`Self::latest_value`] without the constant short-circuit; used
    /// where a constant pointer still needs a representative.
    pub fn latest_value_no_constant_check(&self, value: &ValueRef) -> Option<UArc<VersionedValue>> {
        if let Some(v) = self.values.iter().rev().find(|v| v.has_value(value)) {
            return Some(v.clone());
        }
        self.parent
            .as_ref()
            .and_then(|p| p.latest_value_no_constant_check(value))
    }

    fn resolve_operand(
        &mut self,
        operand: &Operand,
        expr: &ExprRef,
    ) -> Option<UArc<VersionedValue>> {
        match operand {
            Operand::Constant(v) => Some(self.new_versioned_value(v.clone(), expr.clone())),
            Operand::Local(v) => self.latest_value(v, expr),
        }
    }

    /// Resolve an operand, minting a fresh versioned value when no version
    /// is visible. A missing version means the operand is an unobserved
    /// constant, which still needs a representative for edges to exist.
    fn operand_value_or_fresh(&mut self, operand: &Operand, expr: &ExprRef) -> UArc<VersionedValue> {
        self.resolve_operand(operand, expr)
            .unwrap_or_else(|| self.new_versioned_value(operand.value().clone(), expr.clone()))
    }

    // --------------------------------------------------------------
    // Allocations

    /// The most recent allocation matching `(site, address)`, if any.
    fn latest_allocation(&self, site: &ValueRef, address: &ExprRef) -> Option<UArc<Alloc>> {
        if let Some(a) = self
            .allocations
            .iter()
            .rev()
            .find(|a| a.has_allocation_site(site, address))
        {
            return Some(a.clone());
        }
        self.parent
            .as_ref()
            .and_then(|p| p.latest_allocation(site, address))
    }

    /// The allocation for `(site, address)` visible from this node,
    /// created fresh in this node when none exists yet.
    fn initial_allocation(&mut self, site: &ValueRef, address: &ExprRef) -> UArc<Alloc> {
        if is_environment_allocation(site) {
            let (canonical_site, canonical_address) =
                self.context.canonical_environment(site, address);
            if let Some(a) = self.latest_allocation(&canonical_site, &canonical_address) {
                return a;
            }
            let alloc = Alloc::environment(canonical_site, canonical_address);
            self.allocations.push(alloc.clone());
            return alloc;
        }
        if let Some(a) = self.latest_allocation(site, address) {
            return a;
        }
        let alloc = Alloc::versioned(site.clone(), address.clone());
        self.allocations.push(alloc.clone());
        alloc
    }

    /// A fresh version of the allocation at `(site, address)`, for
    /// destructive writes.
    fn new_allocation_version(&mut self, site: &ValueRef, address: &ExprRef) -> UArc<Alloc> {
        let alloc = Alloc::versioned(site.clone(), address.clone());
        self.allocations.push(alloc.clone());
        alloc
    }

    // --------------------------------------------------------------
    // Relation queries

    /// The allocation whose address `value` holds, if any. The closest
    /// node wins; within a node, insertion order breaks ties.
    pub fn resolve_allocation(&self, value: &UArc<VersionedValue>) -> Option<UArc<Alloc>> {
        for eq in &self.equalities {
            if let Some(a) = eq.equals(value) {
                return Some(a.clone());
            }
        }
        self.parent.as_ref().and_then(|p| p.resolve_allocation(value))
    }

    fn allocation_bound(&self, allocation: &UArc<Alloc>) -> bool {
        self.equalities.iter().any(|eq| eq.allocation() == allocation)
            || self
                .parent
                .as_ref()
                .map(|p| p.allocation_bound(allocation))
                .unwrap_or(false)
    }

    fn allocation_bound_to_value(&self, site: &ValueRef, allocation: &UArc<Alloc>) -> bool {
        self.equalities
            .iter()
            .any(|eq| eq.allocation() == allocation && eq.value().has_value(site))
            || self
                .parent
                .as_ref()
                .map(|p| p.allocation_bound_to_value(site, allocation))
                .unwrap_or(false)
    }

    /// Values flowing to `target` in one step, local to this node.
    pub fn direct_local_flow_sources(
        &self,
        target: &UArc<VersionedValue>,
    ) -> Vec<UArc<VersionedValue>> {
        self.flows
            .iter()
            .filter(|f| f.target() == target)
            .map(|f| f.source().clone())
            .collect()
    }

    /// Values flowing to `target` in one step, across the chain. The edges
    /// of a value live in the node that created them.
    pub fn direct_flow_sources(&self, target: &UArc<VersionedValue>) -> Vec<UArc<VersionedValue>> {
        let mut out = Vec::new();
        let mut node = Some(self);
        while let Some(n) = node {
            out.extend(n.direct_local_flow_sources(target));
            node = n.parent.as_deref();
        }
        out
    }

    /// All values that could flow to `target`.
    pub fn all_flow_sources(&self, target: &UArc<VersionedValue>) -> Vec<UArc<VersionedValue>> {
        let mut visited: HashSet<UArc<VersionedValue>> = HashSet::new();
        let mut queue: VecDeque<UArc<VersionedValue>> =
            self.direct_flow_sources(target).into();
        let mut out = Vec::new();
        while let Some(s) = queue.pop_front() {
            if !visited.insert(s.clone()) {
                continue;
            }
            queue.extend(self.direct_flow_sources(&s));
            out.push(s);
        }
        out
    }

    /// The terminals of the flow closure: sources of `target` with no
    /// incoming flow edge of their own.
    pub fn all_flow_sources_ends(
        &self,
        target: &UArc<VersionedValue>,
    ) -> Vec<UArc<VersionedValue>> {
        self.all_flow_sources(target)
            .into_iter()
            .filter(|s| self.direct_flow_sources(s).is_empty())
            .collect()
    }

    /// The reflexive transitive closure of the flow relation, looking
    /// backwards from `value`.
    fn depends_star(&self, value: &UArc<VersionedValue>) -> Vec<UArc<VersionedValue>> {
        let mut out = vec![value.clone()];
        out.extend(self.all_flow_sources(value));
        out
    }

    /// Allocations held by any value `value` transitively depends on.
    pub fn resolve_allocation_transitively(
        &self,
        value: &UArc<VersionedValue>,
    ) -> Vec<UArc<Alloc>> {
        let mut out: Vec<UArc<Alloc>> = Vec::new();
        for v in self.depends_star(value) {
            if let Some(a) = self.resolve_allocation(&v) {
                if !out.contains(&a) {
                    out.push(a);
                }
            }
        }
        out
    }

    /// Values currently stored in `allocation`, newest node first. Each
    /// node contributes at most one entry.
    pub fn stored_values(&self, allocation: &UArc<Alloc>) -> Vec<UArc<VersionedValue>> {
        let mut out = Vec::new();
        let mut node = Some(self);
        while let Some(n) = node {
            if let Some(v) = n.stores.value_in(allocation) {
                out.push(v.clone());
            }
            node = n.parent.as_deref();
        }
        out
    }

    /// Allocations into which `value` was deposited, across the chain.
    fn allocations_storing(&self, value: &UArc<VersionedValue>) -> Vec<UArc<Alloc>> {
        let mut out: Vec<UArc<Alloc>> = Vec::new();
        let mut node = Some(self);
        while let Some(n) = node {
            for a in n.stores.allocations_holding(value) {
                if !out.contains(a) {
                    out.push(a.clone());
                }
            }
            node = n.parent.as_deref();
        }
        out
    }

    /// Allocations one level of indirection away from `value`: the value
    /// transitively depends on something deposited in each of them.
    fn one_step_indirect_targets(&self, value: &UArc<VersionedValue>) -> Vec<UArc<Alloc>> {
        let mut out: Vec<UArc<Alloc>> = Vec::new();
        for w in self.depends_star(value) {
            for a in self.allocations_storing(&w) {
                if !out.contains(&a) {
                    out.push(a);
                }
            }
        }
        out
    }

    // --------------------------------------------------------------
    // The abstract transition function

    /// Apply the dependency semantics of one instruction. `args` holds the
    /// symbolic expressions of the instruction's operands in operand
    /// order, except for an allocation instruction, which receives the
    /// base-address expression of the new object as its only element.
    pub fn execute(&mut self, instr: &Instruction, args: &[ExprRef]) -> Execution {
        let expected = match &instr.opcode {
            Opcode::Alloca(_) => 1,
            op => op.operands().len(),
        };
        debug_assert_eq!(expected, args.len(), "operand expression count");

        let span = trace_span!("execute", block = %instr.block);
        let _enter = span.enter();

        let outcome = match &instr.opcode {
            Opcode::Alloca(_) => self.execute_alloca(instr, args),
            Opcode::Store(s) => self.execute_store(s, args),
            Opcode::Load(l) => self.execute_load(instr, l, args),
            Opcode::GetElementPtr(g) => self.execute_gep(instr, g, args),
            Opcode::Phi(p) => self.execute_phi(instr, p, args),
            Opcode::Binary(b) => self.execute_binary(instr, b, args),
            Opcode::Unary(u) => self.execute_unary(instr, u, args),
            Opcode::Call(_) => {
                self.bind_call_arguments(instr, args);
                Execution::Committed
            }
            Opcode::Ret(_) | Opcode::Other => Execution::Committed,
        };
        if outcome.is_committed() {
            self.incoming_block = Some(instr.block.clone());
        }
        outcome
    }

    fn execute_alloca(&mut self, instr: &Instruction, args: &[ExprRef]) -> Execution {
        let Some(site) = instr.result.clone() else {
            return Execution::Committed;
        };
        let address = args[0].clone();
        let allocation = self.initial_allocation(&site, &address);
        let bound = match self.context.options().equality_guard {
            EqualityGuard::OnAllocation => self.allocation_bound(&allocation),
            EqualityGuard::OnPair => self.allocation_bound_to_value(&site, &allocation),
        };
        if !bound {
            let v = self.new_versioned_value(site, address);
            trace!(equality = %PointerEquality::new(v.clone(), allocation.clone()), "alloca");
            self.equalities.push(PointerEquality::new(v, allocation));
        }
        Execution::Committed
    }

    fn execute_store(&mut self, store: &Store, args: &[ExprRef]) -> Execution {
        let value_expr = &args[0];
        let pointer_expr = &args[1];
        if is_environment_allocation(store.pointer.value()) {
            debug!("store to the environment, aborting with no changes");
            return Execution::AbortedEnvironmentStore;
        }
        let vp = self.operand_value_or_fresh(&store.pointer, pointer_expr);
        let direct = self.resolve_allocation_transitively(&vp);
        if direct.iter().any(|a| a.is_environment()) {
            debug!("store through an environment pointer, aborting with no changes");
            return Execution::AbortedEnvironmentStore;
        }
        let vv = self.operand_value_or_fresh(&store.value, value_expr);
        if !direct.is_empty() {
            for m in &direct {
                match (m.site().cloned(), m.address().cloned()) {
                    (Some(site), Some(address)) => {
                        let fresh = self.new_allocation_version(&site, &address);
                        trace!(allocation = %fresh, value = %vv, "store");
                        self.stores.update(fresh, vv.clone());
                    }
                    // Sentinels cannot be versioned; updates to them are
                    // non-destructive.
                    _ => self.stores.update(m.clone(), vv.clone()),
                }
            }
            return Execution::Committed;
        }
        let indirect = self.one_step_indirect_targets(&vp);
        if !indirect.is_empty() {
            for m in &indirect {
                match (m.site().cloned(), m.address().cloned()) {
                    (Some(site), Some(address)) => {
                        // TODO: Chase deeper indirection once the executor
                        // produces pointers more than one load away from
                        // their allocation.
                        //
                        // The target sits one load behind the base cell;
                        // its address is the unresolved content of that
                        // cell, never the base address itself, so the two
                        // cannot share an export slot.
                        let target_address = self.context.unknown_read(address);
                        let fresh = Alloc::indirect(site, target_address, 1);
                        self.allocations.push(fresh.clone());
                        trace!(allocation = %fresh, value = %vv, "store one step indirect");
                        self.stores.update(fresh, vv.clone());
                    }
                    _ => self.stores.update(m.clone(), vv.clone()),
                }
            }
            return Execution::Committed;
        }
        trace!(value = %vv, "store at unknown address");
        self.stores
            .update(self.context.unknown_allocation().clone(), vv);
        Execution::Committed
    }

    fn execute_load(&mut self, instr: &Instruction, load: &Load, args: &[ExprRef]) -> Execution {
        let pointer_expr = &args[0];
        let Some(result) = instr.result.clone() else {
            return Execution::Committed;
        };
        if is_environment_allocation(load.pointer.value()) {
            let expr = self
                .context
                .unknown_environment_value()
                .expression()
                .clone();
            let v = self.new_versioned_value(result, expr);
            let alloc = self.context.unknown_environment_allocation().clone();
            trace!(value = %v, "environment load");
            self.equalities.push(PointerEquality::new(v, alloc));
            return Execution::Committed;
        }

        let vp = self.operand_value_or_fresh(&load.pointer, pointer_expr);

        // The load rules are not mutually exclusive; every applicable one
        // contributes sources.
        let mut sources: Vec<(UArc<VersionedValue>, Option<UArc<Alloc>>)> = Vec::new();

        // Content deposited in the allocations the pointer resolves to.
        let mut direct_content = false;
        for m in &self.resolve_allocation_transitively(&vp) {
            if m.is_environment() {
                sources.push((self.context.unknown_environment_value().clone(), None));
                direct_content = true;
                continue;
            }
            let latest = match (m.site(), m.address()) {
                (Some(site), Some(address)) => self
                    .latest_allocation(site, address)
                    .unwrap_or_else(|| m.clone()),
                _ => m.clone(),
            };
            for u in self.stored_values(&latest) {
                sources.push((u, Some(latest.clone())));
                direct_content = true;
            }
        }

        // Content one level of indirection away.
        for w in self.depends_star(&vp) {
            for a in self.allocations_storing(&w) {
                if a.is_unknown() {
                    continue;
                }
                for u in self.stored_values(&a) {
                    sources.push((u, Some(a.clone())));
                }
            }
        }

        // Anything deposited at an unknown address may be what we read.
        for u in self.stored_values(self.context.unknown_allocation()) {
            sources.push((u, None));
        }

        let result_expr = sources
            .first()
            .map(|(u, _)| u.expression().clone())
            .unwrap_or_else(|| self.context.unknown_read(pointer_expr.clone()));
        let v = self.new_versioned_value(result, result_expr);
        for (u, via) in sources {
            trace!(flow = %FlowsTo::new(u.clone(), v.clone(), via.clone()), "load");
            self.flows.push(FlowsTo::new(u, v.clone(), via));
        }
        if !direct_content {
            // The addressed content was never observed; the result is a
            // sink of the unknown store.
            trace!(value = %v, "load of unobserved content");
            self.stores
                .update(self.context.unknown_allocation().clone(), v);
        }
        Execution::Committed
    }

    fn execute_gep(
        &mut self,
        instr: &Instruction,
        gep: &GetElementPtr,
        args: &[ExprRef],
    ) -> Execution {
        let Some(result) = instr.result.clone() else {
            return Execution::Committed;
        };
        let vp = self.operand_value_or_fresh(&gep.pointer, &args[0]);
        let mut expr = args[0].clone();
        for idx in &args[1..] {
            expr = crate::expr::Expr::binary(crate::expr::BinaryOp::Add, expr, idx.clone());
        }
        let v = self.new_versioned_value(result, expr);
        self.flows.push(FlowsTo::new(vp, v, None));
        Execution::Committed
    }

    fn execute_phi(&mut self, instr: &Instruction, phi: &Phi, args: &[ExprRef]) -> Execution {
        let Some(result) = instr.result.clone() else {
            return Execution::Committed;
        };
        let mut chosen: Vec<usize> = match &self.incoming_block {
            Some(block) => phi
                .incoming
                .iter()
                .enumerate()
                .filter(|(_, (_, pred))| pred == block)
                .map(|(i, _)| i)
                .collect(),
            None => Vec::new(),
        };
        if chosen.is_empty() {
            // The live predecessor is unknown; depend on every operand.
            chosen = (0..phi.incoming.len()).collect();
        }
        let mut incoming = Vec::with_capacity(chosen.len());
        for &i in &chosen {
            if let Some(u) = self.resolve_operand(&phi.incoming[i].0, &args[i]) {
                incoming.push(u);
            }
        }
        let expr = incoming
            .first()
            .map(|u| u.expression().clone())
            .unwrap_or_else(|| args[chosen[0]].clone());
        let v = self.new_versioned_value(result, expr);
        for u in incoming {
            self.flows.push(FlowsTo::new(u, v.clone(), None));
        }
        Execution::Committed
    }

    fn execute_binary(&mut self, instr: &Instruction, binary: &Binary, args: &[ExprRef]) -> Execution {
        let Some(result) = instr.result.clone() else {
            return Execution::Committed;
        };
        let left = self.operand_value_or_fresh(&binary.left, &args[0]);
        let right = self.operand_value_or_fresh(&binary.right, &args[1]);
        let expr = crate::expr::Expr::binary(binary.op, args[0].clone(), args[1].clone());
        let v = self.new_versioned_value(result, expr);
        self.flows.push(FlowsTo::new(left, v.clone(), None));
        self.flows.push(FlowsTo::new(right, v, None));
        Execution::Committed
    }

    fn execute_unary(&mut self, instr: &Instruction, unary: &Unary, args: &[ExprRef]) -> Execution {
        let Some(result) = instr.result.clone() else {
            return Execution::Committed;
        };
        let source = self.operand_value_or_fresh(&unary.operand, &args[0]);
        let v = self.new_versioned_value(result, args[0].clone());
        self.flows.push(FlowsTo::new(source, v, None));
        Execution::Committed
    }

    // --------------------------------------------------------------
    // Calls and returns

    /// Read the latest versioned value of each actual argument and queue
    /// them for the callee.
    pub fn bind_call_arguments(&mut self, instr: &Instruction, args: &[ExprRef]) {
        let Opcode::Call(call) = &instr.opcode else {
            debug_assert!(false, "bind_call_arguments on a non-call");
            return;
        };
        let mut bound = Vec::with_capacity(call.args.len());
        for (operand, expr) in call.args.iter().zip(args) {
            bound.push(self.operand_value_or_fresh(operand, expr));
        }
        self.argument_values.write().unwrap().extend(bound);
    }

    /// Claim the argument values queued by the nearest call site and bind
    /// them, in order, to the callee's formal parameters. Parameters of the
    /// program entry point have no caller; they get fresh versioned values
    /// with no incoming flow.
    pub fn bind_callee_parameters(&mut self, params: &[(ValueRef, ExprRef)]) {
        let actuals = self.take_pending_arguments();
        if actuals.is_empty() {
            for (param, expr) in params {
                if is_main_argument(param) {
                    self.new_versioned_value(param.clone(), expr.clone());
                }
            }
            return;
        }
        for ((param, expr), actual) in params.iter().zip(actuals) {
            let v = self.new_versioned_value(param.clone(), expr.clone());
            self.flows.push(FlowsTo::new(actual, v, None));
        }
    }

    fn take_pending_arguments(&self) -> Vec<UArc<VersionedValue>> {
        {
            let mut own = self.argument_values.write().unwrap();
            if !own.is_empty() {
                return std::mem::take(&mut *own);
            }
        }
        let mut node = self.parent.as_deref();
        while let Some(n) = node {
            {
                let mut pending = n.argument_values.write().unwrap();
                if !pending.is_empty() {
                    return std::mem::take(&mut *pending);
                }
            }
            node = n.parent.as_deref();
        }
        Vec::new()
    }

    /// Link the value received at a call site to the value returned by the
    /// callee.
    pub fn bind_return_value(
        &mut self,
        call_site: &Instruction,
        ret: &Instruction,
        return_expr: ExprRef,
    ) {
        let Some(result) = call_site.result.clone() else {
            return;
        };
        let source = match &ret.opcode {
            Opcode::Ret(r) => r
                .value
                .as_ref()
                .and_then(|op| self.resolve_operand(op, &return_expr)),
            _ => None,
        };
        let v = self.new_versioned_value(result, return_expr);
        if let Some(s) = source {
            self.flows.push(FlowsTo::new(s, v, None));
        }
    }

    // --------------------------------------------------------------
    // Core marking and the allocation graph

    /// Direct flow predecessors of `target` paired with the allocation
    /// each dependency went through: the edge's mediating allocation when
    /// recorded, the source's own pointer binding otherwise.
    fn direct_allocation_sources(
        &self,
        target: &UArc<VersionedValue>,
    ) -> Vec<(UArc<VersionedValue>, Option<UArc<Alloc>>)> {
        let mut out: Vec<(UArc<VersionedValue>, Option<UArc<Alloc>>)> = Vec::new();
        let mut node = Some(self);
        while let Some(n) = node {
            for f in n.flows.iter().filter(|f| f.target() == target) {
                let source = f.source().clone();
                if out.iter().any(|(s, _)| *s == source) {
                    continue;
                }
                let alloc = f.via().cloned().or_else(|| self.resolve_allocation(&source));
                out.push((source, alloc));
            }
            node = n.parent.as_deref();
        }
        out
    }

    fn recursively_build_allocation_graph(
        &self,
        g: &mut AllocationGraph,
        value: &UArc<VersionedValue>,
        current: Option<&UArc<Alloc>>,
        visited: &mut HashSet<UArc<VersionedValue>>,
    ) {
        if !visited.insert(value.clone()) {
            return;
        }
        // The graph performs no duplicate-edge check; link each allocation
        // at most once per level, and never to itself.
        let mut linked: HashSet<UArc<Alloc>> = HashSet::new();
        for (source, alloc) in self.direct_allocation_sources(value) {
            source.set_core();
            if let Some(a) = &alloc {
                a.set_core();
                if linked.insert(a.clone()) {
                    match current {
                        Some(sink_side) if sink_side != a => g.add_new_edge(a, sink_side),
                        Some(_) => {}
                        None => g.add_new_sink(a.clone()),
                    }
                }
            }
            self.recursively_build_allocation_graph(
                g,
                &source,
                alloc.as_ref().or(current),
                visited,
            );
        }
    }

    fn build_allocation_graph(&self, g: &mut AllocationGraph, value: &UArc<VersionedValue>) {
        // The allocations holding the seed value are where the core lives;
        // they are the sinks the rest of the graph grows from.
        for a in self.allocations_storing(value) {
            g.add_new_sink(a);
        }
        let mut visited = HashSet::new();
        self.recursively_build_allocation_graph(g, value, None, &mut visited);
    }

    /// Mark `value` and everything it transitively depends on as core, and
    /// grow the allocation graph with the allocations the dependencies
    /// went through.
    pub fn mark_all_values(&self, g: &mut AllocationGraph, value: &UArc<VersionedValue>) {
        value.set_core();
        self.build_allocation_graph(g, value);
    }

    /// As [`Self::mark_all_values`], resolving the latest versioned value
    /// first. A value that was never versioned is a no-op.
    pub fn mark_all_values_of(&self, g: &mut AllocationGraph, value: &ValueRef) {
        if let Some(v) = self.latest_value_no_constant_check(value) {
            self.mark_all_values(g, &v);
        }
    }

    /// Walk the chain from this node upwards; each node claims the graph
    /// sinks among its own allocations as its core allocations and
    /// consumes them, exposing the next layer for its ancestors.
    pub fn compute_core_allocations(&self, g: &mut AllocationGraph) {
        for a in &self.allocations {
            if a.is_core() && !g.visited(a) {
                g.add_new_sink(a.clone());
            }
        }
        let claimed = g.sinks_with_allocations(&self.allocations);
        {
            let mut core = self.core_allocations.write().unwrap();
            for a in claimed {
                if !core.contains(&a) {
                    core.push(a);
                }
            }
        }
        g.consume_sinks_with_allocations(&self.allocations);
        if let Some(p) = &self.parent {
            p.compute_core_allocations(g);
        }
    }

    /// The core allocations claimed by this node.
    pub fn core_allocations(&self) -> Vec<UArc<Alloc>> {
        self.core_allocations.read().unwrap().clone()
    }

    // --------------------------------------------------------------
    // Store projection

    /// Project the visible store into a concrete-address map and a
    /// symbolic-address list per allocation site.
    ///
    /// With `core_only`, only entries whose allocation was claimed as core
    /// and whose value is core-marked are emitted, and every emitted
    /// expression is rewritten through the shadow registry; the arrays
    /// observed on the way are added to `replacements`, so the caller ends
    /// up with the full set of originals the export mentions.
    pub fn get_stored_expressions(
        &self,
        replacements: &mut HashSet<UArc<Array>>,
        core_only: bool,
    ) -> (ConcreteStore, SymbolicStore) {
        let mut concrete = ConcreteStore::new();
        let mut symbolic = SymbolicStore::new();
        self.collect_stored_expressions(&mut concrete, &mut symbolic, replacements, core_only);
        (concrete, symbolic)
    }

    fn collect_stored_expressions(
        &self,
        concrete: &mut ConcreteStore,
        symbolic: &mut SymbolicStore,
        replacements: &mut HashSet<UArc<Array>>,
        core_only: bool,
    ) {
        // Ancestors first, so newer entries overwrite older concrete slots
        // and list order stays chronological.
        if let Some(p) = &self.parent {
            p.collect_stored_expressions(concrete, symbolic, replacements, core_only);
        }
        for (a, v) in self.stores.iter() {
            let (Some(site), Some(address)) = (a.site(), a.address()) else {
                continue;
            };
            if core_only {
                let core = self.core_allocations.read().unwrap();
                if !core.contains(a) || !v.is_core() {
                    continue;
                }
            }
            let (address_expr, value_expr) = if core_only {
                let shadow = self.context.shadow();
                let mut arrays = HashSet::new();
                address.collect_arrays(&mut arrays);
                v.expression().collect_arrays(&mut arrays);
                for arr in &arrays {
                    shadow.ensure_shadow(arr);
                }
                replacements.extend(arrays);
                (
                    shadow.shadow_expression(address, replacements),
                    shadow.shadow_expression(v.expression(), replacements),
                )
            } else {
                (address.clone(), v.expression().clone())
            };
            if let Some(concrete_address) = address.as_constant() {
                concrete
                    .entry(site.clone())
                    .or_default()
                    .insert(concrete_address, (address_expr, value_expr));
            } else {
                symbolic
                    .entry(site.clone())
                    .or_default()
                    .push((address_expr, value_expr));
            }
        }
    }

    /// Render this node and its ancestors, one indentation level per hop.
    pub fn dump_chain(&self) -> String {
        let mut out = String::new();
        let mut depth = 0usize;
        let mut node = Some(self);
        while let Some(n) = node {
            let indent = "  ".repeat(depth);
            for line in n.to_string().lines() {
                out.push_str(&indent);
                out.push_str(line);
                out.push('\n');
            }
            depth += 1;
            node = n.parent.as_deref();
        }
        out
    }
}

impl Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "EQUALITIES:")?;
        for eq in &self.equalities {
            writeln!(f, "  {}", eq)?;
        }
        writeln!(f, "STORES:")?;
        for (a, v) in self.stores.iter() {
            writeln!(f, "  {} <- {}", a, v)?;
        }
        writeln!(f, "FLOWS:")?;
        for flow in &self.flows {
            writeln!(f, "  {}", flow)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;
    use crate::expr::{Expr, UpdateList};
    use crate::ir::{BlockName, FunctionName, GlobalName, InstructionName, Value};

    fn context() -> Arc<EngineContext> {
        Arc::new(EngineContext::new(Options::default()))
    }

    fn block(f: &str, b: &str) -> UArc<BlockName> {
        let f = UArc::new(FunctionName::from(f));
        UArc::new(BlockName::new(f, b))
    }

    fn local(b: &UArc<BlockName>, idx: usize) -> ValueRef {
        UArc::new(Value::Instruction(UArc::new(InstructionName::new(
            b.function().clone(),
            b.clone(),
            idx,
        ))))
    }

    fn symbolic(name: &str) -> ExprRef {
        Expr::read(
            UpdateList::new(UArc::new(crate::expr::Array::new(name, 8)), None),
            Expr::constant(0, 32),
        )
    }

    #[test]
    fn latest_value_shadows_across_the_chain() {
        let ctx = context();
        let b = block("f", "entry");
        let x = local(&b, 0);
        let mut root = Dependency::new(ctx.clone(), None);
        let v1 = root.new_versioned_value(x.clone(), symbolic("one"));
        let root = Arc::new(root);
        let mut child = Dependency::new(ctx, Some(root.clone()));

        assert_eq!(child.latest_value_no_constant_check(&x), Some(v1.clone()));
        let v2 = child.new_versioned_value(x.clone(), symbolic("two"));
        assert_eq!(child.latest_value_no_constant_check(&x), Some(v2));
        assert_eq!(root.latest_value_no_constant_check(&x), Some(v1));
    }

    #[test]
    fn constants_are_never_reused() {
        let ctx = context();
        let mut node = Dependency::new(ctx, None);
        let c = Expr::constant(7, 32);
        let seven = UArc::new(Value::Constant(c.clone()));
        let first = node.latest_value(&seven, &c).unwrap();
        let second = node.latest_value(&seven, &c).unwrap();
        assert_ne!(first, second);
        assert!(!first.is_core());
    }

    #[test]
    fn missing_latest_value_is_none() {
        let ctx = context();
        let b = block("f", "entry");
        let node = Dependency::new(ctx, None);
        assert_eq!(node.latest_value_no_constant_check(&local(&b, 0)), None);
    }

    #[test]
    fn alloca_binds_each_allocation_once() {
        let ctx = context();
        let b = block("f", "entry");
        let a = local(&b, 0);
        let mut node = Dependency::new(ctx, None);
        let alloca = Instruction::alloca(a.clone(), b.clone()).unwrap();
        let addr = Expr::constant(64, 64);
        assert!(node.execute(&alloca, &[addr.clone()]).is_committed());
        assert!(node.execute(&alloca, &[addr]).is_committed());
        assert_eq!(node.equalities.len(), 1);
    }

    #[test]
    fn environment_allocations_share_identity() {
        let ctx = context();
        let e1 = UArc::new(Value::Global(GlobalName::from("environ")));
        let e2 = UArc::new(Value::Global(GlobalName::from("_environ")));
        let mut node = Dependency::new(ctx, None);
        let addr = Expr::constant(4096, 64);
        let a1 = node.initial_allocation(&e1, &addr);
        let a2 = node.initial_allocation(&e2, &addr);
        assert_eq!(a1, a2);
        assert_eq!(node.allocations.len(), 1);
    }

    #[test]
    fn equality_guard_policies_differ_on_shared_allocations() {
        let b = block("main", "entry");
        let e1 = UArc::new(Value::Global(GlobalName::from("environ")));
        let e2 = UArc::new(Value::Global(GlobalName::from("_environ")));
        let addr = Expr::constant(4096, 64);

        // Both environment sites alias one allocation; the per-allocation
        // guard binds it once.
        let ctx = context();
        let mut node = Dependency::new(ctx, None);
        let a1 = Instruction::alloca(e1.clone(), b.clone()).unwrap();
        let a2 = Instruction::alloca(e2.clone(), b.clone()).unwrap();
        assert!(node.execute(&a1, &[addr.clone()]).is_committed());
        assert!(node.execute(&a2, &[addr.clone()]).is_committed());
        assert_eq!(node.equalities.len(), 1);

        // The per-pair guard lets each site bind its own value.
        let ctx = Arc::new(EngineContext::new(Options {
            equality_guard: EqualityGuard::OnPair,
        }));
        let mut node = Dependency::new(ctx, None);
        assert!(node.execute(&a1, &[addr.clone()]).is_committed());
        assert!(node.execute(&a2, &[addr]).is_committed());
        assert_eq!(node.equalities.len(), 2);
    }

    #[test]
    fn main_parameters_need_no_caller() {
        let ctx = context();
        let b = block("main", "entry");
        let argv = UArc::new(Value::Parameter(crate::ir::ParameterName::new(
            b.function().clone(),
            "argv",
        )));
        let mut node = Dependency::new(ctx, None);
        node.bind_callee_parameters(&[(argv.clone(), symbolic("argv"))]);
        assert!(node.latest_value_no_constant_check(&argv).is_some());
    }
}
