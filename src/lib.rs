// SPDX-License-Identifier: BSD-3-Clause
//! Flow-insensitive value-dependency analysis for path-based symbolic
//! execution with interpolation.
//!
//! A symbolic executor drives this engine one instruction at a time. Along
//! the way the engine records how values flow through allocations and
//! instructions, so that when a path is proved infeasible the executor can
//! ask which allocations and stored values justify the proof. That set
//! seeds an interpolant: a state predicate used to subsume later paths
//! that reach the same program point with a weaker store.
//!
//! The executor itself, its constraint solver, the instruction decoder,
//! and the interpolation tree all live outside this crate; the surface
//! here is the [`Dependency`] node, the [`AllocationGraph`] derived from
//! it, and the store projection exported through shadow arrays.

pub mod alloc;
pub mod analysis;
pub mod arc;
pub mod context;
pub mod expr;
pub mod ir;
pub mod relation;
pub mod shadow;
pub mod value;

pub use self::alloc::{Alloc, AllocKind};
pub use analysis::dependency::{
    is_environment_allocation, is_main_argument, ConcreteStore, ConcreteStoreMap, Dependency,
    Execution, SymbolicStore, SymbolicStoreMap,
};
pub use analysis::graph::AllocationGraph;
pub use arc::{Arc, UArc};
pub use context::{EngineContext, EqualityGuard, Options};
pub use expr::{Array, BinaryOp, Expr, ExprRef, UpdateList, UpdateNode};
pub use ir::instruction::{Callee, Instruction, Opcode, Operand};
pub use ir::{
    BlockName, FunctionName, GlobalName, InstructionName, ParameterName, Value, ValueRef,
};
pub use relation::{FlowsTo, PointerEquality};
pub use shadow::{shadow_name, ShadowMap};
pub use value::VersionedValue;
