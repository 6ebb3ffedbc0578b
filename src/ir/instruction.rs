// SPDX-License-Identifier: BSD-3-Clause
use std::fmt::Display;

use crate::arc::UArc;
use crate::expr::BinaryOp;

use super::error::Error;
use super::name::BlockName;
use super::ValueRef;

/// An instruction operand. Locals resolve to the latest versioned value
/// along the dependency chain; constants mint a fresh versioned value per
/// use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Constant(ValueRef),
    Local(ValueRef),
}

impl Operand {
    #[inline]
    pub fn value(&self) -> &ValueRef {
        match self {
            Operand::Constant(v) | Operand::Local(v) => v,
        }
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Callee {
    Operand(Operand),
    Asm,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alloca {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Store {
    pub value: Operand,
    pub pointer: Operand,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Load {
    pub pointer: Operand,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetElementPtr {
    pub pointer: Operand,
    pub indices: Vec<Operand>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phi {
    /// Incoming values paired with their predecessor blocks.
    pub incoming: Vec<(Operand, UArc<BlockName>)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binary {
    pub op: BinaryOp,
    pub left: Operand,
    pub right: Operand,
}

/// Unary operations and casts; the result depends on the single operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unary {
    pub operand: Operand,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub callee: Callee,
    pub args: Vec<Operand>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ret {
    pub value: Option<Operand>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Alloca(Alloca),
    Store(Store),
    Load(Load),
    GetElementPtr(GetElementPtr),
    Phi(Phi),
    Binary(Binary),
    Unary(Unary),
    Call(Call),
    Ret(Ret),
    //
    Other,
}

impl Opcode {
    /// Operands in the order their expressions are passed to `execute`.
    /// The callee of a call is not an operand here; only the actual
    /// arguments are.
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Opcode::Alloca(_) => vec![],
            Opcode::Store(s) => vec![&s.value, &s.pointer],
            Opcode::Load(l) => vec![&l.pointer],
            Opcode::GetElementPtr(g) => {
                let mut ops = vec![&g.pointer];
                ops.extend(g.indices.iter());
                ops
            }
            Opcode::Phi(p) => p.incoming.iter().map(|(op, _)| op).collect(),
            Opcode::Binary(b) => vec![&b.left, &b.right],
            Opcode::Unary(u) => vec![&u.operand],
            Opcode::Call(c) => c.args.iter().collect(),
            Opcode::Ret(r) => r.value.iter().collect(),
            //
            Opcode::Other => vec![],
        }
    }

    fn defines_result(&self) -> bool {
        match self {
            Opcode::Alloca(_)
            | Opcode::Load(_)
            | Opcode::GetElementPtr(_)
            | Opcode::Phi(_)
            | Opcode::Binary(_)
            | Opcode::Unary(_) => true,
            Opcode::Store(_) | Opcode::Ret(_) => false,
            // Calls may or may not produce a value; Other is opaque.
            Opcode::Call(_) | Opcode::Other => false,
        }
    }

    fn may_define_result(&self) -> bool {
        matches!(self, Opcode::Call(_) | Opcode::Other) || self.defines_result()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub result: Option<ValueRef>,
    pub opcode: Opcode,
    pub block: UArc<BlockName>,
}

impl Instruction {
    pub fn new(
        result: Option<ValueRef>,
        opcode: Opcode,
        block: UArc<BlockName>,
    ) -> Result<Self, Error> {
        if let Opcode::Phi(p) = &opcode {
            if p.incoming.is_empty() {
                return Err(Error::EmptyPhi);
            }
        }
        if opcode.defines_result() && result.is_none() {
            return Err(Error::MissingResult);
        }
        if !opcode.may_define_result() && result.is_some() {
            return Err(Error::UnexpectedResult);
        }
        Ok(Instruction {
            result,
            opcode,
            block,
        })
    }

    pub fn alloca(result: ValueRef, block: UArc<BlockName>) -> Result<Self, Error> {
        Self::new(Some(result), Opcode::Alloca(Alloca {}), block)
    }

    pub fn store(value: Operand, pointer: Operand, block: UArc<BlockName>) -> Result<Self, Error> {
        Self::new(None, Opcode::Store(Store { value, pointer }), block)
    }

    pub fn load(result: ValueRef, pointer: Operand, block: UArc<BlockName>) -> Result<Self, Error> {
        Self::new(Some(result), Opcode::Load(Load { pointer }), block)
    }

    pub fn getelementptr(
        result: ValueRef,
        pointer: Operand,
        indices: Vec<Operand>,
        block: UArc<BlockName>,
    ) -> Result<Self, Error> {
        Self::new(
            Some(result),
            Opcode::GetElementPtr(GetElementPtr { pointer, indices }),
            block,
        )
    }

    pub fn phi(
        result: ValueRef,
        incoming: Vec<(Operand, UArc<BlockName>)>,
        block: UArc<BlockName>,
    ) -> Result<Self, Error> {
        Self::new(Some(result), Opcode::Phi(Phi { incoming }), block)
    }

    pub fn binary(
        result: ValueRef,
        op: BinaryOp,
        left: Operand,
        right: Operand,
        block: UArc<BlockName>,
    ) -> Result<Self, Error> {
        Self::new(Some(result), Opcode::Binary(Binary { op, left, right }), block)
    }

    pub fn unary(result: ValueRef, operand: Operand, block: UArc<BlockName>) -> Result<Self, Error> {
        Self::new(Some(result), Opcode::Unary(Unary { operand }), block)
    }

    pub fn call(
        result: Option<ValueRef>,
        callee: Callee,
        args: Vec<Operand>,
        block: UArc<BlockName>,
    ) -> Result<Self, Error> {
        Self::new(result, Opcode::Call(Call { callee, args }), block)
    }

    pub fn ret(value: Option<Operand>, block: UArc<BlockName>) -> Result<Self, Error> {
        Self::new(None, Opcode::Ret(Ret { value }), block)
    }
}
