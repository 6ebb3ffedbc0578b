// SPDX-License-Identifier: BSD-3-Clause
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed instruction: opcode defines no result but one was supplied")]
    UnexpectedResult,
    #[error("malformed instruction: opcode requires a result value")]
    MissingResult,
    #[error("malformed instruction: phi with no incoming values")]
    EmptyPhi,
}
