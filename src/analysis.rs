// SPDX-License-Identifier: BSD-3-Clause
pub mod dependency;
pub mod graph;
