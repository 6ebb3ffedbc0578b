// SPDX-License-Identifier: BSD-3-Clause
//! The shadow-array registry.
//!
//! Exported state predicates must not mention path-local array names, so
//! every original array observed during export is paired with a renamed
//! shadow array and the exported expressions are rewritten to reference the
//! shadows. The registry is insert-once: an original is mapped at most
//! once, and later insertions for the same original are ignored.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::arc::{Arc, UArc};
use crate::expr::{create_binary_of_same_kind, Array, Expr, ExprRef, UpdateList, UpdateNode};

/// Process-wide mapping from original arrays to their shadows. Writes are
/// monotone, so the lock is only contended by insertion.
#[derive(Debug, Default)]
pub struct ShadowMap {
    map: RwLock<HashMap<UArc<Array>, UArc<Array>>>,
}

/// The renamed counterpart of an original array name.
pub fn shadow_name(name: &str) -> String {
    format!("__shadow__{}", name)
}

impl ShadowMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `source` to `target`. The first insertion wins; later calls for
    /// the same source leave the registry unchanged.
    pub fn add_shadow_array(&self, source: &UArc<Array>, target: UArc<Array>) {
        let mut map = self.map.write().unwrap();
        map.entry(source.clone()).or_insert(target);
    }

    pub fn shadow_of(&self, source: &UArc<Array>) -> Option<UArc<Array>> {
        self.map.read().unwrap().get(source).cloned()
    }

    /// The shadow of `source`, created and registered on first use.
    pub fn ensure_shadow(&self, source: &UArc<Array>) -> UArc<Array> {
        let mut map = self.map.write().unwrap();
        map.entry(source.clone())
            .or_insert_with(|| UArc::new(Array::new(shadow_name(source.name()), source.size())))
            .clone()
    }

    /// `expr` with every reference to an array in `replacements` replaced by
    /// its shadow. Sub-terms whose arrays have no registered shadow are left
    /// intact. Unchanged sub-terms keep their identity, so rewriting with an
    /// empty replacement set is the identity function.
    pub fn shadow_expression(
        &self,
        expr: &ExprRef,
        replacements: &HashSet<UArc<Array>>,
    ) -> ExprRef {
        let mut memo = HashMap::new();
        self.rewrite(expr, replacements, &mut memo)
    }

    fn rewrite(
        &self,
        expr: &ExprRef,
        replacements: &HashSet<UArc<Array>>,
        memo: &mut HashMap<*const UpdateNode, Arc<UpdateNode>>,
    ) -> ExprRef {
        match expr.as_ref() {
            Expr::Constant { .. } => expr.clone(),
            Expr::Read { updates, index } => {
                let root = if replacements.contains(&updates.root) {
                    self.shadow_of(&updates.root)
                        .unwrap_or_else(|| updates.root.clone())
                } else {
                    updates.root.clone()
                };
                let head = updates
                    .head
                    .as_ref()
                    .map(|n| self.rewrite_update(n, replacements, memo));
                let new_index = self.rewrite(index, replacements, memo);
                let unchanged = root == updates.root
                    && Arc::ptr_eq(&new_index, index)
                    && match (&head, &updates.head) {
                        (None, None) => true,
                        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                        _ => false,
                    };
                if unchanged {
                    expr.clone()
                } else {
                    Expr::read(UpdateList::new(root, head), new_index)
                }
            }
            Expr::Binary { left, right, .. } | Expr::Concat { left, right } => {
                let new_left = self.rewrite(left, replacements, memo);
                let new_right = self.rewrite(right, replacements, memo);
                if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
                    expr.clone()
                } else {
                    create_binary_of_same_kind(expr, new_left, new_right)
                }
            }
            Expr::Extract {
                expr: inner,
                offset,
                width,
            } => {
                let new_inner = self.rewrite(inner, replacements, memo);
                if Arc::ptr_eq(&new_inner, inner) {
                    expr.clone()
                } else {
                    Expr::extract(new_inner, *offset, *width)
                }
            }
            Expr::ZExt { expr: inner, width } => {
                let new_inner = self.rewrite(inner, replacements, memo);
                if Arc::ptr_eq(&new_inner, inner) {
                    expr.clone()
                } else {
                    Expr::zext(new_inner, *width)
                }
            }
            Expr::SExt { expr: inner, width } => {
                let new_inner = self.rewrite(inner, replacements, memo);
                if Arc::ptr_eq(&new_inner, inner) {
                    expr.clone()
                } else {
                    Expr::sext(new_inner, *width)
                }
            }
            Expr::Not { expr: inner } => {
                let new_inner = self.rewrite(inner, replacements, memo);
                if Arc::ptr_eq(&new_inner, inner) {
                    expr.clone()
                } else {
                    Expr::not(new_inner)
                }
            }
            Expr::Select { cond, left, right } => {
                let new_cond = self.rewrite(cond, replacements, memo);
                let new_left = self.rewrite(left, replacements, memo);
                let new_right = self.rewrite(right, replacements, memo);
                if Arc::ptr_eq(&new_cond, cond)
                    && Arc::ptr_eq(&new_left, left)
                    && Arc::ptr_eq(&new_right, right)
                {
                    expr.clone()
                } else {
                    Expr::select(new_cond, new_left, new_right)
                }
            }
        }
    }

    /// Rewrite an update chain bottom-up. The memo is keyed on node
    /// identity, not structure, so a chain shared by several reads is
    /// traversed once per rewrite and the rewritten chain is shared too.
    fn rewrite_update(
        &self,
        node: &Arc<UpdateNode>,
        replacements: &HashSet<UArc<Array>>,
        memo: &mut HashMap<*const UpdateNode, Arc<UpdateNode>>,
    ) -> Arc<UpdateNode> {
        let key = Arc::as_ptr(node);
        if let Some(done) = memo.get(&key) {
            return done.clone();
        }
        let next = node
            .next
            .as_ref()
            .map(|n| self.rewrite_update(n, replacements, memo));
        let index = self.rewrite(&node.index, replacements, memo);
        let value = self.rewrite(&node.value, replacements, memo);
        let unchanged = Arc::ptr_eq(&index, &node.index)
            && Arc::ptr_eq(&value, &node.value)
            && match (&next, &node.next) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            };
        let rewritten = if unchanged {
            node.clone()
        } else {
            UpdateNode::new(next, index, value)
        };
        memo.insert(key, rewritten.clone());
        rewritten
    }
}
