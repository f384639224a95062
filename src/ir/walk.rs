//! Generic traversal of every operand node of a function, in program order.

use std::borrow::Cow;
use std::collections::VecDeque;

use super::{Function, OpId, Operand};

/**
  Iterates over `(op, slot, operand)` for every operand node of every instruction in the body.
  `slot` is the node's position as `operand1/2/3` would number it, starting at zero. Nodes are
  queued one instruction at a time.
*/
pub struct Operands<'f> {
  function : &'f Function,
  body     : std::slice::Iter<'f, OpId>,
  pending  : VecDeque<(OpId, usize, Cow<'f, Operand>)>,
}

impl<'f> Operands<'f> {
  pub fn new(function: &'f Function) -> Operands<'f> {
    Operands {
      function,
      body    : function.body().iter(),
      pending : VecDeque::new(),
    }
  }
}

impl<'f> Iterator for Operands<'f> {
  type Item = (OpId, usize, Cow<'f, Operand>);

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if let Some(item) = self.pending.pop_front() {
        return Some(item);
      }
      let id = *self.body.next()?;
      let function: &'f Function = self.function;
      self.pending.extend(
        function[id].kind.operand_nodes().into_iter().enumerate().map(|(slot, node)| (id, slot, node)),
      );
    }
  }
}

impl Function {
  pub fn operands(&self) -> Operands<'_> {
    Operands::new(self)
  }

  /// The instructions that consume or observe the value of `producer`.
  pub fn users(&self, producer: OpId) -> Vec<OpId> {
    let mut users: Vec<OpId> = self
      .operands()
      .filter(|(_, _, operand)| operand.producer() == Some(producer))
      .map(|(id, _, _)| id)
      .collect();
    users.dedup();
    users
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{BinaryOp, Op, OpKind, VarId};
  use crate::value::Value;

  #[test]
  fn test_walks_all_nodes_in_order() {
    let mut function = Function::new("f");
    let x = function.vars.intern("x");
    let sum = function.push(Op::new(1, OpKind::Binary {
      op: BinaryOp::Add,
      lhs: Operand::Var(x),
      rhs: Operand::Const(Value::Long(1)),
      assign: None,
    }));
    let ret = function.push(Op::new(2, OpKind::Return { value: Operand::Temporary(sum) }));

    let nodes: Vec<(OpId, usize, Operand)> =
      function.operands().map(|(id, slot, node)| (id, slot, node.into_owned())).collect();
    assert_eq!(nodes, vec![
      (sum, 0, Operand::Var(VarId(0))),
      (sum, 1, Operand::Const(Value::Long(1))),
      (ret, 0, Operand::Temporary(sum)),
    ]);
    assert_eq!(function.users(sum), vec![ret]);
  }
}
