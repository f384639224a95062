//! The function container: metadata, parameters, and the instruction arena with its body order.

use std::collections::HashMap;
use std::ops::Index;

use string_cache::DefaultAtom;

use super::{ConstExpr, DebugMarker, Op, OpId, OpKind, VarId};
use crate::symboltable::{VarTable, GLOBALS, THIS};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct FunctionFlags {
  pub generator   : bool,
  pub returns_ref : bool,
  pub is_static   : bool,
  pub uses_this   : bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
  pub var      : VarId,
  pub default  : Option<ConstExpr>,
  pub by_ref   : bool,
  pub variadic : bool,
  pub line     : u32,
}

/**
  One function or method in canonical form. Instructions live in an arena and are addressed by
  `OpId`; `body` is the program order. Removing an instruction takes it out of the body but
  keeps its id reserved, so ids held by tooling never change meaning.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
  pub name             : DefaultAtom,
  pub scope            : Option<DefaultAtom>,
  pub flags            : FunctionFlags,
  pub vars             : VarTable,
  pub params           : Vec<Param>,
  /// Names of the closures and conditional functions this body declares.
  pub closures         : Vec<DefaultAtom>,
  /// Debug markers after the last instruction.
  pub trailing_markers : Vec<DebugMarker>,
  ops                  : Vec<Op>,
  body                 : Vec<OpId>,
}

impl Function {
  pub fn new(name: &str) -> Function {
    Function {
      name             : DefaultAtom::from(name),
      scope            : None,
      flags            : FunctionFlags::default(),
      vars             : VarTable::new(),
      params           : Vec::new(),
      closures         : Vec::new(),
      trailing_markers : Vec::new(),
      ops              : Vec::new(),
      body             : Vec::new(),
    }
  }

  pub fn qualified_name(&self) -> String {
    match &self.scope {
      Some(scope) => format!("{}::{}", scope, self.name),
      None => self.name.to_string(),
    }
  }

  // region Instructions

  pub fn body(&self) -> &[OpId] {
    &self.body
  }

  pub fn len(&self) -> usize {
    self.body.len()
  }

  pub fn is_empty(&self) -> bool {
    self.body.is_empty()
  }

  /// The instruction with the given id, even if it has been removed from the body.
  pub fn get(&self, id: OpId) -> Option<&Op> {
    self.ops.get(id.index())
  }

  pub fn get_mut(&mut self, id: OpId) -> Option<&mut Op> {
    self.ops.get_mut(id.index())
  }

  /// The instructions in program order.
  pub fn ops(&self) -> impl Iterator<Item = (OpId, &Op)> + '_ {
    self.body.iter().map(move |id| (*id, &self.ops[id.index()]))
  }

  pub fn position(&self, id: OpId) -> Option<usize> {
    self.body.iter().position(|candidate| *candidate == id)
  }

  pub fn positions(&self) -> HashMap<OpId, usize> {
    self.body.iter().enumerate().map(|(position, id)| (*id, position)).collect()
  }

  fn allocate(&mut self, op: Op) -> OpId {
    let id = OpId(self.ops.len() as u32);
    self.ops.push(op);
    id
  }

  /// Appends an instruction to the body.
  pub fn push(&mut self, op: Op) -> OpId {
    let id = self.allocate(op);
    self.body.push(id);
    id
  }

  /// Inserts an instruction at `position` in program order.
  pub fn insert(&mut self, position: usize, op: Op) -> OpId {
    let id = self.allocate(op);
    self.body.insert(position.min(self.body.len()), id);
    id
  }

  pub fn insert_before(&mut self, anchor: OpId, op: Op) -> Option<OpId> {
    let position = self.position(anchor)?;
    Some(self.insert(position, op))
  }

  pub fn insert_after(&mut self, anchor: OpId, op: Op) -> Option<OpId> {
    let position = self.position(anchor)?;
    Some(self.insert(position + 1, op))
  }

  /// Swaps the kind of an instruction, keeping its identity, line and markers.
  pub fn replace(&mut self, id: OpId, kind: OpKind) -> Option<OpKind> {
    let op = self.ops.get_mut(id.index())?;
    Some(std::mem::replace(&mut op.kind, kind))
  }

  /**
    Takes an instruction out of the body. Jumps and catch links that targeted it move to the
    instruction that followed it. Values it produced or consumed are left as they are; removing
    a producer without its consumer leaves a dangling operand that validation reports.
  */
  pub fn remove(&mut self, id: OpId) -> Option<Op> {
    let position = self.position(id)?;
    self.body.remove(position);
    let successor = self.body.get(position).copied();

    if let Some(successor) = successor {
      for body_id in self.body.clone() {
        self.ops[body_id.index()].kind.visit_references_mut(&mut |target, referent| {
          if *target == id && !referent.is_back_reference() {
            *target = successor;
          }
        });
      }
    }
    self.ops.get(id.index()).cloned()
  }

  // endregion

  // region Variables

  pub fn var_name(&self, var: VarId) -> Option<&str> {
    self.vars.get_name(&var).map(|name| name.as_ref())
  }

  pub fn this_var(&mut self) -> VarId {
    self.vars.intern(THIS)
  }

  pub fn globals_var(&mut self) -> VarId {
    self.vars.intern(GLOBALS)
  }

  pub fn is_this(&self, var: VarId) -> bool {
    self.var_name(var) == Some(THIS)
  }

  pub fn is_globals(&self, var: VarId) -> bool {
    self.var_name(var) == Some(GLOBALS)
  }

  // endregion
}

impl Index<OpId> for Function {
  type Output = Op;

  fn index(&self, id: OpId) -> &Op {
    &self.ops[id.index()]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{JumpCondition, Operand};
  use crate::value::Value;

  fn echo(text: &str) -> Op {
    Op::new(1, OpKind::Echo { value: Operand::Const(Value::string(text)) })
  }

  #[test]
  fn test_insert_keeps_ids() {
    let mut function = Function::new("f");
    let a = function.push(echo("a"));
    let c = function.push(echo("c"));
    let b = function.insert_before(c, echo("b")).unwrap();
    assert_eq!(function.body(), &[a, b, c]);
    assert_eq!(function.position(c), Some(2));
    assert_eq!(function[b].kind, echo("b").kind);
  }

  #[test]
  fn test_remove_retargets_jumps() {
    let mut function = Function::new("f");
    let jump = function.push(Op::new(1, OpKind::CondJmp {
      condition: JumpCondition::Zero,
      value: Operand::Const(Value::Bool(true)),
      target: OpId(2),
    }));
    function.push(echo("skipped"));
    let target = function.push(echo("target"));
    let after = function.push(echo("after"));
    assert_eq!(target, OpId(2));

    let removed = function.remove(target).unwrap();
    assert_eq!(removed.kind, echo("target").kind);
    assert_eq!(function.len(), 3);
    assert_eq!(function[jump].kind.references()[0].0, after);
  }

  #[test]
  fn test_pseudo_variables() {
    let mut function = Function::new("m");
    let this = function.this_var();
    let globals = function.globals_var();
    assert!(function.is_this(this));
    assert!(!function.is_this(globals));
    assert!(function.is_globals(globals));
  }
}
