/*!
  Structural checks over a function container. The decoder runs them on what it produces and
  the encoder runs them before emitting anything; tooling can run them after an edit.

  Checked, in program order:

   * every referenced instruction is in the body, and values, array builders, loops, try
     regions and closures are only referenced from later instructions;
   * each produced value is consumed by at most one instruction, and required values by exactly
     one, through an operand of the kind the producer produces;
   * every variable is declared;
   * calls are begin, sends, do-call (possibly nested);
   * the handlers of each try region form a chain in program order whose last element links to
     a non-handler;
   * each finally block is entered at one instruction and ended by one `FastRet` after it, and
     exceptions are only discarded inside it;
   * a variable is not written while a value fetched from it waits on the stack;
   * `$this` is never written or unset, and lists are only destructured by reference from
     variables.
*/

use std::collections::HashMap;

use super::{FetchTarget, Function, Op, OpId, OpKind, Operand, Referent, ValueKind, VarId};
use crate::error::{InvariantViolation, Violation};

struct CallFrame {
  begin : OpId,
  sends : usize,
}

struct Validator<'f> {
  function       : &'f Function,
  positions      : HashMap<OpId, usize>,
  consumed       : HashMap<(OpId, ValueKind), OpId>,
  continued_by   : HashMap<OpId, OpId>,
  calls          : Vec<CallFrame>,
  tries          : Vec<OpId>,
  catches        : HashMap<OpId, Vec<OpId>>,
  /// Try region to where its finally block is entered, and to its `FastRet`.
  finally_starts : HashMap<OpId, OpId>,
  finally_ends   : HashMap<OpId, OpId>,
  discards       : Vec<(OpId, OpId)>,
  /// Variables with a fetched value not consumed yet, and the fetch.
  fetched        : Vec<(VarId, OpId)>,
}

/// Checks the function against the structural rules of the IR, reporting the first violation.
pub fn validate(function: &Function) -> Result<(), InvariantViolation> {
  let mut validator = Validator {
    function,
    positions      : function.positions(),
    consumed       : HashMap::new(),
    continued_by   : HashMap::new(),
    calls          : Vec::new(),
    tries          : Vec::new(),
    catches        : HashMap::new(),
    finally_starts : HashMap::new(),
    finally_ends   : HashMap::new(),
    discards       : Vec::new(),
    fetched        : Vec::new(),
  };

  for (position, (id, op)) in function.ops().enumerate() {
    validator
      .check_op(position, id, op)
      .map_err(|violation| InvariantViolation { op: id, line: op.line, violation })?;
  }
  validator.check_end()
}

impl<'f> Validator<'f> {
  fn at(&self, id: OpId, violation: Violation) -> InvariantViolation {
    let line = self.function.get(id).map_or(0, |op| op.line);
    InvariantViolation { op: id, line, violation }
  }

  /// Checks that `target` is in the body and, for back-references, strictly before `position`.
  fn check_target(&self, position: usize, target: OpId, backwards: bool) -> Result<(), Violation> {
    match self.positions.get(&target) {
      None => Err(Violation::DanglingReference { target }),
      Some(target_position) if backwards && *target_position >= position => {
        Err(Violation::ForwardReference { target })
      }
      Some(_) => Ok(()),
    }
  }

  fn check_op(&mut self, position: usize, id: OpId, op: &Op) -> Result<(), Violation> {
    let function = self.function;

    if let Some(previous) = op.continues {
      self.check_target(position, previous, true)?;
      if function[previous].kind.outputs().is_empty() || op.kind.outputs().is_empty() {
        return Err(Violation::NotAProducer { producer: previous });
      }
      if let Some(other) = self.continued_by.insert(previous, id) {
        return Err(Violation::ForkedContinuation { producer: previous, other });
      }
    }

    for var in op.kind.var_fields() {
      if !function.vars.contains(&var) {
        return Err(Violation::UnknownVariable(var));
      }
    }

    for operand in op.kind.operands() {
      match operand {
        Operand::Var(var) if !function.vars.contains(var) => {
          return Err(Violation::UnknownVariable(*var));
        }
        Operand::Ref(producer) => {
          self.check_target(position, *producer, true)?;
          if function[*producer].kind.outputs().is_empty() {
            return Err(Violation::NotAProducer { producer: *producer });
          }
        }
        _ => {}
      }
      if let Some((producer, kind)) = operand.consumed() {
        self.check_target(position, producer, true)?;
        let outputs = function[producer].kind.outputs();
        if !outputs.iter().any(|output| output.kind == kind) {
          return Err(match outputs.first() {
            None => Violation::NotAProducer { producer },
            Some(output) => Violation::OperandKindMismatch { producer, expected: output.kind, found: kind },
          });
        }
        if self.continued_by.contains_key(&producer) {
          return Err(Violation::WrongReferent { target: producer, expected: "the last writer of its value" });
        }
        if let Some(first) = self.consumed.insert((producer, kind), id) {
          return Err(Violation::MultipleConsumers { producer, first });
        }
      }
    }

    for (target, referent) in op.kind.references() {
      if !self.positions.contains_key(&target) {
        return Err(match referent {
          Referent::Jump | Referent::CatchNext => Violation::UnresolvedJump { target },
          _ => Violation::DanglingReference { target },
        });
      }
      self.check_target(position, target, referent.is_back_reference())?;
      let target_kind = &function[target].kind;
      let matches_referent = match referent {
        Referent::Jump | Referent::CatchNext => true,
        Referent::InitArray => matches!(target_kind, OpKind::InitArray { .. }),
        Referent::FeReset => matches!(target_kind, OpKind::FeReset { .. }),
        Referent::Try => matches!(target_kind, OpKind::Try),
        Referent::Lambda => matches!(target_kind, OpKind::DeclareLambda { .. }),
      };
      if !matches_referent {
        return Err(Violation::WrongReferent { target, expected: referent_name(referent) });
      }
    }

    self.check_this(&op.kind)?;
    self.check_list(&op.kind)?;
    self.check_call(id, &op.kind)?;
    self.check_fetched(id, &op.kind)?;

    match &op.kind {
      OpKind::Try => self.tries.push(id),
      OpKind::Catch { try_op, .. } => self.catches.entry(*try_op).or_default().push(id),
      OpKind::FastCall { try_op, target, .. } => {
        if *self.finally_starts.entry(*try_op).or_insert(*target) != *target {
          return Err(Violation::MalformedFinally("entered at two different instructions"));
        }
      }
      OpKind::FastRet { try_op, .. } => {
        if self.finally_ends.insert(*try_op, id).is_some() {
          return Err(Violation::MalformedFinally("ended twice"));
        }
      }
      OpKind::DiscardException { try_op } => self.discards.push((id, *try_op)),
      _ => {}
    }
    Ok(())
  }

  fn check_fetched(&mut self, id: OpId, kind: &OpKind) -> Result<(), Violation> {
    for operand in kind.operands() {
      if let Some((producer, ValueKind::Stack)) = operand.consumed() {
        self.fetched.retain(|(_, fetch)| *fetch != producer);
      }
    }
    for var in written_vars(kind) {
      if let Some((_, producer)) = self.fetched.iter().find(|(fetched, _)| *fetched == var) {
        return Err(Violation::ClobberedFetch { producer: *producer });
      }
    }
    if let OpKind::FetchRead { var: Operand::Var(var), target } = kind {
      if !matches!(target, FetchTarget::Name(_) | FetchTarget::StaticProperty(_)) {
        self.fetched.push((*var, id));
      }
    }
    if let OpKind::FetchList { var: Operand::Var(var), .. } = kind {
      self.fetched.push((*var, id));
    }
    Ok(())
  }

  fn check_this(&self, kind: &OpKind) -> Result<(), Violation> {
    let function = self.function;
    let is_this = |operand: &Operand| operand.as_var().map_or(false, |var| function.is_this(var));
    match kind {
      OpKind::Assign { var, target: FetchTarget::None, .. }
      | OpKind::Binary { lhs: var, assign: Some(FetchTarget::None), .. }
      | OpKind::IncDec { var, target: FetchTarget::None, .. }
      | OpKind::FetchWrite { var, target: FetchTarget::None }
        if is_this(var) =>
      {
        Err(Violation::ThisReassigned)
      }
      OpKind::Unset { var, target: FetchTarget::None } if is_this(var) => Err(Violation::ThisUnset),
      _ if kind.var_fields().into_iter().any(|var| function.is_this(var)) => Err(Violation::ThisReassigned),
      _ => Ok(()),
    }
  }

  fn check_list(&self, kind: &OpKind) -> Result<(), Violation> {
    if let OpKind::FetchList { var, by_ref: true, .. } = kind {
      let referencable = match var {
        Operand::Var(_) => true,
        Operand::Ref(producer) | Operand::Unnamed(producer) | Operand::Stack(producer) => {
          !matches!(
            self.function[*producer].kind.outputs().first().map(|output| output.kind),
            Some(ValueKind::Temporary) | None
          )
        }
        _ => false,
      };
      if !referencable {
        return Err(Violation::ListByReference);
      }
    }
    Ok(())
  }

  fn check_call(&mut self, id: OpId, kind: &OpKind) -> Result<(), Violation> {
    if kind.is_call_begin() {
      self.calls.push(CallFrame { begin: id, sends: 0 });
    } else if kind.is_send() {
      match self.calls.last_mut() {
        Some(frame) => frame.sends += 1,
        None => return Err(Violation::CallShape("argument sent outside of a call")),
      }
    } else if kind.is_call_end() {
      let frame = self
        .calls
        .pop()
        .ok_or(Violation::CallShape("call completed without being started"))?;
      if matches!(kind, OpKind::CallableConvert) && frame.sends > 0 {
        return Err(Violation::CallShape("callable conversion with arguments"));
      }
    }
    Ok(())
  }

  fn check_end(self) -> Result<(), InvariantViolation> {
    let function = self.function;

    if let Some(frame) = self.calls.first() {
      return Err(self.at(frame.begin, Violation::CallShape("call is never completed")));
    }

    for (id, op) in function.ops() {
      if self.continued_by.contains_key(&id) {
        continue;
      }
      for output in op.kind.outputs() {
        if output.required && !self.consumed.contains_key(&(id, output.kind)) {
          return Err(self.at(id, Violation::UnconsumedValue));
        }
      }
    }

    for try_op in &self.tries {
      let catches: &[OpId] = match (self.catches.get(try_op), self.finally_ends.contains_key(try_op)) {
        (Some(catches), _) => catches.as_slice(),
        (None, true) => &[],
        (None, false) => {
          return Err(self.at(*try_op, Violation::MalformedCatchChain("try region without a handler")));
        }
      };
      for (index, catch) in catches.iter().enumerate() {
        let next = match &function[*catch].kind {
          OpKind::Catch { next, .. } => *next,
          _ => continue,
        };
        match catches.get(index + 1) {
          Some(expected) if next != *expected => {
            return Err(self.at(*catch, Violation::MalformedCatchChain("handlers are not linked in program order")));
          }
          None if matches!(function[next].kind, OpKind::Catch { .. }) => {
            return Err(self.at(*catch, Violation::MalformedCatchChain("last handler links to another handler")));
          }
          None if self.positions[&next] <= self.positions[catch] => {
            return Err(self.at(*catch, Violation::MalformedCatchChain("last handler does not link forward")));
          }
          _ => {}
        }
      }

      let start = self.finally_starts.get(try_op);
      let end = self.finally_ends.get(try_op);
      match (start, end) {
        (Some(_), None) => return Err(self.at(*try_op, Violation::MalformedFinally("never ended"))),
        (None, Some(end)) => return Err(self.at(*end, Violation::MalformedFinally("never entered"))),
        (Some(start), Some(end)) if self.positions[start] > self.positions[end] => {
          return Err(self.at(*end, Violation::MalformedFinally("ends before it starts")));
        }
        _ => {}
      }
    }

    for (discard, try_op) in &self.discards {
      let inside = match (self.finally_starts.get(try_op), self.finally_ends.get(try_op)) {
        (Some(start), Some(end)) => (self.positions[start]..self.positions[end]).contains(&self.positions[discard]),
        _ => false,
      };
      if !inside {
        return Err(self.at(*discard, Violation::MalformedFinally("exception discarded outside the block")));
      }
    }
    Ok(())
  }
}

/// Variables an instruction writes, directly or through an element or property.
fn written_vars(kind: &OpKind) -> Vec<VarId> {
  let mut vars = kind.var_fields();
  let written = match kind {
    OpKind::Assign { var, target, .. }
    | OpKind::Binary { lhs: var, assign: Some(target), .. }
    | OpKind::IncDec { var, target, .. }
    | OpKind::Unset { var, target }
    | OpKind::FetchWrite { var, target } => match target {
      FetchTarget::Name(_) | FetchTarget::StaticProperty(_) => None,
      _ => var.as_var(),
    },
    OpKind::MakeRef { var } | OpKind::Separate { var } => var.as_var(),
    _ => None,
  };
  vars.extend(written);
  vars
}

fn referent_name(referent: Referent) -> &'static str {
  match referent {
    Referent::Jump => "a jump target",
    Referent::CatchNext => "the next handler of the chain",
    Referent::InitArray => "an array initialization",
    Referent::FeReset => "a foreach reset",
    Referent::Try => "a try region",
    Referent::Lambda => "a closure declaration",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{BinaryOp, Op};
  use crate::value::Value;

  fn long(l: i64) -> Operand {
    Operand::Const(Value::Long(l))
  }

  fn add(lhs: Operand, rhs: Operand) -> Op {
    Op::new(1, OpKind::Binary { op: BinaryOp::Add, lhs, rhs, assign: None })
  }

  fn ret(value: Operand) -> Op {
    Op::new(2, OpKind::Return { value })
  }

  #[test]
  fn test_accepts_straight_line() {
    let mut function = Function::new("f");
    let sum = function.push(add(long(1), long(2)));
    function.push(ret(Operand::Temporary(sum)));
    assert_eq!(validate(&function), Ok(()));
  }

  #[test]
  fn test_unconsumed_and_doubly_consumed() {
    let mut function = Function::new("f");
    function.push(add(long(1), long(2)));
    function.push(ret(long(0)));
    assert_eq!(validate(&function).unwrap_err().violation, Violation::UnconsumedValue);

    let mut function = Function::new("f");
    let sum2 = function.push(add(long(1), long(2)));
    function.push(Op::new(1, OpKind::Echo { value: Operand::Temporary(sum2) }));
    let second = function.push(ret(Operand::Temporary(sum2)));
    let error = validate(&function).unwrap_err();
    assert_eq!(error.op, second);
    assert_eq!(error.violation, Violation::MultipleConsumers { producer: sum2, first: OpId(1) });
  }

  #[test]
  fn test_kind_mismatch() {
    let mut function = Function::new("f");
    let sum = function.push(add(long(1), long(2)));
    function.push(ret(Operand::Stack(sum)));
    assert_eq!(
      validate(&function).unwrap_err().violation,
      Violation::OperandKindMismatch { producer: sum, expected: ValueKind::Temporary, found: ValueKind::Stack }
    );
  }

  #[test]
  fn test_array_builder_must_follow_init() {
    let mut function = Function::new("f");
    let add_element = function.push(Op::new(1, OpKind::AddArrayElement {
      array: OpId(1),
      value: long(2),
      key: None,
      by_ref: false,
    }));
    let init = function.push(Op::new(1, OpKind::InitArray { value: Some(long(1)), key: None, by_ref: false }));
    function.push(ret(Operand::Temporary(init)));
    let error = validate(&function).unwrap_err();
    assert_eq!(error.op, add_element);
    assert_eq!(error.violation, Violation::ForwardReference { target: init });
  }

  #[test]
  fn test_call_shape() {
    let mut function = Function::new("f");
    function.push(Op::new(1, OpKind::Send { value: long(1) }));
    assert_eq!(
      validate(&function).unwrap_err().violation,
      Violation::CallShape("argument sent outside of a call")
    );

    let mut function = Function::new("f");
    function.push(Op::new(1, OpKind::InitFcall { function: Operand::string("\\f") }));
    function.push(Op::new(1, OpKind::Send { value: long(1) }));
    assert_eq!(
      validate(&function).unwrap_err().violation,
      Violation::CallShape("call is never completed")
    );
  }

  #[test]
  fn test_this_is_read_only() {
    let mut function = Function::new("m");
    let this = function.this_var();
    function.push(Op::new(3, OpKind::Assign {
      var: Operand::Var(this),
      target: FetchTarget::None,
      value: long(1),
      by_ref: false,
    }));
    let error = validate(&function).unwrap_err();
    assert_eq!(error.line, 3);
    assert_eq!(error.violation, Violation::ThisReassigned);
    assert_eq!(error.to_string(), "@0 (line 3): Cannot reassign $this");
  }

  #[test]
  fn test_catch_chain() {
    let mut function = Function::new("f");
    let try_op = function.push(Op::new(1, OpKind::Try));
    function.push(Op::new(2, OpKind::Echo { value: long(1) }));
    let first = OpId(2);
    let second = OpId(3);
    let body = OpId(4);
    function.push(Op::new(3, OpKind::Catch { try_op, class: "A".into(), var: None, next: second }));
    function.push(Op::new(4, OpKind::Catch { try_op, class: "B".into(), var: None, next: body }));
    function.push(ret(long(0)));
    assert_eq!(function.body()[2], first);
    assert_eq!(validate(&function), Ok(()));

    function.replace(first, OpKind::Catch { try_op, class: "A".into(), var: None, next: body });
    assert_eq!(
      validate(&function).unwrap_err().violation,
      Violation::MalformedCatchChain("handlers are not linked in program order")
    );
  }

  #[test]
  fn test_finally_block_shape() {
    let mut function = Function::new("f");
    let try_op = function.push(Op::new(1, OpKind::Try));
    function.push(Op::new(2, OpKind::Echo { value: long(1) }));
    let (block, end, after) = (OpId(5), OpId(6), OpId(7));
    function.push(Op::new(2, OpKind::FastCall { try_op, target: block, returning: None }));
    let jump = function.push(Op::new(2, OpKind::Jmp { target: after }));
    let discard = function.push(Op::new(3, OpKind::DiscardException { try_op }));
    function.push(Op::new(3, OpKind::Echo { value: long(2) }));
    function.push(Op::new(3, OpKind::FastRet { try_op, outer: None }));
    function.push(ret(long(0)));
    assert_eq!(function.body()[5..], [block, end, after]);
    // The discard comes before the block starts.
    let error = validate(&function).unwrap_err();
    assert_eq!(error.op, discard);
    assert_eq!(error.violation, Violation::MalformedFinally("exception discarded outside the block"));

    function.remove(discard).unwrap();
    assert_eq!(validate(&function), Ok(()));

    let inside = function.insert_before(end, Op::new(3, OpKind::DiscardException { try_op })).unwrap();
    assert_eq!(validate(&function), Ok(()));
    function.remove(inside).unwrap();

    let second = function.insert_before(jump, Op::new(2, OpKind::FastCall { try_op, target: end, returning: None }));
    let error = validate(&function).unwrap_err();
    assert_eq!(Some(error.op), second);
    assert_eq!(error.violation, Violation::MalformedFinally("entered at two different instructions"));
  }

  #[test]
  fn test_finally_alone_is_a_handler() {
    let mut function = Function::new("f");
    let try_op = function.push(Op::new(1, OpKind::Try));
    let block = OpId(3);
    function.push(Op::new(1, OpKind::FastCall { try_op, target: block, returning: None }));
    function.push(Op::new(1, OpKind::Jmp { target: OpId(5) }));
    function.push(Op::new(2, OpKind::Echo { value: long(1) }));
    function.push(Op::new(2, OpKind::FastRet { try_op, outer: None }));
    function.push(ret(long(0)));
    assert_eq!(validate(&function), Ok(()));

    let mut bare = Function::new("f");
    bare.push(Op::new(1, OpKind::Try));
    bare.push(ret(long(0)));
    assert_eq!(
      validate(&bare).unwrap_err().violation,
      Violation::MalformedCatchChain("try region without a handler")
    );
  }

  #[test]
  fn test_variable_written_under_a_fetched_value() {
    let mut function = Function::new("f");
    let a = function.vars.intern("a");
    let fetch = function.push(Op::new(1, OpKind::FetchRead {
      var: Operand::Var(a),
      target: FetchTarget::Dim(long(0)),
    }));
    let unset = function.push(Op::new(1, OpKind::Unset { var: Operand::Var(a), target: FetchTarget::None }));
    function.push(Op::new(1, OpKind::Echo { value: Operand::Stack(fetch) }));
    function.push(ret(long(0)));
    let error = validate(&function).unwrap_err();
    assert_eq!(error.op, unset);
    assert_eq!(error.violation, Violation::ClobberedFetch { producer: fetch });

    // Consuming the value in the writing instruction itself is fine.
    let mut function = Function::new("f");
    let a = function.vars.intern("a");
    let fetch = function.push(Op::new(1, OpKind::FetchRead {
      var: Operand::Var(a),
      target: FetchTarget::Dim(long(0)),
    }));
    function.push(Op::new(1, OpKind::Assign {
      var: Operand::Var(a),
      target: FetchTarget::None,
      value: Operand::Stack(fetch),
      by_ref: false,
    }));
    function.push(ret(long(0)));
    assert_eq!(validate(&function), Ok(()));
  }
}
