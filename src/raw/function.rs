//! The op array of one function or method, as the virtual machine stores it.

use std::fmt::{Display, Formatter};

use string_cache::DefaultAtom;

use super::{RawOpcode, RawOperand, ACC_GENERATOR, ACC_RETURN_REFERENCE, ACC_STATIC, ACC_USES_THIS};
use crate::value::Value;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RawOp {
  pub opcode         : RawOpcode,
  pub op1            : RawOperand,
  pub op2            : RawOperand,
  pub result         : RawOperand,
  pub extended_value : u32,
  pub lineno         : u32,
}

impl RawOp {
  pub fn new(opcode: RawOpcode, lineno: u32) -> RawOp {
    RawOp {
      opcode,
      op1            : RawOperand::default(),
      op2            : RawOperand::default(),
      result         : RawOperand::default(),
      extended_value : 0,
      lineno,
    }
  }

  pub fn with_op1(mut self, op1: RawOperand) -> RawOp {
    self.op1 = op1;
    self
  }

  pub fn with_op2(mut self, op2: RawOperand) -> RawOp {
    self.op2 = op2;
    self
  }

  pub fn with_result(mut self, result: RawOperand) -> RawOp {
    self.result = result;
    self
  }

  pub fn with_extended_value(mut self, extended_value: u32) -> RawOp {
    self.extended_value = extended_value;
    self
  }
}

/// Declared information about a parameter.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ArgInfo {
  pub name     : DefaultAtom,
  pub by_ref   : bool,
  pub variadic : bool,
}

/**
  One row of the try/catch table. `try_op` is the first op of the protected region and `catch_op`
  the first `CATCH` of its handler chain. A nonzero `finally_op` marks a finally block, which this
  VM model only carries through so that the decoder can refuse it.
*/
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct TryCatchElement {
  pub try_op      : u32,
  pub catch_op    : u32,
  pub finally_op  : u32,
  pub finally_end : u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawFunction {
  pub name              : DefaultAtom,
  /// The class declaring this method, if it is one.
  pub scope             : Option<DefaultAtom>,
  pub flags             : u32,
  pub opcodes           : Vec<RawOp>,
  pub literals          : Vec<Value>,
  /// Names of the compiled variables, without the `$`.
  pub vars              : Vec<DefaultAtom>,
  pub num_temps         : u32,
  pub arg_info          : Vec<ArgInfo>,
  pub required_num_args : u32,
  pub try_catch         : Vec<TryCatchElement>,
  /// Names of the closures declared in this body; `DECLARE_LAMBDA_FUNCTION` indexes this list.
  pub closures          : Vec<DefaultAtom>,
}

impl RawFunction {
  pub fn new(name: &str) -> RawFunction {
    RawFunction {
      name: DefaultAtom::from(name),
      ..RawFunction::default()
    }
  }

  pub fn has_flag(&self, flag: u32) -> bool {
    self.flags & flag != 0
  }

  pub fn is_generator(&self) -> bool {
    self.has_flag(ACC_GENERATOR)
  }

  pub fn returns_reference(&self) -> bool {
    self.has_flag(ACC_RETURN_REFERENCE)
  }

  pub fn is_static(&self) -> bool {
    self.has_flag(ACC_STATIC)
  }

  pub fn uses_this(&self) -> bool {
    self.has_flag(ACC_USES_THIS)
  }

  pub fn literal(&self, index: u32) -> Option<&Value> {
    self.literals.get(index as usize)
  }

  /// Adds `value` to the literal pool, reusing an equal entry.
  pub fn add_literal(&mut self, value: Value) -> u32 {
    match self.literals.iter().position(|literal| *literal == value) {
      Some(index) => index as u32,
      None => {
        self.literals.push(value);
        (self.literals.len() - 1) as u32
      }
    }
  }

  /// `scope::name` for methods, `name` otherwise.
  pub fn qualified_name(&self) -> String {
    match &self.scope {
      Some(scope) => format!("{}::{}", scope, self.name),
      None => self.name.to_string(),
    }
  }
}

impl Display for RawFunction {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", super::print_assembly(self))
  }
}
