//! Operands of IR instructions, and the fetch targets of read/write/unset/isset instructions.

use std::fmt::{Display, Formatter};

use strum_macros::Display as StrumDisplay;

use crate::value::Value;

/// The identity of an instruction within its function. Identities are stable across edits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpId(pub u32);

impl OpId {
  pub fn index(&self) -> usize {
    self.0 as usize
  }
}

impl Display for OpId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "@{}", self.0)
  }
}

/// A named variable slot of a function. See `VarTable`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarId(pub u32);

impl Display for VarId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "var{}", self.0)
  }
}

/// The three ways an unnamed intermediate value can flow from its producer to its consumer.
#[derive(StrumDisplay, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
  /// A value read from a variable location, handed to the next instruction that needs it.
  Stack,
  /// A short-lived computed value.
  Temporary,
  /// A value that may be a reference or a location: prepared write targets, call results and
  /// objects under construction.
  Unnamed,
}

impl ValueKind {
  /// The operand that consumes the value of kind `self` produced by `producer`.
  pub fn operand(&self, producer: OpId) -> Operand {
    match self {
      ValueKind::Stack => Operand::Stack(producer),
      ValueKind::Temporary => Operand::Temporary(producer),
      ValueKind::Unnamed => Operand::Unnamed(producer),
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
  Const(Value),
  Var(VarId),
  /// Consumes the `Unnamed` value of the given instruction.
  Unnamed(OpId),
  /// Consumes the `Stack` value of the given instruction.
  Stack(OpId),
  /// Consumes the `Temporary` value of the given instruction.
  Temporary(OpId),
  /// An ignored position with its auxiliary number.
  Unused(u32),
  /// Observes the value of the given instruction without consuming it.
  Ref(OpId),
}

impl Operand {
  pub fn string(text: &str) -> Operand {
    Operand::Const(Value::string(text))
  }

  /// The producer and kind of a consumed value.
  pub fn consumed(&self) -> Option<(OpId, ValueKind)> {
    match self {
      Operand::Stack(id) => Some((*id, ValueKind::Stack)),
      Operand::Temporary(id) => Some((*id, ValueKind::Temporary)),
      Operand::Unnamed(id) => Some((*id, ValueKind::Unnamed)),
      _ => None,
    }
  }

  /// The instruction whose value this operand consumes or observes.
  pub fn producer(&self) -> Option<OpId> {
    match self {
      Operand::Ref(id) => Some(*id),
      _ => self.consumed().map(|(id, _)| id),
    }
  }

  pub fn as_const(&self) -> Option<&Value> {
    match self {
      Operand::Const(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    self.as_const().and_then(Value::as_str)
  }

  pub fn as_var(&self) -> Option<VarId> {
    match self {
      Operand::Var(var) => Some(*var),
      _ => None,
    }
  }

  pub fn is_unused(&self) -> bool {
    matches!(self, Operand::Unused(_))
  }
}

impl Display for Operand {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Operand::Const(value) => write!(f, "{}", value),
      Operand::Var(var) => write!(f, "{}", var),
      Operand::Unnamed(id) => write!(f, "unnamed{}", id),
      Operand::Stack(id) => write!(f, "stack{}", id),
      Operand::Temporary(id) => write!(f, "tmp{}", id),
      Operand::Unused(0) => write!(f, "_"),
      Operand::Unused(n) => write!(f, "#{}", n),
      Operand::Ref(id) => write!(f, "&{}", id),
    }
  }
}

/**
  What a read, write, unset or isset instruction addresses, relative to its `var` operand.
  For static properties `var` is the class and the target carries the property name.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum FetchTarget {
  /// The variable itself.
  None,
  /// The variable named by the operand (`$$name`). `var` is `Unused` for the local scope and the
  /// `GLOBALS` pseudo-variable for the global one.
  Name(Operand),
  /// An array element. `Operand::Unused` is the append position `$a[]`.
  Dim(Operand),
  Property(Operand),
  StaticProperty(Operand),
}

impl FetchTarget {
  pub fn operand(&self) -> Option<&Operand> {
    match self {
      FetchTarget::None => None,
      FetchTarget::Name(operand)
      | FetchTarget::Dim(operand)
      | FetchTarget::Property(operand)
      | FetchTarget::StaticProperty(operand) => Some(operand),
    }
  }

  pub fn operand_mut(&mut self) -> Option<&mut Operand> {
    match self {
      FetchTarget::None => None,
      FetchTarget::Name(operand)
      | FetchTarget::Dim(operand)
      | FetchTarget::Property(operand)
      | FetchTarget::StaticProperty(operand) => Some(operand),
    }
  }

  pub fn is_none(&self) -> bool {
    matches!(self, FetchTarget::None)
  }
}

impl Display for FetchTarget {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      FetchTarget::None => Ok(()),
      FetchTarget::Name(operand) => write!(f, "${{{}}}", operand),
      FetchTarget::Dim(operand) => write!(f, "[{}]", operand),
      FetchTarget::Property(operand) => write!(f, "->{}", operand),
      FetchTarget::StaticProperty(operand) => write!(f, "::${}", operand),
    }
  }
}
