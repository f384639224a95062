//! An op operand: which store it addresses and the index into that store. `Unused` operands carry
//! a bare number instead (a jump target, an argument number, a class fetch type, or nothing).

use std::fmt::{Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};

// `SlotNumberType` is `u32`, the width of an operand in the binary form.
pub type SlotNumberType = u32;

/// Operand type tags as stored in the binary form.
#[derive(TryFromPrimitive, IntoPrimitive, Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u8)]
pub enum OperandType {
  Unused = 0,
  Const = 1,
  TmpVar = 2,
  Var = 4,
  Cv = 8,
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum RawOperand {
  Unused(SlotNumberType),
  /// An index into the literal pool.
  Const(SlotNumberType),
  /// A temporary slot.
  Tmp(SlotNumberType),
  /// A variable slot. Shares numbering with `Tmp`.
  Var(SlotNumberType),
  /// A compiled variable, i.e. an index into the function's named locals.
  Cv(SlotNumberType),
}

impl Default for RawOperand {
  fn default() -> Self {
    RawOperand::Unused(0)
  }
}

impl RawOperand {
  pub fn operand_type(&self) -> OperandType {
    match self {
      RawOperand::Unused(_) => OperandType::Unused,
      RawOperand::Const(_) => OperandType::Const,
      RawOperand::Tmp(_) => OperandType::TmpVar,
      RawOperand::Var(_) => OperandType::Var,
      RawOperand::Cv(_) => OperandType::Cv,
    }
  }

  pub fn num(&self) -> SlotNumberType {
    match self {
      RawOperand::Unused(n)
      | RawOperand::Const(n)
      | RawOperand::Tmp(n)
      | RawOperand::Var(n)
      | RawOperand::Cv(n) => *n,
    }
  }

  pub fn from_parts(operand_type: OperandType, num: SlotNumberType) -> RawOperand {
    match operand_type {
      OperandType::Unused => RawOperand::Unused(num),
      OperandType::Const => RawOperand::Const(num),
      OperandType::TmpVar => RawOperand::Tmp(num),
      OperandType::Var => RawOperand::Var(num),
      OperandType::Cv => RawOperand::Cv(num),
    }
  }

  pub fn is_unused(&self) -> bool {
    matches!(self, RawOperand::Unused(_))
  }

  /// The temporary slot number for `Tmp` and `Var` operands.
  pub fn slot(&self) -> Option<SlotNumberType> {
    match self {
      RawOperand::Tmp(n) | RawOperand::Var(n) => Some(*n),
      _ => None,
    }
  }
}

/// The assembly spelling. Literals print as their pool index here; the assembly printer
/// substitutes the value itself.
impl Display for RawOperand {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      RawOperand::Unused(0) => write!(f, "_"),
      RawOperand::Unused(n) => write!(f, "#{}", n),
      RawOperand::Const(n) => write!(f, "L{}", n),
      RawOperand::Tmp(n) => write!(f, "T{}", n),
      RawOperand::Var(n) => write!(f, "V{}", n),
      RawOperand::Cv(n) => write!(f, "CV{}", n),
    }
  }
}
