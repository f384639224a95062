/*!
  The two-way tables between canonical instruction kinds and the opcode variants they stand for.
  The decoder reads them left to right and the encoder right to left; the context-sensitive part
  (which fetch mode a consumer needs, which send variant a callee needs) lives with the encoder.

  Accesses are the biggest family. An opcode for reading, writing, unsetting, testing or
  incrementing a location is determined by what is done (`Family`) and what kind of location it
  is done to (`Access`):

  ```text
                  Plain        Name             Dim               Property          StaticProperty
  Fetch(R)        -            FETCH_R          FETCH_DIM_R       FETCH_OBJ_R       FETCH_STATIC_PROP_R
  Assign          ASSIGN       -                ASSIGN_DIM        ASSIGN_OBJ        ASSIGN_STATIC_PROP
  Unset           UNSET_CV     UNSET_VAR        UNSET_DIM         UNSET_OBJ         UNSET_STATIC_PROP
  ...
  ```
*/

use bimap::BiMap;
use strum_macros::{Display as StrumDisplay, IntoStaticStr};

use crate::ir::{BinaryOp, CastType, DebugMarker, FetchTarget, IncDecOp, IncludeMode, JumpCondition, Operand};
use crate::raw::{
  RawOpcode, EVAL, INCLUDE, INCLUDE_ONCE, IS_ARRAY, IS_BOOL, IS_DOUBLE, IS_LONG, IS_OBJECT,
  IS_RESOURCE, IS_STRING, REQUIRE, REQUIRE_ONCE,
};

/// How a fetch uses the location it prepares.
#[derive(StrumDisplay, IntoStaticStr, Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FetchMode {
  R,
  W,
  Rw,
  Is,
  FuncArg,
  Unset,
}

impl FetchMode {
  /// Read and isset fetches never create or separate the location.
  pub fn is_read(&self) -> bool {
    matches!(self, FetchMode::R | FetchMode::Is)
  }
}

/// The kind of location an access opcode addresses. Mirrors `FetchTarget`.
#[derive(StrumDisplay, IntoStaticStr, Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Access {
  Plain,
  Name,
  Dim,
  Property,
  StaticProperty,
}

impl Access {
  pub fn of(target: &FetchTarget) -> Access {
    match target {
      FetchTarget::None => Access::Plain,
      FetchTarget::Name(_) => Access::Name,
      FetchTarget::Dim(_) => Access::Dim,
      FetchTarget::Property(_) => Access::Property,
      FetchTarget::StaticProperty(_) => Access::StaticProperty,
    }
  }

  /// The fetch target of this access kind addressing `operand`.
  pub fn target(&self, operand: Operand) -> FetchTarget {
    match self {
      Access::Plain => FetchTarget::None,
      Access::Name => FetchTarget::Name(operand),
      Access::Dim => FetchTarget::Dim(operand),
      Access::Property => FetchTarget::Property(operand),
      Access::StaticProperty => FetchTarget::StaticProperty(operand),
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Family {
  Fetch(FetchMode),
  Assign,
  AssignRef,
  AssignOp,
  IncDec(IncDecOp),
  Unset,
  Isset,
}

lazy_static! {
  static ref ACCESS_OPCODES: BiMap<(Family, Access), RawOpcode> = {
    use RawOpcode::*;
    use Access::{Dim, Name, Plain, Property, StaticProperty};

    let mut table = BiMap::new();
    let mut row = |family: Family, opcodes: [Option<RawOpcode>; 5]| {
      for (access, opcode) in [Plain, Name, Dim, Property, StaticProperty].into_iter().zip(opcodes) {
        if let Some(opcode) = opcode {
          table.insert((family, access), opcode);
        }
      }
    };

    row(Family::Fetch(FetchMode::R),       [None, Some(FetchR),       Some(FetchDimR),       Some(FetchObjR),       Some(FetchStaticPropR)]);
    row(Family::Fetch(FetchMode::W),       [None, Some(FetchW),       Some(FetchDimW),       Some(FetchObjW),       Some(FetchStaticPropW)]);
    row(Family::Fetch(FetchMode::Rw),      [None, Some(FetchRw),      Some(FetchDimRw),      Some(FetchObjRw),      Some(FetchStaticPropRw)]);
    row(Family::Fetch(FetchMode::Is),      [None, Some(FetchIs),      Some(FetchDimIs),      Some(FetchObjIs),      Some(FetchStaticPropIs)]);
    row(Family::Fetch(FetchMode::FuncArg), [None, Some(FetchFuncArg), Some(FetchDimFuncArg), Some(FetchObjFuncArg), Some(FetchStaticPropFuncArg)]);
    row(Family::Fetch(FetchMode::Unset),   [None, Some(FetchUnset),   Some(FetchDimUnset),   Some(FetchObjUnset),   Some(FetchStaticPropUnset)]);

    row(Family::Assign,    [Some(Assign),    None, Some(AssignDim),   Some(AssignObj),    Some(AssignStaticProp)]);
    row(Family::AssignRef, [Some(AssignRef), None, None,              Some(AssignObjRef), Some(AssignStaticPropRef)]);
    row(Family::AssignOp,  [Some(AssignOp),  None, Some(AssignDimOp), Some(AssignObjOp),  Some(AssignStaticPropOp)]);

    row(Family::IncDec(IncDecOp::PreInc),  [Some(PreInc),  None, None, Some(PreIncObj),  Some(PreIncStaticProp)]);
    row(Family::IncDec(IncDecOp::PreDec),  [Some(PreDec),  None, None, Some(PreDecObj),  Some(PreDecStaticProp)]);
    row(Family::IncDec(IncDecOp::PostInc), [Some(PostInc), None, None, Some(PostIncObj), Some(PostIncStaticProp)]);
    row(Family::IncDec(IncDecOp::PostDec), [Some(PostDec), None, None, Some(PostDecObj), Some(PostDecStaticProp)]);

    row(Family::Unset, [Some(UnsetCv),        Some(UnsetVar),        Some(UnsetDim),           Some(UnsetObj),            Some(UnsetStaticProp)]);
    row(Family::Isset, [Some(IssetIsemptyCv), Some(IssetIsemptyVar), Some(IssetIsemptyDimObj), Some(IssetIsemptyPropObj), Some(IssetIsemptyStaticProp)]);

    table
  };

  static ref BINARY_OPCODES: BiMap<BinaryOp, RawOpcode> = {
    let mut table = BiMap::new();
    table.insert(BinaryOp::Add,              RawOpcode::Add);
    table.insert(BinaryOp::Sub,              RawOpcode::Sub);
    table.insert(BinaryOp::Mul,              RawOpcode::Mul);
    table.insert(BinaryOp::Div,              RawOpcode::Div);
    table.insert(BinaryOp::Mod,              RawOpcode::Mod);
    table.insert(BinaryOp::Sl,               RawOpcode::Sl);
    table.insert(BinaryOp::Sr,               RawOpcode::Sr);
    table.insert(BinaryOp::Concat,           RawOpcode::Concat);
    table.insert(BinaryOp::BwOr,             RawOpcode::BwOr);
    table.insert(BinaryOp::BwAnd,            RawOpcode::BwAnd);
    table.insert(BinaryOp::BwXor,            RawOpcode::BwXor);
    table.insert(BinaryOp::Pow,              RawOpcode::Pow);
    table.insert(BinaryOp::BoolXor,          RawOpcode::BoolXor);
    table.insert(BinaryOp::IsIdentical,      RawOpcode::IsIdentical);
    table.insert(BinaryOp::IsNotIdentical,   RawOpcode::IsNotIdentical);
    table.insert(BinaryOp::IsEqual,          RawOpcode::IsEqual);
    table.insert(BinaryOp::IsNotEqual,       RawOpcode::IsNotEqual);
    table.insert(BinaryOp::IsSmaller,        RawOpcode::IsSmaller);
    table.insert(BinaryOp::IsSmallerOrEqual, RawOpcode::IsSmallerOrEqual);
    table.insert(BinaryOp::Spaceship,        RawOpcode::Spaceship);
    table
  };

  static ref JUMP_OPCODES: BiMap<JumpCondition, RawOpcode> = {
    let mut table = BiMap::new();
    table.insert(JumpCondition::Zero,      RawOpcode::Jmpz);
    table.insert(JumpCondition::NotZero,   RawOpcode::Jmpnz);
    table.insert(JumpCondition::ZeroEx,    RawOpcode::JmpzEx);
    table.insert(JumpCondition::NotZeroEx, RawOpcode::JmpnzEx);
    table.insert(JumpCondition::Set,       RawOpcode::JmpSet);
    table.insert(JumpCondition::Coalesce,  RawOpcode::Coalesce);
    table.insert(JumpCondition::Null,      RawOpcode::JmpNull);
    table
  };

  static ref CAST_TYPES: BiMap<CastType, u32> = {
    let mut table = BiMap::new();
    table.insert(CastType::Bool,   IS_BOOL);
    table.insert(CastType::Long,   IS_LONG);
    table.insert(CastType::Double, IS_DOUBLE);
    table.insert(CastType::String, IS_STRING);
    table.insert(CastType::Array,  IS_ARRAY);
    table.insert(CastType::Object, IS_OBJECT);
    table
  };

  static ref INCLUDE_MODES: BiMap<IncludeMode, u32> = {
    let mut table = BiMap::new();
    table.insert(IncludeMode::Eval,        EVAL);
    table.insert(IncludeMode::Include,     INCLUDE);
    table.insert(IncludeMode::IncludeOnce, INCLUDE_ONCE);
    table.insert(IncludeMode::Require,     REQUIRE);
    table.insert(IncludeMode::RequireOnce, REQUIRE_ONCE);
    table
  };

  static ref MARKER_OPCODES: BiMap<DebugMarker, RawOpcode> = {
    let mut table = BiMap::new();
    table.insert(DebugMarker::Statement, RawOpcode::ExtStmt);
    table.insert(DebugMarker::CallBegin, RawOpcode::ExtFcallBegin);
    table.insert(DebugMarker::CallEnd,   RawOpcode::ExtFcallEnd);
    table
  };

  /// Builtins the VM has a dedicated opcode for, by lowercase name.
  static ref INTRINSICS: BiMap<RawOpcode, &'static str> = {
    let mut table = BiMap::new();
    table.insert(RawOpcode::Strlen,         "strlen");
    table.insert(RawOpcode::Count,          "count");
    table.insert(RawOpcode::GetClass,       "get_class");
    table.insert(RawOpcode::GetCalledClass, "get_called_class");
    table.insert(RawOpcode::GetType,        "gettype");
    table.insert(RawOpcode::FuncNumArgs,    "func_num_args");
    table.insert(RawOpcode::FuncGetArgs,    "func_get_args");
    table.insert(RawOpcode::Defined,        "defined");
    table.insert(RawOpcode::InArray,        "in_array");
    table.insert(RawOpcode::ArrayKeyExists, "array_key_exists");
    table
  };

  /// `TYPE_CHECK` type codes that stand for an `is_*` call.
  static ref TYPE_CHECKS: BiMap<u32, &'static str> = {
    let mut table = BiMap::new();
    table.insert(IS_LONG,     "is_int");
    table.insert(IS_DOUBLE,   "is_float");
    table.insert(IS_STRING,   "is_string");
    table.insert(IS_ARRAY,    "is_array");
    table.insert(IS_OBJECT,   "is_object");
    table.insert(IS_RESOURCE, "is_resource");
    table.insert(IS_BOOL,     "is_bool");
    table
  };
}

// region Lookups

pub fn access_opcode(family: Family, access: Access) -> Option<RawOpcode> {
  ACCESS_OPCODES.get_by_left(&(family, access)).copied()
}

pub fn access_of(opcode: RawOpcode) -> Option<(Family, Access)> {
  ACCESS_OPCODES.get_by_right(&opcode).copied()
}

pub fn binary_opcode(op: BinaryOp) -> RawOpcode {
  // Every `BinaryOp` has a row.
  BINARY_OPCODES.get_by_left(&op).copied().unwrap_or(RawOpcode::Nop)
}

/// `FAST_CONCAT` is the same operation as `CONCAT`.
pub fn binary_op(opcode: RawOpcode) -> Option<BinaryOp> {
  match opcode {
    RawOpcode::FastConcat => Some(BinaryOp::Concat),
    _ => BINARY_OPCODES.get_by_right(&opcode).copied(),
  }
}

pub fn jump_opcode(condition: JumpCondition) -> RawOpcode {
  JUMP_OPCODES.get_by_left(&condition).copied().unwrap_or(RawOpcode::Jmp)
}

pub fn jump_condition(opcode: RawOpcode) -> Option<JumpCondition> {
  JUMP_OPCODES.get_by_right(&opcode).copied()
}

pub fn cast_code(to: CastType) -> u32 {
  CAST_TYPES.get_by_left(&to).copied().unwrap_or(0)
}

pub fn cast_type(code: u32) -> Option<CastType> {
  CAST_TYPES.get_by_right(&code).copied()
}

pub fn include_code(mode: IncludeMode) -> u32 {
  INCLUDE_MODES.get_by_left(&mode).copied().unwrap_or(0)
}

pub fn include_mode(code: u32) -> Option<IncludeMode> {
  INCLUDE_MODES.get_by_right(&code).copied()
}

pub fn marker_opcode(marker: DebugMarker) -> RawOpcode {
  MARKER_OPCODES.get_by_left(&marker).copied().unwrap_or(RawOpcode::ExtNop)
}

pub fn marker(opcode: RawOpcode) -> Option<DebugMarker> {
  MARKER_OPCODES.get_by_right(&opcode).copied()
}

pub fn intrinsic_name(opcode: RawOpcode) -> Option<&'static str> {
  INTRINSICS.get_by_left(&opcode).copied()
}

pub fn intrinsic_opcode(name: &str) -> Option<RawOpcode> {
  INTRINSICS.get_by_right(&name).copied()
}

pub fn type_check_name(code: u32) -> Option<&'static str> {
  TYPE_CHECKS.get_by_left(&code).copied()
}

pub fn type_check_code(name: &str) -> Option<u32> {
  TYPE_CHECKS.get_by_right(&name).copied()
}

// endregion

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_access_table_is_a_bijection() {
    // 6 fetch modes × 4, 4 + 3 + 4 assignments, 4 × 3 increments, 5 unsets, 5 issets.
    assert_eq!(ACCESS_OPCODES.len(), 24 + 11 + 12 + 10);
    for ((family, access), opcode) in ACCESS_OPCODES.iter() {
      assert_eq!(access_of(*opcode), Some((*family, *access)));
    }
  }

  #[test]
  fn test_access_lookups() {
    assert_eq!(access_opcode(Family::Fetch(FetchMode::FuncArg), Access::Dim), Some(RawOpcode::FetchDimFuncArg));
    assert_eq!(access_of(RawOpcode::AssignStaticPropOp), Some((Family::AssignOp, Access::StaticProperty)));
    assert_eq!(access_of(RawOpcode::UnsetVar), Some((Family::Unset, Access::Name)));
    assert_eq!(access_opcode(Family::AssignRef, Access::Dim), None);
    assert_eq!(access_opcode(Family::Fetch(FetchMode::W), Access::Plain), None);
  }

  #[test]
  fn test_operator_tables() {
    assert_eq!(binary_op(RawOpcode::FastConcat), Some(BinaryOp::Concat));
    assert_eq!(binary_opcode(BinaryOp::Concat), RawOpcode::Concat);
    assert_eq!(binary_op(RawOpcode::Spaceship), Some(BinaryOp::Spaceship));
    assert_eq!(binary_op(RawOpcode::BoolNot), None);
    assert_eq!(jump_condition(RawOpcode::JmpNull), Some(JumpCondition::Null));
    assert_eq!(cast_type(cast_code(CastType::Double)), Some(CastType::Double));
    assert_eq!(include_mode(REQUIRE_ONCE), Some(IncludeMode::RequireOnce));
    assert_eq!(marker(RawOpcode::ExtFcallEnd), Some(DebugMarker::CallEnd));
  }

  #[test]
  fn test_builtin_tables() {
    assert_eq!(intrinsic_name(RawOpcode::GetType), Some("gettype"));
    assert_eq!(intrinsic_opcode("array_key_exists"), Some(RawOpcode::ArrayKeyExists));
    assert_eq!(type_check_name(IS_LONG), Some("is_int"));
    assert_eq!(type_check_code("is_null"), None);
  }
}
