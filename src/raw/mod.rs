/*!

  The host virtual machine's own representation of a compiled function: a flat op array in the
  style of the Zend engine. Each op has an opcode, two input operands, a result operand, an
  extended value whose meaning depends on the opcode, and the source line it was compiled from.

  Operands address one of four stores:

    Literal pool   (`CONST`) immutable values, indexed
    Compiled vars  (`CV`)    the function's named locals, indexed
    Temporaries    (`TMP`)   short-lived unnamed values, indexed by slot
    Variables      (`VAR`)   unnamed values that may hold a reference, same slot space as `TMP`

  An `UNUSED` operand still carries a number. Jump targets are stored there as absolute op
  indices, as are argument numbers and class fetch types.

  Only the opcode itself is an enum; the binary form (see `binary`) packs an op into six words.
  The human readable form (see `assembly`) is what tests and the command line work with.

*/

mod assembly;
mod binary;
mod function;
mod operand;

pub use assembly::{parse_assembly, print_assembly};
pub use binary::{decode_ops, encode_op, encode_ops, try_decode_op, Word, WORDS_PER_OP};
pub use function::{ArgInfo, RawFunction, RawOp, TryCatchElement};
pub use operand::{OperandType, RawOperand, SlotNumberType};

use strum_macros::{Display as StrumDisplay, EnumString, IntoStaticStr};
use num_enum::{IntoPrimitive, TryFromPrimitive};

// Function flags
pub const ACC_STATIC: u32 = 1 << 4;
pub const ACC_RETURN_REFERENCE: u32 = 1 << 12;
pub const ACC_HAS_FINALLY_BLOCK: u32 = 1 << 15;
pub const ACC_USES_THIS: u32 = 1 << 22;
pub const ACC_GENERATOR: u32 = 1 << 24;

// Extended value flags
/// `ISSET_ISEMPTY_*`: the op implements `empty()` rather than `isset()`.
pub const ISEMPTY: u32 = 1;
/// `CATCH`: no further handler follows in this chain.
pub const LAST_CATCH: u32 = 1;
/// `FAST_RET` op2 of a finally block that no other try region encloses.
pub const NO_ENCLOSING_TRY: u32 = u32::MAX;
/// `INIT_ARRAY`/`ADD_ARRAY_ELEMENT`: the element is added by reference.
pub const ARRAY_ELEMENT_REF: u32 = 1;
/// `INIT_ARRAY`: the size hint is stored above this shift.
pub const ARRAY_SIZE_SHIFT: u32 = 2;
/// `BIND_STATIC`/`BIND_LEXICAL`: bind by reference.
pub const BIND_REF: u32 = 1;
/// `FETCH_CONSTANT` (op1): the name was unqualified inside a namespace.
pub const CONSTANT_UNQUALIFIED: u32 = 1;
/// `FETCH_*`/`UNSET_VAR`/`ISSET_ISEMPTY_VAR` by name: look the name up in the global scope.
pub const FETCH_GLOBAL: u32 = 1 << 1;
/// As above, in the local scope.
pub const FETCH_LOCAL: u32 = 1 << 2;

// Class fetch types, stored in an `UNUSED` class operand.
pub const FETCH_CLASS_SELF: u32 = 1;
pub const FETCH_CLASS_PARENT: u32 = 2;
pub const FETCH_CLASS_STATIC: u32 = 3;

// Type codes used by `CAST` and `TYPE_CHECK`.
pub const IS_NULL: u32 = 1;
pub const IS_FALSE: u32 = 2;
pub const IS_TRUE: u32 = 3;
pub const IS_LONG: u32 = 4;
pub const IS_DOUBLE: u32 = 5;
pub const IS_STRING: u32 = 6;
pub const IS_ARRAY: u32 = 7;
pub const IS_OBJECT: u32 = 8;
pub const IS_RESOURCE: u32 = 9;
pub const IS_BOOL: u32 = 18;

// `INCLUDE_OR_EVAL` modes.
pub const EVAL: u32 = 1 << 0;
pub const INCLUDE: u32 = 1 << 1;
pub const INCLUDE_ONCE: u32 = 1 << 2;
pub const REQUIRE: u32 = 1 << 3;
pub const REQUIRE_ONCE: u32 = 1 << 4;

/**
  Opcodes of the virtual machine, numbered as the engine numbers them. The mnemonic used in
  assembly is the variant name in SCREAMING_SNAKE_CASE, e.g. `FETCH_DIM_FUNC_ARG`.
*/
#[derive(
StrumDisplay, IntoStaticStr, EnumString, TryFromPrimitive, IntoPrimitive,
Clone,        Copy,          Eq, PartialEq,  Debug,            Hash
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum RawOpcode {
  Nop = 0,
  Add = 1,
  Sub = 2,
  Mul = 3,
  Div = 4,
  Mod = 5,
  Sl = 6,
  Sr = 7,
  Concat = 8,
  BwOr = 9,
  BwAnd = 10,
  BwXor = 11,
  Pow = 12,
  BwNot = 13,
  BoolNot = 14,
  BoolXor = 15,
  IsIdentical = 16,
  IsNotIdentical = 17,
  IsEqual = 18,
  IsNotEqual = 19,
  IsSmaller = 20,
  IsSmallerOrEqual = 21,
  Assign = 22,
  AssignDim = 23,
  AssignObj = 24,
  AssignStaticProp = 25,
  AssignOp = 26,
  AssignDimOp = 27,
  AssignObjOp = 28,
  AssignStaticPropOp = 29,
  AssignRef = 30,
  QmAssign = 31,
  AssignObjRef = 32,
  AssignStaticPropRef = 33,
  PreInc = 34,
  PreDec = 35,
  PostInc = 36,
  PostDec = 37,
  PreIncStaticProp = 38,
  PreDecStaticProp = 39,
  PostIncStaticProp = 40,
  PostDecStaticProp = 41,
  Jmp = 42,
  Jmpz = 43,
  Jmpnz = 44,
  JmpzEx = 46,
  JmpnzEx = 47,
  Case = 48,
  CheckVar = 49,
  SendVarNoRefEx = 50,
  Cast = 51,
  Bool = 52,
  FastConcat = 53,
  RopeInit = 54,
  RopeAdd = 55,
  RopeEnd = 56,
  BeginSilence = 57,
  EndSilence = 58,
  InitFcallByName = 59,
  DoFcall = 60,
  InitFcall = 61,
  Return = 62,
  Recv = 63,
  RecvInit = 64,
  SendVal = 65,
  SendVarEx = 66,
  SendRef = 67,
  New = 68,
  InitNsFcallByName = 69,
  Free = 70,
  InitArray = 71,
  AddArrayElement = 72,
  IncludeOrEval = 73,
  UnsetVar = 74,
  UnsetDim = 75,
  UnsetObj = 76,
  FeResetR = 77,
  FeFetchR = 78,
  Exit = 79,
  FetchR = 80,
  FetchDimR = 81,
  FetchObjR = 82,
  FetchW = 83,
  FetchDimW = 84,
  FetchObjW = 85,
  FetchRw = 86,
  FetchDimRw = 87,
  FetchObjRw = 88,
  FetchIs = 89,
  FetchDimIs = 90,
  FetchObjIs = 91,
  FetchFuncArg = 92,
  FetchDimFuncArg = 93,
  FetchObjFuncArg = 94,
  FetchUnset = 95,
  FetchDimUnset = 96,
  FetchObjUnset = 97,
  FetchListR = 98,
  FetchConstant = 99,
  CheckFuncArg = 100,
  ExtStmt = 101,
  ExtFcallBegin = 102,
  ExtFcallEnd = 103,
  ExtNop = 104,
  Ticks = 105,
  SendVarNoRef = 106,
  Catch = 107,
  Throw = 108,
  FetchClass = 109,
  Clone = 110,
  ReturnByRef = 111,
  InitMethodCall = 112,
  InitStaticMethodCall = 113,
  IssetIsemptyVar = 114,
  IssetIsemptyDimObj = 115,
  SendValEx = 116,
  SendVar = 117,
  InitUserCall = 118,
  SendArray = 119,
  SendUser = 120,
  Strlen = 121,
  Defined = 122,
  TypeCheck = 123,
  VerifyReturnType = 124,
  FeResetRw = 125,
  FeFetchRw = 126,
  FeFree = 127,
  InitDynamicCall = 128,
  DoIcall = 129,
  DoUcall = 130,
  DoFcallByName = 131,
  PreIncObj = 132,
  PreDecObj = 133,
  PostIncObj = 134,
  PostDecObj = 135,
  Echo = 136,
  OpData = 137,
  Instanceof = 138,
  GeneratorCreate = 139,
  MakeRef = 140,
  DeclareFunction = 141,
  DeclareLambdaFunction = 142,
  DeclareConst = 143,
  DeclareClass = 144,
  DeclareClassDelayed = 145,
  DeclareAnonClass = 146,
  AddArrayUnpack = 147,
  IssetIsemptyPropObj = 148,
  AssertCheck = 151,
  JmpSet = 152,
  UnsetCv = 153,
  IssetIsemptyCv = 154,
  FetchListW = 155,
  Separate = 156,
  FetchClassName = 157,
  DiscardException = 159,
  Yield = 160,
  GeneratorReturn = 161,
  FastCall = 162,
  FastRet = 163,
  RecvVariadic = 164,
  SendUnpack = 165,
  YieldFrom = 166,
  CopyTmp = 167,
  BindGlobal = 168,
  Coalesce = 169,
  Spaceship = 170,
  FuncNumArgs = 171,
  FuncGetArgs = 172,
  FetchStaticPropR = 173,
  FetchStaticPropW = 174,
  FetchStaticPropRw = 175,
  FetchStaticPropIs = 176,
  FetchStaticPropFuncArg = 177,
  FetchStaticPropUnset = 178,
  UnsetStaticProp = 179,
  IssetIsemptyStaticProp = 180,
  FetchClassConstant = 181,
  BindLexical = 182,
  BindStatic = 183,
  FetchThis = 184,
  SendFuncArg = 185,
  IssetIsemptyThis = 186,
  SwitchLong = 187,
  SwitchString = 188,
  InArray = 189,
  Count = 190,
  GetClass = 191,
  GetCalledClass = 192,
  GetType = 193,
  ArrayKeyExists = 194,
  Match = 195,
  CaseStrict = 196,
  MatchError = 197,
  JmpNull = 198,
  CheckUndefArgs = 199,
  FetchGlobals = 200,
  CallableConvert = 202,
}

/// Where an op keeps its jump target, if it has one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum JumpSlot {
  Op1,
  Op2,
  ExtendedValue,
}

impl RawOpcode {
  pub fn code(&self) -> u8 {
    Into::<u8>::into(*self)
  }

  pub fn jump_slot(&self) -> Option<JumpSlot> {
    use RawOpcode::*;
    match self {
      Jmp | FastCall => Some(JumpSlot::Op1),
      Jmpz | Jmpnz | JmpzEx | JmpnzEx | JmpSet | Coalesce | JmpNull | AssertCheck
      | FeResetR | FeResetRw | Catch => Some(JumpSlot::Op2),
      FeFetchR | FeFetchRw => Some(JumpSlot::ExtendedValue),
      _ => None,
    }
  }

  /// Ops whose `UNUSED` op1 means the current object.
  pub fn op1_may_be_this(&self) -> bool {
    use RawOpcode::*;
    matches!(
      self,
      FetchObjR | FetchObjW | FetchObjRw | FetchObjIs | FetchObjFuncArg | FetchObjUnset
      | AssignObj | AssignObjOp | AssignObjRef | UnsetObj | IssetIsemptyPropObj
      | PreIncObj | PreDecObj | PostIncObj | PostDecObj | InitMethodCall | Clone
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::convert::TryFrom;
  use std::str::FromStr;

  #[test]
  fn test_mnemonics() {
    assert_eq!(RawOpcode::FetchDimFuncArg.to_string(), "FETCH_DIM_FUNC_ARG");
    assert_eq!(RawOpcode::JmpzEx.to_string(), "JMPZ_EX");
    assert_eq!(RawOpcode::from_str("INIT_NS_FCALL_BY_NAME").ok(), Some(RawOpcode::InitNsFcallByName));
    assert_eq!(RawOpcode::from_str("IS_SMALLER_OR_EQUAL").ok(), Some(RawOpcode::IsSmallerOrEqual));
  }

  #[test]
  fn test_numbering() {
    assert_eq!(RawOpcode::CallableConvert.code(), 202);
    assert_eq!(RawOpcode::try_from(137u8).ok(), Some(RawOpcode::OpData));
    assert!(RawOpcode::try_from(45u8).is_err());
  }

  #[test]
  fn test_jump_slots() {
    assert_eq!(RawOpcode::FastCall.jump_slot(), Some(JumpSlot::Op1));
    assert_eq!(RawOpcode::Catch.jump_slot(), Some(JumpSlot::Op2));
    // Op2 of FAST_RET names a try table row.
    assert_eq!(RawOpcode::FastRet.jump_slot(), None);
  }
}
