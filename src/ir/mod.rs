/*!
  The canonical intermediate representation of one compiled function.

  A `Function` owns an arena of `Op`s and a body that puts them in program order. Operands name
  their producers by `OpId`, so the graph has no ownership cycles and "earlier in the body" is a
  position comparison. `validate` checks the structural rules that the decoder guarantees and the
  encoder requires.
*/

mod constexpr;
mod function;
mod instruction;
mod operand;
mod validate;
mod walk;

pub use constexpr::{ArrayElement, AstBinaryOp, AstUnaryOp, ConstExpr};
pub use function::{Function, FunctionFlags, Param};
pub use instruction::{
  BinaryOp, CastType, DebugMarker, DeclareMode, IncDecOp, IncludeMode, JumpCondition, Op, OpKind,
  Output, Referent, UnaryOp,
};
pub use operand::{FetchTarget, OpId, Operand, ValueKind, VarId};
pub use validate::validate;
pub use walk::Operands;
