/*!
  The canonical instruction taxonomy. Each `OpKind` stands for one or more opcode variants of the
  virtual machine; the decoder folds the variants together and the encoder picks them again.

  Instructions refer to each other by `OpId`: consumed values through `Operand`, and structural
  links (jump targets, the array an element is added to, the loop an iteration belongs to, the
  try region of a catch, the closure a variable is bound into) through plain `OpId` fields. The
  latter are visited generically by `visit_references`.
*/

use std::borrow::Cow;
use std::fmt::{Display, Formatter};

use string_cache::DefaultAtom;
use strum_macros::{Display as StrumDisplay, EnumString, IntoStaticStr};

use super::{FetchTarget, OpId, Operand, ValueKind, VarId};

#[derive(StrumDisplay, IntoStaticStr, EnumString, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Mod,
  Sl,
  Sr,
  Concat,
  BwOr,
  BwAnd,
  BwXor,
  Pow,
  BoolXor,
  IsIdentical,
  IsNotIdentical,
  IsEqual,
  IsNotEqual,
  IsSmaller,
  IsSmallerOrEqual,
  Spaceship,
}

#[derive(StrumDisplay, IntoStaticStr, EnumString, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum UnaryOp {
  BwNot,
  BoolNot,
}

#[derive(StrumDisplay, IntoStaticStr, EnumString, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum CastType {
  Bool,
  Long,
  Double,
  String,
  Array,
  Object,
}

#[derive(StrumDisplay, IntoStaticStr, EnumString, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum IncDecOp {
  PreInc,
  PreDec,
  PostInc,
  PostDec,
}

#[derive(StrumDisplay, IntoStaticStr, EnumString, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum IncludeMode {
  Eval,
  Include,
  IncludeOnce,
  Require,
  RequireOnce,
}

/// When a conditional jump is taken, and whether it leaves a value behind.
#[derive(StrumDisplay, IntoStaticStr, EnumString, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum JumpCondition {
  /// Jumps if the value is falsy.
  Zero,
  /// Jumps if the value is truthy.
  NotZero,
  /// Like `Zero`, and leaves the value as a boolean (`&&`).
  ZeroEx,
  /// Like `NotZero`, and leaves the value as a boolean (`||`).
  NotZeroEx,
  /// Jumps leaving the value if it is truthy (`?:`).
  Set,
  /// Jumps leaving the value if it is not null (`??`).
  Coalesce,
  /// Jumps leaving null if the value is null (`?->`).
  Null,
}

#[derive(StrumDisplay, IntoStaticStr, EnumString, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum DeclareMode {
  Eager,
  /// Declared once its parent is available.
  Delayed,
  /// `new class {}`; produces the class.
  Anonymous,
}

/// Extended debug markers, recorded by position on the instruction they precede.
#[derive(StrumDisplay, IntoStaticStr, EnumString, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum DebugMarker {
  Statement,
  CallBegin,
  CallEnd,
}

/// What a structural `OpId` field must point at.
#[derive(StrumDisplay, Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum Referent {
  /// A jump target; any instruction of the function.
  #[strum(serialize = "a jump target")]
  Jump,
  /// The next handler of a catch chain, or the instruction after the last handler.
  #[strum(serialize = "the next handler of the chain")]
  CatchNext,
  #[strum(serialize = "an array initialization")]
  InitArray,
  #[strum(serialize = "a foreach reset")]
  FeReset,
  #[strum(serialize = "a try region")]
  Try,
  #[strum(serialize = "a closure declaration")]
  Lambda,
}

impl Referent {
  /// Structural links other than control transfer always point backwards.
  pub fn is_back_reference(&self) -> bool {
    !matches!(self, Referent::Jump | Referent::CatchNext)
  }
}

/// A value an instruction produces.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub struct Output {
  pub kind     : ValueKind,
  /// Required values must be consumed exactly once; others at most once.
  pub required : bool,
}

impl Output {
  const fn required(kind: ValueKind) -> Output {
    Output { kind, required: true }
  }

  const fn optional(kind: ValueKind) -> Output {
    Output { kind, required: false }
  }
}

const NO_OUTPUT          : &[Output] = &[];
const TEMPORARY          : &[Output] = &[Output::required(ValueKind::Temporary)];
const OPTIONAL_TEMPORARY : &[Output] = &[Output::optional(ValueKind::Temporary)];
const STACK              : &[Output] = &[Output::required(ValueKind::Stack)];
const UNNAMED            : &[Output] = &[Output::required(ValueKind::Unnamed)];
const OPTIONAL_UNNAMED   : &[Output] = &[Output::optional(ValueKind::Unnamed)];
const VALUE_AND_KEY      : &[Output] =
  &[Output::required(ValueKind::Unnamed), Output::optional(ValueKind::Temporary)];

#[derive(IntoStaticStr, Clone, Debug, PartialEq)]
pub enum OpKind {
  Nop { ext: bool },
  /// Opens a try region. Emits nothing; the region's handlers are the catches that name it.
  Try,
  /// Enters the finally block of `try_op` at `target`, remembering where to come back to.
  /// `returning` observes the value a `return` leaving the region is about to hand back.
  FastCall { try_op: OpId, target: OpId, returning: Option<Operand> },
  /// Ends the finally block of `try_op`. A pending exception is rethrown into `outer`.
  FastRet { try_op: OpId, outer: Option<OpId> },
  /// Drops the exception pending in the finally block of `try_op` before leaving it early.
  DiscardException { try_op: OpId },

  /// Arithmetic, bitwise, comparison and concatenation. With `assign`, the compound assignment
  /// `lhs op= rhs` on the location `assign` designates.
  Binary { op: BinaryOp, lhs: Operand, rhs: Operand, assign: Option<FetchTarget> },
  Unary { op: UnaryOp, arg: Operand },
  Cast { to: CastType, arg: Operand },
  Assign { var: Operand, target: FetchTarget, value: Operand, by_ref: bool },
  QmAssign { value: Operand },
  IncDec { op: IncDecOp, var: Operand, target: FetchTarget },
  Unset { var: Operand, target: FetchTarget },
  Isset { var: Operand, target: FetchTarget, empty: bool },

  /// Reads a location for its value. With a `Name` target this is a variable-variable lookup.
  FetchRead { var: Operand, target: FetchTarget },
  /// Prepares a location for writing, creating it if needed.
  FetchWrite { var: Operand, target: FetchTarget },
  FetchList { var: Operand, dim: Operand, by_ref: bool },
  MakeRef { var: Operand },
  Separate { var: Operand },

  Jmp { target: OpId },
  CondJmp { condition: JumpCondition, value: Operand, target: OpId },
  Case { subject: Operand, compare: Operand, strict: bool },
  MatchError { subject: Operand },
  CheckVar { var: Operand },

  InitFcall { function: Operand },
  InitMethodCall { object: Operand, method: Operand },
  InitStaticMethodCall { class: Operand, method: Operand },
  New { class: Operand },
  Send { value: Operand },
  SendUnpack { value: Operand },
  DoFcall,
  CallableConvert,

  BeginSilence,
  EndSilence { value: Operand },
  Return { value: Operand },
  Free { value: Operand },
  IncludeOrEval { arg: Operand, mode: IncludeMode },
  Exit { value: Option<Operand> },
  Echo { value: Operand },

  InitArray { value: Option<Operand>, key: Option<Operand>, by_ref: bool },
  AddArrayElement { array: OpId, value: Operand, key: Option<Operand>, by_ref: bool },
  AddArrayUnpack { array: OpId, value: Operand },

  FeReset { value: Operand, by_ref: bool, exit: OpId },
  /// Fetches the next element into `value`, or produces it when `value` is `None`. The key, if
  /// used, is a second, temporary value.
  FeFetch { reset: OpId, value: Option<VarId>, exit: OpId },
  FeFree { reset: OpId },

  FetchConstant { name: DefaultAtom },
  FetchClassConstant { class: Operand, name: DefaultAtom },
  FetchClassName { class: Operand },

  Catch { try_op: OpId, class: DefaultAtom, var: Option<VarId>, next: OpId },
  Throw { value: Operand },

  Clone { value: Operand },
  Instanceof { object: Operand, class: Operand },
  DeclareFunction { name: DefaultAtom },
  DeclareLambda { name: DefaultAtom },
  DeclareClass { name: DefaultAtom, parent: Option<DefaultAtom>, mode: DeclareMode },
  AssertCheck { target: OpId },

  Yield { value: Option<Operand>, key: Option<Operand> },
  YieldFrom { value: Operand },
  CopyTmp { value: Operand },

  BindGlobal { var: VarId, name: DefaultAtom },
  BindLexical { closure: OpId, var: VarId, by_ref: bool },
  BindStatic { var: VarId, by_ref: bool },
}

// The operand fields of every kind, in a fixed order. Expanded once for shared and once for
// mutable access.
macro_rules! for_each_operand {
  ($kind:expr, $f:ident, $target_operand:ident) => {{
    use OpKind::*;
    match $kind {
      Binary { lhs, rhs, assign, .. } => {
        $f(lhs);
        if let Some(target) = assign {
          if let Some(operand) = target.$target_operand() {
            $f(operand);
          }
        }
        $f(rhs);
      }
      Assign { var, target, value, .. } => {
        $f(var);
        if let Some(operand) = target.$target_operand() {
          $f(operand);
        }
        $f(value);
      }
      IncDec { var, target, .. }
      | Unset { var, target }
      | Isset { var, target, .. }
      | FetchRead { var, target }
      | FetchWrite { var, target } => {
        $f(var);
        if let Some(operand) = target.$target_operand() {
          $f(operand);
        }
      }
      FetchList { var, dim, .. } => {
        $f(var);
        $f(dim);
      }
      Case { subject, compare, .. } => {
        $f(subject);
        $f(compare);
      }
      InitMethodCall { object: first, method: second }
      | InitStaticMethodCall { class: first, method: second }
      | Instanceof { object: first, class: second } => {
        $f(first);
        $f(second);
      }
      Unary { arg, .. } | Cast { arg, .. } | IncludeOrEval { arg, .. } => $f(arg),
      MakeRef { var } | Separate { var } | CheckVar { var } => $f(var),
      MatchError { subject } => $f(subject),
      InitFcall { function } => $f(function),
      New { class } | FetchClassConstant { class, .. } | FetchClassName { class } => $f(class),
      CondJmp { value, .. }
      | QmAssign { value }
      | Send { value }
      | SendUnpack { value }
      | EndSilence { value }
      | Return { value }
      | Free { value }
      | Echo { value }
      | FeReset { value, .. }
      | Throw { value }
      | Clone { value }
      | YieldFrom { value }
      | CopyTmp { value } => $f(value),
      AddArrayElement { value, key, .. } => {
        $f(value);
        if let Some(key) = key {
          $f(key);
        }
      }
      AddArrayUnpack { value, .. } => $f(value),
      InitArray { value, key, .. } | Yield { value, key } => {
        if let Some(value) = value {
          $f(value);
        }
        if let Some(key) = key {
          $f(key);
        }
      }
      Exit { value } => {
        if let Some(value) = value {
          $f(value);
        }
      }
      FastCall { returning, .. } => {
        if let Some(returning) = returning {
          $f(returning);
        }
      }
      Nop { .. } | Try | FastRet { .. } | DiscardException { .. } | Jmp { .. } | DoFcall
      | CallableConvert | BeginSilence | FeFetch { .. } | FeFree { .. } | FetchConstant { .. } | Catch { .. } | DeclareFunction { .. }
      | DeclareLambda { .. } | DeclareClass { .. } | AssertCheck { .. } | BindGlobal { .. }
      | BindLexical { .. } | BindStatic { .. } => {}
    }
  }};
}

macro_rules! for_each_reference {
  ($kind:expr, $f:ident) => {{
    use OpKind::*;
    match $kind {
      Jmp { target } | CondJmp { target, .. } | AssertCheck { target } => $f(target, Referent::Jump),
      AddArrayElement { array, .. } | AddArrayUnpack { array, .. } => $f(array, Referent::InitArray),
      FeReset { exit, .. } => $f(exit, Referent::Jump),
      FeFetch { reset, exit, .. } => {
        $f(reset, Referent::FeReset);
        $f(exit, Referent::Jump);
      }
      FeFree { reset } => $f(reset, Referent::FeReset),
      Catch { try_op, next, .. } => {
        $f(try_op, Referent::Try);
        $f(next, Referent::CatchNext);
      }
      FastCall { try_op, target, .. } => {
        $f(try_op, Referent::Try);
        $f(target, Referent::Jump);
      }
      FastRet { try_op, outer } => {
        $f(try_op, Referent::Try);
        if let Some(outer) = outer {
          $f(outer, Referent::Try);
        }
      }
      DiscardException { try_op } => $f(try_op, Referent::Try),
      BindLexical { closure, .. } => $f(closure, Referent::Lambda),
      _ => {}
    }
  }};
}

impl OpKind {
  pub fn name(&self) -> &'static str {
    self.into()
  }

  pub fn visit_operands<'a>(&'a self, f: &mut dyn FnMut(&'a Operand)) {
    for_each_operand!(self, f, operand)
  }

  pub fn visit_operands_mut(&mut self, f: &mut dyn FnMut(&mut Operand)) {
    for_each_operand!(self, f, operand_mut)
  }

  pub fn operands(&self) -> Vec<&Operand> {
    let mut operands = Vec::with_capacity(3);
    self.visit_operands(&mut |operand| operands.push(operand));
    operands
  }

  pub fn visit_references<'a>(&'a self, f: &mut dyn FnMut(&'a OpId, Referent)) {
    for_each_reference!(self, f)
  }

  pub fn visit_references_mut(&mut self, f: &mut dyn FnMut(&mut OpId, Referent)) {
    for_each_reference!(self, f)
  }

  pub fn references(&self) -> Vec<(OpId, Referent)> {
    let mut references = Vec::with_capacity(2);
    self.visit_references(&mut |id, referent| references.push((*id, referent)));
    references
  }

  /// Named variables held directly rather than as operands.
  pub fn var_fields(&self) -> Vec<VarId> {
    match self {
      OpKind::FeFetch { value: Some(var), .. } | OpKind::Catch { var: Some(var), .. } => vec![*var],
      OpKind::BindGlobal { var, .. }
      | OpKind::BindLexical { var, .. }
      | OpKind::BindStatic { var, .. } => vec![*var],
      _ => vec![],
    }
  }

  /**
    Up to three operand nodes, for traversal code that does not care about the concrete kind:
    the operand fields in order, then variables held directly, then structural links as
    `Operand::Ref`.
  */
  pub fn operand_nodes(&self) -> Vec<Cow<'_, Operand>> {
    let mut nodes: Vec<Cow<'_, Operand>> = self.operands().into_iter().map(Cow::Borrowed).collect();
    nodes.extend(self.var_fields().into_iter().map(|var| Cow::Owned(Operand::Var(var))));
    nodes.extend(self.references().into_iter().map(|(id, _)| Cow::Owned(Operand::Ref(id))));
    nodes
  }

  pub fn operand1(&self) -> Option<Cow<'_, Operand>> {
    self.operand_nodes().into_iter().next()
  }

  pub fn operand2(&self) -> Option<Cow<'_, Operand>> {
    self.operand_nodes().into_iter().nth(1)
  }

  pub fn operand3(&self) -> Option<Cow<'_, Operand>> {
    self.operand_nodes().into_iter().nth(2)
  }

  /// The values this instruction produces. The first is the one `Operand::Ref` observes.
  pub fn outputs(&self) -> &'static [Output] {
    use OpKind::*;
    match self {
      Binary { assign: None, .. } => TEMPORARY,
      Binary { assign: Some(_), .. } => OPTIONAL_TEMPORARY,
      Unary { .. } | Cast { .. } | QmAssign { .. } | Case { .. } | Isset { .. }
      | IncludeOrEval { .. } | InitArray { .. } | FetchConstant { .. }
      | FetchClassConstant { .. } | FetchClassName { .. } | Clone { .. } | Instanceof { .. }
      | CopyTmp { .. } | BeginSilence | DeclareLambda { .. } | CallableConvert => TEMPORARY,
      CondJmp { condition, .. } => match condition {
        JumpCondition::Zero | JumpCondition::NotZero => NO_OUTPUT,
        JumpCondition::Null => OPTIONAL_TEMPORARY,
        _ => TEMPORARY,
      },
      Assign { by_ref: false, .. } => OPTIONAL_TEMPORARY,
      Assign { by_ref: true, .. } => OPTIONAL_UNNAMED,
      IncDec { .. } | AssertCheck { .. } | Yield { .. } | YieldFrom { .. } => OPTIONAL_TEMPORARY,
      FetchRead { .. } | FetchList { .. } => STACK,
      FetchWrite { .. } | MakeRef { .. } | Separate { .. } | New { .. } => UNNAMED,
      DoFcall => OPTIONAL_UNNAMED,
      FeFetch { value: None, .. } => VALUE_AND_KEY,
      FeFetch { value: Some(_), .. } => &VALUE_AND_KEY[1..],
      DeclareClass { mode: DeclareMode::Anonymous, .. } => UNNAMED,
      _ => NO_OUTPUT,
    }
  }

  pub fn output(&self, kind: ValueKind) -> Option<Output> {
    self.outputs().iter().copied().find(|output| output.kind == kind)
  }

  pub fn is_call_begin(&self) -> bool {
    matches!(
      self,
      OpKind::InitFcall { .. }
      | OpKind::InitMethodCall { .. }
      | OpKind::InitStaticMethodCall { .. }
      | OpKind::New { .. }
    )
  }

  pub fn is_call_end(&self) -> bool {
    matches!(self, OpKind::DoFcall | OpKind::CallableConvert)
  }

  pub fn is_send(&self) -> bool {
    matches!(self, OpKind::Send { .. } | OpKind::SendUnpack { .. })
  }
}

impl Display for OpKind {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    use OpKind::*;
    match self {
      Binary { op, .. } => write!(f, "{}", op)?,
      Unary { op, .. } => write!(f, "{}", op)?,
      Cast { to, .. } => write!(f, "Cast({})", to)?,
      IncDec { op, .. } => write!(f, "{}", op)?,
      CondJmp { condition, .. } => write!(f, "Jmp{}", condition)?,
      IncludeOrEval { mode, .. } => write!(f, "{}", mode)?,
      Isset { empty: true, .. } => write!(f, "Empty")?,
      Case { strict: true, .. } => write!(f, "CaseStrict")?,
      Nop { ext: true } => write!(f, "ExtNop")?,
      FetchConstant { name } | DeclareFunction { name } | DeclareLambda { name } => {
        write!(f, "{} {}", self.name(), name)?
      }
      FetchClassConstant { name, .. } => write!(f, "{} ::{}", self.name(), name)?,
      Catch { class, .. } => write!(f, "Catch {}", class)?,
      DeclareClass { name, mode, .. } => write!(f, "DeclareClass({}) {}", mode, name)?,
      BindGlobal { name, .. } => write!(f, "BindGlobal {}", name)?,
      _ => write!(f, "{}", self.name())?,
    }

    let mut separator = " ";
    if let Binary { assign: Some(target), .. }
    | Assign { target, .. }
    | IncDec { target, .. }
    | Unset { target, .. }
    | Isset { target, .. }
    | FetchRead { target, .. }
    | FetchWrite { target, .. } = self
    {
      let kind = match target {
        FetchTarget::None => "var",
        FetchTarget::Name(_) => "name",
        FetchTarget::Dim(_) => "dim",
        FetchTarget::Property(_) => "prop",
        FetchTarget::StaticProperty(_) => "static",
      };
      write!(f, "[{}]", kind)?;
    }
    for node in self.operand_nodes() {
      write!(f, "{}{}", separator, node)?;
      separator = ", ";
    }
    Ok(())
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Op {
  pub line      : u32,
  pub kind      : OpKind,
  /// An earlier instruction writing the same value on another control path (ternaries,
  /// short-circuit operators, nullsafe chains). Consumers name the last writer.
  pub continues : Option<OpId>,
  pub markers   : Vec<DebugMarker>,
}

impl Op {
  pub fn new(line: u32, kind: OpKind) -> Op {
    Op {
      line,
      kind,
      continues: None,
      markers: Vec::new(),
    }
  }
}

impl Display for Op {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.kind)?;
    if let Some(previous) = self.continues {
      write!(f, " (continues {})", previous)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::Value;

  #[test]
  fn test_operand_order() {
    let assign = OpKind::Assign {
      var: Operand::Var(VarId(0)),
      target: FetchTarget::Dim(Operand::Const(Value::Long(1))),
      value: Operand::Temporary(OpId(4)),
      by_ref: false,
    };
    assert_eq!(assign.operand1().as_deref(), Some(&Operand::Var(VarId(0))));
    assert_eq!(assign.operand2().as_deref(), Some(&Operand::Const(Value::Long(1))));
    assert_eq!(assign.operand3().as_deref(), Some(&Operand::Temporary(OpId(4))));
  }

  #[test]
  fn test_references_become_nodes() {
    let fetch = OpKind::FeFetch { reset: OpId(2), value: Some(VarId(1)), exit: OpId(9) };
    let nodes = fetch.operand_nodes();
    assert_eq!(nodes.len(), 3);
    assert_eq!(*nodes[0], Operand::Var(VarId(1)));
    assert_eq!(*nodes[1], Operand::Ref(OpId(2)));
    assert_eq!(*nodes[2], Operand::Ref(OpId(9)));
    assert_eq!(fetch.references()[0], (OpId(2), Referent::FeReset));
  }

  #[test]
  fn test_finally_links() {
    let call = OpKind::FastCall { try_op: OpId(0), target: OpId(6), returning: Some(Operand::Ref(OpId(3))) };
    assert_eq!(call.operands(), vec![&Operand::Ref(OpId(3))]);
    assert_eq!(call.references(), vec![(OpId(0), Referent::Try), (OpId(6), Referent::Jump)]);
    let ret = OpKind::FastRet { try_op: OpId(2), outer: Some(OpId(0)) };
    assert_eq!(ret.references(), vec![(OpId(2), Referent::Try), (OpId(0), Referent::Try)]);
    assert!(ret.outputs().is_empty());
  }

  #[test]
  fn test_mutable_visit_rewrites_targets() {
    let mut isset = OpKind::Isset {
      var: Operand::Stack(OpId(1)),
      target: FetchTarget::Property(Operand::string("name")),
      empty: false,
    };
    isset.visit_operands_mut(&mut |operand| {
      if let Operand::Stack(id) = operand {
        *id = OpId(7);
      }
    });
    assert_eq!(isset.operands()[0], &Operand::Stack(OpId(7)));
  }

  #[test]
  fn test_outputs() {
    let call = OpKind::DoFcall;
    assert_eq!(call.outputs(), &[Output { kind: ValueKind::Unnamed, required: false }]);
    let fetch = OpKind::FeFetch { reset: OpId(0), value: None, exit: OpId(0) };
    assert!(fetch.output(ValueKind::Unnamed).unwrap().required);
    assert!(!fetch.output(ValueKind::Temporary).unwrap().required);
    assert!(OpKind::Jmp { target: OpId(0) }.outputs().is_empty());
  }

  #[test]
  fn test_display() {
    let add = OpKind::Binary {
      op: BinaryOp::Add,
      lhs: Operand::Var(VarId(0)),
      rhs: Operand::Const(Value::Long(2)),
      assign: None,
    };
    assert_eq!(add.to_string(), "Add var0, 2");
  }
}
