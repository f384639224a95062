/*!
  Lowers a canonical function back to an op array the VM can run.

  Encoding happens in three passes. The analysis pass (`analysis`) looks at the whole function to
  decide what the canonical form leaves open: the fetch mode each fetch needs, which send variant
  each argument needs given what is known about the callee, which calls are better expressed as a
  builtin opcode, and which concatenation chains become ropes. The slot pass (`slots`) gives every
  unnamed value a temporary slot. The emission pass below walks the body once, writing each
  instruction's ops and recording jump fixups, which are patched when every instruction's start
  index is known.

  Jump targets are absolute op indices; an instruction's start index is where its first op,
  including its debug markers and any operand preparation, was written.
*/

mod analysis;
mod slots;

use std::collections::HashMap;

use tracing::{debug, instrument, trace};

use crate::error::EncodeError;
use crate::ir::{
  validate, CastType, DeclareMode, FetchTarget, Function, Op, OpId, OpKind, Operand, UnaryOp, ValueKind, VarId,
};
use crate::raw::{
  ArgInfo, JumpSlot, RawFunction, RawOp, RawOpcode, RawOperand, TryCatchElement, ACC_GENERATOR,
  ACC_HAS_FINALLY_BLOCK, ACC_RETURN_REFERENCE, ACC_STATIC, ACC_USES_THIS, ARRAY_ELEMENT_REF, ARRAY_SIZE_SHIFT, BIND_REF,
  CONSTANT_UNQUALIFIED, FETCH_CLASS_PARENT, FETCH_CLASS_SELF, FETCH_CLASS_STATIC, FETCH_GLOBAL,
  FETCH_LOCAL, ISEMPTY, LAST_CATCH, NO_ENCLOSING_TRY,
};
use crate::runtime::CalleeResolver;
use crate::signature::Passing;
use crate::value::Value;
use crate::variants::{self, Access, Family, FetchMode};

use analysis::{Analysis, CallTarget, Fusion, RopePart};
use slots::{rope_previous, Slots};

/// Optional lowerings. Turning one off gives the plainer, equivalent encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct EncoderOptions {
  /// Emit chains of two or more concatenations as a single rope.
  pub rope_concat     : bool,
  /// Emit calls of builtins that have their own opcode as that opcode.
  pub fuse_intrinsics : bool,
}

impl Default for EncoderOptions {
  fn default() -> Self {
    EncoderOptions { rope_concat: true, fuse_intrinsics: true }
  }
}

/**
  Encodes `function` into an op array. The function is validated first; a function the decoder
  produced, edited in ways that keep it valid, always encodes. `resolver` supplies signatures of
  callees, which decide between the by-name and the direct forms of calls and sends.
*/
#[instrument(level = "debug", skip_all, fields(function = %function.qualified_name()))]
pub fn encode<R: CalleeResolver + ?Sized>(
  function: &Function,
  resolver: &R,
  options: EncoderOptions,
) -> Result<RawFunction, EncodeError> {
  validate(function)?;

  let analysis = Analysis::new(function, resolver, options);
  let slots = Slots::allocate(function, &analysis);
  let mut emitter = Emitter::new(function, &analysis, &slots);

  emitter.prologue()?;
  for (id, op) in function.ops() {
    emitter.emit(id, op)?;
  }
  let raw = emitter.finish()?;

  debug!(ops = raw.opcodes.len(), temps = raw.num_temps, literals = raw.literals.len(), "encoded function");
  #[cfg(feature = "trace_transforms")]
  trace!("encoded body of {}\n{}", raw.qualified_name(), crate::display::raw_table(&raw));
  Ok(raw)
}

enum FixupTarget {
  /// The first op of an instruction.
  Start(OpId),
  /// The `CATCH` of a catch instruction, which need not be its first op.
  Catch(OpId),
}

struct Fixup {
  source : OpId,
  index  : usize,
  slot   : JumpSlot,
  target : FixupTarget,
}

struct Emitter<'a> {
  function    : &'a Function,
  analysis    : &'a Analysis,
  slots       : &'a Slots,
  raw         : RawFunction,
  cvs         : HashMap<VarId, u32>,
  /// The instruction being emitted.
  id          : OpId,
  line        : u32,
  /// Scratch slots taken by the current instruction.
  scratch     : u32,
  max_scratch : u32,
  starts      : HashMap<OpId, usize>,
  catches     : HashMap<OpId, usize>,
  tries       : Vec<OpId>,
  /// Try region to the instruction its finally block starts at, and to its `FAST_RET`.
  finally     : HashMap<OpId, (OpId, usize)>,
  fixups      : Vec<Fixup>,
}

impl<'a> Emitter<'a> {
  fn new(function: &'a Function, analysis: &'a Analysis, slots: &'a Slots) -> Emitter<'a> {
    let mut raw = RawFunction::new(&function.name);
    raw.scope = function.scope.clone();
    raw.closures = function.closures.clone();
    for (set, flag) in [
      (function.flags.generator, ACC_GENERATOR),
      (function.flags.returns_ref, ACC_RETURN_REFERENCE),
      (function.flags.is_static, ACC_STATIC),
      (function.flags.uses_this, ACC_USES_THIS),
    ] {
      if set {
        raw.flags |= flag;
      }
    }

    let mut cvs = HashMap::new();
    for (index, (var, name)) in function.vars.compiled().enumerate() {
      cvs.insert(var, index as u32);
      raw.vars.push(name.clone());
    }

    Emitter {
      function,
      analysis,
      slots,
      raw,
      cvs,
      id          : OpId(0),
      line        : 0,
      scratch     : 0,
      max_scratch : 0,
      starts      : HashMap::new(),
      catches     : HashMap::new(),
      tries       : Vec::new(),
      finally     : HashMap::new(),
      fixups      : Vec::new(),
    }
  }

  // region Bookkeeping

  fn unencodable(&self, reason: &str) -> EncodeError {
    EncodeError::Unencodable { op: self.id, reason: reason.to_string() }
  }

  fn push(&mut self, op: RawOp) -> usize {
    trace!(index = self.raw.opcodes.len(), opcode = %op.opcode, "emitted");
    self.raw.opcodes.push(op);
    self.raw.opcodes.len() - 1
  }

  fn op(&self, opcode: RawOpcode) -> RawOp {
    RawOp::new(opcode, self.line)
  }

  fn jump(&mut self, index: usize, slot: JumpSlot, target: FixupTarget) {
    self.fixups.push(Fixup { source: self.id, index, slot, target });
  }

  fn literal(&mut self, value: Value) -> RawOperand {
    RawOperand::Const(self.raw.add_literal(value))
  }

  fn string(&mut self, text: &str) -> RawOperand {
    self.literal(Value::string(text))
  }

  /// A slot above every allocated one, live only while the current instruction is emitted.
  fn scratch(&mut self, tmp: bool) -> RawOperand {
    let slot = self.slots.num_slots + self.scratch;
    self.scratch += 1;
    self.max_scratch = self.max_scratch.max(self.scratch);
    if tmp { RawOperand::Tmp(slot) } else { RawOperand::Var(slot) }
  }

  /// The slot of the current instruction's first output.
  fn result(&self) -> RawOperand {
    match self.function[self.id].kind.outputs().first() {
      Some(output) => self.slots.of(self.id, output.kind),
      None => RawOperand::default(),
    }
  }

  fn value_slot(&self, producer: OpId) -> RawOperand {
    match self.function[producer].kind.outputs().first() {
      Some(output) => self.slots.of(producer, output.kind),
      None => RawOperand::default(),
    }
  }

  // endregion

  // region Operands

  fn cv(&self, var: VarId) -> Result<RawOperand, EncodeError> {
    self
      .cvs
      .get(&var)
      .map(|index| RawOperand::Cv(*index))
      .ok_or_else(|| self.unencodable("variable is not a compiled variable of this function"))
  }

  /// Lowers an operand, writing any op that prepares it first.
  fn operand(&mut self, operand: &Operand) -> Result<RawOperand, EncodeError> {
    match operand {
      Operand::Const(value) => Ok(self.literal(value.clone())),
      Operand::Var(var) if self.function.is_this(*var) => {
        let slot = self.scratch(true);
        let fetch = self.op(RawOpcode::FetchThis).with_result(slot);
        self.push(fetch);
        Ok(slot)
      }
      Operand::Var(var) if self.function.is_globals(*var) => {
        let slot = self.scratch(true);
        let fetch = self.op(RawOpcode::FetchGlobals).with_result(slot);
        self.push(fetch);
        Ok(slot)
      }
      Operand::Var(var) => self.cv(*var),
      Operand::Unused(n) => Ok(RawOperand::Unused(*n)),
      Operand::Stack(producer) => Ok(self.slots.of(*producer, ValueKind::Stack)),
      Operand::Temporary(producer) => Ok(self.slots.of(*producer, ValueKind::Temporary)),
      Operand::Unnamed(producer) => Ok(self.slots.of(*producer, ValueKind::Unnamed)),
      Operand::Ref(producer) => Ok(self.value_slot(*producer)),
    }
  }

  fn optional(&mut self, operand: Option<&Operand>) -> Result<RawOperand, EncodeError> {
    match operand {
      Some(operand) => self.operand(operand),
      None => Ok(RawOperand::default()),
    }
  }

  /// Op1 of an opcode that reads the current object from an `UNUSED` op1.
  fn object(&mut self, opcode: RawOpcode, operand: &Operand) -> Result<RawOperand, EncodeError> {
    match operand {
      Operand::Var(var) if opcode.op1_may_be_this() && self.function.is_this(*var) => Ok(RawOperand::Unused(0)),
      _ => self.operand(operand),
    }
  }

  /// A class operand: `self`, `parent` and `static` by fetch type, other names as literals, and
  /// computed classes through `FETCH_CLASS`.
  fn class(&mut self, operand: &Operand) -> Result<RawOperand, EncodeError> {
    if let Operand::Const(Value::String(name)) = operand {
      return Ok(match name.to_ascii_lowercase().as_str() {
        "self" => RawOperand::Unused(FETCH_CLASS_SELF),
        "parent" => RawOperand::Unused(FETCH_CLASS_PARENT),
        "static" => RawOperand::Unused(FETCH_CLASS_STATIC),
        _ => self.string(name),
      });
    }
    let value = self.operand(operand)?;
    let slot = self.scratch(false);
    let fetch = self.op(RawOpcode::FetchClass).with_op2(value).with_result(slot);
    self.push(fetch);
    Ok(slot)
  }

  // endregion

  fn prologue(&mut self) -> Result<(), EncodeError> {
    let function = self.function;
    for (position, param) in function.params.iter().enumerate() {
      let var = self.cv(param.var)?;
      let (opcode, default) = match (&param.default, param.variadic) {
        (_, true) => (RawOpcode::RecvVariadic, RawOperand::default()),
        (Some(expr), false) => {
          let value = expr.fold().unwrap_or_else(|| Value::Ast(Box::new(expr.clone())));
          (RawOpcode::RecvInit, self.literal(value))
        }
        (None, false) => (RawOpcode::Recv, RawOperand::default()),
      };
      self.push(
        RawOp::new(opcode, param.line)
          .with_op1(RawOperand::Unused(position as u32 + 1))
          .with_op2(default)
          .with_result(var),
      );
      self.raw.arg_info.push(ArgInfo {
        name     : function.vars.get_name(&param.var).cloned().unwrap_or_default(),
        by_ref   : param.by_ref,
        variadic : param.variadic,
      });
    }
    self.raw.required_num_args = function
      .params
      .iter()
      .rposition(|param| param.default.is_none() && !param.variadic)
      .map_or(0, |index| index as u32 + 1);

    if function.flags.generator {
      let line = function.ops().next().map_or(0, |(_, op)| op.line);
      self.push(RawOp::new(RawOpcode::GeneratorCreate, line));
    }
    Ok(())
  }

  fn emit(&mut self, id: OpId, op: &Op) -> Result<(), EncodeError> {
    use RawOpcode::*;

    self.id = id;
    self.line = op.line;
    self.scratch = 0;
    self.starts.insert(id, self.raw.opcodes.len());
    for marker in &op.markers {
      let marker = self.op(variants::marker_opcode(*marker));
      self.push(marker);
    }

    match &op.kind {
      OpKind::Nop { ext } => {
        let nop = self.op(if *ext { ExtNop } else { Nop });
        self.push(nop);
      }
      OpKind::Try => self.tries.push(id),
      OpKind::FastCall { try_op, target, returning } => {
        let returning = self.optional(returning.as_ref())?;
        let op = self.op(FastCall).with_op2(returning).with_result(self.slots.of(*try_op, ValueKind::Temporary));
        let index = self.push(op);
        self.jump(index, JumpSlot::Op1, FixupTarget::Start(*target));
      }
      OpKind::DiscardException { try_op } => {
        let op = self.op(DiscardException).with_op1(self.slots.of(*try_op, ValueKind::Temporary));
        self.push(op);
      }
      OpKind::FastRet { try_op, outer } => {
        let outer = match outer {
          Some(outer) => self
            .tries
            .iter()
            .position(|region| region == outer)
            .ok_or_else(|| self.unencodable("enclosing try region is not open"))? as u32,
          None => NO_ENCLOSING_TRY,
        };
        let op = self
          .op(FastRet)
          .with_op1(self.slots.of(*try_op, ValueKind::Temporary))
          .with_op2(RawOperand::Unused(outer));
        let index = self.push(op);
        let start = self
          .function
          .ops()
          .find_map(|(_, op)| match op.kind {
            OpKind::FastCall { try_op: region, target, .. } if region == *try_op => Some(target),
            _ => None,
          })
          .ok_or_else(|| self.unencodable("finally block is never entered"))?;
        self.finally.insert(*try_op, (start, index));
        self.raw.flags |= ACC_HAS_FINALLY_BLOCK;
      }

      OpKind::Binary { op: binary, lhs, rhs, assign: None } => match self.analysis.ropes.get(&id) {
        Some(part) => self.emit_rope(*part, rhs, lhs)?,
        None => {
          let lhs = self.operand(lhs)?;
          let rhs = self.operand(rhs)?;
          let result = self.result();
          let op = self.op(variants::binary_opcode(*binary)).with_op1(lhs).with_op2(rhs).with_result(result);
          self.push(op);
        }
      },
      OpKind::Binary { op: binary, lhs, rhs, assign: Some(target) } => {
        let code = variants::binary_opcode(*binary).code() as u32;
        self.emit_access(Family::AssignOp, lhs, target, Some(rhs), code)?;
      }
      OpKind::Unary { op: unary, arg } => {
        let opcode = match unary {
          UnaryOp::BwNot => BwNot,
          UnaryOp::BoolNot => BoolNot,
        };
        self.emit_simple(opcode, Some(arg), None)?;
      }
      OpKind::Cast { to: CastType::Bool, arg } => { self.emit_simple(Bool, Some(arg), None)?; }
      OpKind::Cast { to, arg } => {
        self.emit_simple(Cast, Some(arg), None)?;
        self.set_extended_value(variants::cast_code(*to));
      }
      OpKind::Assign { var, target, value, by_ref } => {
        let family = if *by_ref { Family::AssignRef } else { Family::Assign };
        self.emit_access(family, var, target, Some(value), 0)?;
      }
      OpKind::QmAssign { value } => { self.emit_simple(QmAssign, Some(value), None)?; }
      OpKind::IncDec { op: inc_dec, var, target } => {
        self.emit_access(Family::IncDec(*inc_dec), var, target, None, 0)?;
      }
      OpKind::Unset { var, target } => { self.emit_access(Family::Unset, var, target, None, 0)?; }
      OpKind::Isset { var: Operand::Var(var), target: FetchTarget::None, empty } if self.function.is_this(*var) => {
        let result = self.result();
        let op = self.op(IssetIsemptyThis).with_result(result).with_extended_value(if *empty { ISEMPTY } else { 0 });
        self.push(op);
      }
      OpKind::Isset { var, target, empty } => {
        self.emit_access(Family::Isset, var, target, None, if *empty { ISEMPTY } else { 0 })?;
      }

      OpKind::FetchRead { var, target } | OpKind::FetchWrite { var, target } => {
        let default = if matches!(op.kind, OpKind::FetchRead { .. }) { FetchMode::R } else { FetchMode::W };
        let mode = self.analysis.modes.get(&id).copied().unwrap_or(default);
        if let Some(arg_num) = self.analysis.check_func_arg.get(&id).copied() {
          let check = self.op(CheckFuncArg).with_op2(RawOperand::Unused(arg_num));
          self.push(check);
        }
        self.emit_access(Family::Fetch(mode), var, target, None, 0)?;
      }
      OpKind::FetchList { var, dim, by_ref } => {
        self.emit_simple(if *by_ref { FetchListW } else { FetchListR }, Some(var), Some(dim))?;
      }
      OpKind::MakeRef { var } => { self.emit_simple(MakeRef, Some(var), None)?; }
      OpKind::Separate { var } => { self.emit_simple(Separate, Some(var), None)?; }

      OpKind::Jmp { target } => {
        let index = self.push(self.op(Jmp));
        self.jump(index, JumpSlot::Op1, FixupTarget::Start(*target));
      }
      OpKind::CondJmp { condition, value, target } => {
        let index = self.emit_simple(variants::jump_opcode(*condition), Some(value), None)?;
        self.jump(index, JumpSlot::Op2, FixupTarget::Start(*target));
      }
      OpKind::Case { subject, compare, strict } => {
        self.emit_simple(if *strict { CaseStrict } else { Case }, Some(subject), Some(compare))?;
      }
      OpKind::MatchError { subject } => { self.emit_simple(MatchError, Some(subject), None)?; }
      OpKind::CheckVar { var } => { self.emit_simple(CheckVar, Some(var), None)?; }

      OpKind::InitFcall { function } => { self.emit_init_fcall(function)?; }
      OpKind::InitMethodCall { object, method } => {
        let object = self.object(InitMethodCall, object)?;
        let method = self.operand(method)?;
        let op = self.op(InitMethodCall).with_op1(object).with_op2(method).with_extended_value(self.num_args());
        self.push(op);
      }
      OpKind::InitStaticMethodCall { class, method } => {
        let class = self.class(class)?;
        let method = self.operand(method)?;
        let op =
          self.op(InitStaticMethodCall).with_op1(class).with_op2(method).with_extended_value(self.num_args());
        self.push(op);
      }
      OpKind::New { class } => {
        let class = self.class(class)?;
        let result = self.result();
        let op = self.op(New).with_op1(class).with_result(result).with_extended_value(self.num_args());
        self.push(op);
      }
      OpKind::Send { value } => { self.emit_send(value)?; }
      OpKind::SendUnpack { value } => { self.emit_simple(SendUnpack, Some(value), None)?; }
      OpKind::DoFcall => { self.emit_do_fcall()?; }
      OpKind::CallableConvert => { self.emit_simple(CallableConvert, None, None)?; }

      OpKind::BeginSilence => { self.emit_simple(BeginSilence, None, None)?; }
      OpKind::EndSilence { value } => { self.emit_simple(EndSilence, Some(value), None)?; }
      OpKind::Return { value } => {
        let opcode = if self.function.flags.generator {
          GeneratorReturn
        } else if self.function.flags.returns_ref {
          ReturnByRef
        } else {
          Return
        };
        self.emit_simple(opcode, Some(value), None)?;
      }
      OpKind::Free { value } => { self.emit_simple(Free, Some(value), None)?; }
      OpKind::IncludeOrEval { arg, mode } => {
        self.emit_simple(IncludeOrEval, Some(arg), None)?;
        self.set_extended_value(variants::include_code(*mode));
      }
      OpKind::Exit { value } => { self.emit_simple(Exit, value.as_ref(), None)?; }
      OpKind::Echo { value } => { self.emit_simple(Echo, Some(value), None)?; }

      OpKind::InitArray { value, key, by_ref } => {
        self.emit_simple(InitArray, value.as_ref(), key.as_ref())?;
        let size = self.analysis.array_sizes.get(&id).copied().unwrap_or(0);
        self.set_extended_value((size << ARRAY_SIZE_SHIFT) | if *by_ref { ARRAY_ELEMENT_REF } else { 0 });
      }
      OpKind::AddArrayElement { array, value, key, by_ref } => {
        let value = self.operand(value)?;
        let key = self.optional(key.as_ref())?;
        let op = self
          .op(AddArrayElement)
          .with_op1(value)
          .with_op2(key)
          .with_result(self.slots.of(*array, ValueKind::Temporary))
          .with_extended_value(if *by_ref { ARRAY_ELEMENT_REF } else { 0 });
        self.push(op);
      }
      OpKind::AddArrayUnpack { array, value } => {
        let value = self.operand(value)?;
        let op = self.op(AddArrayUnpack).with_op1(value).with_result(self.slots.of(*array, ValueKind::Temporary));
        self.push(op);
      }

      OpKind::FeReset { value, by_ref, exit } => {
        let value = self.operand(value)?;
        let iterator = self.slots.of(id, ValueKind::Unnamed);
        let op = self.op(if *by_ref { FeResetRw } else { FeResetR }).with_op1(value).with_result(iterator);
        let index = self.push(op);
        self.jump(index, JumpSlot::Op2, FixupTarget::Start(*exit));
      }
      OpKind::FeFetch { reset, value, exit } => {
        let by_ref = matches!(self.function[*reset].kind, OpKind::FeReset { by_ref: true, .. });
        let target = match value {
          Some(var) => self.cv(*var)?,
          None => self.slots.of(id, ValueKind::Unnamed),
        };
        let op = self
          .op(if by_ref { FeFetchRw } else { FeFetchR })
          .with_op1(self.slots.of(*reset, ValueKind::Unnamed))
          .with_op2(target)
          .with_result(self.slots.of(id, ValueKind::Temporary));
        let index = self.push(op);
        self.jump(index, JumpSlot::ExtendedValue, FixupTarget::Start(*exit));
      }
      OpKind::FeFree { reset } => {
        let op = self.op(FeFree).with_op1(self.slots.of(*reset, ValueKind::Unnamed));
        self.push(op);
      }

      OpKind::FetchConstant { name } => {
        let (flags, name) = match name.strip_prefix('\\') {
          Some(global) => (0, global),
          None => (CONSTANT_UNQUALIFIED, &name[..]),
        };
        let name = self.string(name);
        let result = self.result();
        let op = self.op(FetchConstant).with_op1(RawOperand::Unused(flags)).with_op2(name).with_result(result);
        self.push(op);
      }
      OpKind::FetchClassConstant { class, name } => {
        let class = self.class(class)?;
        let name = self.string(name);
        let result = self.result();
        let op = self.op(FetchClassConstant).with_op1(class).with_op2(name).with_result(result);
        self.push(op);
      }
      OpKind::FetchClassName { class } => {
        let class = self.class(class)?;
        let result = self.result();
        let op = self.op(FetchClassName).with_op1(class).with_result(result);
        self.push(op);
      }

      OpKind::Catch { class, var, next, .. } => {
        let last = !matches!(self.function[*next].kind, OpKind::Catch { .. });
        let class = self.string(class);
        let var = match var {
          Some(var) => self.cv(*var)?,
          None => RawOperand::default(),
        };
        let op = self
          .op(Catch)
          .with_op1(class)
          .with_result(var)
          .with_extended_value(if last { LAST_CATCH } else { 0 });
        let index = self.push(op);
        self.catches.insert(id, index);
        if !last {
          self.jump(index, JumpSlot::Op2, FixupTarget::Catch(*next));
        }
      }
      OpKind::Throw { value } => { self.emit_simple(Throw, Some(value), None)?; }

      OpKind::Clone { value } => {
        let value = self.object(Clone, value)?;
        let result = self.result();
        let op = self.op(Clone).with_op1(value).with_result(result);
        self.push(op);
      }
      OpKind::Instanceof { object, class } => {
        let object = self.operand(object)?;
        let class = self.class(class)?;
        let result = self.result();
        let op = self.op(Instanceof).with_op1(object).with_op2(class).with_result(result);
        self.push(op);
      }
      OpKind::DeclareFunction { name } => {
        let name = self.string(name);
        let op = self.op(DeclareFunction).with_op1(name);
        self.push(op);
      }
      OpKind::DeclareLambda { name } => {
        let index = self
          .function
          .closures
          .iter()
          .position(|closure| closure == name)
          .ok_or_else(|| EncodeError::UnknownClosure { op: id, name: name.to_string() })?;
        let result = self.result();
        let op = self.op(DeclareLambdaFunction).with_op2(RawOperand::Unused(index as u32)).with_result(result);
        self.push(op);
      }
      OpKind::DeclareClass { name, parent, mode } => {
        let opcode = match mode {
          DeclareMode::Eager => DeclareClass,
          DeclareMode::Delayed => DeclareClassDelayed,
          DeclareMode::Anonymous => DeclareAnonClass,
        };
        let name = self.string(name);
        let parent = match parent {
          Some(parent) => self.string(parent),
          None => RawOperand::default(),
        };
        let result = self.result();
        let op = self.op(opcode).with_op1(name).with_op2(parent).with_result(result);
        self.push(op);
      }
      OpKind::AssertCheck { target } => {
        let index = self.emit_simple(AssertCheck, None, None)?;
        self.jump(index, JumpSlot::Op2, FixupTarget::Start(*target));
      }

      OpKind::Yield { value, key } => { self.emit_simple(Yield, value.as_ref(), key.as_ref())?; }
      OpKind::YieldFrom { value } => { self.emit_simple(YieldFrom, Some(value), None)?; }
      OpKind::CopyTmp { value } => { self.emit_simple(CopyTmp, Some(value), None)?; }

      OpKind::BindGlobal { var, name } => {
        let var = self.cv(*var)?;
        let name = self.string(name);
        let op = self.op(BindGlobal).with_op1(var).with_op2(name);
        self.push(op);
      }
      OpKind::BindLexical { closure, var, by_ref } => {
        let var = self.cv(*var)?;
        let op = self
          .op(BindLexical)
          .with_op1(self.slots.of(*closure, ValueKind::Temporary))
          .with_op2(var)
          .with_extended_value(if *by_ref { BIND_REF } else { 0 });
        self.push(op);
      }
      OpKind::BindStatic { var, by_ref } => {
        let var = self.cv(*var)?;
        let op = self.op(BindStatic).with_op1(var).with_extended_value(if *by_ref { BIND_REF } else { 0 });
        self.push(op);
      }
    }
    Ok(())
  }

  /// Writes `opcode` with up to two operands and the current instruction's result, and returns
  /// its index.
  fn emit_simple(
    &mut self,
    opcode: RawOpcode,
    op1: Option<&Operand>,
    op2: Option<&Operand>,
  ) -> Result<usize, EncodeError> {
    let op1 = self.optional(op1)?;
    let op2 = self.optional(op2)?;
    let result = self.result();
    let op = self.op(opcode).with_op1(op1).with_op2(op2).with_result(result);
    Ok(self.push(op))
  }

  fn set_extended_value(&mut self, extended_value: u32) {
    if let Some(op) = self.raw.opcodes.last_mut() {
      op.extended_value = extended_value;
    }
  }

  // region Families

  /// An access opcode. Values written to a location other than a plain variable travel in an
  /// `OP_DATA` right after it.
  fn emit_access(
    &mut self,
    family: Family,
    var: &Operand,
    target: &FetchTarget,
    value: Option<&Operand>,
    extended_value: u32,
  ) -> Result<(), EncodeError> {
    let access = Access::of(target);
    let opcode = variants::access_opcode(family, access)
      .ok_or_else(|| self.unencodable(&format!("{:?} has no opcode for a {} access", family, access)))?;

    let mut data = match value {
      Some(value) => Some(self.operand(value)?),
      None => None,
    };
    let (op1, op2, extended_value) = match target {
      FetchTarget::None => (self.object(opcode, var)?, data.take().unwrap_or_default(), extended_value),
      FetchTarget::Name(name) => {
        let scope = match var {
          Operand::Unused(_) => FETCH_LOCAL,
          Operand::Var(var) if self.function.is_globals(*var) => FETCH_GLOBAL,
          _ => return Err(self.unencodable("variable variables are looked up in the local or global scope only")),
        };
        (self.operand(name)?, RawOperand::default(), extended_value | scope)
      }
      FetchTarget::Dim(key) | FetchTarget::Property(key) => {
        let object = self.object(opcode, var)?;
        (object, self.operand(key)?, extended_value)
      }
      FetchTarget::StaticProperty(property) => {
        let property = self.operand(property)?;
        (property, self.class(var)?, extended_value)
      }
    };

    let result = self.result();
    let op = self.op(opcode).with_op1(op1).with_op2(op2).with_result(result).with_extended_value(extended_value);
    self.push(op);
    if let Some(data) = data {
      let op_data = self.op(RawOpcode::OpData).with_op1(data);
      self.push(op_data);
    }
    Ok(())
  }

  /// One link of a rope. `part` is the string appended by this link.
  fn emit_rope(&mut self, rope: RopePart, part: &Operand, first: &Operand) -> Result<(), EncodeError> {
    match rope {
      RopePart::Init { parts } => {
        let slot = self.slots.of(self.id, ValueKind::Temporary);
        let first = self.operand(first)?;
        let part = self.operand(part)?;
        let init = self.op(RawOpcode::RopeInit).with_op2(first).with_result(slot).with_extended_value(parts);
        self.push(init);
        let add = self.op(RawOpcode::RopeAdd).with_op1(slot).with_op2(part).with_result(slot).with_extended_value(1);
        self.push(add);
      }
      RopePart::Add { index } | RopePart::End { index } => {
        let previous = rope_previous(self.function, self.id).ok_or_else(|| self.unencodable("rope link without a rope"))?;
        let acc = self.slots.of(previous, ValueKind::Temporary);
        let part = self.operand(part)?;
        let (opcode, result) = match rope {
          RopePart::Add { .. } => (RawOpcode::RopeAdd, acc),
          _ => (RawOpcode::RopeEnd, self.result()),
        };
        let op = self.op(opcode).with_op1(acc).with_op2(part).with_result(result).with_extended_value(index);
        self.push(op);
      }
    }
    Ok(())
  }

  // endregion

  // region Calls

  fn num_args(&self) -> u32 {
    self.analysis.call(self.id).map_or(0, |call| call.num_args())
  }

  fn emit_init_fcall(&mut self, function: &Operand) -> Result<(), EncodeError> {
    let analysis = self.analysis;
    let call = analysis.call(self.id).ok_or_else(|| self.unencodable("call begin without a call"))?;
    if call.fusion.is_some() {
      return Ok(());
    }

    let (opcode, name) = match &call.target {
      CallTarget::Known { name, .. } => (RawOpcode::InitFcall, self.string(name)),
      CallTarget::ByName(name) => (RawOpcode::InitFcallByName, self.string(name)),
      CallTarget::Namespaced(name) => (RawOpcode::InitNsFcallByName, self.string(name)),
      _ => (RawOpcode::InitDynamicCall, self.operand(function)?),
    };
    let op = self.op(opcode).with_op2(name).with_extended_value(call.num_args());
    self.push(op);
    Ok(())
  }

  fn emit_send(&mut self, value: &Operand) -> Result<(), EncodeError> {
    use RawOpcode::*;

    let analysis = self.analysis;
    let call = analysis.call(self.id).ok_or_else(|| self.unencodable("send outside of a call"))?;
    let arg_num = analysis.arg_num(self.id);

    match &call.fusion {
      Some(Fusion::Intrinsic(_)) | Some(Fusion::TypeCheck(_)) => Ok(()),
      Some(Fusion::UserCall { name, array }) => {
        let value = self.operand(value)?;
        let op = if arg_num == 1 {
          let name = self.string(name);
          self.op(InitUserCall).with_op1(name).with_op2(value).with_extended_value(call.num_args() - 1)
        } else if *array {
          self.op(SendArray).with_op1(value)
        } else {
          self.op(SendUser).with_op1(value).with_op2(RawOperand::Unused(arg_num - 1))
        };
        self.push(op);
        Ok(())
      }
      None => {
        let lowered = self.operand(value)?;
        let prepared = match value {
          Operand::Unnamed(producer) => matches!(self.function[*producer].kind, OpKind::FetchWrite { .. }),
          _ => false,
        };
        let opcode = match (lowered, analysis.passing(self.id)) {
          (RawOperand::Unused(_), _) => return Err(self.unencodable("sends nothing")),
          (RawOperand::Const(_) | RawOperand::Tmp(_), None) => SendValEx,
          (RawOperand::Const(_) | RawOperand::Tmp(_), Some(_)) => SendVal,
          (RawOperand::Cv(_), None) => SendVarEx,
          (RawOperand::Cv(_), Some(Passing::ByReference)) => SendRef,
          (RawOperand::Cv(_), Some(Passing::ByValue)) => SendVar,
          (RawOperand::Var(_), None) if prepared => SendFuncArg,
          (RawOperand::Var(_), None) => SendVarNoRefEx,
          (RawOperand::Var(_), Some(Passing::ByReference)) if prepared => SendRef,
          (RawOperand::Var(_), Some(Passing::ByReference)) => SendVarNoRef,
          (RawOperand::Var(_), Some(Passing::ByValue)) => SendVar,
        };
        let op = self.op(opcode).with_op1(lowered).with_op2(RawOperand::Unused(arg_num));
        self.push(op);
        Ok(())
      }
    }
  }

  fn emit_do_fcall(&mut self) -> Result<(), EncodeError> {
    use RawOpcode::*;

    let analysis = self.analysis;
    let call = analysis.call(self.id).ok_or_else(|| self.unencodable("call end without a call"))?;
    let result = self.result();

    let op = match &call.fusion {
      Some(Fusion::Intrinsic(opcode)) => {
        let args = self.call_args(&call.sends)?;
        self
          .op(*opcode)
          .with_op1(args.first().copied().unwrap_or_default())
          .with_op2(args.get(1).copied().unwrap_or_default())
      }
      Some(Fusion::TypeCheck(code)) => {
        let args = self.call_args(&call.sends)?;
        self.op(TypeCheck).with_op1(args.first().copied().unwrap_or_default()).with_extended_value(*code)
      }
      Some(Fusion::UserCall { .. }) => self.op(DoFcall),
      None => {
        if call.unpack {
          let check = self.op(CheckUndefArgs);
          self.push(check);
        }
        let opcode = match &call.target {
          CallTarget::Known { signature, .. } if signature.is_internal() => DoIcall,
          CallTarget::Known { .. } => DoUcall,
          CallTarget::ByName(_) | CallTarget::Namespaced(_) => DoFcallByName,
          _ => DoFcall,
        };
        self.op(opcode)
      }
    };
    self.push(op.with_result(result));
    Ok(())
  }

  /// The lowered values of the sends of a fused call.
  fn call_args(&mut self, sends: &[OpId]) -> Result<Vec<RawOperand>, EncodeError> {
    let function = self.function;
    let mut args = Vec::with_capacity(sends.len());
    for send in sends {
      if let OpKind::Send { value } = &function[*send].kind {
        args.push(self.operand(value)?);
      }
    }
    Ok(args)
  }

  // endregion

  /// Patches jumps, builds the try table and sizes the temporary area.
  fn finish(mut self) -> Result<RawFunction, EncodeError> {
    for marker in &self.function.trailing_markers {
      let op = RawOp::new(variants::marker_opcode(*marker), self.line);
      self.raw.opcodes.push(op);
    }

    let length = self.raw.opcodes.len();
    for fixup in std::mem::take(&mut self.fixups) {
      let resolved = match fixup.target {
        FixupTarget::Start(target) => self.starts.get(&target),
        FixupTarget::Catch(target) => self.catches.get(&target),
      };
      let index = match resolved {
        Some(index) if *index < length => *index as u32,
        _ => {
          return Err(EncodeError::Unencodable {
            op     : fixup.source,
            reason : "jump target emits no op".to_string(),
          })
        }
      };
      let op = &mut self.raw.opcodes[fixup.index];
      match fixup.slot {
        JumpSlot::Op1 => op.op1 = RawOperand::Unused(index),
        JumpSlot::Op2 => op.op2 = RawOperand::Unused(index),
        JumpSlot::ExtendedValue => op.extended_value = index,
      }
    }

    for try_op in std::mem::take(&mut self.tries) {
      let first_catch = self
        .function
        .ops()
        .find(|(_, op)| matches!(op.kind, OpKind::Catch { try_op: region, .. } if region == try_op))
        .and_then(|(catch, _)| self.catches.get(&catch).copied());
      let finally = self.finally.get(&try_op).and_then(|(start, end)| Some((*self.starts.get(start)?, *end)));
      if first_catch.is_none() && finally.is_none() {
        return Err(EncodeError::Unencodable { op: try_op, reason: "try region without a handler".to_string() });
      }
      let (finally_op, finally_end) = finally.unwrap_or((0, 0));
      self.raw.try_catch.push(TryCatchElement {
        try_op      : self.starts.get(&try_op).copied().unwrap_or(0) as u32,
        catch_op    : first_catch.unwrap_or(0) as u32,
        finally_op  : finally_op as u32,
        finally_end : finally_end as u32,
      });
    }

    self.raw.num_temps = self.slots.num_slots + self.max_scratch;
    Ok(self.raw)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::decode::decode;
  use crate::ir::BinaryOp;
  use crate::raw::{parse_assembly, print_assembly};
  use crate::runtime::{NoCallees, Runtime};

  fn decode_text(text: &str) -> Function {
    decode(&parse_assembly(text).expect("valid assembly")[0]).expect("decodable")
  }

  fn opcodes(raw: &RawFunction) -> Vec<RawOpcode> {
    raw.opcodes.iter().map(|op| op.opcode).collect()
  }

  /// Decoding the encoding gives back the same function.
  fn assert_fixpoint(text: &str, resolver: &impl CalleeResolver) {
    let function = decode_text(text);
    let raw = encode(&function, resolver, EncoderOptions::default()).unwrap();
    let again = decode(&raw).unwrap_or_else(|error| panic!("{}\n{}", error, print_assembly(&raw)));
    assert_eq!(again, function, "\n{}", print_assembly(&raw));
  }

  #[test]
  fn test_round_trips() {
    let runtime = Runtime::with_builtins();
    let texts = [
      ".function f\n.vars a b\n.arg a\n.arg b\n  RECV #1 -> CV0\n  RECV_INIT #2, 5 -> CV1\n  ADD CV0, CV1 -> T0\n  RETURN T0\n",
      ".function f\n.vars a\n  JMPZ CV0, #3\n  QM_ASSIGN 1 -> T0\n  JMP #4\n  QM_ASSIGN 2 -> T0\n  RETURN T0\n",
      ".function f\n.vars a\n  INIT_FCALL_BY_NAME _, \"g\" ext=1\n  SEND_VAR_EX CV0, #1\n  DO_FCALL_BY_NAME -> V0\n  RETURN V0\n",
      ".function f\n.vars s\n  STRLEN CV0 -> T0\n  RETURN T0\n",
      ".function f\n.vars a b\n  ROPE_INIT _, \"x\" -> T0 ext=4\n  ROPE_ADD T0, CV0 -> T0 ext=1\n  ROPE_ADD T0, \"y\" -> T0 ext=2\n  ROPE_END T0, CV1 -> T1 ext=3\n  ECHO T1\n  RETURN null\n",
      ".function f\n.vars a v\n  FE_RESET_R CV0, #4 -> V0\n  FE_FETCH_R V0, CV1 ext=4\n  ECHO CV1\n  JMP #1\n  FE_FREE V0\n  RETURN null\n",
      ".function f\n.vars a\n  ASSIGN_DIM CV0, \"k\"\n  OP_DATA 1\n  RETURN null\n",
      ".function C::m\n.scope C\n  FETCH_OBJ_R _, \"p\" -> T0\n  RETURN T0\n",
      ".function f\n.vars a b\n  BOOL CV0 -> T0\n  BOOL_NOT T0 -> T1\n  QM_ASSIGN T1 -> T2\n  ECHO T2\n  UNSET_CV CV1\n  BEGIN_SILENCE -> T3\n  ECHO CV0\n  END_SILENCE T3\n  RETURN null\n",
    ];
    for text in texts {
      assert_fixpoint(text, &runtime);
      assert_fixpoint(text, &NoCallees);
    }
  }

  #[test]
  fn test_printed_defaults_reparse() {
    let function = decode_text(
      ".function f\n.vars a b\n.arg a\n.arg b\n  RECV_INIT #1, const((A . \"x\")) -> CV0\n  RECV_INIT #2, const(array(1, ...B)) -> CV1\n  RETURN CV0\n",
    );
    let raw = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    let printed = print_assembly(&raw);
    let reparsed = parse_assembly(&printed).unwrap_or_else(|error| panic!("{}\n{}", error, printed));
    assert_eq!(decode(&reparsed[0]).unwrap(), function);
  }

  #[test]
  fn test_catch_chain_round_trips() {
    let text = "\
.function f
.vars e
.try 0 2
  ECHO \"body\"
  JMP #6
  CATCH \"A\", #4 -> CV0
  JMP #6
  CATCH \"B\" ext=1
  JMP #6
  RETURN null
";
    let function = decode_text(text);
    let raw = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(raw.try_catch, vec![TryCatchElement { try_op: 0, catch_op: 2, finally_op: 0, finally_end: 0 }]);
    assert_eq!(raw.opcodes[2].op2, RawOperand::Unused(4));
    assert_eq!(raw.opcodes[4].extended_value, LAST_CATCH);
    assert_eq!(decode(&raw).unwrap(), function);
  }

  #[test]
  fn test_finally_round_trips() {
    let text = "\
.function f
.vars a
.try 0 0 3 4
  ECHO CV0
  FAST_CALL #3 -> T7
  JMP #5
  ECHO \"done\"
  FAST_RET T7, #4294967295
  RETURN null
";
    let function = decode_text(text);
    let raw = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(raw.try_catch, vec![TryCatchElement { try_op: 0, catch_op: 0, finally_op: 3, finally_end: 4 }]);
    assert_eq!(raw.opcodes[1].opcode, RawOpcode::FastCall);
    assert_eq!(raw.opcodes[1].op1, RawOperand::Unused(3));
    assert_eq!(raw.opcodes[1].result, RawOperand::Tmp(0));
    assert_eq!(raw.opcodes[4].op1, RawOperand::Tmp(0));
    assert_eq!(raw.opcodes[4].op2, RawOperand::Unused(NO_ENCLOSING_TRY));
    assert_ne!(raw.flags & ACC_HAS_FINALLY_BLOCK, 0);
    assert_eq!(decode(&raw).unwrap(), function);

    let with_catch_and_return = "\
.function f
.vars a e
.try 0 3 7 8
  ADD CV0, 1 -> T0
  FAST_CALL #7, T0 -> T1
  RETURN T0
  CATCH \"A\" -> CV1 ext=1
  FAST_CALL #7 -> T1
  JMP #9
  ECHO \"caught\"
  DISCARD_EXCEPTION T1
  FAST_RET T1, #4294967295
  RETURN null
";
    let nested = "\
.function f
.try 0 0 7 8
.try 0 0 3 4
  ECHO 1
  FAST_CALL #3 -> T0
  JMP #5
  ECHO 2
  FAST_RET T0, #0
  FAST_CALL #7 -> T1
  JMP #9
  ECHO 3
  FAST_RET T1, #4294967295
  RETURN null
";
    for text in [with_catch_and_return, nested] {
      assert_fixpoint(text, &NoCallees);
    }
    let raw = encode(&decode_text(nested), &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(raw.try_catch.len(), 2);
    assert_eq!((raw.try_catch[0].finally_op, raw.try_catch[1].finally_op), (7, 3));
    assert_eq!(raw.opcodes[4].op2, RawOperand::Unused(0));
  }

  #[test]
  fn test_concat_chains_become_ropes() {
    let text = ".function f\n.vars a b\n  CONCAT \"x\", CV0 -> T0\n  CONCAT T0, \"y\" -> T1\n  CONCAT T1, CV1 -> T2\n  RETURN T2\n";
    let function = decode_text(text);

    let raw = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(opcodes(&raw), vec![
      RawOpcode::RopeInit,
      RawOpcode::RopeAdd,
      RawOpcode::RopeAdd,
      RawOpcode::RopeEnd,
      RawOpcode::Return,
    ]);
    assert_eq!(raw.opcodes[0].extended_value, 4);
    assert_eq!(decode(&raw).unwrap(), function);

    let plain = EncoderOptions { rope_concat: false, ..EncoderOptions::default() };
    let raw = encode(&function, &NoCallees, plain).unwrap();
    assert_eq!(opcodes(&raw)[..3], [RawOpcode::Concat, RawOpcode::Concat, RawOpcode::Concat]);
    assert_eq!(decode(&raw).unwrap(), function);
  }

  #[test]
  fn test_call_forms_follow_the_resolver() {
    let text = ".function f\n.vars a\n  INIT_FCALL_BY_NAME _, \"sort\" ext=1\n  SEND_VAR_EX CV0, #1\n  DO_FCALL_BY_NAME\n  RETURN null\n";
    let function = decode_text(text);

    let by_name = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(opcodes(&by_name)[..3], [RawOpcode::InitFcallByName, RawOpcode::SendVarEx, RawOpcode::DoFcallByName]);

    let known = encode(&function, &Runtime::with_builtins(), EncoderOptions::default()).unwrap();
    assert_eq!(opcodes(&known)[..3], [RawOpcode::InitFcall, RawOpcode::SendRef, RawOpcode::DoIcall]);
    assert_eq!(known.literal(known.opcodes[0].op2.num()), Some(&Value::string("sort")));
  }

  #[test]
  fn test_intrinsics_fuse() {
    let function = decode_text(".function f\n.vars s\n  STRLEN CV0 -> T0\n  RETURN T0\n");
    let fused = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(opcodes(&fused), vec![RawOpcode::Strlen, RawOpcode::Return]);

    let plain = EncoderOptions { fuse_intrinsics: false, ..EncoderOptions::default() };
    let call = encode(&function, &NoCallees, plain).unwrap();
    assert_eq!(opcodes(&call)[..3], [RawOpcode::InitFcallByName, RawOpcode::SendVarEx, RawOpcode::DoFcallByName]);
    assert_eq!(decode(&call).unwrap(), function);
  }

  #[test]
  fn test_jumps_follow_edits() {
    let mut function = decode_text(
      ".function f\n.vars a\n  JMPZ CV0, #2\n  ECHO \"yes\"\n  RETURN null\n",
    );
    let echo = function.body()[1];
    function.insert_before(echo, Op::new(0, OpKind::Echo { value: Operand::string("first") }));
    let raw = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(raw.opcodes[0].op2, RawOperand::Unused(3));
    assert_eq!(raw.opcodes[3].opcode, RawOpcode::Return);
  }

  #[test]
  fn test_this_and_globals_are_fetched() {
    let mut function = Function::new("m");
    function.scope = Some("C".into());
    let globals = function.globals_var();
    let this = function.this_var();
    let fetch = function.push(Op::new(1, OpKind::FetchRead {
      var    : Operand::Var(globals),
      target : FetchTarget::Dim(Operand::string("x")),
    }));
    let sum = function.push(Op::new(1, OpKind::Binary {
      op     : BinaryOp::Add,
      lhs    : Operand::Stack(fetch),
      rhs    : Operand::Const(Value::Long(1)),
      assign : None,
    }));
    function.push(Op::new(2, OpKind::Assign {
      var    : Operand::Var(this),
      target : FetchTarget::Property(Operand::string("total")),
      value  : Operand::Temporary(sum),
      by_ref : false,
    }));
    function.push(Op::new(3, OpKind::Return { value: Operand::Const(Value::Null) }));

    let raw = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(opcodes(&raw), vec![
      RawOpcode::FetchGlobals,
      RawOpcode::FetchDimR,
      RawOpcode::Add,
      RawOpcode::AssignObj,
      RawOpcode::OpData,
      RawOpcode::Return,
    ]);
    assert_eq!(raw.opcodes[3].op1, RawOperand::Unused(0));
    assert!(raw.vars.is_empty());
    assert_eq!(decode(&raw).unwrap(), function);
  }

  #[test]
  fn test_refusals() {
    let mut function = decode_text(".function f\n  RETURN null\n");
    let ret = function.body()[0];
    function.insert_before(ret, Op::new(1, OpKind::Binary {
      op     : BinaryOp::Add,
      lhs    : Operand::Const(Value::Long(1)),
      rhs    : Operand::Const(Value::Long(2)),
      assign : None,
    }));
    assert!(matches!(encode(&function, &NoCallees, EncoderOptions::default()), Err(EncodeError::Invariant(_))));

    let mut function = decode_text(".function f\n  RETURN null\n");
    let ret = function.body()[0];
    function.insert_before(ret, Op::new(1, OpKind::DeclareLambda { name: "{closure}".into() }));
    function.replace(ret, OpKind::Return { value: Operand::Temporary(OpId(1)) });
    assert!(matches!(
      encode(&function, &NoCallees, EncoderOptions::default()),
      Err(EncodeError::UnknownClosure { .. })
    ));
  }
}
