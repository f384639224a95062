/*!
  Raw op array to canonical IR.

  The decoder walks the op array once, front to back. Temporary slots are tracked as they are
  written and read, which turns every `TMP`/`VAR` operand into a reference to the instruction
  that produced the value. Bookkeeping ops (`OP_DATA`, `FETCH_CLASS`, `FETCH_THIS`, rope starts,
  argument checks, receives) leave no instruction of their own: they are folded into the
  instruction that uses them, or into the parameter list. Debug markers are remembered and
  attached to the next instruction.

  Jump targets are raw op indices while decoding. Each raw index is mapped to the first
  instruction decoded at or after it, and the targets are rewritten once the whole array has
  been seen.
*/

use std::collections::HashMap;

use string_cache::DefaultAtom;
use tracing::{debug, instrument, trace};

use crate::error::DecodeError;
use crate::ir::{
  validate, BinaryOp, CastType, ConstExpr, DebugMarker, DeclareMode, FetchTarget, Function,
  FunctionFlags, IncludeMode, JumpCondition, Op, OpId, OpKind, Operand, Param, Referent, UnaryOp,
  ValueKind, VarId,
};
use crate::raw::{
  RawFunction, RawOp, RawOpcode, RawOperand, SlotNumberType, ARRAY_ELEMENT_REF, BIND_REF,
  CONSTANT_UNQUALIFIED, FETCH_CLASS_PARENT, FETCH_CLASS_SELF, FETCH_CLASS_STATIC, FETCH_GLOBAL,
  ISEMPTY, IS_FALSE, IS_NULL, IS_TRUE, LAST_CATCH, NO_ENCLOSING_TRY,
};
use crate::value::{ArrayKey, Value};
use crate::variants::{self, Access, Family};

/// What a temporary slot holds at the current point of the walk.
#[derive(Clone, Debug, PartialEq)]
enum Slot {
  /// A value not consumed yet.
  Live { writer: OpId, kind: ValueKind },
  /// A value that has been consumed; later reads only observe it.
  Consumed(OpId),
  /// A class fetched by `FETCH_CLASS`, to be folded into its user.
  Class(Operand),
  This,
  Globals,
  /// A rope under construction and the concatenation so far.
  Rope(Operand),
  /// A foreach iterator.
  Iterator(OpId),
  /// The return address a `FAST_CALL` leaves for its finally block.
  FastCall,
}

/// The finally block of a try table row, as raw op indices.
struct Finally {
  row   : usize,
  start : usize,
  /// The `FAST_RET`.
  end   : usize,
}

/// Decodes one function. The result satisfies `validate`.
#[instrument(level = "debug", skip(raw), fields(function = %raw.qualified_name()))]
pub fn decode(raw: &RawFunction) -> Result<Function, DecodeError> {
  let mut decoder = Decoder::new(raw)?;
  let mut index = 0;
  while index < raw.opcodes.len() {
    decoder.index = index;
    decoder.open_try_regions();
    decoder.decode_op(&raw.opcodes[index])?;
    index += 1;
  }
  decoder.finish()
}

struct Decoder<'r> {
  raw           : &'r RawFunction,
  function      : Function,
  /// The raw op being decoded.
  index         : usize,
  slots         : HashMap<SlotNumberType, Slot>,
  /// The first instruction decoded at or after each raw index.
  raw_to_ir     : Vec<Option<OpId>>,
  unmapped_from : usize,
  markers       : Vec<DebugMarker>,
  /// Raw index of a region's first op, to the try table rows starting there.
  try_starts    : HashMap<usize, Vec<usize>>,
  /// Try table row to its `Try` marker.
  try_markers   : HashMap<usize, OpId>,
  /// Raw index of a `CATCH` to the try table row it handles.
  catch_regions : HashMap<usize, usize>,
  finally       : Vec<Finally>,
}

impl<'r> Decoder<'r> {
  fn new(raw: &'r RawFunction) -> Result<Decoder<'r>, DecodeError> {
    let mut function = Function::new(&raw.name);
    function.scope = raw.scope.clone();
    function.flags = FunctionFlags {
      generator   : raw.is_generator(),
      returns_ref : raw.returns_reference(),
      is_static   : raw.is_static(),
      uses_this   : raw.uses_this(),
    };
    for name in &raw.vars {
      function.vars.intern(name);
    }
    function.closures = raw.closures.clone();

    let mut decoder = Decoder {
      raw,
      function,
      index         : 0,
      slots         : HashMap::new(),
      raw_to_ir     : vec![None; raw.opcodes.len()],
      unmapped_from : 0,
      markers       : Vec::new(),
      try_starts    : HashMap::new(),
      try_markers   : HashMap::new(),
      catch_regions : HashMap::new(),
      finally       : Vec::new(),
    };
    decoder.scan_try_table()?;
    Ok(decoder)
  }

  // region Bookkeeping

  fn unsupported(&self, reason: &str) -> DecodeError {
    DecodeError::UnsupportedConstruct {
      index  : self.index,
      opcode : self.raw.opcodes.get(self.index).map_or(RawOpcode::Nop, |op| op.opcode),
      reason : reason.to_string(),
    }
  }

  fn malformed(&self, reason: &str) -> DecodeError {
    DecodeError::Malformed { index: self.index, reason: reason.to_string() }
  }

  fn line(&self) -> u32 {
    self.raw.opcodes.get(self.index).map_or(0, |op| op.lineno)
  }

  /// Appends an instruction for the current raw op. Pending debug markers go to it, unless it is
  /// a try marker, which emits nothing for them to precede.
  fn push(&mut self, kind: OpKind) -> OpId {
    let mut op = Op::new(self.line(), kind);
    if !matches!(op.kind, OpKind::Try) {
      op.markers = std::mem::take(&mut self.markers);
    }
    trace!(index = self.index, op = %op, "decoded");
    let id = self.function.push(op);
    for entry in &mut self.raw_to_ir[self.unmapped_from..=self.index] {
      entry.get_or_insert(id);
    }
    self.unmapped_from = self.index + 1;
    id
  }

  fn this(&mut self) -> Operand {
    Operand::Var(self.function.this_var())
  }

  fn globals(&mut self) -> Operand {
    Operand::Var(self.function.globals_var())
  }

  fn literal(&self, index: SlotNumberType) -> Result<Value, DecodeError> {
    self.raw.literal(index).cloned().ok_or_else(|| self.malformed("literal index out of range"))
  }

  fn string_literal(&self, operand: RawOperand) -> Result<DefaultAtom, DecodeError> {
    match operand {
      RawOperand::Const(index) => match self.literal(index)? {
        Value::String(text) => Ok(DefaultAtom::from(text.as_str())),
        _ => Err(self.malformed("expected a string literal")),
      },
      _ => Err(self.malformed("expected a string literal")),
    }
  }

  fn cv(&self, operand: RawOperand) -> Result<VarId, DecodeError> {
    match operand {
      RawOperand::Cv(index) if (index as usize) < self.raw.vars.len() => Ok(VarId(index)),
      RawOperand::Cv(_) => Err(self.malformed("compiled variable out of range")),
      _ => Err(self.malformed("expected a compiled variable")),
    }
  }

  // endregion

  // region Operands

  /// Reads an input operand, consuming the value in a temporary slot.
  fn consume(&mut self, operand: RawOperand) -> Result<Operand, DecodeError> {
    let slot = match operand {
      RawOperand::Unused(n) => return Ok(Operand::Unused(n)),
      RawOperand::Const(index) => return Ok(Operand::Const(self.literal(index)?)),
      RawOperand::Cv(_) => return Ok(Operand::Var(self.cv(operand)?)),
      RawOperand::Tmp(slot) | RawOperand::Var(slot) => slot,
    };
    match self.slots.get(&slot).cloned() {
      Some(Slot::Live { writer, kind }) => {
        self.slots.insert(slot, Slot::Consumed(writer));
        Ok(kind.operand(writer))
      }
      Some(Slot::Class(class)) => {
        self.slots.remove(&slot);
        Ok(class)
      }
      Some(Slot::This) => Ok(self.this()),
      Some(Slot::Globals) => Ok(self.globals()),
      Some(Slot::Consumed(_)) => Err(self.malformed("reads a value that has already been consumed")),
      Some(Slot::Rope(_)) => Err(self.malformed("reads an unfinished rope")),
      Some(Slot::Iterator(_)) => Err(self.malformed("reads a foreach iterator as a value")),
      Some(Slot::FastCall) => Err(self.malformed("reads the return address of a finally block as a value")),
      None => Err(self.malformed("reads a temporary that was never written")),
    }
  }

  /// Reads an input operand without consuming it.
  fn observe(&mut self, operand: RawOperand) -> Result<Operand, DecodeError> {
    if let Some(slot) = operand.slot() {
      if let Some(Slot::Live { writer, .. } | Slot::Consumed(writer)) = self.slots.get(&slot) {
        return Ok(Operand::Ref(*writer));
      }
      if let Some(Slot::Class(class)) = self.slots.get(&slot) {
        return Ok(class.clone());
      }
    }
    self.consume(operand)
  }

  /// The operand of a `FREE`, which may release a value that an earlier path already consumed.
  fn free(&mut self, operand: RawOperand) -> Result<Operand, DecodeError> {
    if let Some(slot) = operand.slot() {
      if let Some(Slot::Consumed(writer)) = self.slots.get(&slot) {
        return Ok(Operand::Ref(*writer));
      }
    }
    self.consume(operand)
  }

  /// A class operand: a name, a fetched class, or `self`/`parent`/`static` as a fetch type.
  fn class(&mut self, operand: RawOperand) -> Result<Operand, DecodeError> {
    match operand {
      RawOperand::Unused(FETCH_CLASS_SELF) => Ok(Operand::string("self")),
      RawOperand::Unused(FETCH_CLASS_PARENT) => Ok(Operand::string("parent")),
      RawOperand::Unused(FETCH_CLASS_STATIC) => Ok(Operand::string("static")),
      RawOperand::Unused(_) => Err(self.malformed("unknown class fetch type")),
      _ => self.consume(operand),
    }
  }

  /// Op1 of an object access, where `UNUSED` is the current object.
  fn object(&mut self, op: &RawOp) -> Result<Operand, DecodeError> {
    if op.op1.is_unused() && op.opcode.op1_may_be_this() {
      Ok(self.this())
    } else {
      self.consume(op.op1)
    }
  }

  /// Optional operand: `UNUSED` means absent.
  fn optional(&mut self, operand: RawOperand) -> Result<Option<Operand>, DecodeError> {
    match operand {
      RawOperand::Unused(_) => Ok(None),
      _ => self.consume(operand).map(Some),
    }
  }

  /// The value carried by the `OP_DATA` that follows the current op.
  fn op_data(&mut self) -> Result<Operand, DecodeError> {
    match self.raw.opcodes.get(self.index + 1) {
      Some(data) if data.opcode == RawOpcode::OpData => self.consume(data.op1),
      _ => Err(self.malformed("missing OP_DATA")),
    }
  }

  fn write(&mut self, operand: RawOperand, id: OpId, kind: ValueKind) -> Result<(), DecodeError> {
    match operand {
      RawOperand::Unused(_) => Ok(()),
      RawOperand::Tmp(slot) | RawOperand::Var(slot) => {
        if let Some(Slot::Live { writer, .. }) = self.slots.get(&slot) {
          let previous = *writer;
          if let Some(op) = self.function.get_mut(id) {
            op.continues = Some(previous);
          }
        }
        self.slots.insert(slot, Slot::Live { writer: id, kind });
        Ok(())
      }
      _ => Err(self.malformed("result is not a temporary")),
    }
  }

  /// Records the result of the instruction just pushed.
  fn result(&mut self, op: &RawOp, id: OpId) -> Result<(), DecodeError> {
    if op.result.is_unused() {
      return Ok(());
    }
    match self.function[id].kind.outputs().first() {
      Some(output) => self.write(op.result, id, output.kind),
      None => Err(self.malformed("op has a result but its instruction produces no value")),
    }
  }

  fn slot_state(&self, operand: RawOperand) -> Option<Slot> {
    operand.slot().and_then(|slot| self.slots.get(&slot).cloned())
  }

  // endregion

  // region Try/catch

  fn scan_try_table(&mut self) -> Result<(), DecodeError> {
    let opcodes = &self.raw.opcodes;
    for (row, element) in self.raw.try_catch.iter().enumerate() {
      let try_op = element.try_op as usize;
      if try_op >= opcodes.len() {
        return Err(DecodeError::Malformed { index: try_op, reason: "try region out of range".to_string() });
      }
      if element.finally_op != 0 {
        let (start, end) = (element.finally_op as usize, element.finally_end as usize);
        if start <= try_op || end < start || opcodes.get(end).map(|op| op.opcode) != Some(RawOpcode::FastRet) {
          return Err(DecodeError::Malformed { index: end, reason: "finally block does not end in FAST_RET".to_string() });
        }
        self.finally.push(Finally { row, start, end });
      } else if element.catch_op == 0 {
        return Err(DecodeError::Malformed { index: try_op, reason: "try region without catch or finally".to_string() });
      }
      self.try_starts.entry(try_op).or_default().push(row);
      if element.catch_op == 0 {
        continue;
      }

      let mut at = element.catch_op as usize;
      loop {
        match opcodes.get(at) {
          Some(catch) if catch.opcode == RawOpcode::Catch && !self.catch_regions.contains_key(&at) => {
            self.catch_regions.insert(at, row);
            if catch.extended_value & LAST_CATCH != 0 {
              break;
            }
            at = catch.op2.num() as usize;
          }
          _ => {
            return Err(DecodeError::Malformed {
              index  : at,
              reason : "catch chain leads to a non-CATCH op or loops".to_string(),
            });
          }
        }
      }
    }
    Ok(())
  }

  /// Inserts the try markers of the regions starting at the current op, in table order.
  fn open_try_regions(&mut self) {
    if let Some(rows) = self.try_starts.remove(&self.index) {
      for row in rows {
        let id = self.push(OpKind::Try);
        self.try_markers.insert(row, id);
      }
    }
  }

  /// The try marker of the innermost finally block `matches` accepts.
  fn finally_region(&self, matches: impl Fn(&Finally) -> bool) -> Result<OpId, DecodeError> {
    self
      .finally
      .iter()
      .filter(|finally| matches(finally))
      .max_by_key(|finally| finally.start)
      .and_then(|finally| self.try_markers.get(&finally.row))
      .copied()
      .ok_or_else(|| self.malformed("no finally block of an open try region belongs here"))
  }

  /// Checks that `operand` holds the return address of a finally block.
  fn return_address(&self, operand: RawOperand) -> Result<(), DecodeError> {
    match self.slot_state(operand) {
      Some(Slot::FastCall) => Ok(()),
      _ => Err(self.malformed("expected the return address left by FAST_CALL")),
    }
  }

  // endregion

  fn decode_op(&mut self, op: &RawOp) -> Result<(), DecodeError> {
    use RawOpcode::*;

    if let Some(marker) = variants::marker(op.opcode) {
      self.markers.push(marker);
      return Ok(());
    }
    if let Some((family, access)) = variants::access_of(op.opcode) {
      return self.decode_access(op, family, access);
    }
    if let Some(binary) = variants::binary_op(op.opcode) {
      let lhs = self.consume(op.op1)?;
      let rhs = self.consume(op.op2)?;
      let id = self.push(OpKind::Binary { op: binary, lhs, rhs, assign: None });
      return self.result(op, id);
    }
    if let Some(name) = variants::intrinsic_name(op.opcode) {
      return self.decode_intrinsic(op, name);
    }
    if let Some(condition) = variants::jump_condition(op.opcode) {
      let value = match condition {
        JumpCondition::Null => self.observe(op.op1)?,
        _ => self.consume(op.op1)?,
      };
      let id = self.push(OpKind::CondJmp { condition, value, target: OpId(op.op2.num()) });
      return self.result(op, id);
    }

    match op.opcode {
      Nop | ExtNop => {
        self.push(OpKind::Nop { ext: op.opcode == ExtNop });
      }

      // Dropped: regenerated by the encoder, or consumed by a neighbour.
      OpData | CheckFuncArg | CheckUndefArgs | GeneratorCreate => {}

      BwNot | BoolNot => {
        let arg = self.consume(op.op1)?;
        let unary = if op.opcode == BwNot { UnaryOp::BwNot } else { UnaryOp::BoolNot };
        let id = self.push(OpKind::Unary { op: unary, arg });
        self.result(op, id)?;
      }
      Bool | Cast => {
        let to = match op.opcode {
          Bool => CastType::Bool,
          _ => variants::cast_type(op.extended_value).ok_or_else(|| self.malformed("unknown cast type"))?,
        };
        let arg = self.consume(op.op1)?;
        let id = self.push(OpKind::Cast { to, arg });
        self.result(op, id)?;
      }
      TypeCheck => self.decode_type_check(op)?,
      QmAssign => {
        let value = self.consume(op.op1)?;
        let id = self.push(OpKind::QmAssign { value });
        self.result(op, id)?;
      }

      RopeInit => {
        let part = self.consume(op.op2)?;
        let slot = op.result.slot().ok_or_else(|| self.malformed("rope result is not a temporary"))?;
        self.slots.insert(slot, Slot::Rope(part));
      }
      RopeAdd | RopeEnd => {
        let acc = match self.slot_state(op.op1) {
          Some(Slot::Rope(acc)) => acc,
          _ => return Err(self.malformed("rope continued without ROPE_INIT")),
        };
        let part = self.consume(op.op2)?;
        let id = self.push(OpKind::Binary { op: BinaryOp::Concat, lhs: acc, rhs: part, assign: None });
        if op.opcode == RopeAdd {
          let slot = op.result.slot().ok_or_else(|| self.malformed("rope result is not a temporary"))?;
          self.slots.insert(slot, Slot::Rope(Operand::Temporary(id)));
        } else {
          if let Some(slot) = op.op1.slot() {
            self.slots.remove(&slot);
          }
          self.write(op.result, id, ValueKind::Temporary)?;
        }
      }

      Jmp => {
        self.push(OpKind::Jmp { target: OpId(op.op1.num()) });
      }
      Case | CaseStrict => {
        let subject = self.observe(op.op1)?;
        let compare = self.consume(op.op2)?;
        let id = self.push(OpKind::Case { subject, compare, strict: op.opcode == CaseStrict });
        self.result(op, id)?;
      }
      MatchError => {
        let subject = self.observe(op.op1)?;
        self.push(OpKind::MatchError { subject });
      }
      CheckVar => {
        let var = self.consume(op.op1)?;
        self.push(OpKind::CheckVar { var });
      }
      AssertCheck => {
        let id = self.push(OpKind::AssertCheck { target: OpId(op.op2.num()) });
        self.result(op, id)?;
      }

      InitFcall | InitFcallByName => {
        let name = self.string_literal(op.op2)?;
        let qualified = if name.starts_with('\\') { name.to_string() } else { format!("\\{}", name) };
        self.push(OpKind::InitFcall { function: Operand::string(&qualified) });
      }
      InitNsFcallByName => {
        let name = self.string_literal(op.op2)?;
        if !name.contains('\\') || name.starts_with('\\') {
          return Err(self.malformed("namespaced call without a namespace-relative name"));
        }
        self.push(OpKind::InitFcall { function: Operand::string(&name) });
      }
      InitDynamicCall => {
        let function = self.consume(op.op2)?;
        self.push(OpKind::InitFcall { function });
      }
      InitMethodCall => {
        let object = self.object(op)?;
        let method = self.consume(op.op2)?;
        self.push(OpKind::InitMethodCall { object, method });
      }
      InitStaticMethodCall => {
        let class = self.class(op.op1)?;
        let method = self.consume(op.op2)?;
        self.push(OpKind::InitStaticMethodCall { class, method });
      }
      New => {
        let class = self.class(op.op1)?;
        let id = self.push(OpKind::New { class });
        self.result(op, id)?;
      }
      InitUserCall => {
        let name = self.string_literal(op.op1)?;
        let callable = self.consume(op.op2)?;
        self.push(OpKind::InitFcall { function: Operand::string(&format!("\\{}", name)) });
        self.push(OpKind::Send { value: callable });
      }
      SendVal | SendValEx | SendVar | SendVarEx | SendRef | SendVarNoRef | SendVarNoRefEx
      | SendFuncArg | SendUser => {
        if matches!(op.op2, RawOperand::Const(_)) {
          return Err(self.unsupported("named arguments are not supported"));
        }
        let value = self.consume(op.op1)?;
        self.push(OpKind::Send { value });
      }
      SendUnpack => {
        let value = self.consume(op.op1)?;
        self.push(OpKind::SendUnpack { value });
      }
      SendArray => self.decode_send_array(op)?,
      DoFcall | DoIcall | DoUcall | DoFcallByName => {
        let id = self.push(OpKind::DoFcall);
        self.result(op, id)?;
      }
      CallableConvert => {
        let id = self.push(OpKind::CallableConvert);
        self.result(op, id)?;
      }

      BeginSilence => {
        let id = self.push(OpKind::BeginSilence);
        self.result(op, id)?;
      }
      EndSilence => {
        let value = self.consume(op.op1)?;
        self.push(OpKind::EndSilence { value });
      }
      Return | ReturnByRef | GeneratorReturn => {
        let value = self.consume(op.op1)?;
        self.push(OpKind::Return { value });
      }
      Free => {
        let value = self.free(op.op1)?;
        self.push(OpKind::Free { value });
      }
      IncludeOrEval => {
        let mode: IncludeMode =
          variants::include_mode(op.extended_value).ok_or_else(|| self.malformed("unknown include mode"))?;
        let arg = self.consume(op.op1)?;
        let id = self.push(OpKind::IncludeOrEval { arg, mode });
        self.result(op, id)?;
      }
      Exit => {
        let value = self.optional(op.op1)?;
        self.push(OpKind::Exit { value });
      }
      Echo => {
        let value = self.consume(op.op1)?;
        self.push(OpKind::Echo { value });
      }

      InitArray => {
        let value = self.optional(op.op1)?;
        let key = self.optional(op.op2)?;
        let by_ref = op.extended_value & ARRAY_ELEMENT_REF != 0;
        let id = self.push(OpKind::InitArray { value, key, by_ref });
        self.result(op, id)?;
      }
      AddArrayElement | AddArrayUnpack => {
        let array = match self.slot_state(op.result) {
          Some(Slot::Live { writer, .. }) if matches!(self.function[writer].kind, OpKind::InitArray { .. }) => writer,
          _ => return Err(self.malformed("array element added outside of an array initialization")),
        };
        let value = self.consume(op.op1)?;
        if op.opcode == AddArrayUnpack {
          self.push(OpKind::AddArrayUnpack { array, value });
        } else {
          let key = self.optional(op.op2)?;
          let by_ref = op.extended_value & ARRAY_ELEMENT_REF != 0;
          self.push(OpKind::AddArrayElement { array, value, key, by_ref });
        }
      }

      FeResetR | FeResetRw => {
        let value = self.consume(op.op1)?;
        let id = self.push(OpKind::FeReset {
          value,
          by_ref : op.opcode == FeResetRw,
          exit   : OpId(op.op2.num()),
        });
        let slot = op.result.slot().ok_or_else(|| self.malformed("iterator is not a temporary"))?;
        self.slots.insert(slot, Slot::Iterator(id));
      }
      FeFetchR | FeFetchRw => {
        let reset = self.iterator(op.op1)?;
        let value = match op.op2 {
          RawOperand::Cv(_) => Some(self.cv(op.op2)?),
          _ => None,
        };
        let id = self.push(OpKind::FeFetch { reset, value, exit: OpId(op.extended_value) });
        if value.is_none() {
          self.write(op.op2, id, ValueKind::Unnamed)?;
        }
        self.write(op.result, id, ValueKind::Temporary)?;
      }
      FeFree => {
        let reset = self.iterator(op.op1)?;
        self.push(OpKind::FeFree { reset });
      }

      FetchListR | FetchListW => {
        let var = self.observe(op.op1)?;
        let dim = self.consume(op.op2)?;
        let id = self.push(OpKind::FetchList { var, dim, by_ref: op.opcode == FetchListW });
        self.result(op, id)?;
      }
      MakeRef | Separate => {
        let var = self.consume(op.op1)?;
        let kind = if op.opcode == MakeRef { OpKind::MakeRef { var } } else { OpKind::Separate { var } };
        let id = self.push(kind);
        self.result(op, id)?;
      }
      IssetIsemptyThis => {
        let var = self.this();
        let id = self.push(OpKind::Isset {
          var,
          target : FetchTarget::None,
          empty  : op.extended_value & ISEMPTY != 0,
        });
        self.result(op, id)?;
      }

      FetchClass => {
        let class = match op.op2 {
          RawOperand::Unused(_) => self.class(op.op1)?,
          _ => self.consume(op.op2)?,
        };
        self.fold_into_result(op, Slot::Class(class))?;
      }
      FetchThis => self.fold_into_result(op, Slot::This)?,
      FetchGlobals => self.fold_into_result(op, Slot::Globals)?,
      FetchConstant => {
        let name = self.string_literal(op.op2)?;
        let name = if op.op1.num() & CONSTANT_UNQUALIFIED != 0 || name.starts_with('\\') {
          name
        } else {
          DefaultAtom::from(format!("\\{}", name).as_str())
        };
        let id = self.push(OpKind::FetchConstant { name });
        self.result(op, id)?;
      }
      FetchClassConstant => {
        let class = self.class(op.op1)?;
        let name = self.string_literal(op.op2)?;
        let id = self.push(OpKind::FetchClassConstant { class, name });
        self.result(op, id)?;
      }
      FetchClassName => {
        let class = self.class(op.op1)?;
        let id = self.push(OpKind::FetchClassName { class });
        self.result(op, id)?;
      }

      Catch => {
        let class = self.string_literal(op.op1)?;
        let var = match op.result {
          RawOperand::Unused(_) => None,
          _ => Some(self.cv(op.result)?),
        };
        let next = if op.extended_value & LAST_CATCH != 0 { self.index + 1 } else { op.op2.num() as usize };
        let try_op = self
          .catch_regions
          .get(&self.index)
          .and_then(|row| self.try_markers.get(row))
          .copied()
          .ok_or_else(|| self.malformed("CATCH outside of any try region"))?;
        self.push(OpKind::Catch { try_op, class, var, next: OpId(next as u32) });
      }
      Throw => {
        let value = self.consume(op.op1)?;
        self.push(OpKind::Throw { value });
      }
      Clone => {
        let value = self.object(op)?;
        let id = self.push(OpKind::Clone { value });
        self.result(op, id)?;
      }
      Instanceof => {
        let object = self.consume(op.op1)?;
        let class = self.class(op.op2)?;
        let id = self.push(OpKind::Instanceof { object, class });
        self.result(op, id)?;
      }

      DeclareFunction => {
        let name = self.string_literal(op.op1)?;
        self.push(OpKind::DeclareFunction { name });
      }
      DeclareLambdaFunction => {
        let name = self
          .raw
          .closures
          .get(op.op2.num() as usize)
          .cloned()
          .ok_or_else(|| self.malformed("closure index out of range"))?;
        let id = self.push(OpKind::DeclareLambda { name });
        self.result(op, id)?;
      }
      DeclareClass | DeclareClassDelayed | DeclareAnonClass => {
        let name = self.string_literal(op.op1)?;
        let parent = match op.op2 {
          RawOperand::Unused(_) => None,
          _ => Some(self.string_literal(op.op2)?),
        };
        let mode = match op.opcode {
          DeclareClass => DeclareMode::Eager,
          DeclareClassDelayed => DeclareMode::Delayed,
          _ => DeclareMode::Anonymous,
        };
        let id = self.push(OpKind::DeclareClass { name, parent, mode });
        self.result(op, id)?;
      }

      Yield => {
        let value = self.optional(op.op1)?;
        let key = self.optional(op.op2)?;
        let id = self.push(OpKind::Yield { value, key });
        self.result(op, id)?;
      }
      YieldFrom => {
        let value = self.consume(op.op1)?;
        let id = self.push(OpKind::YieldFrom { value });
        self.result(op, id)?;
      }
      CopyTmp => {
        let value = self.observe(op.op1)?;
        let id = self.push(OpKind::CopyTmp { value });
        self.result(op, id)?;
      }

      BindGlobal => {
        let var = self.cv(op.op1)?;
        let name = self.string_literal(op.op2)?;
        self.push(OpKind::BindGlobal { var, name });
      }
      BindLexical => {
        let closure = match self.slot_state(op.op1) {
          Some(Slot::Live { writer, .. }) if matches!(self.function[writer].kind, OpKind::DeclareLambda { .. }) => writer,
          _ => return Err(self.malformed("lexical variable bound to something other than a closure")),
        };
        let var = self.cv(op.op2)?;
        self.push(OpKind::BindLexical { closure, var, by_ref: op.extended_value & BIND_REF != 0 });
      }
      BindStatic => {
        let var = self.cv(op.op1)?;
        self.push(OpKind::BindStatic { var, by_ref: op.extended_value & BIND_REF != 0 });
      }

      Recv | RecvInit | RecvVariadic => self.decode_receive(op)?,

      FastCall => {
        let target = op.op1.num() as usize;
        let try_op = self.finally_region(|finally| finally.start == target)?;
        let returning = match op.op2 {
          RawOperand::Unused(_) => None,
          _ => Some(self.observe(op.op2)?),
        };
        let slot = op.result.slot().ok_or_else(|| self.malformed("return address is not a temporary"))?;
        self.push(OpKind::FastCall { try_op, target: OpId(target as u32), returning });
        self.slots.insert(slot, Slot::FastCall);
      }
      DiscardException => {
        self.return_address(op.op1)?;
        let index = self.index;
        let try_op = self.finally_region(|finally| finally.start <= index && index < finally.end)?;
        self.push(OpKind::DiscardException { try_op });
      }
      FastRet => {
        self.return_address(op.op1)?;
        let index = self.index;
        let try_op = self.finally_region(|finally| finally.end == index)?;
        let outer = match op.op2.num() {
          NO_ENCLOSING_TRY => None,
          row => Some(
            self
              .try_markers
              .get(&(row as usize))
              .copied()
              .ok_or_else(|| self.malformed("FAST_RET names a try region that is not open"))?,
          ),
        };
        self.push(OpKind::FastRet { try_op, outer });
      }
      SwitchLong | SwitchString | Match => return Err(self.unsupported("jump tables are not supported")),
      Ticks => return Err(self.unsupported("declare(ticks) is not supported")),
      VerifyReturnType => return Err(self.unsupported("return type verification is not supported")),
      DeclareConst => return Err(self.unsupported("constant declarations are not supported")),

      _ => return Err(self.unsupported("no canonical form")),
    }
    Ok(())
  }

  // region Families

  fn decode_access(&mut self, op: &RawOp, family: Family, access: Access) -> Result<(), DecodeError> {
    let (var, target) = match access {
      Access::Plain => (self.object(op)?, FetchTarget::None),
      Access::Name => {
        let name = self.consume(op.op1)?;
        let scope = if op.extended_value & FETCH_GLOBAL != 0 { self.globals() } else { Operand::Unused(0) };
        (scope, FetchTarget::Name(name))
      }
      Access::Dim | Access::Property => {
        let var = self.object(op)?;
        let operand = self.consume(op.op2)?;
        (var, access.target(operand))
      }
      Access::StaticProperty => {
        let property = self.consume(op.op1)?;
        let class = self.class(op.op2)?;
        (class, FetchTarget::StaticProperty(property))
      }
    };

    let kind = match family {
      Family::Fetch(mode) if mode.is_read() => OpKind::FetchRead { var, target },
      Family::Fetch(_) => OpKind::FetchWrite { var, target },
      Family::Assign | Family::AssignRef => {
        let value = if access == Access::Plain { self.consume(op.op2)? } else { self.op_data()? };
        OpKind::Assign { var, target, value, by_ref: family == Family::AssignRef }
      }
      Family::AssignOp => {
        let binary = u8::try_from(op.extended_value)
          .ok()
          .and_then(|code| RawOpcode::try_from(code).ok())
          .and_then(variants::binary_op)
          .ok_or_else(|| self.malformed("compound assignment with an unknown operator"))?;
        let value = if access == Access::Plain { self.consume(op.op2)? } else { self.op_data()? };
        OpKind::Binary { op: binary, lhs: var, rhs: value, assign: Some(target) }
      }
      Family::IncDec(inc_dec) => OpKind::IncDec { op: inc_dec, var, target },
      Family::Unset => OpKind::Unset { var, target },
      Family::Isset => OpKind::Isset { var, target, empty: op.extended_value & ISEMPTY != 0 },
    };
    let id = self.push(kind);
    self.result(op, id)
  }

  /// Builtin opcodes become a call of the builtin.
  fn decode_intrinsic(&mut self, op: &RawOp, name: &str) -> Result<(), DecodeError> {
    use RawOpcode::*;

    let mut args = Vec::new();
    match op.opcode {
      GetCalledClass | FuncNumArgs => {}
      GetClass => args.extend(self.optional(op.op1)?),
      FuncGetArgs if op.op1.is_unused() => {}
      FuncGetArgs => return Err(self.unsupported("func_get_args with an offset is not supported")),
      InArray => {
        args.push(self.consume(op.op1)?);
        args.push(Operand::Const(self.haystack(op.op2)?));
        if op.extended_value != 0 {
          args.push(Operand::Const(Value::Bool(true)));
        }
      }
      ArrayKeyExists => {
        args.push(self.consume(op.op1)?);
        args.push(self.consume(op.op2)?);
      }
      _ => args.push(self.consume(op.op1)?),
    }
    self.push_call(op, name, args)
  }

  /// `IN_ARRAY` keeps its haystack as a set: the values are the keys of the literal.
  fn haystack(&self, operand: RawOperand) -> Result<Value, DecodeError> {
    let set = match operand {
      RawOperand::Const(index) => self.literal(index)?,
      _ => return Err(self.malformed("IN_ARRAY haystack is not a literal")),
    };
    match set {
      Value::Array(elements) => Ok(Value::Array(
        elements
          .into_iter()
          .enumerate()
          .map(|(position, (key, _))| {
            let value = match key {
              ArrayKey::Long(l) => Value::Long(l),
              ArrayKey::String(s) => Value::String(s),
            };
            (ArrayKey::Long(position as i64), value)
          })
          .collect(),
      )),
      _ => Err(self.malformed("IN_ARRAY haystack is not an array")),
    }
  }

  fn decode_type_check(&mut self, op: &RawOp) -> Result<(), DecodeError> {
    let value = self.consume(op.op1)?;
    let constant = match op.extended_value {
      IS_NULL => Some(Value::Null),
      IS_FALSE => Some(Value::Bool(false)),
      IS_TRUE => Some(Value::Bool(true)),
      _ => None,
    };
    match constant {
      Some(constant) => {
        let id = self.push(OpKind::Binary {
          op     : BinaryOp::IsIdentical,
          lhs    : value,
          rhs    : Operand::Const(constant),
          assign : None,
        });
        self.result(op, id)
      }
      None => {
        let name =
          variants::type_check_name(op.extended_value).ok_or_else(|| self.malformed("unknown type check"))?;
        self.push_call(op, name, vec![value])
      }
    }
  }

  /// `SEND_ARRAY` with a length sends `array_slice(array, offset, length)`.
  fn decode_send_array(&mut self, op: &RawOp) -> Result<(), DecodeError> {
    let array = self.consume(op.op1)?;
    if op.op2.is_unused() {
      self.push(OpKind::Send { value: array });
      return Ok(());
    }
    let length = self.consume(op.op2)?;
    self.push(OpKind::InitFcall { function: Operand::string("\\array_slice") });
    for value in [array, Operand::Const(Value::Long(op.extended_value as i64)), length] {
      self.push(OpKind::Send { value });
    }
    let slice = self.push(OpKind::DoFcall);
    self.push(OpKind::Send { value: Operand::Unnamed(slice) });
    Ok(())
  }

  /// Emits the canonical call `\name(args...)` with the result of `op`.
  fn push_call(&mut self, op: &RawOp, name: &str, args: Vec<Operand>) -> Result<(), DecodeError> {
    self.push(OpKind::InitFcall { function: Operand::string(&format!("\\{}", name)) });
    for value in args {
      self.push(OpKind::Send { value });
    }
    let id = self.push(OpKind::DoFcall);
    self.result(op, id)
  }

  fn decode_receive(&mut self, op: &RawOp) -> Result<(), DecodeError> {
    let arg_num = op.op1.num() as usize;
    let info = arg_num
      .checked_sub(1)
      .and_then(|index| self.raw.arg_info.get(index))
      .ok_or_else(|| self.malformed("receives an undeclared argument"))?;
    let default = match (op.opcode, op.op2) {
      (RawOpcode::RecvInit, RawOperand::Const(index)) => Some(match self.literal(index)? {
        Value::Ast(expr) => *expr,
        value => ConstExpr::Literal(value),
      }),
      (RawOpcode::RecvInit, _) => return Err(self.malformed("default value is not a literal")),
      _ => None,
    };
    let param = Param {
      var      : self.cv(op.result)?,
      default,
      by_ref   : info.by_ref,
      variadic : op.opcode == RawOpcode::RecvVariadic,
      line     : op.lineno,
    };
    self.function.params.push(param);
    Ok(())
  }

  // endregion

  fn iterator(&self, operand: RawOperand) -> Result<OpId, DecodeError> {
    match self.slot_state(operand) {
      Some(Slot::Iterator(reset)) => Ok(reset),
      _ => Err(self.malformed("expected a foreach iterator")),
    }
  }

  fn fold_into_result(&mut self, op: &RawOp, state: Slot) -> Result<(), DecodeError> {
    let slot = op.result.slot().ok_or_else(|| self.malformed("result is not a temporary"))?;
    self.slots.insert(slot, state);
    Ok(())
  }

  /// Rewrites raw jump targets to instructions and checks the result.
  fn finish(mut self) -> Result<Function, DecodeError> {
    self.function.trailing_markers = std::mem::take(&mut self.markers);

    let raw_to_ir = std::mem::take(&mut self.raw_to_ir);
    let body: Vec<OpId> = self.function.body().to_vec();
    for id in body {
      let mut unresolved = None;
      if let Some(op) = self.function.get_mut(id) {
        op.kind.visit_references_mut(&mut |target, referent| {
          if matches!(referent, Referent::Jump | Referent::CatchNext) {
            match raw_to_ir.get(target.index()).copied().flatten() {
              Some(resolved) => *target = resolved,
              None => unresolved = Some(target.index()),
            }
          }
        });
      }
      if let Some(index) = unresolved {
        return Err(DecodeError::Malformed { index, reason: "jump target is not an instruction".to_string() });
      }
    }

    validate(&self.function)?;
    debug!(ops = self.function.len(), params = self.function.params.len(), "decoded function");
    Ok(self.function)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Violation;
  use crate::raw::parse_assembly;

  fn decode_text(text: &str) -> Result<Function, DecodeError> {
    let functions = parse_assembly(text).expect("valid assembly");
    decode(&functions[0])
  }

  fn kinds(function: &Function) -> Vec<OpKind> {
    function.ops().map(|(_, op)| op.kind.clone()).collect()
  }

  #[test]
  fn test_values_become_references() {
    let function = decode_text(
      ".function f\n.vars a\n.arg a\n  RECV #1 -> CV0\n  ADD CV0, 1 -> T0\n  RETURN T0\n",
    )
    .unwrap();
    let ops = kinds(&function);
    assert_eq!(function.params.len(), 1);
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[1], OpKind::Return { value: Operand::Temporary(function.body()[0]) });
  }

  #[test]
  fn test_rope_becomes_concat_chain() {
    let function = decode_text(
      ".function f\n.vars a b\n  ROPE_INIT _, \"x\" -> T0 ext=4\n  ROPE_ADD T0, CV0 -> T0 ext=1\n  ROPE_ADD T0, \"y\" -> T0 ext=2\n  ROPE_END T0, CV1 -> T1 ext=3\n  ECHO T1\n  RETURN null\n",
    )
    .unwrap();
    let body = function.body().to_vec();
    let ops = kinds(&function);
    assert_eq!(ops.len(), 5);
    assert_eq!(ops[0], OpKind::Binary {
      op: BinaryOp::Concat,
      lhs: Operand::string("x"),
      rhs: Operand::Var(VarId(0)),
      assign: None,
    });
    assert_eq!(ops[1], OpKind::Binary {
      op: BinaryOp::Concat,
      lhs: Operand::Temporary(body[0]),
      rhs: Operand::string("y"),
      assign: None,
    });
    assert_eq!(ops[3], OpKind::Echo { value: Operand::Temporary(body[2]) });
  }

  #[test]
  fn test_ternary_writers_are_linked() {
    let function = decode_text(
      ".function f\n.vars a\n  JMPZ CV0, #3\n  QM_ASSIGN 1 -> T0\n  JMP #4\n  QM_ASSIGN 2 -> T0\n  RETURN T0\n",
    )
    .unwrap();
    let body = function.body().to_vec();
    assert_eq!(function[body[3]].continues, Some(body[1]));
    assert_eq!(function[body[4]].kind, OpKind::Return { value: Operand::Temporary(body[3]) });
    assert_eq!(function[body[0]].kind.references()[0].0, body[3]);
  }

  #[test]
  fn test_compound_dim_assignment_takes_op_data() {
    let function = decode_text(
      ".function f\n.vars a\n  ASSIGN_DIM_OP CV0, \"k\" ext=8\n  OP_DATA \"s\"\n  RETURN null\n",
    )
    .unwrap();
    assert_eq!(kinds(&function)[0], OpKind::Binary {
      op: BinaryOp::Concat,
      lhs: Operand::Var(VarId(0)),
      rhs: Operand::string("s"),
      assign: Some(FetchTarget::Dim(Operand::string("k"))),
    });
  }

  #[test]
  fn test_intrinsics_become_calls() {
    let function = decode_text(".function f\n.vars s\n  STRLEN CV0 -> T0\n  RETURN T0\n").unwrap();
    let body = function.body().to_vec();
    let ops = kinds(&function);
    assert_eq!(ops[0], OpKind::InitFcall { function: Operand::string("\\strlen") });
    assert_eq!(ops[1], OpKind::Send { value: Operand::Var(VarId(0)) });
    assert_eq!(ops[2], OpKind::DoFcall);
    assert_eq!(ops[3], OpKind::Return { value: Operand::Unnamed(body[2]) });
  }

  #[test]
  fn test_this_and_class_fetches_fold() {
    let function = decode_text(
      ".function C::m\n.scope C\n  FETCH_OBJ_R _, \"p\" -> T0\n  FETCH_CLASS #1 -> V1\n  NEW V1 -> V2\n  DO_FCALL\n  FREE V2\n  RETURN T0\n",
    )
    .unwrap();
    let this = function.vars.get_var("this").unwrap();
    let ops = kinds(&function);
    assert_eq!(ops[0], OpKind::FetchRead {
      var: Operand::Var(this),
      target: FetchTarget::Property(Operand::string("p")),
    });
    assert_eq!(ops[1], OpKind::New { class: Operand::string("self") });
  }

  #[test]
  fn test_catch_chain() {
    let text = "\
.function f
.try 0 2
  ECHO \"body\"
  JMP #6
  CATCH \"A\", #4
  JMP #6
  CATCH \"B\" ext=1
  JMP #6
  RETURN null
";
    let function = decode_text(text).unwrap();
    let body = function.body().to_vec();
    assert_eq!(function[body[0]].kind, OpKind::Try);
    match (&function[body[3]].kind, &function[body[5]].kind) {
      (OpKind::Catch { try_op: first_try, next: first_next, .. }, OpKind::Catch { try_op: second_try, next: second_next, .. }) => {
        assert_eq!(*first_try, body[0]);
        assert_eq!(*second_try, body[0]);
        assert_eq!(*first_next, body[5]);
        assert_eq!(*second_next, body[6]);
      }
      other => panic!("expected two catches, got {:?}", other),
    }
  }

  #[test]
  fn test_refusals() {
    let switch = ".function f\n.vars a\n  SWITCH_LONG CV0, 5\n  RETURN null\n";
    assert!(matches!(decode_text(switch), Err(DecodeError::UnsupportedConstruct { index: 0, .. })));

    let unended = ".function f\n.try 0 0 2 3\n  ECHO 1\n  RETURN null\n  FAST_RET T0\n  RETURN null\n";
    assert!(matches!(decode_text(unended), Err(DecodeError::Malformed { index: 3, .. })));

    let named = ".function f\n  INIT_FCALL_BY_NAME _, \"g\"\n  SEND_VAL 1, \"x\"\n  DO_FCALL_BY_NAME\n  RETURN null\n";
    assert!(matches!(decode_text(named), Err(DecodeError::UnsupportedConstruct { index: 1, .. })));

    let unconsumed = ".function f\n  ADD 1, 2 -> T0\n  RETURN null\n";
    match decode_text(unconsumed) {
      Err(DecodeError::Invariant(violation)) => assert_eq!(violation.violation, Violation::UnconsumedValue),
      other => panic!("expected an invariant violation, got {:?}", other),
    }
  }

  #[test]
  fn test_finally_blocks() {
    let text = "\
.function f
.vars a e
.try 0 3 7 8
  ADD CV0, 1 -> T0
  FAST_CALL #7, T0 -> T1
  RETURN T0
  CATCH \"A\" -> CV1 ext=1
  FAST_CALL #7 -> T1
  JMP #9
  ECHO \"unreachable\"
  DISCARD_EXCEPTION T1
  FAST_RET T1, #4294967295
  RETURN null
";
    let function = decode_text(text).unwrap();
    let body = function.body().to_vec();
    let try_op = body[0];
    assert_eq!(function[try_op].kind, OpKind::Try);
    assert_eq!(
      function[body[2]].kind,
      OpKind::FastCall { try_op, target: body[8], returning: Some(Operand::Ref(body[1])) }
    );
    assert_eq!(function[body[3]].kind, OpKind::Return { value: Operand::Temporary(body[1]) });
    assert_eq!(function[body[5]].kind, OpKind::FastCall { try_op, target: body[8], returning: None });
    assert_eq!(function[body[8]].kind, OpKind::DiscardException { try_op });
    assert_eq!(function[body[9]].kind, OpKind::FastRet { try_op, outer: None });

    let address_read = text.replace("ECHO \"unreachable\"", "ECHO T1");
    assert!(matches!(decode_text(&address_read), Err(DecodeError::Malformed { index: 6, .. })));
  }

  #[test]
  fn test_nested_finally_rethrows_outward() {
    let text = "\
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
    let function = decode_text(text).unwrap();
    let body = function.body().to_vec();
    let (outer, inner) = (body[0], body[1]);
    assert_eq!(function[body[6]].kind, OpKind::FastRet { try_op: inner, outer: Some(outer) });
    assert_eq!(function[body[10]].kind, OpKind::FastRet { try_op: outer, outer: None });
  }
}
