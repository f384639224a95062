/*!
  Whole-function facts the emitter needs before it can choose opcode variants: the call each
  begin/send/do-call belongs to and what is known about its callee, the fetch mode each fetch
  needs given its consumer, which calls collapse into a builtin opcode, and which concatenation
  chains become ropes.
*/

use std::collections::HashMap;

use crate::ir::{BinaryOp, Function, JumpCondition, OpId, OpKind, Operand, ValueKind};
use crate::raw::RawOpcode;
use crate::runtime::CalleeResolver;
use crate::signature::{normalize_name, Passing, Signature};
use crate::value::Value;
use crate::variants::{self, FetchMode};

use super::EncoderOptions;

#[derive(Clone, Debug, PartialEq)]
pub(super) enum CallTarget {
  /// A global function whose signature is known. The name has no leading backslash.
  Known { name: String, signature: Signature },
  /// A global function that is resolved when the call runs.
  ByName(String),
  /// A namespace-relative name, which falls back to the global function of the same name.
  Namespaced(String),
  Dynamic,
  Method,
  StaticMethod,
  Constructor,
}

/// A call emitted as something other than begin, sends, do-call.
#[derive(Clone, Debug, PartialEq)]
pub(super) enum Fusion {
  /// A builtin with its own opcode, emitted in place of the do-call.
  Intrinsic(RawOpcode),
  /// An `is_*` builtin, emitted as `TYPE_CHECK`.
  TypeCheck(u32),
  /// `call_user_func` or `call_user_func_array`: the first send becomes `INIT_USER_CALL`.
  UserCall { name: String, array: bool },
}

#[derive(Clone, Debug)]
pub(super) struct Call {
  pub begin  : OpId,
  pub end    : OpId,
  /// Plain sends, in argument order.
  pub sends  : Vec<OpId>,
  pub unpack : bool,
  pub target : CallTarget,
  pub fusion : Option<Fusion>,
}

impl Call {
  pub fn num_args(&self) -> u32 {
    self.sends.len() as u32
  }
}

/// How a concatenation takes part in a rope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum RopePart {
  /// The first concatenation of a chain of `parts` parts; starts the rope with both operands.
  Init { parts: u32 },
  Add { index: u32 },
  End { index: u32 },
}

pub(super) struct Analysis {
  pub calls          : Vec<Call>,
  call_of            : HashMap<OpId, usize>,
  arg_nums           : HashMap<OpId, u32>,
  /// The consumer of each consumed value.
  pub consumers      : HashMap<(OpId, ValueKind), OpId>,
  pub modes          : HashMap<OpId, FetchMode>,
  /// Fetch chain roots needing `CHECK_FUNC_ARG`, with the argument number.
  pub check_func_arg : HashMap<OpId, u32>,
  func_arg_nums      : HashMap<OpId, u32>,
  pub ropes          : HashMap<OpId, RopePart>,
  pub array_sizes    : HashMap<OpId, u32>,
  /// Instructions whose operands are read at another instruction's position.
  emit_positions     : HashMap<OpId, usize>,
}

impl Analysis {
  pub fn new<R: CalleeResolver + ?Sized>(function: &Function, resolver: &R, options: EncoderOptions) -> Analysis {
    let mut analysis = Analysis {
      calls          : Vec::new(),
      call_of        : HashMap::new(),
      arg_nums       : HashMap::new(),
      consumers      : HashMap::new(),
      modes          : HashMap::new(),
      check_func_arg : HashMap::new(),
      func_arg_nums  : HashMap::new(),
      ropes          : HashMap::new(),
      array_sizes    : HashMap::new(),
      emit_positions : HashMap::new(),
    };

    for (id, op) in function.ops() {
      for operand in op.kind.operands() {
        if let Some(key) = operand.consumed() {
          analysis.consumers.insert(key, id);
        }
      }
      if let OpKind::InitArray { value, .. } = &op.kind {
        analysis.array_sizes.insert(id, value.is_some() as u32);
      }
      if let OpKind::AddArrayElement { array, .. } | OpKind::AddArrayUnpack { array, .. } = &op.kind {
        *analysis.array_sizes.entry(*array).or_default() += 1;
      }
    }

    analysis.find_calls(function, resolver);
    if options.fuse_intrinsics {
      analysis.find_fusions(function);
    }
    analysis.find_fetch_modes(function);
    if options.rope_concat {
      analysis.find_ropes(function);
    }
    analysis
  }

  // region Calls

  fn find_calls<R: CalleeResolver + ?Sized>(&mut self, function: &Function, resolver: &R) {
    let mut open: Vec<Call> = Vec::new();
    for (id, op) in function.ops() {
      match &op.kind {
        kind if kind.is_call_begin() => open.push(Call {
          begin  : id,
          end    : id,
          sends  : Vec::new(),
          unpack : false,
          target : call_target(kind, resolver),
          fusion : None,
        }),
        OpKind::Send { .. } => {
          if let Some(call) = open.last_mut() {
            call.sends.push(id);
            self.arg_nums.insert(id, call.sends.len() as u32);
          }
        }
        OpKind::SendUnpack { .. } => {
          if let Some(call) = open.last_mut() {
            call.unpack = true;
          }
        }
        kind if kind.is_call_end() => {
          if let Some(mut call) = open.pop() {
            call.end = id;
            self.calls.push(call);
          }
        }
        _ => {}
      }
    }

    for (index, call) in self.calls.iter().enumerate() {
      self.call_of.insert(call.begin, index);
      self.call_of.insert(call.end, index);
      for send in &call.sends {
        self.call_of.insert(*send, index);
      }
    }
  }

  /// The call a begin, send or do-call belongs to.
  pub fn call(&self, id: OpId) -> Option<&Call> {
    self.call_of.get(&id).map(|index| &self.calls[*index])
  }

  pub fn arg_num(&self, send: OpId) -> u32 {
    self.arg_nums.get(&send).copied().unwrap_or(0)
  }

  /// How the argument of `send` is passed, if the callee is known.
  pub fn passing(&self, send: OpId) -> Option<Passing> {
    let call = self.call(send)?;
    match (&call.fusion, &call.target) {
      (Some(Fusion::UserCall { .. }), _) => Some(Passing::ByValue),
      (_, CallTarget::Known { signature, .. }) => Some(signature.passing(self.arg_num(send))),
      _ => None,
    }
  }

  fn find_fusions(&mut self, function: &Function) {
    let positions = function.positions();
    for index in 0..self.calls.len() {
      let fusion = self.fusion(function, &positions, &self.calls[index]);
      if let Some(fusion) = fusion {
        let call = &mut self.calls[index];
        if !matches!(fusion, Fusion::UserCall { .. }) {
          let end_position = positions[&call.end];
          for send in &call.sends {
            self.emit_positions.insert(*send, end_position);
          }
        }
        call.fusion = Some(fusion);
      }
    }
  }

  fn fusion(&self, function: &Function, positions: &HashMap<OpId, usize>, call: &Call) -> Option<Fusion> {
    let name = match &function[call.begin].kind {
      OpKind::InitFcall { function: Operand::Const(Value::String(name)) } if name.starts_with('\\') => {
        normalize_name(name)
      }
      _ => return None,
    };
    if call.unpack || !matches!(function[call.end].kind, OpKind::DoFcall) {
      return None;
    }
    let begin = positions[&call.begin];

    if name == "call_user_func" || name == "call_user_func_array" {
      let first = *call.sends.first()?;
      let array = name == "call_user_func_array";
      if positions[&first] != begin + 1 || !function[first].markers.is_empty() || (array && call.sends.len() != 2) {
        return None;
      }
      return Some(Fusion::UserCall { name, array });
    }

    let adjacent = positions[&call.end] == begin + call.sends.len() + 1;
    let unmarked = call.sends.iter().chain([&call.end]).all(|id| function[*id].markers.is_empty());
    let used = self.consumers.contains_key(&(call.end, ValueKind::Unnamed));
    let args: Vec<&Operand> = call
      .sends
      .iter()
      .filter_map(|send| match &function[*send].kind {
        OpKind::Send { value } => Some(value),
        _ => None,
      })
      .collect();
    let plain_values = args.iter().all(|value| match value {
      Operand::Const(_) | Operand::Var(_) | Operand::Temporary(_) | Operand::Stack(_) => true,
      Operand::Unnamed(producer) => matches!(function[*producer].kind, OpKind::DoFcall | OpKind::New { .. }),
      Operand::Ref(_) | Operand::Unused(_) => false,
    });
    if !(adjacent && unmarked && used && plain_values) {
      return None;
    }

    if let Some(code) = variants::type_check_code(&name) {
      return (args.len() == 1).then(|| Fusion::TypeCheck(code));
    }
    let opcode = variants::intrinsic_opcode(&name)?;
    let arity_fits = match opcode {
      RawOpcode::Strlen | RawOpcode::Count | RawOpcode::GetType => args.len() == 1,
      RawOpcode::GetClass => args.len() <= 1,
      RawOpcode::GetCalledClass | RawOpcode::FuncNumArgs | RawOpcode::FuncGetArgs => args.is_empty(),
      RawOpcode::Defined => args.len() == 1 && args[0].as_str().is_some(),
      RawOpcode::ArrayKeyExists => args.len() == 2,
      _ => false,
    };
    arity_fits.then(|| Fusion::Intrinsic(opcode))
  }

  /// Where the operands of `id` are read, if not at its own position.
  pub fn emit_position(&self, id: OpId) -> Option<usize> {
    self.emit_positions.get(&id).copied()
  }

  // endregion

  // region Fetch modes

  /// Consumers come after producers, so walking backwards decides every consumer first.
  fn find_fetch_modes(&mut self, function: &Function) {
    let ops: Vec<OpId> = function.body().to_vec();
    for id in ops.into_iter().rev() {
      match &function[id].kind {
        OpKind::FetchRead { .. } => {
          let consumer = self.consumers.get(&(id, ValueKind::Stack)).copied();
          let feeds_isset = consumer.map_or(false, |consumer| match &function[consumer].kind {
            OpKind::Isset { var: Operand::Stack(p), .. } => *p == id,
            OpKind::CondJmp { condition: JumpCondition::Coalesce, value: Operand::Stack(p), .. } => *p == id,
            OpKind::FetchRead { var: Operand::Stack(p), .. } => {
              *p == id && self.modes.get(&consumer) == Some(&FetchMode::Is)
            }
            _ => false,
          });
          self.modes.insert(id, if feeds_isset { FetchMode::Is } else { FetchMode::R });
        }
        OpKind::FetchWrite { var, .. } => {
          let consumer = self.consumers.get(&(id, ValueKind::Unnamed)).copied();
          let (mode, arg_num) = match consumer {
            Some(consumer) => self.write_mode(function, id, consumer),
            None => (FetchMode::W, None),
          };
          self.modes.insert(id, mode);
          if let (FetchMode::FuncArg, Some(arg_num)) = (mode, arg_num) {
            self.func_arg_nums.insert(id, arg_num);
            let chained = match var {
              Operand::Unnamed(p) => matches!(function[*p].kind, OpKind::FetchWrite { .. }),
              _ => false,
            };
            if !chained {
              self.check_func_arg.insert(id, arg_num);
            }
          }
        }
        _ => {}
      }
    }
  }

  fn write_mode(&self, function: &Function, id: OpId, consumer: OpId) -> (FetchMode, Option<u32>) {
    let is_me = |operand: &Operand| *operand == Operand::Unnamed(id);
    match &function[consumer].kind {
      OpKind::FetchWrite { var, .. } if is_me(var) => (
        self.modes.get(&consumer).copied().unwrap_or(FetchMode::W),
        self.func_arg_nums.get(&consumer).copied(),
      ),
      OpKind::Send { value } if is_me(value) => match self.passing(consumer) {
        None => (FetchMode::FuncArg, Some(self.arg_num(consumer))),
        Some(Passing::ByReference) => (FetchMode::W, None),
        Some(Passing::ByValue) => (FetchMode::R, None),
      },
      OpKind::Binary { lhs, assign: Some(_), .. } if is_me(lhs) => (FetchMode::Rw, None),
      OpKind::IncDec { var, .. } if is_me(var) => (FetchMode::Rw, None),
      OpKind::Unset { var, .. } if is_me(var) => (FetchMode::Unset, None),
      OpKind::Isset { var, .. } if is_me(var) => (FetchMode::Is, None),
      _ => (FetchMode::W, None),
    }
  }

  // endregion

  /// Left-associated chains of two or more plain concatenations, each consuming the previous one.
  fn find_ropes(&mut self, function: &Function) {
    let continued: Vec<OpId> = function.ops().filter_map(|(_, op)| op.continues).collect();
    let links = |id: OpId| -> bool {
      matches!(function[id].kind, OpKind::Binary { op: BinaryOp::Concat, assign: None, .. })
        && function[id].continues.is_none()
        && !continued.contains(&id)
    };

    for id in function.body().to_vec() {
      if self.ropes.contains_key(&id) || !links(id) {
        continue;
      }
      let mut chain = vec![id];
      while let Some(next) = self.consumers.get(&(chain[chain.len() - 1], ValueKind::Temporary)).copied() {
        let extends = links(next)
          && matches!(&function[next].kind, OpKind::Binary { lhs: Operand::Temporary(p), .. } if *p == chain[chain.len() - 1]);
        if !extends {
          break;
        }
        chain.push(next);
      }
      if chain.len() < 2 {
        continue;
      }

      let last = chain.len() - 1;
      for (index, link) in chain.iter().enumerate() {
        let part = match index {
          0 => RopePart::Init { parts: chain.len() as u32 + 1 },
          _ if index == last => RopePart::End { index: index as u32 + 1 },
          _ => RopePart::Add { index: index as u32 + 1 },
        };
        self.ropes.insert(*link, part);
      }
    }
  }
}

fn call_target<R: CalleeResolver + ?Sized>(kind: &OpKind, resolver: &R) -> CallTarget {
  match kind {
    OpKind::InitFcall { function: Operand::Const(Value::String(name)) } => match name.strip_prefix('\\') {
      Some(global) => match resolver.signature(global) {
        Some(signature) => CallTarget::Known { name: global.to_string(), signature: signature.clone() },
        None => CallTarget::ByName(global.to_string()),
      },
      None if name.contains('\\') => CallTarget::Namespaced(name.clone()),
      None => CallTarget::Dynamic,
    },
    OpKind::InitMethodCall { .. } => CallTarget::Method,
    OpKind::InitStaticMethodCall { .. } => CallTarget::StaticMethod,
    OpKind::New { .. } => CallTarget::Constructor,
    _ => CallTarget::Dynamic,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::decode::decode;
  use crate::raw::parse_assembly;
  use crate::runtime::{NoCallees, Runtime};

  fn decoded(text: &str) -> Function {
    decode(&parse_assembly(text).unwrap()[0]).unwrap()
  }

  #[test]
  fn test_fetch_modes_follow_consumers() {
    let function = decoded(
      ".function f\n.vars a\n  FETCH_DIM_IS CV0, 1 -> V0\n  ISSET_ISEMPTY_DIM_OBJ V0, 2 -> T1\n  RETURN T1\n",
    );
    let analysis = Analysis::new(&function, &NoCallees, EncoderOptions::default());
    assert_eq!(analysis.modes[&function.body()[0]], FetchMode::Is);

    let function = decoded(
      ".function f\n.vars a\n  FETCH_DIM_RW CV0, 1 -> V0\n  ASSIGN_DIM_OP V0, 2 ext=1\n  OP_DATA 5\n  RETURN null\n",
    );
    let analysis = Analysis::new(&function, &NoCallees, EncoderOptions::default());
    assert_eq!(analysis.modes[&function.body()[0]], FetchMode::Rw);
  }

  #[test]
  fn test_func_arg_depends_on_the_callee() {
    let text = "\
.function f
.vars a
  INIT_FCALL_BY_NAME _, \"sort\"
  CHECK_FUNC_ARG _, #1
  FETCH_DIM_FUNC_ARG CV0, 0 -> V0
  SEND_FUNC_ARG V0, #1
  DO_FCALL_BY_NAME
  RETURN null
";
    let function = decoded(text);
    let fetch = function.body()[1];

    let unknown = Analysis::new(&function, &NoCallees, EncoderOptions::default());
    assert_eq!(unknown.modes[&fetch], FetchMode::FuncArg);
    assert_eq!(unknown.check_func_arg.get(&fetch), Some(&1));

    let runtime = Runtime::with_builtins();
    let known = Analysis::new(&function, &runtime, EncoderOptions::default());
    assert_eq!(known.modes[&fetch], FetchMode::W);
    assert!(known.check_func_arg.is_empty());
  }

  #[test]
  fn test_fusion_requires_adjacency() {
    let fused = decoded(".function f\n.vars s\n  STRLEN CV0 -> T0\n  RETURN T0\n");
    let analysis = Analysis::new(&fused, &NoCallees, EncoderOptions::default());
    assert_eq!(analysis.calls[0].fusion, Some(Fusion::Intrinsic(RawOpcode::Strlen)));

    let spread = decoded(
      ".function f\n.vars s\n  INIT_FCALL _, \"strlen\" ext=1\n  CONCAT CV0, \"!\" -> T0\n  SEND_VAL T0, #1\n  DO_ICALL -> V1\n  RETURN V1\n",
    );
    let analysis = Analysis::new(&spread, &NoCallees, EncoderOptions::default());
    assert_eq!(analysis.calls[0].fusion, None);

    let options = EncoderOptions { fuse_intrinsics: false, ..EncoderOptions::default() };
    let analysis = Analysis::new(&fused, &NoCallees, options);
    assert_eq!(analysis.calls[0].fusion, None);
  }

  #[test]
  fn test_rope_chains() {
    let function = decoded(
      ".function f\n.vars a b\n  ROPE_INIT _, \"x\" -> T0 ext=4\n  ROPE_ADD T0, CV0 -> T0 ext=1\n  ROPE_ADD T0, \"y\" -> T0 ext=2\n  ROPE_END T0, CV1 -> T1 ext=3\n  RETURN T1\n",
    );
    let body = function.body().to_vec();
    let analysis = Analysis::new(&function, &NoCallees, EncoderOptions::default());
    assert_eq!(analysis.ropes[&body[0]], RopePart::Init { parts: 4 });
    assert_eq!(analysis.ropes[&body[1]], RopePart::Add { index: 2 });
    assert_eq!(analysis.ropes[&body[2]], RopePart::End { index: 3 });

    let single = decoded(".function f\n.vars a\n  CONCAT CV0, \"!\" -> T0\n  RETURN T0\n");
    assert!(Analysis::new(&single, &NoCallees, EncoderOptions::default()).ropes.is_empty());
  }
}
