//! Whole-pipeline properties: assembly is loaded into a runtime, looked up, decoded, edited,
//! encoded and decoded again.

use std::collections::HashMap;

use opir::ir::{BinaryOp, Function, Op, OpId, OpKind, Operand, ValueKind};
use opir::raw::{parse_assembly, print_assembly, RawOpcode, RawOperand, TryCatchElement};
use opir::value::Value;
use opir::{decode, encode, validate, EncodeError, EncoderOptions, NoCallees, Runtime, Violation};

const CORPUS: &str = "\
.function add
.vars a b
.arg a
.arg b
  RECV #1 -> CV0
  RECV_INIT #2, 5 -> CV1
  ADD CV0, CV1 -> T0
  RETURN T0
.function pick
.vars a
  JMPZ CV0, #3
  QM_ASSIGN 1 -> T0
  JMP #4
  QM_ASSIGN 2 -> T0
  RETURN T0
.function call_g
.vars a
  INIT_FCALL_BY_NAME _, \"g\" ext=1
  SEND_VAR_EX CV0, #1
  DO_FCALL_BY_NAME -> V0
  RETURN V0
.function len
.vars s
  STRLEN CV0 -> T0
  RETURN T0
.function wrap
.vars a b
  ROPE_INIT _, \"x\" -> T0 ext=4
  ROPE_ADD T0, CV0 -> T0 ext=1
  ROPE_ADD T0, \"y\" -> T0 ext=2
  ROPE_END T0, CV1 -> T1 ext=3
  ECHO T1
  RETURN null
.function each
.vars a v
  FE_RESET_R CV0, #4 -> V0
  FE_FETCH_R V0, CV1 ext=4
  ECHO CV1
  JMP #1
  FE_FREE V0
  RETURN null
.function store
.vars a
  ASSIGN_DIM CV0, \"k\"
  OP_DATA 1
  RETURN null
.function build
.vars a
  INIT_ARRAY CV0 -> T0
  ADD_ARRAY_ELEMENT 2 -> T0
  RETURN T0
.function guarded
.vars e
.try 0 2
  ECHO \"body\"
  JMP #6
  CATCH \"A\", #4 -> CV0
  JMP #6
  CATCH \"B\" ext=1
  JMP #6
  RETURN null
.function Point::x
.scope Point
  FETCH_OBJ_R _, \"x\" -> T0
  RETURN T0
";

fn corpus() -> (Runtime, Vec<Function>) {
  let mut runtime = Runtime::with_builtins();
  runtime.load_assembly(CORPUS).unwrap();
  let functions = parse_assembly(CORPUS)
    .unwrap()
    .iter()
    .map(|raw| runtime.lookup_and_decode(&raw.name, raw.scope.as_deref()).unwrap().unwrap())
    .collect();
  (runtime, functions)
}

fn decode_text(text: &str) -> Function {
  decode(&parse_assembly(text).unwrap()[0]).unwrap()
}

#[test]
fn round_trip_is_a_fixpoint() {
  let (runtime, functions) = corpus();
  assert_eq!(functions.len(), 10);
  for function in &functions {
    for options in [EncoderOptions::default(), EncoderOptions { rope_concat: false, fuse_intrinsics: false }] {
      let raw = encode(function, &runtime, options).unwrap();
      let again = decode(&raw).unwrap();
      assert_eq!(&again, function, "{}\n{}", function.qualified_name(), print_assembly(&raw));
    }
  }
}

#[test]
fn edited_bodies_replace_the_originals() {
  let (mut runtime, functions) = corpus();
  for function in &functions {
    let raw = encode(function, &runtime, EncoderOptions::default()).unwrap();
    let scope = function.scope.as_ref().map(|scope| scope.to_string());
    assert!(runtime.replace(&function.name, scope.as_deref(), raw));
    let again = runtime.lookup_and_decode(&function.name, scope.as_deref()).unwrap().unwrap();
    assert_eq!(&again, function);
  }
}

#[test]
fn concatenation_chain_law() {
  let function = decode_text(
    ".function f\n.vars a b\n  ROPE_INIT _, \"x\" -> T0 ext=4\n  ROPE_ADD T0, CV0 -> T0 ext=1\n  ROPE_ADD T0, \"y\" -> T0 ext=2\n  ROPE_END T0, CV1 -> T1 ext=3\n  RETURN T1\n",
  );
  let body = function.body().to_vec();
  assert_eq!(body.len(), 4);
  for (position, id) in body[..3].iter().enumerate() {
    match &function[*id].kind {
      OpKind::Binary { op: BinaryOp::Concat, lhs, assign: None, .. } => {
        if position > 0 {
          assert_eq!(*lhs, Operand::Temporary(body[position - 1]));
        }
      }
      other => panic!("expected a concatenation, got {:?}", other),
    }
  }

  let rope = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
  assert_eq!(rope.opcodes[0].opcode, RawOpcode::RopeInit);
  assert_eq!(decode(&rope).unwrap(), function);

  let chained = encode(&function, &NoCallees, EncoderOptions { rope_concat: false, ..EncoderOptions::default() }).unwrap();
  assert!(chained.opcodes[..3].iter().all(|op| op.opcode == RawOpcode::Concat));
  assert_eq!(decode(&chained).unwrap(), function);
}

#[test]
fn array_builders_must_follow_their_initialization() {
  let original = decode_text(".function f\n.vars a\n  ECHO 0\n  INIT_ARRAY CV0 -> T0\n  ADD_ARRAY_ELEMENT 2 -> T0\n  RETURN T0\n");
  let body = original.body().to_vec();
  let element = |array: OpId| Op::new(1, OpKind::AddArrayElement { array, value: Operand::Const(Value::Long(3)), key: None, by_ref: false });

  let mut early = original.clone();
  let inserted = early.insert_before(body[1], element(body[1])).unwrap();
  match encode(&early, &NoCallees, EncoderOptions::default()) {
    Err(EncodeError::Invariant(error)) => {
      assert_eq!(error.op, inserted);
      assert_eq!(error.violation, Violation::ForwardReference { target: body[1] });
    }
    other => panic!("expected a refusal, got {:?}", other),
  }

  let mut stray = original.clone();
  stray.insert_after(body[2], element(body[0])).unwrap();
  assert!(matches!(
    encode(&stray, &NoCallees, EncoderOptions::default()),
    Err(EncodeError::Invariant(error)) if matches!(error.violation, Violation::WrongReferent { .. })
  ));

  let mut later = original;
  later.insert_after(body[2], element(body[1])).unwrap();
  let raw = encode(&later, &NoCallees, EncoderOptions::default()).unwrap();
  assert_eq!(decode(&raw).unwrap().len(), 5);
}

#[test]
fn catch_chain_is_linked_in_source_order() {
  let (_, functions) = corpus();
  let guarded = functions.iter().find(|function| &*function.name == "guarded").unwrap();
  let catches: Vec<(OpId, OpId)> = guarded
    .ops()
    .filter_map(|(id, op)| match op.kind {
      OpKind::Catch { next, .. } => Some((id, next)),
      _ => None,
    })
    .collect();
  assert_eq!(catches.len(), 2);
  assert_eq!(catches[0].1, catches[1].0);
  assert!(!matches!(guarded[catches[1].1].kind, OpKind::Catch { .. }));
  assert!(guarded.position(catches[0].0) < guarded.position(catches[1].0));
}

#[test]
fn nested_regions_sharing_a_start_keep_their_rows() {
  let body = "\
  ECHO \"x\"
  JMP #4
  CATCH \"A\" -> CV0 ext=1
  ECHO \"a\"
  JMP #8
  CATCH \"B\", #7 -> CV0
  JMP #8
  CATCH \"C\" -> CV0 ext=1
  RETURN null
";
  for rows in [".try 0 2\n.try 0 5\n", ".try 0 5\n.try 0 2\n"] {
    let text = format!(".function f\n.vars e\n{}{}", rows, body);
    let raw = parse_assembly(&text).unwrap().remove(0);
    let function = decode(&raw).unwrap();

    let body = function.body().to_vec();
    assert!(matches!(function[body[0]].kind, OpKind::Try));
    assert!(matches!(function[body[1]].kind, OpKind::Try));
    let handled: Vec<(String, OpId)> = function
      .ops()
      .filter_map(|(_, op)| match &op.kind {
        OpKind::Catch { try_op, class, .. } => Some((class.to_string(), *try_op)),
        _ => None,
      })
      .collect();
    let inner = if raw.try_catch[0].catch_op == 2 { body[0] } else { body[1] };
    let outer = if inner == body[0] { body[1] } else { body[0] };
    assert_eq!(handled, vec![("A".to_string(), inner), ("B".to_string(), outer), ("C".to_string(), outer)]);

    let encoded = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
    assert_eq!(encoded.try_catch, raw.try_catch);
    assert!(encoded.try_catch.iter().all(|row| row.try_op == 0));
    assert_eq!(decode(&encoded).unwrap(), function, "{}", print_assembly(&encoded));
  }
}

#[test]
fn try_finally_survives_the_pipeline() {
  let text = "\
.function f
.vars a
.try 0 0 3 4
  ECHO CV0
  FAST_CALL #3 -> T0
  JMP #5
  ECHO \"done\"
  FAST_RET T0, #4294967295
  RETURN null
";
  let mut runtime = Runtime::with_builtins();
  runtime.load_assembly(text).unwrap();
  let function = runtime.lookup_and_decode("f", None).unwrap().unwrap();
  let raw = encode(&function, &runtime, EncoderOptions::default()).unwrap();
  assert_eq!(raw.try_catch, vec![TryCatchElement { try_op: 0, catch_op: 0, finally_op: 3, finally_end: 4 }]);
  assert!(runtime.replace("f", None, raw));
  assert_eq!(runtime.lookup_and_decode("f", None).unwrap().unwrap(), function);
}

#[test]
fn every_value_is_consumed_exactly_once() {
  let (_, functions) = corpus();
  for function in &functions {
    assert_eq!(validate(function), Ok(()));
    let mut consumers: HashMap<(OpId, ValueKind), usize> = HashMap::new();
    for (_, _, operand) in function.operands() {
      if let Some(key) = operand.consumed() {
        *consumers.entry(key).or_default() += 1;
      }
    }
    assert!(consumers.values().all(|count| *count == 1), "{}: {:?}", function.qualified_name(), consumers);
  }
}

#[test]
fn unknown_names_are_not_found() {
  let (runtime, _) = corpus();
  assert_eq!(runtime.lookup_and_decode("doesNotExist", None), Ok(None));
  assert_eq!(runtime.lookup_and_decode("count", None), Ok(None));
  assert_eq!(runtime.lookup_and_decode("x", Some("Nowhere")), Ok(None));
}

#[test]
fn jumps_land_on_the_same_instruction_after_edits() {
  let mut function = decode_text(
    ".function f\n.vars a\n  JMPZ CV0, #3\n  ECHO \"a\"\n  ECHO \"b\"\n  ECHO \"c\"\n  RETURN null\n",
  );
  let body = function.body().to_vec();
  function.insert_before(body[1], Op::new(1, OpKind::Echo { value: Operand::string("x") })).unwrap();
  function.insert_before(body[1], Op::new(1, OpKind::Echo { value: Operand::string("y") })).unwrap();
  function.remove(body[2]).unwrap();

  let raw = encode(&function, &NoCallees, EncoderOptions::default()).unwrap();
  assert_eq!(raw.opcodes[0].op2, RawOperand::Unused(4));

  let again = decode(&raw).unwrap();
  match &again[again.body()[0]].kind {
    OpKind::CondJmp { target, .. } => {
      assert_eq!(again[*target].kind, OpKind::Echo { value: Operand::string("c") });
    }
    other => panic!("expected a conditional jump, got {:?}", other),
  }
}
