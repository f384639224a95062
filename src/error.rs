//! Error types, one per stage: assembly text, decoding, IR validation, encoding.

use thiserror::Error;

use crate::ir::{OpId, ValueKind, VarId};
use crate::raw::RawOpcode;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum AssemblyError {
  #[error("line {line}: cannot parse {text:?}")]
  Syntax { line: usize, text: String },

  #[error("line {line}: {name} is not an operation")]
  NotAnOperation { line: usize, name: String },

  #[error("line {line}: {message}")]
  Directive { line: usize, message: String },

  #[error("line {line}: instruction outside of a .function block")]
  NoFunction { line: usize },
}

/// A structural rule of the IR that an instruction breaks.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum Violation {
  #[error("references {target}, which is not in the function body")]
  DanglingReference { target: OpId },

  #[error("references {target}, which does not precede it")]
  ForwardReference { target: OpId },

  #[error("jumps to {target}, which is not in the function body")]
  UnresolvedJump { target: OpId },

  #[error("references {target}, which is not {expected}")]
  WrongReferent { target: OpId, expected: &'static str },

  #[error("produces a value that is never consumed")]
  UnconsumedValue,

  #[error("value of {producer} is consumed a second time (first by {first})")]
  MultipleConsumers { producer: OpId, first: OpId },

  #[error("uses the value of {producer}, which produces none")]
  NotAProducer { producer: OpId },

  #[error("reads {producer} as a {found} value, but it produces a {expected} value")]
  OperandKindMismatch { producer: OpId, expected: ValueKind, found: ValueKind },

  #[error("continues the value of {producer}, which is already continued by {other}")]
  ForkedContinuation { producer: OpId, other: OpId },

  #[error("uses variable {0}, which the function does not declare")]
  UnknownVariable(VarId),

  #[error("malformed catch chain: {0}")]
  MalformedCatchChain(&'static str),

  #[error("malformed finally block: {0}")]
  MalformedFinally(&'static str),

  #[error("writes a variable while the value {producer} fetched from it is still unread")]
  ClobberedFetch { producer: OpId },

  #[error("malformed call sequence: {0}")]
  CallShape(&'static str),

  #[error("Cannot reassign $this")]
  ThisReassigned,

  #[error("unset($this) is not allowed")]
  ThisUnset,

  #[error("cannot fetch a list element by reference from a non-referencable value")]
  ListByReference,
}

/// A violation together with the instruction that commits it.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("{op} (line {line}): {violation}")]
pub struct InvariantViolation {
  pub op        : OpId,
  pub line      : u32,
  pub violation : Violation,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DecodeError {
  #[error("op {index} ({opcode}): unsupported construct: {reason}")]
  UnsupportedConstruct { index: usize, opcode: RawOpcode, reason: String },

  #[error("op {index}: malformed op array: {reason}")]
  Malformed { index: usize, reason: String },

  #[error("decoded function is not well formed: {0}")]
  Invariant(#[from] InvariantViolation),

  #[error("stored code for {0} cannot be decoded")]
  CorruptBody(String),
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum EncodeError {
  #[error(transparent)]
  Invariant(#[from] InvariantViolation),

  #[error("{op}: closure {name} is not declared by this function")]
  UnknownClosure { op: OpId, name: String },

  #[error("{op}: {reason}")]
  Unencodable { op: OpId, reason: String },
}
