/*!
  This module is responsible for the encoding and decoding of ops to and from the binary form
  the virtual machine keeps in code memory. Every op occupies `WORDS_PER_OP` words:

    [OpCode:8][Op1 type:4][Op2 type:4][Result type:4][Reserved:12]
    [Op1:32]
    [Op2:32]
    [Result:32]
    [Extended value:32]
    [Line:32]

  The literal pool, variable names and the try/catch table are not part of the code stream.
*/
use std::convert::TryFrom;

use super::{OperandType, RawOp, RawOpcode, RawOperand};

// If you change this you must also change `encode_op` and `try_decode_op`.
pub type Word = u32;
pub const WORDS_PER_OP: usize = 6;

fn operand_type(code: Word) -> Option<OperandType> {
  OperandType::try_from((code & 0xF) as u8).ok()
}

/**
  Decodes one op from the front of `words`. Returns `None` if fewer than `WORDS_PER_OP` words
  remain or if the opcode or an operand type is not one the VM defines.
*/
pub fn try_decode_op(words: &[Word]) -> Option<RawOp> {
  if words.len() < WORDS_PER_OP {
    return None;
  }
  let header = words[0];
  let opcode = RawOpcode::try_from((header & 0xFF) as u8).ok()?;

  Some(RawOp {
    opcode,
    op1            : RawOperand::from_parts(operand_type(header >> 8)?, words[1]),
    op2            : RawOperand::from_parts(operand_type(header >> 12)?, words[2]),
    result         : RawOperand::from_parts(operand_type(header >> 16)?, words[3]),
    extended_value : words[4],
    lineno         : words[5],
  })
}

/// Encodes the op into its binary form.
pub fn encode_op(op: &RawOp) -> [Word; WORDS_PER_OP] {
  let type_code = |operand: &RawOperand| Into::<u8>::into(operand.operand_type()) as Word;
  [
    ( op.opcode.code() as Word)          +
      (type_code(&op.op1)    << 8 )      +
      (type_code(&op.op2)    << 12)      +
      (type_code(&op.result) << 16),
    op.op1.num(),
    op.op2.num(),
    op.result.num(),
    op.extended_value,
    op.lineno,
  ]
}

pub fn encode_ops(ops: &[RawOp]) -> Vec<Word> {
  ops.iter().flat_map(|op| encode_op(op)).collect()
}

/// Decodes a whole code stream. A trailing partial op or any undecodable op fails the stream.
pub fn decode_ops(words: &[Word]) -> Option<Vec<RawOp>> {
  if words.len() % WORDS_PER_OP != 0 {
    return None;
  }
  words.chunks(WORDS_PER_OP).map(try_decode_op).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_encode_layout() {
    let op = RawOp::new(RawOpcode::Add, 7)
      .with_op1(RawOperand::Cv(1))
      .with_op2(RawOperand::Const(0))
      .with_result(RawOperand::Tmp(3));
    let words = encode_op(&op);
    assert_eq!(words[0], 1 | (8 << 8) | (1 << 12) | (2 << 16));
    assert_eq!(&words[1..], &[1, 0, 3, 0, 7]);
    assert_eq!(try_decode_op(&words), Some(op));
  }

  #[test]
  fn test_rejects_unknown_opcode_and_type() {
    let mut words = encode_op(&RawOp::new(RawOpcode::Nop, 1));
    words[0] = 45;
    assert_eq!(try_decode_op(&words), None);
    words[0] = (RawOpcode::Nop.code() as Word) | (3 << 8);
    assert_eq!(try_decode_op(&words), None);
  }

  #[test]
  fn test_partial_stream() {
    let words = encode_ops(&[RawOp::new(RawOpcode::Nop, 1), RawOp::new(RawOpcode::Return, 2)]);
    assert_eq!(decode_ops(&words).map(|ops| ops.len()), Some(2));
    assert_eq!(decode_ops(&words[..WORDS_PER_OP + 1]), None);
  }
}
