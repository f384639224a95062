//! Tables for looking at op arrays and canonical functions side by side in traces and the CLI.

use prettytable::{format as TableFormat, Table};

use crate::ir::Function;
use crate::raw::{RawFunction, RawOperand};

lazy_static! {
  static ref TABLE_DISPLAY_FORMAT: TableFormat::TableFormat =
    TableFormat::FormatBuilder::new()
      .column_separator('│')
      .borders(' ')
      .separator(
        TableFormat::LinePosition::Title,
        TableFormat::LineSeparator::new('─', '┼', ' ', ' ')
      )
      .separator(
        TableFormat::LinePosition::Bottom,
        TableFormat::LineSeparator::new('─', '┴', ' ', ' ')
      )
      .padding(1, 1)
      .build();
}

fn operand_cell(function: &RawFunction, operand: &RawOperand) -> String {
  match operand {
    RawOperand::Unused(0) => String::new(),
    RawOperand::Const(index) => match function.literal(*index) {
      Some(value) => value.to_string(),
      None => operand.to_string(),
    },
    _ => operand.to_string(),
  }
}

/// One row per op, with literals shown inline.
pub fn raw_table(function: &RawFunction) -> Table {
  let mut table = Table::new();

  table.set_format(*TABLE_DISPLAY_FORMAT);
  table.set_titles(row![ubr->"#", ubr->"Line", ubl->"Opcode", ubl->"Op1", ubl->"Op2", ubl->"Result", ubr->"Ext"]);

  for (index, op) in function.opcodes.iter().enumerate() {
    let extended_value = match op.extended_value {
      0 => String::new(),
      value => value.to_string(),
    };
    table.add_row(row![
      r->index,
      r->op.lineno,
      op.opcode,
      operand_cell(function, &op.op1),
      operand_cell(function, &op.op2),
      operand_cell(function, &op.result),
      r->extended_value
    ]);
  }
  table
}

/// One row per instruction in program order, with the id operands refer to it by.
pub fn function_table(function: &Function) -> Table {
  let mut table = Table::new();

  table.set_format(*TABLE_DISPLAY_FORMAT);
  table.set_titles(row![ubr->"Id", ubr->"Line", ubl->"Instruction", ubl->"Markers"]);

  for (id, op) in function.ops() {
    let markers: Vec<String> = op.markers.iter().map(|marker| marker.to_string()).collect();
    table.add_row(row![r->id, r->op.line, op, markers.join(" ")]);
  }
  table
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::decode::decode;
  use crate::raw::parse_assembly;

  #[test]
  fn test_tables_show_every_op() {
    let raw = parse_assembly(".function f\n.vars a\n  CONCAT \"Hello, \", CV0 -> T0\n  RETURN T0\n").unwrap().remove(0);
    let raw_text = raw_table(&raw).to_string();
    assert!(raw_text.contains("CONCAT"));
    assert!(raw_text.contains("Hello, "));

    let function = decode(&raw).unwrap();
    assert_eq!(function_table(&function).len(), 2);
  }
}
